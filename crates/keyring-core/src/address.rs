//! Ethereum account addresses.
//!
//! Addresses are compared by value, so two hex spellings that differ only
//! in letter case (for example an EIP-55 checksummed form and its lowercase
//! form) name the same account everywhere in the keyring.
//!
//! An address is derived from a secp256k1 public key by hashing the 64-byte
//! `x || y` encoding with Keccak-256 and keeping the last 20 bytes.
//!
//! # Example
//!
//! ```
//! use hw_keyring_core::Address;
//!
//! let checksummed = Address::from_hex("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap();
//! let lowercase = Address::from_hex("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed").unwrap();
//! assert_eq!(checksummed, lowercase);
//! ```

use core::fmt;
use core::str::FromStr;

use alloy_primitives::{Address as AlloyAddress, keccak256};
use k256::ecdsa::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An Ethereum address (20 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(AlloyAddress);

impl Address {
    /// The length of an Ethereum address in bytes.
    pub const BYTE_LEN: usize = 20;

    /// Creates an address from its raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; Self::BYTE_LEN]) -> Self {
        Self(AlloyAddress::new(bytes))
    }

    /// Returns the zero address (`0x0000...0000`).
    #[must_use]
    pub const fn zero() -> Self {
        Self(AlloyAddress::ZERO)
    }

    /// Checks if this is the zero address.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Derives the address controlled by a secp256k1 public key.
    #[must_use]
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        let encoded = public_key.to_encoded_point(false);
        Self::from_xy(&encoded.as_bytes()[1..])
    }

    /// Derives an address from raw uncompressed public key bytes.
    ///
    /// Accepts either 65 bytes (`0x04 || x || y`) or 64 bytes (`x || y`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPublicKey`] if the length is not 64 or 65, or
    /// if a 65-byte key does not start with `0x04`.
    pub fn from_public_key_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            64 => Ok(Self::from_xy(bytes)),
            65 if bytes[0] == 0x04 => Ok(Self::from_xy(&bytes[1..])),
            65 => Err(Error::InvalidPublicKey(
                "65-byte public key must start with 0x04".to_string(),
            )),
            len => Err(Error::InvalidPublicKey(format!(
                "expected 64 or 65 bytes, got {len}"
            ))),
        }
    }

    fn from_xy(xy: &[u8]) -> Self {
        let hash = keccak256(xy);
        let mut address_bytes = [0u8; Self::BYTE_LEN];
        address_bytes.copy_from_slice(&hash[12..]);
        Self::new(address_bytes)
    }

    /// Returns the address bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; Self::BYTE_LEN] {
        self.0.as_ref()
    }

    /// Returns the EIP-55 checksummed hex form with `0x` prefix.
    #[must_use]
    pub fn to_checksum_hex(&self) -> String {
        self.0.to_checksum(None)
    }

    /// Returns the lowercase hex form with `0x` prefix.
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.as_bytes()))
    }

    /// Parses an address from hex in any letter case, with or without `0x`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HexDecodeFailed`] if the string is not hex or does
    /// not decode to exactly 20 bytes.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let trimmed = hex_str.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(digits)?;

        let address_bytes: [u8; Self::BYTE_LEN] = bytes.as_slice().try_into().map_err(|_| {
            Error::HexDecodeFailed(format!(
                "expected {} address bytes, got {}",
                Self::BYTE_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self::new(address_bytes))
    }

    /// Returns the inner [`alloy_primitives::Address`].
    #[must_use]
    pub const fn inner(&self) -> AlloyAddress {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_checksum_hex())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<AlloyAddress> for Address {
    fn from(addr: AlloyAddress) -> Self {
        Self(addr)
    }
}

impl From<Address> for AlloyAddress {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Self::new(bytes)
    }
}
