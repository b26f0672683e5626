//! Ethereum ECDSA signatures and raw signer responses.
//!
//! Signers answer with loosely-typed hex components ([`SignatureParts`]).
//! [`SignatureParts::validate`] turns them into fixed-width scalars and
//! fails with [`Error::NoSignatureReturned`] when `r` or `s` is missing
//! and with [`Error::InvalidSignatureFormat`] when a component is present
//! but unusable. The fully-resolved result is a [`Signature`], whose `v`
//! is the value that ends up on chain (for example `chainId * 2 + 35 + parity`
//! for EIP-155 transactions).
//!
//! # Example
//!
//! ```
//! use hw_keyring_core::Signature;
//!
//! let sig = Signature::new([1u8; 32], [2u8; 32], 27);
//! assert!(sig.to_rsv_hex().ends_with("1b"));
//! ```

use core::fmt;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// secp256k1 group order divided by two; an `s` above it is non-canonical.
const SECP256K1_HALF_ORDER: [u8; 32] = [
    0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0x5D, 0x57, 0x6E, 0x73, 0x57, 0xA4, 0x50, 0x1D, 0xDF, 0xE9, 0x2F, 0x46, 0x68, 0x1B, 0x20, 0xA0,
];

/// A complete Ethereum ECDSA signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// The R component of the signature (32 bytes).
    #[serde(with = "hex_bytes")]
    r: [u8; 32],

    /// The S component of the signature (32 bytes).
    #[serde(with = "hex_bytes")]
    s: [u8; 32],

    /// The on-chain `v` value.
    v: u64,
}

/// Serde helper for hex encoding/decoding 32-byte arrays.
mod hex_bytes {
    use hex::{decode, encode};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub(super) fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", encode(bytes)))
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = decode(s).map_err(de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| de::Error::custom("expected 32 bytes"))
    }
}

/// Serde helper for `0x`-prefixed variable-length byte strings.
pub(crate) mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub(crate) fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(de::Error::custom)
    }
}

impl Signature {
    /// Creates a signature from its components.
    #[must_use]
    pub const fn new(r: [u8; 32], s: [u8; 32], v: u64) -> Self {
        Self { r, s, v }
    }

    /// Returns the R component of the signature.
    #[must_use]
    pub const fn r(&self) -> &[u8; 32] {
        &self.r
    }

    /// Returns the S component of the signature.
    #[must_use]
    pub const fn s(&self) -> &[u8; 32] {
        &self.s
    }

    /// Returns the on-chain `v` value.
    #[must_use]
    pub const fn v(&self) -> u64 {
        self.v
    }

    /// Returns the R component as a [`U256`].
    #[must_use]
    pub const fn r_u256(&self) -> U256 {
        U256::from_be_bytes(self.r)
    }

    /// Returns the S component as a [`U256`].
    #[must_use]
    pub const fn s_u256(&self) -> U256 {
        U256::from_be_bytes(self.s)
    }

    /// Encodes as `0x || r || s || v`, with `v` rendered as at least two hex digits.
    ///
    /// This is the format `personal_sign` and `eth_signTypedData` callers expect.
    #[must_use]
    pub fn to_rsv_hex(&self) -> String {
        format!(
            "0x{}{}{:02x}",
            hex::encode(self.r),
            hex::encode(self.s),
            self.v
        )
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rsv_hex())
    }
}

/// Signature components exactly as a signer returned them.
///
/// Every component is optional hex, with or without `0x` prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureParts {
    /// R component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<String>,
    /// S component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
    /// Recovery value, if the signer computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
}

/// Validated signature scalars with an optional signer-supplied `v`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedParts {
    /// R component.
    pub r: [u8; 32],
    /// S component.
    pub s: [u8; 32],
    /// `v` as supplied by the signer.
    pub v: Option<u64>,
}

impl SignatureParts {
    /// Builds parts from resolved scalars, encoding `v` as hex.
    #[must_use]
    pub fn from_scalars(r: &[u8; 32], s: &[u8; 32], v: Option<u64>) -> Self {
        Self {
            r: Some(hex::encode(r)),
            s: Some(hex::encode(s)),
            v: v.map(|v| format!("{v:02x}")),
        }
    }

    /// Checks that `r` and `s` are present and well-formed.
    ///
    /// # Errors
    ///
    /// - [`Error::NoSignatureReturned`] if `r` or `s` is absent or empty
    /// - [`Error::InvalidSignatureFormat`] if a component is not valid hex,
    ///   is longer than 32 bytes, is zero, or `s` is in the upper half of
    ///   the curve order
    pub fn validate(&self) -> Result<ValidatedParts> {
        let r = required_component(self.r.as_deref())?;
        let s = required_component(self.s.as_deref())?;
        let r = parse_scalar("r", r)?;
        let s = parse_scalar("s", s)?;

        if s > SECP256K1_HALF_ORDER {
            return Err(Error::InvalidSignatureFormat(
                "s is not in canonical low form".to_string(),
            ));
        }

        let v = match self.v.as_deref().map(strip_hex_prefix) {
            None | Some("") => None,
            Some(digits) => Some(parse_v(digits)?),
        };

        Ok(ValidatedParts { r, s, v })
    }
}

/// Zero-pads a hex `v` to an even number of digits, at least two.
///
/// # Example
///
/// ```
/// use hw_keyring_core::signature::normalize_v_hex;
///
/// assert_eq!(normalize_v_hex("0x1"), "01");
/// assert_eq!(normalize_v_hex("136"), "0136");
/// ```
#[must_use]
pub fn normalize_v_hex(v: &str) -> String {
    let digits = strip_hex_prefix(v);
    let width = digits.len().max(2);
    format!("{digits:0>width$}", width = width + width % 2)
}

fn strip_hex_prefix(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

fn required_component(value: Option<&str>) -> Result<&str> {
    match value.map(strip_hex_prefix) {
        Some(digits) if !digits.is_empty() => Ok(digits),
        _ => Err(Error::NoSignatureReturned),
    }
}

fn parse_scalar(name: &str, digits: &str) -> Result<[u8; 32]> {
    if digits.len() > 64 {
        return Err(Error::InvalidSignatureFormat(format!(
            "{name} is longer than 32 bytes"
        )));
    }
    let padded = format!("{digits:0>64}");
    let bytes = hex::decode(&padded)
        .map_err(|err| Error::InvalidSignatureFormat(format!("{name} is not hex: {err}")))?;

    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&bytes);
    if scalar == [0u8; 32] {
        return Err(Error::InvalidSignatureFormat(format!("{name} is zero")));
    }
    Ok(scalar)
}

fn parse_v(digits: &str) -> Result<u64> {
    let normalized = normalize_v_hex(digits);
    u64::from_str_radix(&normalized, 16)
        .map_err(|err| Error::InvalidSignatureFormat(format!("v `{digits}` is invalid: {err}")))
}
