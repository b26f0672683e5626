//! Ethereum transaction types and signing payloads.
//!
//! Supported formats:
//!
//! - **EIP-155 legacy** transactions with chain-id replay protection
//! - **EIP-2930** (type 1) access-list transactions
//! - **EIP-1559** (type 2) fee-market transactions
//!
//! Signers that understand the encoded-payload protocol receive
//! [`Transaction::signing_payload`], the exact byte string whose Keccak-256
//! hash is signed. Older signers receive legacy fields one by one.
//!
//! # Example
//!
//! ```
//! use hw_keyring_core::{Address, Eip1559Transaction, Transaction};
//! use alloy_primitives::U256;
//!
//! let tx = Transaction::Eip1559(Eip1559Transaction {
//!     chain_id: 1,
//!     nonce: 0,
//!     max_priority_fee_per_gas: U256::from(1_000_000_000u64),
//!     max_fee_per_gas: U256::from(100_000_000_000u64),
//!     gas_limit: 21000,
//!     to: Some(Address::zero()),
//!     value: U256::from(1_000_000_000_000_000_000u128),
//!     data: vec![],
//!     access_list: vec![],
//! });
//!
//! assert_eq!(tx.signing_payload()[0], 0x02);
//! assert_eq!(tx.v_for_parity(1), 1);
//! ```

use alloy_primitives::{B256, U256, keccak256};
use alloy_rlp::{Encodable, RlpEncodable};
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::Result;
use crate::signature::{Signature, hex_vec};

/// An access list entry for EIP-2930/EIP-1559 transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, RlpEncodable)]
#[serde(rename_all = "camelCase")]
pub struct AccessListEntry {
    /// The address being accessed.
    pub address: alloy_primitives::Address,

    /// The storage keys being accessed at this address.
    pub storage_keys: Vec<B256>,
}

/// An EIP-155 legacy transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyTransaction {
    /// The chain ID for replay protection.
    pub chain_id: u64,
    /// The transaction nonce.
    pub nonce: u64,
    /// The gas price in wei.
    pub gas_price: U256,
    /// The gas limit.
    pub gas_limit: u64,
    /// The recipient address, or `None` for contract creation.
    pub to: Option<Address>,
    /// The value to transfer in wei.
    pub value: U256,
    /// The transaction input data.
    #[serde(default, with = "hex_vec")]
    pub data: Vec<u8>,
}

impl LegacyTransaction {
    fn encode_fields(&self, buf: &mut Vec<u8>) {
        self.nonce.encode(buf);
        encode_u256(&self.gas_price, buf);
        self.gas_limit.encode(buf);
        encode_optional_address(self.to.as_ref(), buf);
        encode_u256(&self.value, buf);
        self.data.as_slice().encode(buf);
    }

    /// `rlp([nonce, gasPrice, gasLimit, to, value, data, chainId, 0, 0])`.
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.data.len());
        encode_rlp_list(&mut buf, |buf| {
            self.encode_fields(buf);
            self.chain_id.encode(buf);
            0u8.encode(buf);
            0u8.encode(buf);
        });
        buf
    }

    /// `rlp([nonce, gasPrice, gasLimit, to, value, data, v, r, s])`.
    #[must_use]
    pub fn signed_rlp(&self, signature: &Signature) -> Vec<u8> {
        let mut buf = Vec::with_capacity(160 + self.data.len());
        encode_rlp_list(&mut buf, |buf| {
            self.encode_fields(buf);
            signature.v().encode(buf);
            encode_bytes32(signature.r(), buf);
            encode_bytes32(signature.s(), buf);
        });
        buf
    }

    fn eip155_offset(&self) -> u64 {
        self.chain_id.saturating_mul(2).saturating_add(35)
    }
}

/// An EIP-2930 (type 1) access-list transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip2930Transaction {
    /// The chain ID.
    pub chain_id: u64,
    /// The transaction nonce.
    pub nonce: u64,
    /// The gas price in wei.
    pub gas_price: U256,
    /// The gas limit.
    pub gas_limit: u64,
    /// The recipient address, or `None` for contract creation.
    pub to: Option<Address>,
    /// The value to transfer in wei.
    pub value: U256,
    /// The transaction input data.
    #[serde(default, with = "hex_vec")]
    pub data: Vec<u8>,
    /// The access list.
    #[serde(default)]
    pub access_list: Vec<AccessListEntry>,
}

impl Eip2930Transaction {
    /// The transaction type identifier for EIP-2930.
    pub const TX_TYPE: u8 = 0x01;

    fn encode_fields(&self, buf: &mut Vec<u8>) {
        self.chain_id.encode(buf);
        self.nonce.encode(buf);
        encode_u256(&self.gas_price, buf);
        self.gas_limit.encode(buf);
        encode_optional_address(self.to.as_ref(), buf);
        encode_u256(&self.value, buf);
        self.data.as_slice().encode(buf);
        encode_access_list(&self.access_list, buf);
    }
}

/// An EIP-1559 (type 2) fee-market transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip1559Transaction {
    /// The chain ID.
    pub chain_id: u64,
    /// The transaction nonce.
    pub nonce: u64,
    /// The maximum priority fee per gas (tip).
    pub max_priority_fee_per_gas: U256,
    /// The maximum total fee per gas.
    pub max_fee_per_gas: U256,
    /// The gas limit.
    pub gas_limit: u64,
    /// The recipient address, or `None` for contract creation.
    pub to: Option<Address>,
    /// The value to transfer in wei.
    pub value: U256,
    /// The transaction input data.
    #[serde(default, with = "hex_vec")]
    pub data: Vec<u8>,
    /// The access list.
    #[serde(default)]
    pub access_list: Vec<AccessListEntry>,
}

impl Eip1559Transaction {
    /// The transaction type identifier for EIP-1559.
    pub const TX_TYPE: u8 = 0x02;

    fn encode_fields(&self, buf: &mut Vec<u8>) {
        self.chain_id.encode(buf);
        self.nonce.encode(buf);
        encode_u256(&self.max_priority_fee_per_gas, buf);
        encode_u256(&self.max_fee_per_gas, buf);
        self.gas_limit.encode(buf);
        encode_optional_address(self.to.as_ref(), buf);
        encode_u256(&self.value, buf);
        self.data.as_slice().encode(buf);
        encode_access_list(&self.access_list, buf);
    }
}

/// Builds `type || rlp(fields)` for a typed transaction.
fn typed_payload(tx_type: u8, capacity: usize, fields: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
    let mut buf = Vec::with_capacity(capacity);
    buf.push(tx_type);
    encode_rlp_list(&mut buf, fields);
    buf
}

/// Builds `type || rlp(fields ++ [yParity, r, s])` for a typed transaction.
fn typed_signed(
    tx_type: u8,
    capacity: usize,
    signature: &Signature,
    fields: impl FnOnce(&mut Vec<u8>),
) -> Vec<u8> {
    typed_payload(tx_type, capacity, |buf| {
        fields(buf);
        signature.v().encode(buf);
        encode_bytes32(signature.r(), buf);
        encode_bytes32(signature.s(), buf);
    })
}

/// Encodes an RLP list using a closure to write elements.
fn encode_rlp_list<F>(out: &mut Vec<u8>, f: F)
where
    F: FnOnce(&mut Vec<u8>),
{
    let mut content = Vec::new();
    f(&mut content);

    let header = alloy_rlp::Header {
        list: true,
        payload_length: content.len(),
    };
    header.encode(out);
    out.extend_from_slice(&content);
}

/// Encodes a U256 as a minimal big-endian RLP string.
fn encode_u256(value: &U256, out: &mut Vec<u8>) {
    encode_bytes32(&value.to_be_bytes::<32>(), out);
}

fn encode_optional_address(addr: Option<&Address>, out: &mut Vec<u8>) {
    match addr {
        Some(a) => a.inner().encode(out),
        None => out.push(alloy_rlp::EMPTY_STRING_CODE),
    }
}

/// Encodes a 32-byte big-endian scalar, stripping leading zeros.
fn encode_bytes32(bytes: &[u8; 32], out: &mut Vec<u8>) {
    match bytes.iter().position(|&b| b != 0) {
        Some(start) => bytes[start..].encode(out),
        None => out.push(alloy_rlp::EMPTY_STRING_CODE),
    }
}

fn encode_access_list(access_list: &[AccessListEntry], out: &mut Vec<u8>) {
    encode_rlp_list(out, |out| {
        for entry in access_list {
            entry.encode(out);
        }
    });
}

/// A transaction in any supported format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Transaction {
    /// EIP-155 legacy transaction.
    #[serde(rename = "legacy")]
    Legacy(LegacyTransaction),
    /// EIP-2930 (type 1) transaction.
    #[serde(rename = "eip2930")]
    Eip2930(Eip2930Transaction),
    /// EIP-1559 (type 2) transaction.
    #[serde(rename = "eip1559")]
    Eip1559(Eip1559Transaction),
}

impl Transaction {
    /// Returns the unsigned byte string whose Keccak-256 hash gets signed.
    ///
    /// For legacy transactions this is the EIP-155 RLP list, for typed
    /// transactions the type byte followed by the RLP field list.
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        match self {
            Self::Legacy(tx) => tx.signing_payload(),
            Self::Eip2930(tx) => typed_payload(
                Eip2930Transaction::TX_TYPE,
                160 + tx.data.len(),
                |buf| tx.encode_fields(buf),
            ),
            Self::Eip1559(tx) => typed_payload(
                Eip1559Transaction::TX_TYPE,
                192 + tx.data.len(),
                |buf| tx.encode_fields(buf),
            ),
        }
    }

    /// Returns the signing hash for this transaction.
    #[must_use]
    pub fn signing_hash(&self) -> B256 {
        keccak256(self.signing_payload())
    }

    /// Returns the chain ID for this transaction.
    #[must_use]
    pub const fn chain_id(&self) -> u64 {
        match self {
            Self::Legacy(tx) => tx.chain_id,
            Self::Eip2930(tx) => tx.chain_id,
            Self::Eip1559(tx) => tx.chain_id,
        }
    }

    /// Returns the EIP-2718 type byte, `0` for legacy transactions.
    #[must_use]
    pub const fn tx_type(&self) -> u8 {
        match self {
            Self::Legacy(_) => 0,
            Self::Eip2930(_) => Eip2930Transaction::TX_TYPE,
            Self::Eip1559(_) => Eip1559Transaction::TX_TYPE,
        }
    }

    /// Returns `true` for EIP-2718 typed transactions.
    #[must_use]
    pub const fn is_typed(&self) -> bool {
        !matches!(self, Self::Legacy(_))
    }

    /// Names the signer capability a typed transaction needs.
    #[must_use]
    pub const fn required_capability(&self) -> Option<&'static str> {
        match self {
            Self::Legacy(_) => None,
            Self::Eip2930(_) => Some("EIP-2930 access-list transactions"),
            Self::Eip1559(_) => Some("EIP-1559 fee-market transactions"),
        }
    }

    /// Recipient, `None` for contract creation.
    #[must_use]
    pub const fn to(&self) -> Option<&Address> {
        match self {
            Self::Legacy(tx) => tx.to.as_ref(),
            Self::Eip2930(tx) => tx.to.as_ref(),
            Self::Eip1559(tx) => tx.to.as_ref(),
        }
    }

    /// Transaction input data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Legacy(tx) => &tx.data,
            Self::Eip2930(tx) => &tx.data,
            Self::Eip1559(tx) => &tx.data,
        }
    }

    /// Converts a recovery parity into the on-chain `v` for this transaction.
    ///
    /// Legacy transactions use `chainId * 2 + 35 + parity`, typed
    /// transactions use the bare parity.
    #[must_use]
    pub fn v_for_parity(&self, parity: u8) -> u64 {
        match self {
            Self::Legacy(tx) => tx.eip155_offset().saturating_add(u64::from(parity)),
            Self::Eip2930(_) | Self::Eip1559(_) => u64::from(parity),
        }
    }

    /// Extracts the recovery parity from a signer-supplied `v`.
    ///
    /// Accepts the canonical form for this transaction as well as the bare
    /// parities `0`/`1` and the pre-EIP-155 values `27`/`28`.
    #[must_use]
    pub fn parity_for_v(&self, v: u64) -> Option<u8> {
        match v {
            0 | 1 => return u8::try_from(v).ok(),
            27 | 28 => return u8::try_from(v - 27).ok(),
            _ => {}
        }
        match self {
            Self::Legacy(tx) => v
                .checked_sub(tx.eip155_offset())
                .filter(|parity| *parity <= 1)
                .and_then(|parity| u8::try_from(parity).ok()),
            Self::Eip2930(_) | Self::Eip1559(_) => None,
        }
    }

    /// Creates the signed, network-ready encoding.
    ///
    /// `signature.v()` must already be the on-chain value, see
    /// [`Transaction::v_for_parity`].
    #[must_use]
    pub fn signed_rlp(&self, signature: &Signature) -> Vec<u8> {
        match self {
            Self::Legacy(tx) => tx.signed_rlp(signature),
            Self::Eip2930(tx) => typed_signed(
                Eip2930Transaction::TX_TYPE,
                224 + tx.data.len(),
                signature,
                |buf| tx.encode_fields(buf),
            ),
            Self::Eip1559(tx) => typed_signed(
                Eip1559Transaction::TX_TYPE,
                256 + tx.data.len(),
                signature,
                |buf| tx.encode_fields(buf),
            ),
        }
    }

    /// Parses a transaction from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::JsonError`] if parsing fails.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the transaction to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::JsonError`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A transaction awaiting a signature.
///
/// `frozen` marks a transaction the caller treats as immutable; the flag is
/// carried through to the [`SignedTransaction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTransaction {
    /// The transaction body.
    pub transaction: Transaction,
    /// Whether the caller froze the transaction object.
    #[serde(default)]
    pub frozen: bool,
}

impl UnsignedTransaction {
    /// Wraps a transaction, unfrozen.
    #[must_use]
    pub const fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            frozen: false,
        }
    }

    /// Marks the transaction frozen.
    #[must_use]
    pub const fn frozen(mut self) -> Self {
        self.frozen = true;
        self
    }
}

impl From<Transaction> for UnsignedTransaction {
    fn from(transaction: Transaction) -> Self {
        Self::new(transaction)
    }
}

/// A transaction with its signature attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    transaction: Transaction,
    signature: Signature,
    frozen: bool,
}

impl SignedTransaction {
    /// Attaches `signature` to `unsigned`, keeping its frozen flag.
    #[must_use]
    pub fn new(unsigned: &UnsignedTransaction, signature: Signature) -> Self {
        Self {
            transaction: unsigned.transaction.clone(),
            signature,
            frozen: unsigned.frozen,
        }
    }

    /// The transaction body.
    #[must_use]
    pub const fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// The attached signature.
    #[must_use]
    pub const fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Whether the originating transaction was frozen.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Network-ready encoding.
    #[must_use]
    pub fn raw(&self) -> Vec<u8> {
        self.transaction.signed_rlp(&self.signature)
    }

    /// Network-ready encoding as `0x`-prefixed hex.
    #[must_use]
    pub fn raw_hex(&self) -> String {
        format!("0x{}", hex::encode(self.raw()))
    }

    /// Transaction hash, the Keccak-256 of [`SignedTransaction::raw`].
    #[must_use]
    pub fn hash(&self) -> B256 {
        keccak256(self.raw())
    }
}
