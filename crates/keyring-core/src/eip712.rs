//! EIP-712 typed structured data hashing.
//!
//! Implements the hashing used by `eth_signTypedData_v3` and
//! `eth_signTypedData_v4`. The two versions differ only in that v3 has no
//! array support; v4 also encodes a `null` nested struct as a zero word.
//!
//! The final hash to sign is:
//! ```text
//! keccak256("\x19\x01" || domainSeparator || hashStruct(message))
//! ```
//!
//! # Example
//!
//! ```
//! use hw_keyring_core::eip712::{TypedData, TypedDataVersion};
//! use serde_json::json;
//!
//! let typed = TypedData::from_value(&json!({
//!     "types": {
//!         "EIP712Domain": [{"name": "name", "type": "string"}],
//!         "Person": [
//!             {"name": "name", "type": "string"},
//!             {"name": "wallet", "type": "address"}
//!         ]
//!     },
//!     "domain": {"name": "My DApp"},
//!     "primaryType": "Person",
//!     "message": {"name": "Alice", "wallet": "0x0000000000000000000000000000000000000001"}
//! }))
//! .unwrap();
//!
//! let hash = typed.signing_hash(TypedDataVersion::V4).unwrap();
//! assert!(!hash.is_zero());
//! ```
//!
//! [EIP-712]: https://eips.ethereum.org/EIPS/eip-712

use core::fmt;
use core::str::FromStr;
use std::collections::{BTreeSet, HashMap};

use alloy_primitives::{Address as AlloyAddress, B256, U256, keccak256};
use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::Value;

use crate::error::{Error, Result};

const DOMAIN_TYPE: &str = "EIP712Domain";

/// The `eth_signTypedData` flavours a signer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypedDataVersion {
    /// `eth_signTypedData_v3`, without arrays.
    V3,
    /// `eth_signTypedData_v4`.
    V4,
}

impl FromStr for TypedDataVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "V3" | "v3" => Ok(Self::V3),
            "V4" | "v4" => Ok(Self::V4),
            other => Err(Error::UnsupportedVersion(other.to_string())),
        }
    }
}

impl fmt::Display for TypedDataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::V3 => "V3",
            Self::V4 => "V4",
        })
    }
}

/// The EIP-712 domain separator parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip712Domain {
    /// The human-readable name of the signing domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The version of the signing domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// The chain ID where signatures are valid.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_chain_id"
    )]
    pub chain_id: Option<u64>,

    /// The address of the contract verifying the signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifying_contract: Option<String>,

    /// A disambiguating salt for the protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

/// Dapps send `chainId` as a number, a decimal string or a hex string.
fn lenient_chain_id<'de, D>(deserializer: D) -> core::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| de::Error::custom("chainId must be a non-negative integer")),
        Some(Value::String(s)) => {
            let parsed = match s.strip_prefix("0x") {
                Some(hex_digits) => u64::from_str_radix(hex_digits, 16),
                None => s.parse(),
            };
            parsed.map(Some).map_err(de::Error::custom)
        }
        Some(other) => Err(de::Error::custom(format!("invalid chainId: {other}"))),
    }
}

impl Eip712Domain {
    /// Field list of the domain type, in canonical order, for the fields present.
    fn implied_fields(&self) -> Vec<TypeField> {
        [
            (self.name.is_some(), "name", "string"),
            (self.version.is_some(), "version", "string"),
            (self.chain_id.is_some(), "chainId", "uint256"),
            (self.verifying_contract.is_some(), "verifyingContract", "address"),
            (self.salt.is_some(), "salt", "bytes32"),
        ]
        .into_iter()
        .filter(|(present, _, _)| *present)
        .map(|(_, name, ty)| TypeField {
            name: name.to_string(),
            field_type: ty.to_string(),
        })
        .collect()
    }
}

/// A type field definition for EIP-712.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeField {
    /// The name of the field.
    pub name: String,

    /// The type of the field (e.g., "string", "uint256", "address").
    #[serde(rename = "type")]
    pub field_type: String,
}

/// Typed structured data for EIP-712 signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedData {
    /// The EIP-712 domain.
    #[serde(default)]
    pub domain: Eip712Domain,

    /// The type definitions, optionally including `EIP712Domain`.
    pub types: HashMap<String, Vec<TypeField>>,

    /// The primary type being signed.
    pub primary_type: String,

    /// The message data.
    #[serde(default)]
    pub message: Value,
}

impl TypedData {
    /// Parses typed data from an already-decoded JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTypedData`] if the payload does not have the
    /// `types`/`domain`/`primaryType`/`message` shape.
    pub fn from_value(value: &Value) -> Result<Self> {
        Self::deserialize(value).map_err(|err| Error::InvalidTypedData(err.to_string()))
    }

    /// Parses typed data from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JsonError`] if parsing fails.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the typed data to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JsonError`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Rejects constructs the given version cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTypedData`] when v3 data uses array types.
    pub fn validate(&self, version: TypedDataVersion) -> Result<()> {
        if version == TypedDataVersion::V3
            && let Some(field) = self
                .types
                .values()
                .flatten()
                .find(|field| field.field_type.ends_with(']'))
        {
            return Err(Error::InvalidTypedData(format!(
                "arrays are not supported by V3 (field `{}` has type `{}`)",
                field.name, field.field_type
            )));
        }
        Ok(())
    }

    /// Computes the domain separator.
    ///
    /// Uses the declared `EIP712Domain` type when present, otherwise the
    /// canonical field order for the fields the domain sets.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTypedData`] if a domain value is malformed.
    pub fn domain_separator(&self) -> Result<B256> {
        let domain_value = serde_json::to_value(&self.domain)?;
        if self.types.contains_key(DOMAIN_TYPE) {
            return self.hash_struct(DOMAIN_TYPE, &domain_value, TypedDataVersion::V4);
        }

        let mut types = HashMap::with_capacity(1);
        types.insert(DOMAIN_TYPE.to_string(), self.domain.implied_fields());
        let domain_only = Self {
            domain: self.domain.clone(),
            types,
            primary_type: DOMAIN_TYPE.to_string(),
            message: Value::Null,
        };
        domain_only.hash_struct(DOMAIN_TYPE, &domain_value, TypedDataVersion::V4)
    }

    /// Computes `hashStruct(message)` for the primary type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UndefinedType`] or [`Error::InvalidTypedData`] if
    /// the message does not match its type definitions.
    pub fn message_hash(&self, version: TypedDataVersion) -> Result<B256> {
        self.validate(version)?;
        self.hash_struct(&self.primary_type, &self.message, version)
    }

    /// Computes the signing hash for this typed data.
    ///
    /// # Errors
    ///
    /// See [`TypedData::domain_separator`] and [`TypedData::message_hash`].
    pub fn signing_hash(&self, version: TypedDataVersion) -> Result<B256> {
        let domain_separator = self.domain_separator()?;

        let mut data = Vec::with_capacity(2 + 32 + 32);
        data.extend_from_slice(&[0x19, 0x01]);
        data.extend_from_slice(domain_separator.as_slice());
        if self.primary_type != DOMAIN_TYPE {
            data.extend_from_slice(self.message_hash(version)?.as_slice());
        }

        Ok(keccak256(&data))
    }

    /// `hashStruct(s) = keccak256(typeHash || encodeData(s))`
    fn hash_struct(&self, type_name: &str, data: &Value, version: TypedDataVersion) -> Result<B256> {
        let type_hash = keccak256(self.encode_type(type_name)?.as_bytes());
        let encoded_data = self.encode_data(type_name, data, version)?;

        let mut buf = Vec::with_capacity(32 + encoded_data.len());
        buf.extend_from_slice(type_hash.as_slice());
        buf.extend_from_slice(&encoded_data);

        Ok(keccak256(&buf))
    }

    /// Encodes the primary type followed by every transitively referenced
    /// type in alphabetical order.
    fn encode_type(&self, type_name: &str) -> Result<String> {
        let mut dependencies = BTreeSet::new();
        self.collect_dependencies(type_name, &mut dependencies)?;
        dependencies.remove(type_name);

        let mut result = self.encode_single_type(type_name)?;
        for dependency in dependencies {
            result.push_str(&self.encode_single_type(dependency)?);
        }
        Ok(result)
    }

    fn encode_single_type(&self, type_name: &str) -> Result<String> {
        let fields = self.fields(type_name)?;
        let members: Vec<String> = fields
            .iter()
            .map(|f| format!("{} {}", f.field_type, f.name))
            .collect();
        Ok(format!("{type_name}({})", members.join(",")))
    }

    fn collect_dependencies<'a>(
        &'a self,
        type_name: &'a str,
        found: &mut BTreeSet<&'a str>,
    ) -> Result<()> {
        if !found.insert(type_name) {
            return Ok(());
        }
        for field in self.fields(type_name)? {
            let base = base_type(&field.field_type);
            if self.types.contains_key(base) {
                self.collect_dependencies(base, found)?;
            }
        }
        Ok(())
    }

    fn fields(&self, type_name: &str) -> Result<&[TypeField]> {
        self.types
            .get(type_name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::UndefinedType(type_name.to_string()))
    }

    fn encode_data(&self, type_name: &str, data: &Value, version: TypedDataVersion) -> Result<Vec<u8>> {
        let obj = data.as_object().ok_or_else(|| {
            Error::InvalidTypedData(format!("expected object for `{type_name}`"))
        })?;

        let mut encoded = Vec::new();
        for field in self.fields(type_name)? {
            let value = obj.get(&field.name).ok_or_else(|| {
                Error::InvalidTypedData(format!("missing field: {}", field.name))
            })?;
            encoded.extend_from_slice(&self.encode_field(&field.field_type, value, version)?);
        }
        Ok(encoded)
    }

    fn encode_field(&self, field_type: &str, value: &Value, version: TypedDataVersion) -> Result<Vec<u8>> {
        if let Some(item_type) = array_item_type(field_type) {
            let items = value
                .as_array()
                .ok_or_else(|| Error::InvalidTypedData(format!("expected array for `{field_type}`")))?;

            let mut items_encoded = Vec::with_capacity(items.len() * 32);
            for item in items {
                items_encoded.extend_from_slice(&self.encode_field(item_type, item, version)?);
            }
            return Ok(keccak256(&items_encoded).to_vec());
        }

        if self.types.contains_key(field_type) {
            if version == TypedDataVersion::V4 && value.is_null() {
                return Ok(vec![0u8; 32]);
            }
            return Ok(self.hash_struct(field_type, value, version)?.to_vec());
        }

        encode_primitive(field_type, value)
    }
}

/// `Person[][3]` -> `Person`
fn base_type(field_type: &str) -> &str {
    field_type.split('[').next().unwrap_or(field_type)
}

/// `Person[][3]` -> `Person[]`
fn array_item_type(field_type: &str) -> Option<&str> {
    if !field_type.ends_with(']') {
        return None;
    }
    field_type.rfind('[').map(|open| &field_type[..open])
}

fn encode_primitive(field_type: &str, value: &Value) -> Result<Vec<u8>> {
    let mut buf = [0u8; 32];

    match field_type {
        "string" => {
            let s = value
                .as_str()
                .ok_or_else(|| Error::InvalidTypedData("expected string".to_string()))?;
            Ok(keccak256(s.as_bytes()).to_vec())
        }
        "bytes" => {
            let hex_str = value
                .as_str()
                .ok_or_else(|| Error::InvalidTypedData("expected hex string".to_string()))?;
            Ok(keccak256(parse_hex_bytes(hex_str)?).to_vec())
        }
        "bool" => {
            let b = match value {
                Value::Bool(b) => *b,
                Value::String(s) if s == "true" || s == "false" => s == "true",
                _ => return Err(Error::InvalidTypedData("expected bool".to_string())),
            };
            buf[31] = u8::from(b);
            Ok(buf.to_vec())
        }
        "address" => {
            let addr_str = value
                .as_str()
                .ok_or_else(|| Error::InvalidTypedData("expected address string".to_string()))?;
            let addr = parse_address(addr_str)?;
            buf[12..].copy_from_slice(addr.as_slice());
            Ok(buf.to_vec())
        }
        t if t.starts_with("bytes") => {
            let size: usize = t[5..]
                .parse()
                .ok()
                .filter(|size| (1..=32).contains(size))
                .ok_or_else(|| Error::InvalidTypedData(format!("invalid bytes type: {t}")))?;
            let hex_str = value
                .as_str()
                .ok_or_else(|| Error::InvalidTypedData("expected hex string".to_string()))?;
            let bytes = parse_hex_bytes(hex_str)?;
            if bytes.len() > size {
                return Err(Error::InvalidTypedData(format!(
                    "bytes too long for {t}: {} > {size}",
                    bytes.len()
                )));
            }
            buf[..bytes.len()].copy_from_slice(&bytes);
            Ok(buf.to_vec())
        }
        t if t.starts_with("uint") => Ok(parse_uint(value)?.to_be_bytes::<32>().to_vec()),
        t if t.starts_with("int") => Ok(parse_int(value)?.to_be_bytes::<32>().to_vec()),
        _ => Err(Error::InvalidTypedData(format!(
            "unsupported type: {field_type}"
        ))),
    }
}

fn parse_address(s: &str) -> Result<AlloyAddress> {
    let bytes = parse_hex_bytes(s)?;
    if bytes.len() != 20 {
        return Err(Error::InvalidTypedData(format!(
            "invalid address length: {}",
            bytes.len()
        )));
    }
    Ok(AlloyAddress::from_slice(&bytes))
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    Ok(hex::decode(s)?)
}

fn parse_uint(value: &Value) -> Result<U256> {
    if let Some(n) = value.as_u64() {
        return Ok(U256::from(n));
    }
    if let Some(s) = value.as_str() {
        if let Some(hex_str) = s.strip_prefix("0x") {
            return U256::from_str_radix(hex_str, 16)
                .map_err(|_| Error::InvalidTypedData(format!("invalid hex uint: {s}")));
        }
        return U256::from_str_radix(s, 10)
            .map_err(|_| Error::InvalidTypedData(format!("invalid uint: {s}")));
    }
    Err(Error::InvalidTypedData("expected uint".to_string()))
}

/// Parses a signed integer into its 256-bit two's complement word.
fn parse_int(value: &Value) -> Result<U256> {
    if let Some(n) = value.as_i64() {
        let magnitude = U256::from(n.unsigned_abs());
        return Ok(if n < 0 {
            U256::ZERO.wrapping_sub(magnitude)
        } else {
            magnitude
        });
    }
    if let Some(s) = value.as_str()
        && let Some(digits) = s.strip_prefix('-')
    {
        let magnitude = parse_uint(&Value::String(digits.to_string()))?;
        return Ok(U256::ZERO.wrapping_sub(magnitude));
    }
    parse_uint(value)
}
