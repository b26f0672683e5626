//! Requests and responses exchanged with a signer.
//!
//! Every request has an action name. Replies carry the same name with a
//! `-reply` suffix, which lets a session reject a reply that answers a
//! different request than the one it was correlated with.

use core::fmt;
use core::str::FromStr;

use alloy_primitives::{B256, Bytes, U256};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::address::Address;
use crate::eip712::TypedDataVersion;
use crate::error::{Error, Result};
use crate::pairing::Credentials;
use crate::signature::SignatureParts;
use crate::store::OwnerId;
use crate::transaction::LegacyTransaction;

/// Action names understood by signers.
pub mod action {
    /// Establish a session.
    pub const CONNECT: &str = "connect";
    /// Query the wallet the device currently has active.
    pub const FETCH_ACTIVE_WALLET: &str = "fetch-active-wallet";
    /// Derive a run of addresses.
    pub const GET_ADDRESSES: &str = "get-addresses";
    /// Sign an encoded transaction payload.
    pub const SIGN_PAYLOAD: &str = "sign-payload";
    /// Sign a legacy transaction sent field by field.
    pub const SIGN_LEGACY: &str = "sign-legacy-transaction";
    /// Sign a personal message or typed data.
    pub const SIGN_MESSAGE: &str = "sign-message";
    /// Tear down a bridge.
    pub const CLOSE_BRIDGE: &str = "close-bridge";
}

/// Suffix appended to an action to name its reply.
pub const REPLY_SUFFIX: &str = "-reply";

/// Returns the reply tag for `action`.
#[must_use]
pub fn reply_action(action: &str) -> String {
    format!("{action}{REPLY_SUFFIX}")
}

/// Signer firmware version, ordered numerically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FirmwareVersion {
    /// Major component.
    pub major: u16,
    /// Minor component.
    pub minor: u16,
    /// Fix component.
    pub fix: u16,
}

impl FirmwareVersion {
    /// Builds a version.
    #[must_use]
    pub const fn new(major: u16, minor: u16, fix: u16) -> Self {
        Self { major, minor, fix }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.fix)
    }
}

impl FromStr for FirmwareVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().trim_start_matches('v').split('.');
        let mut next = || -> Result<u16> {
            parts
                .next()
                .unwrap_or("0")
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("invalid firmware version `{s}`")))
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(Error::InvalidConfig(format!(
                "invalid firmware version `{s}`"
            )));
        }
        Ok(version)
    }
}

impl TryFrom<String> for FirmwareVersion {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<FirmwareVersion> for String {
    fn from(version: FirmwareVersion) -> Self {
        version.to_string()
    }
}

/// What a signer reports about itself on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    /// Wallet currently active on the device.
    #[serde(default)]
    pub active_owner: Option<OwnerId>,
    /// Firmware version.
    pub firmware: FirmwareVersion,
}

/// Opaque device state a transport can export and later rehydrate from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportState(pub Value);

/// Parameters of [`action::CONNECT`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Pairing credentials, when the signer requires them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

/// Parameters of [`action::GET_ADDRESSES`].
///
/// The signer derives `count` addresses, incrementing the last index of
/// `start_path` each time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAddressesParams {
    /// Path of the first address.
    pub start_path: Vec<u32>,
    /// Number of addresses to derive.
    pub count: u32,
}

/// Curve the signer signs with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Curve {
    /// secp256k1.
    #[default]
    Secp256k1,
}

/// Hash the signer applies to the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HashType {
    /// Keccak-256.
    #[default]
    Keccak256,
}

/// How the signer should interpret the payload for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadEncoding {
    /// An unsigned EVM transaction.
    #[default]
    EvmTransaction,
}

/// Parameters of [`action::SIGN_PAYLOAD`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignPayloadParams {
    /// Path of the signing key.
    pub signer_path: Vec<u32>,
    /// Signing curve.
    pub curve: Curve,
    /// Hash applied to `payload`.
    pub hash_type: HashType,
    /// Payload interpretation.
    pub encoding: PayloadEncoding,
    /// Unsigned payload.
    pub payload: Bytes,
    /// Calldata decoder helping the signer display the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoder: Option<Bytes>,
}

/// Parameters of [`action::SIGN_LEGACY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignLegacyParams {
    /// Path of the signing key.
    pub signer_path: Vec<u32>,
    /// Chain id.
    pub chain_id: u64,
    /// Nonce.
    pub nonce: u64,
    /// Gas price in wei.
    pub gas_price: U256,
    /// Gas limit.
    pub gas_limit: u64,
    /// Recipient.
    pub to: Option<Address>,
    /// Value in wei.
    pub value: U256,
    /// Calldata.
    pub data: Bytes,
}

impl SignLegacyParams {
    /// Splits a legacy transaction into fields.
    #[must_use]
    pub fn new(signer_path: Vec<u32>, tx: &LegacyTransaction) -> Self {
        Self {
            signer_path,
            chain_id: tx.chain_id,
            nonce: tx.nonce,
            gas_price: tx.gas_price,
            gas_limit: tx.gas_limit,
            to: tx.to,
            value: tx.value,
            data: Bytes::copy_from_slice(&tx.data),
        }
    }

    /// Reassembles the transaction.
    #[must_use]
    pub fn transaction(&self) -> LegacyTransaction {
        LegacyTransaction {
            chain_id: self.chain_id,
            nonce: self.nonce,
            gas_price: self.gas_price,
            gas_limit: self.gas_limit,
            to: self.to,
            value: self.value,
            data: self.data.to_vec(),
        }
    }
}

/// Message signing protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageProtocol {
    /// EIP-191 `personal_sign`.
    Personal,
    /// EIP-712 typed data.
    Eip712,
}

/// Parameters of [`action::SIGN_MESSAGE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignMessageParams {
    /// Path of the signing key.
    pub signer_path: Vec<u32>,
    /// Protocol of `payload`.
    pub protocol: MessageProtocol,
    /// Hex message bytes for personal messages, the typed data object for EIP-712.
    pub payload: Value,
    /// Typed data version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<TypedDataVersion>,
    /// Precomputed domain separator, for signers that cannot hash typed data.
    #[serde(
        default,
        rename = "domainSeparatorHex",
        skip_serializing_if = "Option::is_none"
    )]
    pub domain_separator: Option<B256>,
    /// Precomputed message struct hash, for signers that cannot hash typed data.
    #[serde(
        default,
        rename = "hashStructMessageHex",
        skip_serializing_if = "Option::is_none"
    )]
    pub struct_hash: Option<B256>,
}

/// A request to a signer.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceRequest {
    /// [`action::CONNECT`].
    Connect(ConnectParams),
    /// [`action::FETCH_ACTIVE_WALLET`].
    FetchActiveWallet,
    /// [`action::GET_ADDRESSES`].
    GetAddresses(GetAddressesParams),
    /// [`action::SIGN_PAYLOAD`].
    SignPayload(SignPayloadParams),
    /// [`action::SIGN_LEGACY`].
    SignLegacy(SignLegacyParams),
    /// [`action::SIGN_MESSAGE`].
    SignMessage(SignMessageParams),
}

impl DeviceRequest {
    /// The action name.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Connect(_) => action::CONNECT,
            Self::FetchActiveWallet => action::FETCH_ACTIVE_WALLET,
            Self::GetAddresses(_) => action::GET_ADDRESSES,
            Self::SignPayload(_) => action::SIGN_PAYLOAD,
            Self::SignLegacy(_) => action::SIGN_LEGACY,
            Self::SignMessage(_) => action::SIGN_MESSAGE,
        }
    }

    /// Returns `true` for requests that wait on user confirmation.
    #[must_use]
    pub const fn is_signing(&self) -> bool {
        matches!(
            self,
            Self::SignPayload(_) | Self::SignLegacy(_) | Self::SignMessage(_)
        )
    }

    /// Encodes the parameters as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JsonError`] if serialization fails.
    pub fn params(&self) -> Result<Value> {
        Ok(match self {
            Self::Connect(params) => serde_json::to_value(params)?,
            Self::FetchActiveWallet => json!({}),
            Self::GetAddresses(params) => serde_json::to_value(params)?,
            Self::SignPayload(params) => serde_json::to_value(params)?,
            Self::SignLegacy(params) => serde_json::to_value(params)?,
            Self::SignMessage(params) => serde_json::to_value(params)?,
        })
    }

    /// Decodes a request from its action name and JSON parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportRejected`] for unknown actions and
    /// [`Error::JsonError`] for malformed parameters.
    pub fn from_parts(action_name: &str, params: Value) -> Result<Self> {
        Ok(match action_name {
            action::CONNECT => Self::Connect(serde_json::from_value(params)?),
            action::FETCH_ACTIVE_WALLET => Self::FetchActiveWallet,
            action::GET_ADDRESSES => Self::GetAddresses(serde_json::from_value(params)?),
            action::SIGN_PAYLOAD => Self::SignPayload(serde_json::from_value(params)?),
            action::SIGN_LEGACY => Self::SignLegacy(serde_json::from_value(params)?),
            action::SIGN_MESSAGE => Self::SignMessage(serde_json::from_value(params)?),
            other => {
                return Err(Error::TransportRejected(format!(
                    "unknown action `{other}`"
                )));
            }
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveWalletPayload {
    #[serde(default)]
    active_owner: Option<OwnerId>,
}

/// A signer's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceResponse {
    /// Answer to [`action::CONNECT`].
    Connected(DeviceState),
    /// Answer to [`action::FETCH_ACTIVE_WALLET`].
    ActiveWallet(Option<OwnerId>),
    /// Answer to [`action::GET_ADDRESSES`].
    Addresses(Vec<Address>),
    /// Answer to any signing action.
    Signature(SignatureParts),
}

impl DeviceResponse {
    /// Encodes the response as a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JsonError`] if serialization fails.
    pub fn to_payload(&self) -> Result<Value> {
        Ok(match self {
            Self::Connected(state) => serde_json::to_value(state)?,
            Self::ActiveWallet(owner) => serde_json::to_value(ActiveWalletPayload {
                active_owner: owner.clone(),
            })?,
            Self::Addresses(addresses) => serde_json::to_value(addresses)?,
            Self::Signature(parts) => serde_json::to_value(parts)?,
        })
    }

    /// Decodes the payload of a reply to `request_action`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedResponse`] if the payload does not have the
    /// shape that action answers with.
    pub fn from_payload(request_action: &str, payload: Value) -> Result<Self> {
        let malformed =
            |err: serde_json::Error| Error::UnexpectedResponse(format!("{request_action}: {err}"));
        Ok(match request_action {
            action::CONNECT => Self::Connected(serde_json::from_value(payload).map_err(malformed)?),
            action::FETCH_ACTIVE_WALLET => {
                let decoded: ActiveWalletPayload =
                    serde_json::from_value(payload).map_err(malformed)?;
                Self::ActiveWallet(decoded.active_owner)
            }
            action::GET_ADDRESSES => {
                Self::Addresses(serde_json::from_value(payload).map_err(malformed)?)
            }
            action::SIGN_PAYLOAD | action::SIGN_LEGACY | action::SIGN_MESSAGE => {
                Self::Signature(serde_json::from_value(payload).map_err(malformed)?)
            }
            other => {
                return Err(Error::UnexpectedResponse(format!(
                    "reply to unknown action `{other}`"
                )));
            }
        })
    }

    /// Short name of the variant, for logs and errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::ActiveWallet(_) => "active-wallet",
            Self::Addresses(_) => "addresses",
            Self::Signature(_) => "signature",
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("0.15.0" => FirmwareVersion::new(0, 15, 0))]
    #[test_case("v1.2" => FirmwareVersion::new(1, 2, 0))]
    #[test_case("2" => FirmwareVersion::new(2, 0, 0))]
    fn parses_firmware(raw: &str) -> FirmwareVersion {
        raw.parse().unwrap()
    }

    #[test]
    fn firmware_orders_numerically() {
        assert!(FirmwareVersion::new(0, 9, 9) < FirmwareVersion::new(0, 10, 0));
        assert!(FirmwareVersion::new(1, 0, 0) > FirmwareVersion::new(0, 15, 7));
        assert!("1.2.3.4".parse::<FirmwareVersion>().is_err());
        assert!("a.b".parse::<FirmwareVersion>().is_err());
    }

    #[test]
    fn request_params_round_trip_through_parts() {
        let request = DeviceRequest::SignMessage(SignMessageParams {
            signer_path: vec![0x8000_002c, 0],
            protocol: MessageProtocol::Eip712,
            payload: json!({"primaryType": "Mail"}),
            version: Some(TypedDataVersion::V4),
            domain_separator: Some(B256::repeat_byte(0x11)),
            struct_hash: None,
        });
        let params = request.params().unwrap();
        assert!(params.get("domainSeparatorHex").is_some());
        assert!(params.get("hashStructMessageHex").is_none());

        let back = DeviceRequest::from_parts(request.action(), params).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(matches!(
            DeviceRequest::from_parts("reboot", json!({})),
            Err(Error::TransportRejected(_))
        ));
    }

    #[test]
    fn response_payloads_round_trip() {
        let responses = [
            (
                action::CONNECT,
                DeviceResponse::Connected(DeviceState {
                    active_owner: Some(OwnerId::new("uid-1")),
                    firmware: FirmwareVersion::new(0, 15, 0),
                }),
            ),
            (action::FETCH_ACTIVE_WALLET, DeviceResponse::ActiveWallet(None)),
            (
                action::GET_ADDRESSES,
                DeviceResponse::Addresses(vec![Address::new([7; 20])]),
            ),
            (
                action::SIGN_LEGACY,
                DeviceResponse::Signature(SignatureParts::from_scalars(&[1; 32], &[2; 32], None)),
            ),
        ];
        for (request_action, response) in responses {
            let payload = response.to_payload().unwrap();
            assert_eq!(
                DeviceResponse::from_payload(request_action, payload).unwrap(),
                response
            );
        }
    }

    #[test]
    fn malformed_payload_is_unexpected() {
        assert!(matches!(
            DeviceResponse::from_payload(action::GET_ADDRESSES, json!({"nope": 1})),
            Err(Error::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn legacy_params_preserve_transaction() {
        let tx = LegacyTransaction {
            chain_id: 1,
            nonce: 3,
            gas_price: U256::from(5u64),
            gas_limit: 21000,
            to: None,
            value: U256::from(7u64),
            data: vec![1, 2, 3],
        };
        assert_eq!(SignLegacyParams::new(vec![1], &tx).transaction(), tx);
    }
}
