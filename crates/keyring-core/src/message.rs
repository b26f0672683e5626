//! Personal message and typed data signing.
//!
//! Same shape as [`crate::signing`]: guard, build, dispatch, validate,
//! guard again. Requests carry a [`MessageProtocol`] instead of a
//! transaction, and the result is the 65-byte `r || s || v` hex string
//! with `v` in the `27`/`28` form.

use alloy_primitives::B256;
use serde_json::Value;
use tracing::info;

use crate::config::KeyringConfig;
use crate::crypto::{personal_message_hash, recover_address, recovery_id_for};
use crate::eip712::{TypedData, TypedDataVersion};
use crate::error::{Error, Result};
use crate::guard::IdentityGuard;
use crate::session::Flight;
use crate::signature::{Signature, ValidatedParts};
use crate::signing::{SigningStage, enter, expect_signature};
use crate::store::Account;
use crate::transport::DeviceRequest;
use crate::transport::protocol::{MessageProtocol, SignMessageParams};

/// `v` offset of message signatures.
const MESSAGE_V_OFFSET: u64 = 27;

/// Decodes a personal message: `0x`-prefixed valid hex is taken as bytes,
/// anything else as UTF-8 text.
#[must_use]
pub fn message_bytes(message: &str) -> Vec<u8> {
    message
        .strip_prefix("0x")
        .and_then(|digits| hex::decode(digits).ok())
        .unwrap_or_else(|| message.as_bytes().to_vec())
}

/// Signs messages for accounts of one keyring.
#[derive(Debug, Clone, Copy)]
pub struct MessagePipeline<'a> {
    config: &'a KeyringConfig,
}

impl<'a> MessagePipeline<'a> {
    /// Pipeline using `config` thresholds and timeouts.
    #[must_use]
    pub const fn new(config: &'a KeyringConfig) -> Self {
        Self { config }
    }

    /// Signs an EIP-191 personal message.
    ///
    /// # Errors
    ///
    /// Identity, transport and signature errors, as for transactions.
    pub async fn sign_personal(&self, flight: &Flight<'_>, account: &Account, message: &str) -> Result<String> {
        const OP: &str = "personal-message";
        let bytes = message_bytes(message);
        let guard = IdentityGuard::new(flight);

        enter(SigningStage::AwaitingGuard, OP);
        guard.ensure_active_owner(&account.owner_id).await?;

        enter(SigningStage::BuildingRequest, OP);
        let request = DeviceRequest::SignMessage(SignMessageParams {
            signer_path: account.signer_path()?,
            protocol: MessageProtocol::Personal,
            payload: Value::String(format!("0x{}", hex::encode(&bytes))),
            version: None,
            domain_separator: None,
            struct_hash: None,
        });

        self.dispatch(flight, account, request, personal_message_hash(&bytes), OP)
            .await
    }

    /// Signs EIP-712 typed data. `typed` must already be parsed and its
    /// version known, so unsupported input fails before any I/O.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTypedData`] if `typed` cannot be expressed in `version`
    /// - [`Error::UnsupportedFirmware`] if the signer cannot sign typed data
    /// - identity, transport and signature errors, as for transactions
    pub async fn sign_typed_data(
        &self,
        flight: &Flight<'_>,
        account: &Account,
        typed: &TypedData,
        version: TypedDataVersion,
    ) -> Result<String> {
        const OP: &str = "typed-data";
        typed.validate(version)?;
        let domain_separator = typed.domain_separator()?;
        let struct_hash = typed.message_hash(version)?;
        let digest = typed.signing_hash(version)?;
        let guard = IdentityGuard::new(flight);

        enter(SigningStage::AwaitingGuard, OP);
        guard.ensure_active_owner(&account.owner_id).await?;

        enter(SigningStage::BuildingRequest, OP);
        let firmware = flight.session().firmware().ok_or(Error::Disconnected)?;
        let required = self.config.typed_data_min_firmware;
        if firmware < required {
            return Err(Error::UnsupportedFirmware {
                request: "EIP-712 typed data".to_string(),
                required: required.to_string(),
                actual: firmware.to_string(),
            });
        }
        let request = DeviceRequest::SignMessage(SignMessageParams {
            signer_path: account.signer_path()?,
            protocol: MessageProtocol::Eip712,
            payload: serde_json::to_value(typed)?,
            version: Some(version),
            domain_separator: Some(domain_separator),
            struct_hash: Some(struct_hash),
        });

        self.dispatch(flight, account, request, digest, OP).await
    }

    async fn dispatch(
        &self,
        flight: &Flight<'_>,
        account: &Account,
        request: DeviceRequest,
        digest: B256,
        operation: &'static str,
    ) -> Result<String> {
        enter(SigningStage::AwaitingDevice, operation);
        let response = flight.request(request, self.config.sign_timeout()).await?;

        enter(SigningStage::ValidatingResponse, operation);
        let parts = expect_signature(response)?;
        IdentityGuard::new(flight)
            .confirm_unchanged(&account.owner_id)
            .await?;
        let signature = finalize(&digest, &parts, account)?;

        enter(SigningStage::Done, operation);
        info!(account = %account.address, operation, "message signed");
        Ok(signature.to_rsv_hex())
    }
}

fn finalize(digest: &B256, parts: &ValidatedParts, account: &Account) -> Result<Signature> {
    let parity = match parts.v {
        Some(v) => {
            let parity = match v {
                0 | 1 => v,
                27 | 28 => v - MESSAGE_V_OFFSET,
                other => {
                    return Err(Error::InvalidSignatureFormat(format!(
                        "message signature has v {other}"
                    )));
                }
            };
            let parity = u8::try_from(parity)
                .map_err(|_| Error::InvalidSignatureFormat(format!("v {v} out of range")))?;
            if recover_address(digest, &parts.r, &parts.s, parity)? != account.address {
                return Err(Error::SignatureMismatch);
            }
            parity
        }
        None => recovery_id_for(digest, &parts.r, &parts.s, &account.address)?,
    };
    Ok(Signature::new(
        parts.r,
        parts.s,
        MESSAGE_V_OFFSET + u64::from(parity),
    ))
}

#[cfg(test)]
mod tests {
    use k256::ecdsa::SigningKey;
    use test_case::test_case;

    use super::*;
    use crate::address::Address;
    use crate::crypto::sign_prehash;
    use crate::hd_path::PathTemplate;
    use crate::store::OwnerId;

    #[test_case("hello" => b"hello".to_vec(); "utf8 text")]
    #[test_case("0x68656c6c6f" => b"hello".to_vec(); "hex bytes")]
    #[test_case("0xzz" => b"0xzz".to_vec(); "invalid hex is text")]
    #[test_case("" => Vec::<u8>::new(); "empty")]
    fn decodes_messages(message: &str) -> Vec<u8> {
        message_bytes(message)
    }

    fn setup() -> (SigningKey, Account, B256) {
        let key = SigningKey::from_slice(&[8; 32]).unwrap();
        let account = Account {
            address: Address::from_public_key(key.verifying_key()),
            derivation_index: 0,
            hd_path: PathTemplate::default(),
            owner_id: OwnerId::new("a"),
        };
        (key, account, personal_message_hash(b"hello"))
    }

    #[test]
    fn output_uses_27_offset() {
        let (key, account, digest) = setup();
        let (r, s, parity) = sign_prehash(&key, &digest).unwrap();
        for v in [None, Some(u64::from(parity)), Some(27 + u64::from(parity))] {
            let signature = finalize(&digest, &ValidatedParts { r, s, v }, &account).unwrap();
            assert_eq!(signature.v(), 27 + u64::from(parity));
            assert_eq!(signature.to_rsv_hex().len(), 2 + 130);
        }
    }

    #[test]
    fn rejects_wrong_parity() {
        let (key, account, digest) = setup();
        let (r, s, parity) = sign_prehash(&key, &digest).unwrap();
        let flipped = ValidatedParts {
            r,
            s,
            v: Some(27 + u64::from(1 - parity)),
        };
        assert!(matches!(
            finalize(&digest, &flipped, &account),
            Err(Error::SignatureMismatch)
        ));
    }
}
