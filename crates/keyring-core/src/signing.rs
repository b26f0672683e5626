//! The transaction signing pipeline.
//!
//! Signing runs through a fixed sequence of stages; nothing is retried
//! except the identity guard's single resync:
//!
//! ```text
//! Idle ─▶ AwaitingGuard ─▶ BuildingRequest ─▶ AwaitingDevice ─▶ ValidatingResponse ─▶ Done
//!              │                  │                  │                    │
//!              ▼                  ▼                  ▼                    ▼
//!       wrong/no wallet    unsupported feature  timeout/rejected   missing or bad
//!                                                                  signature, swap
//! ```
//!
//! # Protocol selection
//!
//! | Firmware                      | Transaction | Request                         |
//! |-------------------------------|-------------|---------------------------------|
//! | at or above the payload level | any         | encoded payload (+ decoder)     |
//! | below                         | legacy      | legacy field-by-field request   |
//! | below                         | typed       | refused, [`Error::UnsupportedFeature`] |
//!
//! A typed transaction is never downgraded to a pathway that cannot
//! represent all of its fields.

use core::fmt;

use alloy_primitives::Bytes;
use tracing::{debug, info};

use crate::calldata::DecoderCache;
use crate::config::KeyringConfig;
use crate::crypto::{recover_address, recovery_id_for};
use crate::error::{Error, Result};
use crate::guard::IdentityGuard;
use crate::session::Flight;
use crate::signature::{Signature, ValidatedParts};
use crate::store::Account;
use crate::transaction::{SignedTransaction, Transaction, UnsignedTransaction};
use crate::transport::protocol::{
    Curve, HashType, PayloadEncoding, SignLegacyParams, SignPayloadParams,
};
use crate::transport::{DeviceRequest, DeviceResponse, FirmwareVersion};

/// Stage of a signing operation, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigningStage {
    /// Nothing started.
    Idle,
    /// Confirming the active wallet.
    AwaitingGuard,
    /// Selecting the protocol and building the request.
    BuildingRequest,
    /// Waiting for the signer, usually on user confirmation.
    AwaitingDevice,
    /// Checking the returned signature.
    ValidatingResponse,
    /// Finished successfully.
    Done,
}

impl fmt::Display for SigningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::AwaitingGuard => "awaiting-guard",
            Self::BuildingRequest => "building-request",
            Self::AwaitingDevice => "awaiting-device",
            Self::ValidatingResponse => "validating-response",
            Self::Done => "done",
        })
    }
}

pub(crate) fn enter(stage: SigningStage, operation: &'static str) {
    debug!(%stage, operation, "signing stage");
}

/// Extracts the signature from a signing response.
pub(crate) fn expect_signature(response: DeviceResponse) -> Result<ValidatedParts> {
    match response {
        DeviceResponse::Signature(parts) => parts.validate(),
        other => Err(Error::UnexpectedResponse(format!(
            "expected a signature, got {}",
            other.kind()
        ))),
    }
}

/// Signs transactions for accounts of one keyring.
#[derive(Debug, Clone, Copy)]
pub struct SigningPipeline<'a> {
    config: &'a KeyringConfig,
    decoders: Option<&'a DecoderCache>,
}

impl<'a> SigningPipeline<'a> {
    /// Pipeline using `config` thresholds and timeouts.
    #[must_use]
    pub const fn new(config: &'a KeyringConfig, decoders: Option<&'a DecoderCache>) -> Self {
        Self { config, decoders }
    }

    /// Signs `unsigned` with `account` over a connected `flight`.
    ///
    /// # Errors
    ///
    /// - identity errors from the guard, before and after the device signs
    /// - [`Error::UnsupportedFeature`] for typed transactions on old firmware
    /// - transport errors, unmodified
    /// - [`Error::NoSignatureReturned`], [`Error::InvalidSignatureFormat`] or
    ///   [`Error::SignatureMismatch`] for a bad answer
    pub async fn sign_transaction(
        &self,
        flight: &Flight<'_>,
        account: &Account,
        unsigned: &UnsignedTransaction,
    ) -> Result<SignedTransaction> {
        const OP: &str = "transaction";
        let tx = &unsigned.transaction;
        let guard = IdentityGuard::new(flight);

        enter(SigningStage::AwaitingGuard, OP);
        guard.ensure_active_owner(&account.owner_id).await?;

        enter(SigningStage::BuildingRequest, OP);
        let firmware = flight.session().firmware().ok_or(Error::Disconnected)?;
        let request = self.build_request(tx, account.signer_path()?, firmware).await?;

        enter(SigningStage::AwaitingDevice, OP);
        let response = flight.request(request, self.config.sign_timeout()).await?;

        enter(SigningStage::ValidatingResponse, OP);
        let parts = expect_signature(response)?;
        guard.confirm_unchanged(&account.owner_id).await?;
        let signature = finalize(tx, &parts, account)?;

        enter(SigningStage::Done, OP);
        info!(
            account = %account.address,
            tx_type = tx.tx_type(),
            chain_id = tx.chain_id(),
            "transaction signed"
        );
        Ok(SignedTransaction::new(unsigned, signature))
    }

    async fn build_request(
        &self,
        tx: &Transaction,
        signer_path: Vec<u32>,
        firmware: FirmwareVersion,
    ) -> Result<DeviceRequest> {
        let required = self.config.encoded_payload_min_firmware;
        if firmware >= required {
            let decoder = match self.decoders {
                Some(cache) => cache.lookup(tx).await,
                None => None,
            };
            debug!(%firmware, with_decoder = decoder.is_some(), "using encoded payload request");
            return Ok(DeviceRequest::SignPayload(SignPayloadParams {
                signer_path,
                curve: Curve::default(),
                hash_type: HashType::default(),
                encoding: PayloadEncoding::default(),
                payload: Bytes::from(tx.signing_payload()),
                decoder,
            }));
        }

        match tx {
            Transaction::Legacy(legacy) => {
                debug!(%firmware, "using legacy field request");
                Ok(DeviceRequest::SignLegacy(SignLegacyParams::new(signer_path, legacy)))
            }
            typed => Err(Error::UnsupportedFeature {
                feature: typed
                    .required_capability()
                    .unwrap_or("typed transactions")
                    .to_string(),
                required: required.to_string(),
                actual: firmware.to_string(),
            }),
        }
    }
}

/// Checks the signature recovers to `account` and builds the on-chain form.
///
/// A signer-supplied `v` is accepted in any form that carries the parity
/// and re-expressed the way this transaction type encodes it. Without `v`
/// the parity is found by recovery.
fn finalize(tx: &Transaction, parts: &ValidatedParts, account: &Account) -> Result<Signature> {
    let hash = tx.signing_hash();
    let parity = match parts.v {
        Some(v) => {
            let parity = tx.parity_for_v(v).ok_or_else(|| {
                Error::InvalidSignatureFormat(format!(
                    "v {v} does not fit a type {} transaction on chain {}",
                    tx.tx_type(),
                    tx.chain_id()
                ))
            })?;
            if recover_address(&hash, &parts.r, &parts.s, parity)? != account.address {
                return Err(Error::SignatureMismatch);
            }
            parity
        }
        None => recovery_id_for(&hash, &parts.r, &parts.s, &account.address)?,
    };
    Ok(Signature::new(parts.r, parts.s, tx.v_for_parity(parity)))
}

#[cfg(test)]
mod tests {
    use alloy_primitives::U256;
    use k256::ecdsa::SigningKey;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::crypto::sign_prehash;
    use crate::hd_path::PathTemplate;
    use crate::store::OwnerId;
    use crate::transaction::{Eip1559Transaction, LegacyTransaction};

    fn legacy() -> Transaction {
        Transaction::Legacy(LegacyTransaction {
            chain_id: 1,
            nonce: 9,
            gas_price: U256::from(20_000_000_000u64),
            gas_limit: 21_000,
            to: None,
            value: U256::from(1u64),
            data: vec![],
        })
    }

    fn eip1559() -> Transaction {
        Transaction::Eip1559(Eip1559Transaction {
            chain_id: 1,
            nonce: 0,
            max_priority_fee_per_gas: U256::from(1u64),
            max_fee_per_gas: U256::from(2u64),
            gas_limit: 21_000,
            to: None,
            value: U256::ZERO,
            data: vec![],
            access_list: vec![],
        })
    }

    fn signed_parts(tx: &Transaction, key: &SigningKey, v: Option<u64>) -> (ValidatedParts, u8) {
        let (r, s, parity) = sign_prehash(key, &tx.signing_hash()).unwrap();
        (ValidatedParts { r, s, v }, parity)
    }

    fn account_for(key: &SigningKey) -> Account {
        Account {
            address: crate::address::Address::from_public_key(key.verifying_key()),
            derivation_index: 0,
            hd_path: PathTemplate::default(),
            owner_id: OwnerId::new("a"),
        }
    }

    #[test]
    fn derives_missing_v_for_legacy() {
        let key = SigningKey::from_slice(&[3; 32]).unwrap();
        let tx = legacy();
        let (parts, parity) = signed_parts(&tx, &key, None);
        let signature = finalize(&tx, &parts, &account_for(&key)).unwrap();
        assert_eq!(signature.v(), 37 + u64::from(parity));
    }

    #[test]
    fn canonicalizes_supplied_v() {
        let key = SigningKey::from_slice(&[4; 32]).unwrap();
        let tx = eip1559();
        let (honest, parity) = signed_parts(&tx, &key, None);
        let parts = ValidatedParts {
            v: Some(27 + u64::from(parity)),
            ..honest
        };
        let signature = finalize(&tx, &parts, &account_for(&key)).unwrap();
        assert_eq!(signature.v(), u64::from(parity));
    }

    #[test]
    fn rejects_v_that_fits_no_parity() {
        let key = SigningKey::from_slice(&[5; 32]).unwrap();
        let tx = legacy();
        let (parts, _) = signed_parts(&tx, &key, Some(99));
        assert!(matches!(
            finalize(&tx, &parts, &account_for(&key)),
            Err(Error::InvalidSignatureFormat(_))
        ));
    }

    #[test]
    fn rejects_signature_from_another_key() {
        let key = SigningKey::from_slice(&[6; 32]).unwrap();
        let other = SigningKey::from_slice(&[7; 32]).unwrap();
        let tx = legacy();
        let (parts, _) = signed_parts(&tx, &other, None);
        assert!(matches!(
            finalize(&tx, &parts, &account_for(&key)),
            Err(Error::SignatureMismatch)
        ));
    }

    #[tokio::test]
    async fn old_firmware_refuses_typed_transactions() {
        let config = KeyringConfig::default();
        let pipeline = SigningPipeline::new(&config, None);
        let old = FirmwareVersion::new(0, 14, 0);

        let err = pipeline.build_request(&eip1559(), vec![0], old).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedFeature { ref feature, .. } if feature.contains("1559")));

        let request = pipeline.build_request(&legacy(), vec![0], old).await.unwrap();
        assert!(matches!(request, DeviceRequest::SignLegacy(_)));

        let request = pipeline
            .build_request(&legacy(), vec![0], FirmwareVersion::new(0, 15, 0))
            .await
            .unwrap();
        assert!(matches!(request, DeviceRequest::SignPayload(_)));
    }
}
