//! A deterministic in-memory signer.
//!
//! [`SoftwareDevice`] behaves like a multi-wallet hardware signer: it holds
//! an active wallet that can be switched at any time, reports a firmware
//! version, derives addresses for paths and signs with secp256k1. Keys are
//! derived from the wallet id and path by hashing, which makes every
//! address reproducible across runs. It is meant for development and
//! tests, never for real funds.
//!
//! Faults can be injected to reproduce misbehaving signers: missing
//! signature components, rejections, slow answers, and a wallet swap
//! while a signature is being produced.
//!
//! # Example
//!
//! ```
//! use hw_keyring_core::transport::software::SoftwareDevice;
//! use hw_keyring_core::OwnerId;
//!
//! let device = SoftwareDevice::new(OwnerId::new("wallet-a"));
//! let first = device.address_at(&[0x8000_002c, 0x8000_003c, 0x8000_0000, 0, 0]).unwrap();
//! assert_eq!(first, device.address_at(&[0x8000_002c, 0x8000_003c, 0x8000_0000, 0, 0]).unwrap());
//! ```

use core::time::Duration;

use alloy_primitives::{B256, keccak256};
use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info};

use super::direct::DeviceClient;
use super::protocol::{MessageProtocol, SignMessageParams, SignPayloadParams};
use super::{DeviceRequest, DeviceResponse, DeviceState, FirmwareVersion, TransportState};
use crate::address::Address;
use crate::crypto::{personal_message_hash, sign_prehash};
use crate::eip712::{TypedData, TypedDataVersion};
use crate::error::{Error, Result};
use crate::pairing::Credentials;
use crate::signature::SignatureParts;
use crate::store::OwnerId;
use crate::transaction::Transaction;

/// Misbehaviour to inject into signing answers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Faults {
    /// Leave `r` out of signatures.
    pub omit_r: bool,
    /// Leave `s` out of signatures.
    pub omit_s: bool,
    /// Leave `v` out of signatures.
    pub omit_v: bool,
    /// Reject signing requests with this reason.
    pub reject_signing: Option<String>,
    /// Delay every answer.
    pub delay: Option<Duration>,
    /// Switch to this wallet while producing the next signature.
    pub swap_during_signing: Option<Option<OwnerId>>,
    /// Sign with this wallet's keys instead of the active one.
    pub sign_as: Option<OwnerId>,
}

#[derive(Debug)]
struct DeviceInner {
    active: Option<OwnerId>,
    firmware: FirmwareVersion,
    pairing: Option<Credentials>,
    faults: Faults,
    log: Vec<&'static str>,
}

/// Deterministic software signer implementing [`DeviceClient`].
#[derive(Debug)]
pub struct SoftwareDevice {
    inner: Mutex<DeviceInner>,
}

impl SoftwareDevice {
    /// Creates a device with `active` selected and current firmware.
    #[must_use]
    pub fn new(active: OwnerId) -> Self {
        Self {
            inner: Mutex::new(DeviceInner {
                active: Some(active),
                firmware: FirmwareVersion::new(0, 15, 0),
                pairing: None,
                faults: Faults::default(),
                log: Vec::new(),
            }),
        }
    }

    /// Sets the firmware version reported on connect.
    #[must_use]
    pub fn with_firmware(self, firmware: FirmwareVersion) -> Self {
        self.inner.lock().firmware = firmware;
        self
    }

    /// Requires these credentials on connect.
    #[must_use]
    pub fn with_pairing(self, credentials: Credentials) -> Self {
        self.inner.lock().pairing = Some(credentials);
        self
    }

    /// Switches the active wallet, or deselects it with `None`.
    pub fn set_active(&self, owner: Option<OwnerId>) {
        info!(owner = ?owner, "software device wallet switched");
        self.inner.lock().active = owner;
    }

    /// Currently active wallet.
    pub fn active(&self) -> Option<OwnerId> {
        self.inner.lock().active.clone()
    }

    /// Replaces the injected faults.
    pub fn set_faults(&self, faults: Faults) {
        self.inner.lock().faults = faults;
    }

    /// Actions received so far, in order.
    pub fn requests(&self) -> Vec<&'static str> {
        self.inner.lock().log.clone()
    }

    /// Number of signing requests received so far.
    pub fn signing_requests(&self) -> usize {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|action| action.starts_with("sign-"))
            .count()
    }

    /// Address of the active wallet at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportRejected`] if no wallet is active.
    pub fn address_at(&self, path: &[u32]) -> Result<Address> {
        let owner = self.require_active()?;
        Ok(Address::from_public_key(derive_key(&owner, path).verifying_key()))
    }

    /// Address of `owner` at `path`, regardless of the active wallet.
    #[must_use]
    pub fn address_for(owner: &OwnerId, path: &[u32]) -> Address {
        Address::from_public_key(derive_key(owner, path).verifying_key())
    }

    fn require_active(&self) -> Result<OwnerId> {
        self.inner
            .lock()
            .active
            .clone()
            .ok_or_else(|| Error::TransportRejected("no active wallet".to_string()))
    }

    fn state(&self) -> DeviceState {
        let inner = self.inner.lock();
        DeviceState {
            active_owner: inner.active.clone(),
            firmware: inner.firmware,
        }
    }

    fn connect(&self, credentials: Option<&Credentials>) -> Result<DeviceResponse> {
        let required = self.inner.lock().pairing.clone();
        if let Some(required) = required
            && credentials != Some(&required)
        {
            return Err(Error::TransportRejected("pairing credentials do not match".to_string()));
        }
        Ok(DeviceResponse::Connected(self.state()))
    }

    fn get_addresses(&self, start: &[u32], count: u32) -> Result<DeviceResponse> {
        let owner = self.require_active()?;
        let Some((&last, prefix)) = start.split_last() else {
            return Err(Error::TransportRejected("empty start path".to_string()));
        };
        let addresses = (0..count)
            .map(|offset| {
                let mut path = prefix.to_vec();
                path.push(last.wrapping_add(offset));
                Self::address_for(&owner, &path)
            })
            .collect();
        Ok(DeviceResponse::Addresses(addresses))
    }

    /// Signs `hash` and applies signing faults. `v_of` maps the parity to the
    /// `v` this request type answers with, `None` to leave it out.
    fn sign(&self, path: &[u32], hash: &B256, v_of: impl FnOnce(u8) -> Option<u64>) -> Result<DeviceResponse> {
        let faults = self.inner.lock().faults.clone();
        if let Some(reason) = faults.reject_signing {
            return Err(Error::TransportRejected(reason));
        }

        let owner = match faults.sign_as {
            Some(owner) => owner,
            None => self.require_active()?,
        };
        let (r, s, parity) = sign_prehash(&derive_key(&owner, path), hash)?;

        if let Some(next) = faults.swap_during_signing {
            let mut inner = self.inner.lock();
            inner.active = next;
            inner.faults.swap_during_signing = None;
        }

        let mut parts = SignatureParts::from_scalars(&r, &s, v_of(parity));
        if faults.omit_r {
            parts.r = None;
        }
        if faults.omit_s {
            parts.s = None;
        }
        if faults.omit_v {
            parts.v = None;
        }
        Ok(DeviceResponse::Signature(parts))
    }

    fn sign_payload(&self, params: &SignPayloadParams) -> Result<DeviceResponse> {
        let hash = keccak256(&params.payload);
        // Typed payloads answer with the bare parity; for legacy payloads the
        // chain id is inside the RLP, so v is left to the host.
        let typed = params.payload.first().is_some_and(|b| *b <= 0x7f);
        self.sign(&params.signer_path, &hash, |parity| typed.then_some(u64::from(parity)))
    }

    fn sign_message(&self, params: &SignMessageParams) -> Result<DeviceResponse> {
        let hash = match params.protocol {
            MessageProtocol::Personal => {
                let hex_payload = params
                    .payload
                    .as_str()
                    .ok_or_else(|| Error::TransportRejected("payload must be hex".to_string()))?;
                personal_message_hash(&hex::decode(hex_payload.trim_start_matches("0x"))?)
            }
            MessageProtocol::Eip712 => {
                let typed = TypedData::from_value(&params.payload)?;
                typed.signing_hash(params.version.unwrap_or(TypedDataVersion::V4))?
            }
        };
        self.sign(&params.signer_path, &hash, |parity| Some(27 + u64::from(parity)))
    }
}

#[async_trait]
impl DeviceClient for SoftwareDevice {
    async fn call(&self, request: DeviceRequest) -> Result<DeviceResponse> {
        let delay = {
            let mut inner = self.inner.lock();
            inner.log.push(request.action());
            inner.faults.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        debug!(action = request.action(), "software device handling request");

        match &request {
            DeviceRequest::Connect(params) => self.connect(params.credentials.as_ref()),
            DeviceRequest::FetchActiveWallet => Ok(DeviceResponse::ActiveWallet(self.active())),
            DeviceRequest::GetAddresses(params) => self.get_addresses(&params.start_path, params.count),
            DeviceRequest::SignPayload(params) => self.sign_payload(params),
            DeviceRequest::SignLegacy(params) => {
                let tx = Transaction::Legacy(params.transaction());
                let hash = tx.signing_hash();
                self.sign(&params.signer_path, &hash, |parity| Some(tx.v_for_parity(parity)))
            }
            DeviceRequest::SignMessage(params) => self.sign_message(params),
        }
    }

    fn export_state(&self) -> Option<TransportState> {
        serde_json::to_value(self.state()).ok().map(TransportState)
    }

    fn restore_state(&self, state: &TransportState) -> Option<DeviceState> {
        serde_json::from_value(state.0.clone()).ok()
    }
}

/// Derives a signing key from the wallet id and path.
fn derive_key(owner: &OwnerId, path: &[u32]) -> SigningKey {
    let mut seed = Vec::with_capacity(owner.as_str().len() + path.len() * 4);
    seed.extend_from_slice(owner.as_str().as_bytes());
    for index in path {
        seed.extend_from_slice(&index.to_be_bytes());
    }
    let mut secret = keccak256(&seed);
    loop {
        // A hash outside the curve order is astronomically unlikely; rehash if it happens.
        if let Ok(key) = SigningKey::from_slice(secret.as_slice()) {
            return key;
        }
        secret = keccak256(secret);
    }
}

/// JSON form of a state blob, handy for hosts that persist it verbatim.
#[must_use]
pub fn state_blob(owner: Option<&OwnerId>, firmware: FirmwareVersion) -> TransportState {
    TransportState(json!({ "activeOwner": owner, "firmware": firmware }))
}
