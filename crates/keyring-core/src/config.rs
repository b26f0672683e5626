//! Keyring configuration.
//!
//! [`KeyringConfig`] holds everything a keyring needs that is not persisted
//! account state: the default derivation template, pagination size,
//! request timeouts, the single-flight policy and the firmware thresholds
//! that gate signing protocols. It is plain serde data, so hosts can load
//! it from whatever configuration source they already use.
//!
//! # Example
//!
//! ```
//! use hw_keyring_core::config::{BusyPolicy, KeyringConfig};
//!
//! let config = KeyringConfig::from_json(r#"{"pageSize": 10, "busyPolicy": "failFast"}"#).unwrap();
//! assert_eq!(config.page_size, 10);
//! assert_eq!(config.busy_policy, BusyPolicy::FailFast);
//! assert_eq!(config.hd_path.as_str(), "m/44'/60'/0'/0/x");
//! ```

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hd_path::PathTemplate;
use crate::transport::FirmwareVersion;

/// Default number of addresses per page.
pub const DEFAULT_PAGE_SIZE: u32 = 5;

/// Default timeout for non-signing requests.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 20_000;

/// Default timeout for signing requests, which wait on user confirmation.
pub const DEFAULT_SIGN_TIMEOUT_MS: u64 = 300_000;

/// What a session does when a request arrives while another is outstanding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BusyPolicy {
    /// Wait for the outstanding request, first come first served.
    #[default]
    Queue,
    /// Fail immediately with [`Error::Busy`].
    FailFast,
}

/// Keyring configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyringConfig {
    /// Name the keyring reports to hosts and pairing flows.
    pub app_name: String,
    /// Optional network label persisted alongside accounts.
    pub network: Option<String>,
    /// Derivation template used until the host selects another one.
    pub hd_path: PathTemplate,
    /// Addresses per discovery page.
    pub page_size: u32,
    /// Timeout for connection, discovery and identity requests.
    pub request_timeout_ms: u64,
    /// Timeout for signing requests.
    pub sign_timeout_ms: u64,
    /// Single-flight policy for overlapping requests.
    pub busy_policy: BusyPolicy,
    /// Lowest firmware that accepts encoded transaction payloads.
    pub encoded_payload_min_firmware: FirmwareVersion,
    /// Lowest firmware that signs EIP-712 typed data.
    pub typed_data_min_firmware: FirmwareVersion,
    /// Whether connecting requires paired credentials.
    pub requires_pairing: bool,
    /// How long fetched calldata decoders stay cached.
    pub decoder_cache_ttl_secs: u64,
}

impl Default for KeyringConfig {
    fn default() -> Self {
        Self {
            app_name: "Hardware Keyring".to_string(),
            network: None,
            hd_path: PathTemplate::default(),
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            sign_timeout_ms: DEFAULT_SIGN_TIMEOUT_MS,
            busy_policy: BusyPolicy::Queue,
            encoded_payload_min_firmware: FirmwareVersion::new(0, 15, 0),
            typed_data_min_firmware: FirmwareVersion::new(0, 10, 5),
            requires_pairing: false,
            decoder_cache_ttl_secs: 600,
        }
    }
}

impl KeyringConfig {
    /// Parses and validates a configuration from JSON. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JsonError`] on malformed JSON and
    /// [`Error::InvalidConfig`] if validation fails.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JsonError`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Checks ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero page size or zero timeouts,
    /// and the resolver's error if the derivation template cannot resolve.
    pub fn validate(&self) -> Result<()> {
        self.hd_path.resolve(0)?;
        if self.page_size == 0 {
            return Err(Error::InvalidConfig("pageSize must be positive".to_string()));
        }
        if self.request_timeout_ms == 0 || self.sign_timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    /// Timeout for non-signing requests.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Timeout for signing requests.
    #[must_use]
    pub const fn sign_timeout(&self) -> Duration {
        Duration::from_millis(self.sign_timeout_ms)
    }

    /// Lifetime of cached calldata decoders.
    #[must_use]
    pub const fn decoder_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.decoder_cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config = KeyringConfig::from_json("{}").unwrap();
        assert_eq!(config, KeyringConfig::default());
        assert_eq!(config.request_timeout(), Duration::from_secs(20));
        assert_eq!(config.busy_policy, BusyPolicy::Queue);
    }

    #[test]
    fn round_trips_through_json() {
        let config = KeyringConfig {
            hd_path: PathTemplate::parse(PathTemplate::LEDGER_LIVE).unwrap(),
            network: Some("sepolia".to_string()),
            ..KeyringConfig::default()
        };
        let json = config.to_json().unwrap();
        assert!(json.contains("\"hdPath\":\"m/44'/60'/x'/0/0\""));
        assert!(json.contains("\"encodedPayloadMinFirmware\":\"0.15.0\""));
        assert_eq!(KeyringConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn rejects_zero_page_size() {
        assert!(matches!(
            KeyringConfig::from_json(r#"{"pageSize": 0}"#),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_bad_path() {
        assert!(matches!(
            KeyringConfig::from_json(r#"{"hdPath": "m/not/a/path"}"#),
            Err(Error::JsonError(_))
        ));
    }
}
