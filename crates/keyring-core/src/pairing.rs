//! Pairing credentials for network-reachable signers.
//!
//! Some signers are reached through a relay and only talk to hosts that
//! completed a pairing flow. The flow itself runs in an external connector
//! page; this module builds the URL that opens it and validates what it
//! hands back.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};

/// Credentials obtained from pairing.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Identifier of the paired device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Shared secret established during pairing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Relay endpoint, when the device is not reached directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Url>,
}

impl Credentials {
    /// Builds complete credentials.
    #[must_use]
    pub fn new(device_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            secret: Some(secret.into()),
            endpoint: None,
        }
    }

    /// Sets the relay endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Returns `true` if both the device id and the secret are set.
    #[must_use]
    pub fn is_paired(&self) -> bool {
        non_empty(self.device_id.as_deref()) && non_empty(self.secret.as_deref())
    }

    /// Checks that the credentials are complete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCredentials`] naming the missing field.
    pub fn ensure_paired(&self) -> Result<()> {
        if !non_empty(self.device_id.as_deref()) {
            return Err(Error::InvalidCredentials("missing deviceId".to_string()));
        }
        if !non_empty(self.secret.as_deref()) {
            return Err(Error::InvalidCredentials("missing secret".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("device_id", &self.device_id)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint.as_ref().map(Url::as_str))
            .finish()
    }
}

fn non_empty(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

/// Builds the connector URL that starts pairing for `app_name`.
///
/// # Errors
///
/// Returns [`Error::InvalidCredentials`] if `base` cannot carry query parameters.
///
/// # Example
///
/// ```
/// use hw_keyring_core::pairing::connector_url;
/// use url::Url;
///
/// let base = Url::parse("https://connect.example.com").unwrap();
/// let url = connector_url(&base, "My Wallet").unwrap();
/// assert_eq!(url.as_str(), "https://connect.example.com/?keyring=My+Wallet&forceLogin=true");
/// ```
pub fn connector_url(base: &Url, app_name: &str) -> Result<Url> {
    if base.cannot_be_a_base() {
        return Err(Error::InvalidCredentials(format!(
            "connector endpoint `{base}` cannot carry a query"
        )));
    }
    let mut url = base.clone();
    url.query_pairs_mut()
        .append_pair("keyring", app_name)
        .append_pair("forceLogin", "true");
    Ok(url)
}

/// Validates the payload a connector page posts back after pairing.
///
/// The payload is either a JSON object with `deviceID`/`deviceId` and
/// `password`/`secret`, or a JSON string containing such an object.
///
/// # Errors
///
/// Returns [`Error::InvalidCredentials`] if either field is missing or empty.
pub fn parse_pairing_response(payload: &Value) -> Result<Credentials> {
    let object = match payload {
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .map_err(|err| Error::InvalidCredentials(format!("unreadable pairing response: {err}")))?,
        other => other.clone(),
    };

    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| object.get(*name).and_then(Value::as_str))
            .map(str::to_owned)
    };

    let credentials = Credentials {
        device_id: field(&["deviceID", "deviceId"]),
        secret: field(&["password", "secret"]),
        endpoint: field(&["endpoint"]).and_then(|raw| Url::parse(&raw).ok()),
    };
    credentials.ensure_paired()?;
    Ok(credentials)
}
