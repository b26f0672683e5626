//! Error types for the hardware keyring.
//!
//! Every fallible operation in this crate returns [`enum@Error`]. The variants
//! are grouped by the layer that raises them so callers can tell apart a
//! device that is unreachable from a device that is reachable but holding
//! the wrong wallet.
//!
//! # Error Categories
//!
//! - **Path errors**: malformed derivation templates or over-deep resolutions
//! - **Transport errors**: connection, timeouts, busy signers and rejections
//! - **Identity errors**: no active wallet or the wrong one on the device
//! - **Signing errors**: missing or malformed signatures, unsupported features
//! - **Account errors**: unknown signers and invalid account requests
//!
//! # Example
//!
//! ```
//! use hw_keyring_core::Error;
//!
//! let err = Error::NoActiveWallet;
//! assert!(err.is_identity_error());
//! assert_eq!(err.to_string(), "no active wallet on the device");
//! ```

use alloy_rlp::Error as AlloyRlpError;
use core::result::Result as CoreResult;
use hex::FromHexError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// The main error type for keyring operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Derivation Path Errors
    // =========================================================================
    /// The derivation path template could not be parsed.
    #[error("invalid derivation path: {0}")]
    InvalidPath(String),

    /// The resolved derivation path exceeds the device's maximum depth.
    #[error("derivation path has {depth} indices, at most {max} are supported")]
    PathTooLong {
        /// Number of indices the resolution produced.
        depth: usize,
        /// Maximum depth supported by the device.
        max: usize,
    },

    // =========================================================================
    // Transport and Session Errors
    // =========================================================================
    /// Establishing a session with the signer failed.
    #[error("failed to connect to signer: {0}")]
    ConnectionFailed(String),

    /// The signer did not answer within the allotted time.
    #[error("request `{action}` timed out after {millis}ms")]
    Timeout {
        /// Action of the request that timed out.
        action: String,
        /// Timeout that elapsed, in milliseconds.
        millis: u64,
    },

    /// Another request is outstanding and the session is configured to fail fast.
    #[error("signer is busy with another request")]
    Busy,

    /// The transport or signer rejected the request.
    #[error("signer rejected the request: {0}")]
    TransportRejected(String),

    /// The session was torn down while a request was outstanding, or no session exists.
    #[error("signer session is disconnected")]
    Disconnected,

    /// The signer answered with a response of the wrong shape.
    #[error("unexpected response from signer: {0}")]
    UnexpectedResponse(String),

    /// Pairing credentials are missing or incomplete.
    #[error("invalid pairing credentials: {0}")]
    InvalidCredentials(String),

    // =========================================================================
    // Device Identity Errors
    // =========================================================================
    /// The device reports no active wallet.
    #[error("no active wallet on the device")]
    NoActiveWallet,

    /// The transport could not report which wallet owns discovered addresses.
    ///
    /// Discovery can be retried once the device reports a wallet.
    #[error("signer did not report an active wallet owner")]
    NoActiveOwner,

    /// The device's active wallet does not own the requested account.
    #[error("active wallet {actual} does not own this account (expected {expected})")]
    WrongActiveWallet {
        /// Owner recorded for the account.
        expected: String,
        /// Owner the device currently reports.
        actual: String,
    },

    // =========================================================================
    // Signing Errors
    // =========================================================================
    /// The signer answered without the `r` or `s` component.
    #[error("signer returned no signature")]
    NoSignatureReturned,

    /// A signature component was present but malformed.
    #[error("invalid signature format: {0}")]
    InvalidSignatureFormat(String),

    /// The signature does not recover to the account that was asked to sign.
    #[error("signature does not recover to the signing account")]
    SignatureMismatch,

    /// The firmware does not support the requested capability.
    #[error("{feature} requires firmware {required} or later (device runs {actual})")]
    UnsupportedFeature {
        /// Capability that is missing.
        feature: String,
        /// Minimum firmware that provides it.
        required: String,
        /// Firmware the device reported.
        actual: String,
    },

    /// The firmware is too old for this request type altogether.
    #[error("firmware {actual} is not supported for {request} (requires {required})")]
    UnsupportedFirmware {
        /// Request type that was attempted.
        request: String,
        /// Minimum firmware for the request.
        required: String,
        /// Firmware the device reported.
        actual: String,
    },

    /// Typed data was requested with an unknown version.
    #[error("unsupported typed data version: {0}")]
    UnsupportedVersion(String),

    // =========================================================================
    // Account Errors
    // =========================================================================
    /// No stored account matches the requested signer address.
    #[error("no account found for signer {0}")]
    SignerNotFound(String),

    /// The address is not in the account store.
    #[error("account {0} not found")]
    AccountNotFound(String),

    /// Accounts were requested with a non-positive count.
    #[error("invalid account count: {0}")]
    InvalidAccountCount(i64),

    /// The operation cannot be performed by a hardware-backed keyring.
    #[error("{0} is not supported on a hardware device")]
    NotSupportedOnDevice(String),

    /// Persisted keyring state is internally inconsistent.
    #[error("invalid keyring state: {0}")]
    InvalidKeyringState(String),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Transaction and Typed Data Errors
    // =========================================================================
    /// The transaction data is invalid.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Failed to RLP encode or decode a transaction.
    #[error("RLP encoding failed: {0}")]
    RlpEncodingFailed(String),

    /// The EIP-712 typed data is invalid.
    #[error("invalid EIP-712 typed data: {0}")]
    InvalidTypedData(String),

    /// A type referenced in the typed data is not defined.
    #[error("undefined type in EIP-712 data: {0}")]
    UndefinedType(String),

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    /// The public key is invalid or malformed.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Failed to parse hex data.
    #[error("hex decoding failed: {0}")]
    HexDecodeFailed(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    JsonError(String),
}

impl Error {
    /// Returns `true` for errors raised by the device identity guard.
    ///
    /// These mean the signer is reachable but the user has to select the
    /// right wallet before retrying.
    #[must_use]
    pub const fn is_identity_error(&self) -> bool {
        matches!(self, Self::NoActiveWallet | Self::WrongActiveWallet { .. })
    }

    /// Returns `true` when retrying the same request cannot succeed without
    /// user or configuration changes.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Timeout { .. }
                | Self::Busy
                | Self::Disconnected
                | Self::ConnectionFailed(_)
                | Self::NoActiveOwner
                | Self::NoActiveWallet
                | Self::WrongActiveWallet { .. }
        )
    }
}

impl From<FromHexError> for Error {
    fn from(err: FromHexError) -> Self {
        Error::HexDecodeFailed(err.to_string())
    }
}

impl From<SerdeJsonError> for Error {
    fn from(err: SerdeJsonError) -> Self {
        Error::JsonError(err.to_string())
    }
}

impl From<AlloyRlpError> for Error {
    fn from(err: AlloyRlpError) -> Self {
        Error::RlpEncodingFailed(err.to_string())
    }
}

/// A specialized [`Result`] type for keyring operations.
pub type Result<T> = CoreResult<T, Error>;
