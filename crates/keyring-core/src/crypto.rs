//! secp256k1 helpers for checking what a signer returned.
//!
//! Hardware signers do not always return a recovery value, and a buggy or
//! swapped signer can return a valid-looking signature from the wrong key.
//! Everything here works on 32-byte prehashes:
//!
//! - [`recover_address`] recovers the signing account for a given parity
//! - [`recovery_id_for`] finds the parity that recovers an expected account
//! - [`personal_message_hash`] computes the EIP-191 `personal_sign` digest
//!
//! # Example
//!
//! ```
//! use hw_keyring_core::crypto::personal_message_hash;
//!
//! let hash = personal_message_hash(b"hello");
//! assert_eq!(
//!     hex::encode(hash),
//!     "50b2c43fd39106bafbba0da34fc430e1f91e3c96ea2acee2bc34119f92b37750"
//! );
//! ```

use alloy_primitives::{B256, keccak256};
use k256::ecdsa::{RecoveryId, Signature as K256Signature, SigningKey, VerifyingKey};

use crate::address::Address;
use crate::error::{Error, Result};

/// Prefix of EIP-191 version `0x45` messages.
const PERSONAL_MESSAGE_PREFIX: &str = "\x19Ethereum Signed Message:\n";

/// Hashes a message the way `personal_sign` does.
#[must_use]
pub fn personal_message_hash(message: &[u8]) -> B256 {
    let mut prefixed = Vec::with_capacity(PERSONAL_MESSAGE_PREFIX.len() + 20 + message.len());
    prefixed.extend_from_slice(PERSONAL_MESSAGE_PREFIX.as_bytes());
    prefixed.extend_from_slice(message.len().to_string().as_bytes());
    prefixed.extend_from_slice(message);
    keccak256(prefixed)
}

/// Recovers the account that produced `(r, s)` over `hash` with parity `recovery_id`.
///
/// # Errors
///
/// Returns [`Error::InvalidSignatureFormat`] if the scalars are out of range
/// or `recovery_id` is not 0 or 1, and [`Error::SignatureMismatch`] if no
/// public key can be recovered.
pub fn recover_address(hash: &B256, r: &[u8; 32], s: &[u8; 32], recovery_id: u8) -> Result<Address> {
    if recovery_id > 1 {
        return Err(Error::InvalidSignatureFormat(format!(
            "recovery id {recovery_id} is not a parity bit"
        )));
    }
    let signature = k256_signature(r, s)?;
    let recid = RecoveryId::from_byte(recovery_id).ok_or_else(|| {
        Error::InvalidSignatureFormat(format!("invalid recovery id {recovery_id}"))
    })?;
    let key = VerifyingKey::recover_from_prehash(hash.as_slice(), &signature, recid)
        .map_err(|_| Error::SignatureMismatch)?;
    Ok(Address::from_public_key(&key))
}

/// Finds the parity bit under which `(r, s)` recovers to `expected`.
///
/// # Errors
///
/// Returns [`Error::SignatureMismatch`] if neither parity recovers `expected`.
pub fn recovery_id_for(hash: &B256, r: &[u8; 32], s: &[u8; 32], expected: &Address) -> Result<u8> {
    for recovery_id in 0u8..2u8 {
        match recover_address(hash, r, s, recovery_id) {
            Ok(recovered) if recovered == *expected => return Ok(recovery_id),
            Ok(_) | Err(Error::SignatureMismatch) => {}
            Err(other) => return Err(other),
        }
    }
    Err(Error::SignatureMismatch)
}

/// Signs a prehash, returning `(r, s, parity)` in canonical low-s form.
///
/// # Errors
///
/// Returns [`Error::InvalidSignatureFormat`] if signing fails.
pub fn sign_prehash(key: &SigningKey, hash: &B256) -> Result<([u8; 32], [u8; 32], u8)> {
    let (signature, recid) = key
        .sign_prehash_recoverable(hash.as_slice())
        .map_err(|err| Error::InvalidSignatureFormat(err.to_string()))?;
    let bytes = signature.to_bytes();
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&bytes[..32]);
    s.copy_from_slice(&bytes[32..]);
    Ok((r, s, recid.to_byte()))
}

fn k256_signature(r: &[u8; 32], s: &[u8; 32]) -> Result<K256Signature> {
    let mut raw = [0u8; 64];
    raw[..32].copy_from_slice(r);
    raw[32..].copy_from_slice(s);
    K256Signature::from_slice(&raw)
        .map_err(|_| Error::InvalidSignatureFormat("signature scalars out of range".to_string()))
}
