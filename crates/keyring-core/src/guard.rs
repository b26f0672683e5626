//! The device identity guard.
//!
//! A multi-wallet signer can have a different wallet active from one call
//! to the next. Before every signature the guard compares the wallet the
//! session reports with the owner recorded for the account, and after the
//! signature it asks the signer again, so a swap during the (long,
//! user-facing) confirmation is caught before the signature is returned.
//!
//! The check before signing does not ask the signer when the session is
//! fully synced: it trusts the owner observed at the last handshake or
//! resync. A wallet switched on the signer after that point is therefore
//! only noticed by [`IdentityGuard::confirm_unchanged`], after the signer
//! has produced (and the user has approved) a signature that is then
//! discarded. Callers that learn of a switch out of band should call
//! [`TransportSession::mark_stale`](crate::session::TransportSession::mark_stale)
//! so the next check consults the signer first.

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::Flight;
use crate::store::OwnerId;

/// Identity checks bound to one [`Flight`].
#[derive(Debug, Clone, Copy)]
pub struct IdentityGuard<'f, 's> {
    flight: &'f Flight<'s>,
}

impl<'f, 's> IdentityGuard<'f, 's> {
    /// Guard for `flight`.
    #[must_use]
    pub const fn new(flight: &'f Flight<'s>) -> Self {
        Self { flight }
    }

    /// Confirms the active wallet is `expected`.
    ///
    /// Uses the session's last observed owner without asking the signer
    /// when the session is fully synced. If the session has not been
    /// confirmed with the signer since it was rehydrated or marked stale,
    /// a failing check is retried once after a resync. When no wallet is
    /// active the session is marked stale so the next check consults the
    /// signer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveWallet`] or [`Error::WrongActiveWallet`], or
    /// the resync's transport error.
    pub async fn ensure_active_owner(&self, expected: &OwnerId) -> Result<OwnerId> {
        let session = self.flight.session();
        let Some(current) = session.current() else {
            return Err(Error::Disconnected);
        };

        let outcome = match check(current.active_owner.as_ref(), expected) {
            Err(err) if !current.fully_synced => {
                debug!(%expected, error = %err, "identity check failed on unsynced session, resyncing once");
                let owner = self.flight.resync().await?;
                check(owner.as_ref(), expected)
            }
            outcome => outcome,
        };

        if let Err(err) = &outcome {
            if matches!(err, Error::NoActiveWallet) {
                session.mark_stale();
            }
            warn!(%expected, error = %err, "identity guard refused");
        }
        outcome
    }

    /// Asks the signer for its active wallet and requires it to still be
    /// `expected`. No retry.
    ///
    /// # Errors
    ///
    /// Same as [`IdentityGuard::ensure_active_owner`].
    pub async fn confirm_unchanged(&self, expected: &OwnerId) -> Result<()> {
        let owner = self.flight.resync().await?;
        check(owner.as_ref(), expected).map(|_| ()).inspect_err(|err| {
            warn!(%expected, error = %err, "active wallet changed while signing");
        })
    }
}

fn check(active: Option<&OwnerId>, expected: &OwnerId) -> Result<OwnerId> {
    match active {
        None => Err(Error::NoActiveWallet),
        Some(owner) if owner == expected => Ok(owner.clone()),
        Some(owner) => Err(Error::WrongActiveWallet {
            expected: expected.to_string(),
            actual: owner.to_string(),
        }),
    }
}
