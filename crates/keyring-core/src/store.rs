//! The account store.
//!
//! Accounts are kept in insertion order. An account is identified by its
//! address together with the owner (the wallet that controls it) and the
//! derivation template it was discovered under, so the same address can
//! never appear twice for the same owner and template. Address comparison
//! is by value and therefore independent of hex letter case.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::hd_path::PathTemplate;
use crate::pagination::AccountCandidate;

/// Opaque identifier of the wallet that controls an account.
///
/// For multi-wallet devices this is the wallet UID the device reports; for
/// single-seed devices a fixed identifier of the device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Wraps an identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A tracked account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// The account address.
    pub address: Address,
    /// Insertion index the template was resolved with.
    pub derivation_index: u32,
    /// Template the account was discovered under.
    pub hd_path: PathTemplate,
    /// Wallet that controls the account.
    pub owner_id: OwnerId,
}

impl Account {
    /// Concrete signer path of this account.
    ///
    /// # Errors
    ///
    /// Fails if the template no longer resolves for the stored index.
    pub fn signer_path(&self) -> Result<Vec<u32>> {
        self.hd_path.resolve(self.derivation_index)
    }

    fn same_identity(&self, other: &Self) -> bool {
        self.address == other.address
            && self.owner_id == other.owner_id
            && self.hd_path == other.hd_path
    }
}

/// Ordered, de-duplicated collection of accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountStore {
    accounts: Vec<Account>,
}

impl AccountStore {
    /// Creates an empty store.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            accounts: Vec::new(),
        }
    }

    /// Inserts `account` unless an identical one is stored. Returns `true` if inserted.
    pub fn insert(&mut self, account: Account) -> bool {
        if self.accounts.iter().any(|a| a.same_identity(&account)) {
            return false;
        }
        self.accounts.push(account);
        true
    }

    /// Adds discovered candidates for `owner` under `hd_path`.
    ///
    /// Returns the addresses that were not already tracked, in candidate order.
    pub fn add_candidates(
        &mut self,
        candidates: &[AccountCandidate],
        owner: &OwnerId,
        hd_path: &PathTemplate,
    ) -> Vec<Address> {
        candidates
            .iter()
            .filter_map(|candidate| {
                let account = Account {
                    address: candidate.address,
                    derivation_index: candidate.index,
                    hd_path: hd_path.clone(),
                    owner_id: owner.clone(),
                };
                self.insert(account).then_some(candidate.address)
            })
            .collect()
    }

    /// First stored account with `address`.
    #[must_use]
    pub fn find(&self, address: &Address) -> Option<&Account> {
        self.accounts.iter().find(|a| a.address == *address)
    }

    /// Stored account with `address`, preferring the one owned by `owner`.
    ///
    /// Falls back to [`find`](Self::find) when no entry for `address`
    /// belongs to `owner`.
    #[must_use]
    pub fn find_for(&self, address: &Address, owner: Option<&OwnerId>) -> Option<&Account> {
        owner
            .and_then(|owner| {
                self.accounts
                    .iter()
                    .find(|a| a.address == *address && a.owner_id == *owner)
            })
            .or_else(|| self.find(address))
    }

    /// Removes the first stored account with `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] if no account has that address.
    pub fn remove(&mut self, address: &Address) -> Result<Account> {
        let position = self
            .accounts
            .iter()
            .position(|a| a.address == *address)
            .ok_or_else(|| Error::AccountNotFound(address.to_string()))?;
        Ok(self.accounts.remove(position))
    }

    /// Addresses in insertion order.
    #[must_use]
    pub fn addresses(&self) -> Vec<Address> {
        self.accounts.iter().map(|a| a.address).collect()
    }

    /// Iterates over stored accounts in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.iter()
    }

    /// Number of stored accounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Returns `true` if no account is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Removes every account.
    pub fn clear(&mut self) {
        self.accounts.clear();
    }
}

impl FromIterator<Account> for AccountStore {
    fn from_iter<I: IntoIterator<Item = Account>>(iter: I) -> Self {
        let mut store = Self::new();
        for account in iter {
            store.insert(account);
        }
        store
    }
}
