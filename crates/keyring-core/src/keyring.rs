//! The keyring contract consumed by a wallet controller.
//!
//! [`HardwareKeyring`] ties the pieces together: the account store, the
//! transport session, address discovery, the identity guard and both
//! signing pipelines. Account discovery always talks to the attached
//! device; signing may rehydrate a session from cached transport state
//! and relies on the identity guard to catch a changed wallet.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use hw_keyring_core::transport::direct::DirectTransport;
//! use hw_keyring_core::transport::software::SoftwareDevice;
//! use hw_keyring_core::{HardwareKeyring, KeyringConfig, OwnerId};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> hw_keyring_core::Result<()> {
//! let device = SoftwareDevice::new(OwnerId::new("wallet-a"));
//! let keyring = HardwareKeyring::new(
//!     KeyringConfig::default(),
//!     Arc::new(DirectTransport::new(device)),
//! )?;
//!
//! keyring.unlock().await?;
//! let added = keyring.add_accounts(2).await?;
//! assert_eq!(keyring.get_accounts(), added);
//!
//! let signature = keyring.sign_personal_message(&added[0], "hello").await?;
//! assert_eq!(signature.len(), 132);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use alloy_primitives::U256;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::address::Address;
use crate::calldata::{CalldataDecoderSource, DecoderCache};
use crate::config::KeyringConfig;
use crate::eip712::{TypedData, TypedDataVersion};
use crate::error::{Error, Result};
use crate::hd_path::PathTemplate;
use crate::message::MessagePipeline;
use crate::pagination::{AccountCandidate, AddressPager, PaginationCursor};
use crate::pairing::Credentials;
use crate::session::{Flight, Session, TransportSession};
use crate::signing::SigningPipeline;
use crate::store::{Account, AccountStore, OwnerId};
use crate::transaction::{SignedTransaction, UnsignedTransaction};
use crate::transport::{Transport, TransportState};

/// Keyring type reported to wallet controllers.
pub const KEYRING_TYPE: &str = "Hardware Keyring";

/// Per-account metadata in [`KeyringState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountOpts {
    /// Wallet that controls the account.
    pub owner_id: OwnerId,
    /// Template the account was discovered under.
    pub hd_path: PathTemplate,
}

/// Persisted keyring state.
///
/// `accounts`, `derivation_indices` and `account_opts` are parallel arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyringState {
    /// Pairing credentials.
    pub credentials: Credentials,
    /// Account addresses in insertion order.
    pub accounts: Vec<Address>,
    /// Insertion index of each account.
    pub derivation_indices: Vec<u32>,
    /// Owner and template of each account.
    pub account_opts: Vec<AccountOpts>,
    /// Wallet last seen active during discovery.
    pub wallet_identity: Option<OwnerId>,
    /// Application name used for pairing.
    pub app_name: String,
    /// Network label.
    pub network: Option<String>,
    /// Current discovery page.
    pub page: u32,
    /// Current discovery template.
    pub hd_path: PathTemplate,
    /// Device state for fast-path rehydration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_state: Option<TransportState>,
}

impl KeyringState {
    /// Parses persisted state from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JsonError`] if parsing fails.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the state to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JsonError`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One row of a discovery page. `balance` is always `None`; balances are
/// filled in by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEntry {
    /// Derived address.
    pub address: Address,
    /// Balance placeholder.
    pub balance: Option<U256>,
    /// Insertion index.
    pub index: u32,
}

impl From<AccountCandidate> for PageEntry {
    fn from(candidate: AccountCandidate) -> Self {
        Self {
            address: candidate.address,
            balance: None,
            index: candidate.index,
        }
    }
}

#[derive(Debug)]
struct KeyringInner {
    store: AccountStore,
    credentials: Credentials,
    hd_path: PathTemplate,
    cursor: PaginationCursor,
    unlocked_index: u32,
    wallet_identity: Option<OwnerId>,
    cached_transport_state: Option<TransportState>,
    app_name: String,
    network: Option<String>,
}

impl KeyringInner {
    fn fresh(config: &KeyringConfig) -> Self {
        Self {
            store: AccountStore::new(),
            credentials: Credentials::default(),
            hd_path: config.hd_path.clone(),
            cursor: PaginationCursor::first(),
            unlocked_index: 0,
            wallet_identity: None,
            cached_transport_state: None,
            app_name: config.app_name.clone(),
            network: config.network.clone(),
        }
    }
}

/// A keyring backed by an external signer.
#[derive(Debug)]
pub struct HardwareKeyring {
    config: KeyringConfig,
    session: TransportSession,
    inner: RwLock<KeyringInner>,
    decoders: Option<DecoderCache>,
}

impl HardwareKeyring {
    /// Creates a keyring talking to the signer through `transport`.
    ///
    /// # Errors
    ///
    /// Returns the configuration's validation error.
    pub fn new(config: KeyringConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let session = TransportSession::new(transport, config.busy_policy, config.request_timeout());
        Ok(Self {
            inner: RwLock::new(KeyringInner::fresh(&config)),
            session,
            config,
            decoders: None,
        })
    }

    /// Attaches calldata decoder metadata to encoded transaction requests.
    #[must_use]
    pub fn with_decoder_source(mut self, source: Arc<dyn CalldataDecoderSource>) -> Self {
        self.decoders = Some(DecoderCache::new(
            source,
            self.config.decoder_cache_ttl(),
            self.config.request_timeout(),
        ));
        self
    }

    /// Keyring type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        KEYRING_TYPE
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &KeyringConfig {
        &self.config
    }

    /// The transport session.
    #[must_use]
    pub const fn session(&self) -> &TransportSession {
        &self.session
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Snapshot of the persisted state. Never does I/O beyond asking the
    /// transport for its exportable state.
    #[must_use]
    pub fn serialize(&self) -> KeyringState {
        let exported = self.session.export_state();
        let inner = self.inner.read();
        let (accounts, (derivation_indices, account_opts)) = inner
            .store
            .iter()
            .map(|account| {
                (
                    account.address,
                    (
                        account.derivation_index,
                        AccountOpts {
                            owner_id: account.owner_id.clone(),
                            hd_path: account.hd_path.clone(),
                        },
                    ),
                )
            })
            .unzip();

        KeyringState {
            credentials: inner.credentials.clone(),
            accounts,
            derivation_indices,
            account_opts,
            wallet_identity: inner.wallet_identity.clone(),
            app_name: inner.app_name.clone(),
            network: inner.network.clone(),
            page: inner.cursor.page(),
            hd_path: inner.hd_path.clone(),
            transport_state: exported.or_else(|| inner.cached_transport_state.clone()),
        }
    }

    /// Replaces the keyring state with `state`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKeyringState`] if the parallel account arrays
    /// differ in length.
    pub fn deserialize(&self, state: KeyringState) -> Result<()> {
        let KeyringState {
            credentials,
            accounts,
            derivation_indices,
            account_opts,
            wallet_identity,
            app_name,
            network,
            page,
            hd_path,
            transport_state,
        } = state;

        if accounts.len() != derivation_indices.len() || accounts.len() != account_opts.len() {
            return Err(Error::InvalidKeyringState(format!(
                "{} accounts, {} derivation indices, {} account opts",
                accounts.len(),
                derivation_indices.len(),
                account_opts.len()
            )));
        }

        let store: AccountStore = accounts
            .into_iter()
            .zip(derivation_indices)
            .zip(account_opts)
            .map(|((address, derivation_index), opts)| Account {
                address,
                derivation_index,
                hd_path: opts.hd_path,
                owner_id: opts.owner_id,
            })
            .collect();
        debug!(accounts = store.len(), "keyring state restored");

        *self.inner.write() = KeyringInner {
            store,
            credentials,
            hd_path,
            cursor: PaginationCursor::at(page),
            unlocked_index: 0,
            wallet_identity,
            cached_transport_state: transport_state,
            app_name: if app_name.is_empty() {
                self.config.app_name.clone()
            } else {
                app_name
            },
            network,
        };
        Ok(())
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Returns `true` while a session is established.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.session.is_connected()
    }

    /// Establishes the session with a full handshake, or validates the
    /// existing one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCredentials`] if pairing is required and
    /// missing, otherwise the session's connection errors.
    pub async fn unlock(&self) -> Result<()> {
        let flight = self.session.begin().await?;
        self.unlock_in(&flight, false).await.map(|_| ())
    }

    /// Connects within `flight`. `fast_path` permits rehydrating from the
    /// cached transport state and is only used by the signing paths.
    async fn unlock_in(&self, flight: &Flight<'_>, fast_path: bool) -> Result<Session> {
        let credentials = self.connect_credentials()?;
        let session = if fast_path {
            let cached = self.inner.read().cached_transport_state.clone();
            flight
                .connect_bypassable(cached.as_ref(), credentials.as_ref())
                .await?
                .0
        } else {
            flight.connect(credentials.as_ref(), false).await?
        };

        if session.fully_synced {
            let exported = self.session.export_state();
            let mut inner = self.inner.write();
            if exported.is_some() {
                inner.cached_transport_state = exported;
            }
        }
        Ok(session)
    }

    fn connect_credentials(&self) -> Result<Option<Credentials>> {
        let credentials = self.inner.read().credentials.clone();
        if self.config.requires_pairing {
            credentials.ensure_paired()?;
            return Ok(Some(credentials));
        }
        Ok(credentials.is_paired().then_some(credentials))
    }

    /// Stores pairing credentials and drops the current session so the next
    /// connection uses them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCredentials`] if `credentials` are incomplete.
    pub async fn pair(&self, credentials: Credentials) -> Result<()> {
        credentials.ensure_paired()?;
        self.inner.write().credentials = credentials;
        self.session.disconnect().await;
        info!("keyring paired");
        Ok(())
    }

    /// Clears accounts, credentials and cached device state and tears the
    /// session down, cancelling any outstanding request.
    pub async fn forget_device(&self) {
        {
            let mut inner = self.inner.write();
            let (app_name, network) = (inner.app_name.clone(), inner.network.clone());
            *inner = KeyringInner::fresh(&self.config);
            inner.app_name = app_name;
            inner.network = network;
        }
        if let Some(decoders) = &self.decoders {
            decoders.clear();
        }
        self.session.disconnect().await;
        info!("device forgotten");
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Adds `n` accounts starting at the index selected with
    /// [`HardwareKeyring::set_account_to_unlock`]. Returns the addresses
    /// that were not tracked yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAccountCount`] for `n == 0`, otherwise see
    /// [`HardwareKeyring::add_accounts_from`].
    pub async fn add_accounts(&self, n: u32) -> Result<Vec<Address>> {
        if n == 0 {
            return Err(Error::InvalidAccountCount(0));
        }
        let start = self.inner.read().unlocked_index;
        self.add_accounts_from(start, n).await
    }

    /// Discovers `count` addresses from insertion index `start` on the
    /// attached device and tracks those not tracked yet.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAccountCount`] for `count == 0`
    /// - [`Error::NoActiveOwner`] if the device reports no active wallet
    /// - path, transport and connection errors
    pub async fn add_accounts_from(&self, start: u32, count: u32) -> Result<Vec<Address>> {
        if count == 0 {
            return Err(Error::InvalidAccountCount(0));
        }
        let flight = self.session.begin().await?;
        let was_connected = self.session.is_connected();
        let session = self.unlock_in(&flight, false).await?;
        // A reused session may predate a wallet switch.
        let active = if was_connected {
            flight.resync().await?
        } else {
            session.active_owner
        };
        let owner = active.ok_or(Error::NoActiveOwner)?;

        let hd_path = self.inner.read().hd_path.clone();
        let candidates = AddressPager::new(&hd_path)
            .fetch(&flight, start, count, self.config.request_timeout())
            .await?;

        let mut inner = self.inner.write();
        inner.wallet_identity = Some(owner.clone());
        let added = inner.store.add_candidates(&candidates, &owner, &hd_path);
        info!(
            owner = %owner,
            start,
            count,
            added = added.len(),
            total = inner.store.len(),
            "accounts added"
        );
        Ok(added)
    }

    /// Compatibility form of [`HardwareKeyring::add_accounts`] where a
    /// negative count means "forget the device".
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAccountCount`] for zero or out-of-range counts.
    #[deprecated(note = "call `forget_device` or `add_accounts` instead")]
    pub async fn add_accounts_compat(&self, n: i64) -> Result<Vec<Address>> {
        if n < 0 {
            self.forget_device().await;
            return Ok(Vec::new());
        }
        let n = u32::try_from(n).map_err(|_| Error::InvalidAccountCount(n))?;
        self.add_accounts(n).await
    }

    /// Tracked addresses in insertion order. No I/O.
    #[must_use]
    pub fn get_accounts(&self) -> Vec<Address> {
        self.inner.read().store.addresses()
    }

    /// Stops tracking `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] if it is not tracked.
    pub fn remove_account(&self, address: &Address) -> Result<()> {
        let removed = self.inner.write().store.remove(address)?;
        debug!(address = %removed.address, "account removed");
        Ok(())
    }

    /// Selects the insertion index [`HardwareKeyring::add_accounts`] starts at.
    pub fn set_account_to_unlock(&self, index: u32) {
        self.inner.write().unlocked_index = index;
    }

    /// Stored metadata of `address`.
    #[must_use]
    pub fn account_details(&self, address: &Address) -> Option<Account> {
        let owner = self.session.active_owner();
        self.inner.read().store.find_for(address, owner.as_ref()).cloned()
    }

    /// Current discovery template.
    #[must_use]
    pub fn hd_path(&self) -> PathTemplate {
        self.inner.read().hd_path.clone()
    }

    /// Switches the discovery template. A different template resets the
    /// page cursor and the index to unlock.
    ///
    /// # Errors
    ///
    /// Returns the resolver's error if the template cannot resolve.
    pub fn set_hd_path(&self, template: PathTemplate) -> Result<()> {
        template.resolve(0)?;
        let mut inner = self.inner.write();
        if inner.hd_path != template {
            debug!(from = %inner.hd_path, to = %template, "derivation template changed");
            inner.hd_path = template;
            inner.cursor = PaginationCursor::first();
            inner.unlocked_index = 0;
        }
        Ok(())
    }

    /// Exporting private keys is impossible on a hardware signer.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::NotSupportedOnDevice`].
    pub fn export_account(&self, address: &Address) -> Result<String> {
        debug!(%address, "refusing to export account");
        Err(Error::NotSupportedOnDevice("exporting private keys".to_string()))
    }

    // =========================================================================
    // Discovery pages
    // =========================================================================

    /// Current page index.
    #[must_use]
    pub fn current_page(&self) -> u32 {
        self.inner.read().cursor.page()
    }

    /// Loads the first page of addresses.
    ///
    /// # Errors
    ///
    /// Path, transport and connection errors.
    pub async fn get_first_page(&self) -> Result<Vec<PageEntry>> {
        self.load_page(PaginationCursor::first()).await
    }

    /// Loads the page after the current one.
    ///
    /// # Errors
    ///
    /// Path, transport and connection errors.
    pub async fn get_next_page(&self) -> Result<Vec<PageEntry>> {
        let cursor = self.inner.read().cursor.next();
        self.load_page(cursor).await
    }

    /// Loads the page before the current one, staying on the first page.
    ///
    /// # Errors
    ///
    /// Path, transport and connection errors.
    pub async fn get_previous_page(&self) -> Result<Vec<PageEntry>> {
        let cursor = self.inner.read().cursor.previous();
        self.load_page(cursor).await
    }

    /// Fetches `cursor`'s page; the cursor only moves if the fetch succeeds.
    async fn load_page(&self, cursor: PaginationCursor) -> Result<Vec<PageEntry>> {
        let flight = self.session.begin().await?;
        self.unlock_in(&flight, false).await?;
        let hd_path = self.inner.read().hd_path.clone();
        let candidates = AddressPager::new(&hd_path)
            .page(&flight, self.config.page_size, cursor.page(), self.config.request_timeout())
            .await?;
        self.inner.write().cursor = cursor;
        Ok(candidates.into_iter().map(PageEntry::from).collect())
    }

    // =========================================================================
    // Signing
    // =========================================================================

    fn signer(&self, address: &Address) -> Result<Account> {
        let owner = self.session.active_owner();
        self.inner
            .read()
            .store
            .find_for(address, owner.as_ref())
            .cloned()
            .ok_or_else(|| Error::SignerNotFound(address.to_string()))
    }

    /// Signs a transaction with the account at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignerNotFound`] for untracked addresses, otherwise
    /// see [`SigningPipeline::sign_transaction`].
    pub async fn sign_transaction(
        &self,
        address: &Address,
        tx: &UnsignedTransaction,
    ) -> Result<SignedTransaction> {
        self.signer(address)?;
        let flight = self.session.begin().await?;
        self.unlock_in(&flight, true).await?;
        let account = self.signer(address)?;
        SigningPipeline::new(&self.config, self.decoders.as_ref())
            .sign_transaction(&flight, &account, tx)
            .await
    }

    /// Signs an EIP-191 personal message. Returns `0x`-prefixed `r || s || v`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignerNotFound`] for untracked addresses, otherwise
    /// see [`MessagePipeline::sign_personal`].
    pub async fn sign_personal_message(&self, address: &Address, message: &str) -> Result<String> {
        self.signer(address)?;
        let flight = self.session.begin().await?;
        self.unlock_in(&flight, true).await?;
        let account = self.signer(address)?;
        MessagePipeline::new(&self.config)
            .sign_personal(&flight, &account, message)
            .await
    }

    /// Signs EIP-712 typed data with `version` `"v3"` or `"v4"`. Returns
    /// `0x`-prefixed `r || s || v`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedVersion`] or [`Error::InvalidTypedData`]
    /// before any I/O, [`Error::SignerNotFound`] for untracked addresses,
    /// otherwise see [`MessagePipeline::sign_typed_data`].
    pub async fn sign_typed_data(&self, address: &Address, payload: &Value, version: &str) -> Result<String> {
        let version: TypedDataVersion = version.parse()?;
        let typed = TypedData::from_value(payload)?;
        typed.validate(version)?;

        self.signer(address)?;
        let flight = self.session.begin().await?;
        self.unlock_in(&flight, true).await?;
        let account = self.signer(address)?;
        MessagePipeline::new(&self.config)
            .sign_typed_data(&flight, &account, &typed, version)
            .await
    }
}
