//! Hardware Keyring Core Library
//!
//! This crate implements the keyring layer that sits between an EVM wallet
//! controller and an external signing device: HD path resolution, account
//! discovery and storage, a correlated request/response session over a
//! direct or bridged transport, and transaction and message signing with
//! device identity checks before and after every signature.
//!
//! # Overview
//!
//! Multi-wallet hardware signers can switch the active wallet (or card) at
//! any time, and bridged transports deliver replies out of order or not at
//! all. The keyring therefore never trusts a signature blindly:
//!
//! - **Identity guard**: the active wallet must own the account before the
//!   request is sent and still own it after the device answers
//! - **Signature checks**: `r` and `s` must be present and canonical, and
//!   the signature must recover to the requested account
//! - **Capability gating**: typed transactions are refused on firmware that
//!   cannot represent them rather than downgraded
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HardwareKeyring                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Signing    │  Message    │  Identity   │  Address    │ Acct │
//! │  Pipeline   │  Pipeline   │  Guard      │  Pager      │ Store│
//! ├─────────────────────────────────────────────────────────────┤
//! │                    TransportSession                          │
//! │   correlation map · single flight · timeouts · rehydration   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  DirectTransport (DeviceClient)  │  BridgeTransport (port)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ## Resolving a Derivation Path
//!
//! ```rust
//! use hw_keyring_core::hd_path::{HARDENED_OFFSET, resolve};
//!
//! let indices = resolve("m/44'/60'/x'/0/0", 2).unwrap();
//! assert_eq!(indices[2], HARDENED_OFFSET + 2);
//! ```
//!
//! ## Signing a Transaction
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use hw_keyring_core::transport::direct::DirectTransport;
//! use hw_keyring_core::transport::software::SoftwareDevice;
//! use hw_keyring_core::{
//!     Eip1559Transaction, HardwareKeyring, KeyringConfig, OwnerId, Transaction, U256,
//!     UnsignedTransaction,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> hw_keyring_core::Result<()> {
//! let keyring = HardwareKeyring::new(
//!     KeyringConfig::default(),
//!     Arc::new(DirectTransport::new(SoftwareDevice::new(OwnerId::new("wallet")))),
//! )?;
//! let accounts = keyring.add_accounts(1).await?;
//!
//! let tx = UnsignedTransaction::new(Transaction::Eip1559(Eip1559Transaction {
//!     chain_id: 1,
//!     nonce: 0,
//!     max_priority_fee_per_gas: U256::from(1_000_000_000u64),
//!     max_fee_per_gas: U256::from(100_000_000_000u64),
//!     gas_limit: 21000,
//!     to: None,
//!     value: U256::ZERO,
//!     data: vec![],
//!     access_list: vec![],
//! }));
//!
//! let signed = keyring.sign_transaction(&accounts[0], &tx).await?;
//! assert!(signed.signature().v() <= 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Transports
//!
//! Implement [`transport::direct::DeviceClient`] for signers reached by a
//! call (USB HID, vendor SDKs, local relays), or
//! [`transport::bridge::BridgePort`] for signers reached by posting
//! messages across a boundary such as an embedded frame. The keyring
//! itself never branches on the transport.
//!
//! # Security Considerations
//!
//! - Private keys never leave the signer; [`HardwareKeyring::export_account`] always fails
//! - Bridged replies are origin-checked and matched by correlation id and action tag
//! - Fast-path rehydration is only used when signing, where the identity
//!   guard confirms the wallet with the device before returning a signature
//! - High-s signatures are rejected

// Modules
pub mod address;
pub mod calldata;
pub mod config;
pub mod crypto;
pub mod eip712;
pub mod error;
pub mod guard;
pub mod hd_path;
pub mod keyring;
pub mod message;
pub mod pagination;
pub mod pairing;
pub mod session;
pub mod signature;
pub mod signing;
pub mod store;
pub mod transaction;
pub mod transport;

// Re-exports for convenience
pub use address::Address;
pub use config::{BusyPolicy, KeyringConfig};
pub use eip712::{Eip712Domain, TypedData, TypedDataVersion};
pub use error::{Error, Result};
pub use hd_path::PathTemplate;
pub use keyring::{HardwareKeyring, KeyringState, PageEntry};
pub use pairing::Credentials;
pub use signature::Signature;
pub use store::{Account, OwnerId};
pub use transaction::{
    AccessListEntry, Eip1559Transaction, Eip2930Transaction, LegacyTransaction, SignedTransaction,
    Transaction, UnsignedTransaction,
};

// Re-export commonly used alloy types
pub use alloy_primitives::{B256, U256};
