//! Bridge-only behaviour: readiness, origin filtering, message shape and
//! decoder metadata.

// Silence unused crate dependency warnings for test binary
use alloy_primitives as _;
use alloy_rlp as _;
use k256 as _;
use pretty_assertions as _;
use proptest as _;
use serde as _;
use ::test_case as _;
use thiserror as _;
use tracing as _;
use url as _;

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use common::{Harness, Wire, owner, until};
use hw_keyring_core::calldata::{CalldataDecoderSource, DecoderKey};
use hw_keyring_core::transport::action;
use hw_keyring_core::transport::bridge::DEFAULT_TARGET;
use hw_keyring_core::transport::software::SoftwareDevice;
use hw_keyring_core::{
    Address, Eip1559Transaction, Error, KeyringConfig, Result, Transaction, U256,
    UnsignedTransaction,
};

#[derive(Debug)]
struct FixedDecoder;

#[async_trait]
impl CalldataDecoderSource for FixedDecoder {
    async fn fetch(&self, key: &DecoderKey) -> Result<Option<Vec<u8>>> {
        Ok((key.selector == [0xa9, 0x05, 0x9c, 0xbb]).then(|| b"transfer(address,uint256)".to_vec()))
    }
}

#[derive(Debug)]
struct UnresponsiveDecoder;

#[async_trait]
impl CalldataDecoderSource for UnresponsiveDecoder {
    async fn fetch(&self, _key: &DecoderKey) -> Result<Option<Vec<u8>>> {
        std::future::pending().await
    }
}

fn token_transfer() -> UnsignedTransaction {
    let mut data = vec![0xa9, 0x05, 0x9c, 0xbb];
    data.extend_from_slice(&[0; 64]);
    UnsignedTransaction::new(Transaction::Eip1559(Eip1559Transaction {
        chain_id: 1,
        nonce: 1,
        max_priority_fee_per_gas: U256::from(1_000_000_000u64),
        max_fee_per_gas: U256::from(30_000_000_000u64),
        gas_limit: 60_000,
        to: Some(Address::new([0xaa; 20])),
        value: U256::ZERO,
        data,
        access_list: vec![],
    }))
}

#[tokio::test]
async fn requests_wait_for_readiness() {
    let h = Arc::new(Harness::unready(SoftwareDevice::new(owner("a")), KeyringConfig::default()));
    let bridge = h.bridge.clone().unwrap();

    let unlocking = {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.keyring.unlock().await })
    };
    until(|| bridge.queued() == 1).await;
    assert!(h.device.requests().is_empty());
    assert!(!h.keyring.is_unlocked());

    assert_eq!(bridge.mark_ready().unwrap(), 1);
    unlocking.await.unwrap().unwrap();
    assert!(h.keyring.is_unlocked());
    assert_eq!(h.device.requests(), vec![action::CONNECT]);
}

#[tokio::test(start_paused = true)]
async fn replies_from_foreign_origins_are_ignored() {
    let config = KeyringConfig {
        request_timeout_ms: 500,
        ..KeyringConfig::default()
    };
    let h = Harness::new(Wire::Bridge, SoftwareDevice::new(owner("a")), config);
    h.loopback.as_ref().unwrap().answer_from("https://evil.example.com");

    let err = h.keyring.unlock().await.unwrap_err();

    assert!(matches!(err, Error::Timeout { ref action, .. } if action == action::CONNECT), "{err}");
    assert_eq!(h.device.requests(), vec![action::CONNECT]);
    assert_eq!(h.keyring.session().outstanding(), 0);
}

#[tokio::test]
async fn posted_messages_are_tagged_and_correlated() {
    let h = Harness::new(Wire::Bridge, SoftwareDevice::new(owner("a")), KeyringConfig::default());
    h.keyring.add_accounts(2).await.unwrap();

    let posted = h.loopback.as_ref().unwrap().posted();
    assert!(posted.iter().all(|message| message.target == DEFAULT_TARGET));
    let ids: HashSet<_> = posted.iter().filter_map(|message| message.message_id).collect();
    assert_eq!(ids.len(), posted.len());
    assert_eq!(posted[0].action, action::CONNECT);
}

#[tokio::test]
async fn forgetting_closes_the_bridge() {
    let h = Harness::new(Wire::Bridge, SoftwareDevice::new(owner("a")), KeyringConfig::default());
    h.keyring.unlock().await.unwrap();

    h.keyring.forget_device().await;

    let posted = h.loopback.as_ref().unwrap().posted();
    let last = posted.last().unwrap();
    assert_eq!(last.action, action::CLOSE_BRIDGE);
    assert!(last.message_id.is_none());
}

#[tokio::test]
async fn payload_requests_carry_decoders() {
    let device = SoftwareDevice::new(owner("a"));
    let h = Harness::new(Wire::Bridge, device, KeyringConfig::default());
    let h = Harness {
        keyring: h.keyring.with_decoder_source(Arc::new(FixedDecoder)),
        ..h
    };
    let account = h.keyring.add_accounts(1).await.unwrap()[0];

    h.keyring.sign_transaction(&account, &token_transfer()).await.unwrap();

    let posted = h.loopback.as_ref().unwrap().posted();
    let request = posted
        .iter()
        .find(|message| message.action == action::SIGN_PAYLOAD)
        .unwrap();
    assert_eq!(
        request.params["decoder"].as_str(),
        Some(format!("0x{}", hex::encode(b"transfer(address,uint256)")).as_str())
    );
}

#[tokio::test(start_paused = true)]
async fn unresponsive_decoder_source_does_not_block_signing() {
    let config = KeyringConfig {
        request_timeout_ms: 2_000,
        ..KeyringConfig::default()
    };
    let h = Harness::new(Wire::Bridge, SoftwareDevice::new(owner("a")), config);
    let h = Harness {
        keyring: h.keyring.with_decoder_source(Arc::new(UnresponsiveDecoder)),
        ..h
    };
    let account = h.keyring.add_accounts(1).await.unwrap()[0];
    let started = tokio::time::Instant::now();

    h.keyring.sign_transaction(&account, &token_transfer()).await.unwrap();

    assert_eq!(started.elapsed(), std::time::Duration::from_millis(2_000));
    let posted = h.loopback.as_ref().unwrap().posted();
    let request = posted
        .iter()
        .find(|message| message.action == action::SIGN_PAYLOAD)
        .unwrap();
    assert!(request.params.get("decoder").is_none());
}
