//! Calldata decoder metadata.
//!
//! Signers with a screen can show a decoded contract call if they are
//! handed a decoder for the called function. Decoders come from an
//! external [`CalldataDecoderSource`] (typically a network service) and are
//! cached per keyring with a fixed lifetime. Decoders only enrich what the
//! user sees, so lookup failures and slow lookups are logged and signing
//! goes on without one.

use core::fmt;
use core::time::Duration;
use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::Bytes;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::address::Address;
use crate::error::Result;
use crate::transaction::Transaction;

/// What a decoder is looked up by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecoderKey {
    /// Chain the contract lives on.
    pub chain_id: u64,
    /// Contract address.
    pub to: Address,
    /// Function selector, the first four bytes of the calldata.
    pub selector: [u8; 4],
}

impl DecoderKey {
    /// Key for `tx`, or `None` for contract creations and plain transfers.
    #[must_use]
    pub fn for_transaction(tx: &Transaction) -> Option<Self> {
        let to = *tx.to()?;
        let selector: [u8; 4] = tx.data().get(..4)?.try_into().ok()?;
        Some(Self {
            chain_id: tx.chain_id(),
            to,
            selector,
        })
    }
}

/// Supplies opaque decoder bytes for contract calls.
#[async_trait]
pub trait CalldataDecoderSource: Send + Sync + fmt::Debug {
    /// Looks up the decoder for `key`. `Ok(None)` means none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup itself failed.
    async fn fetch(&self, key: &DecoderKey) -> Result<Option<Vec<u8>>>;
}

#[derive(Debug, Clone)]
struct CachedDecoder {
    fetched_at: Instant,
    decoder: Option<Bytes>,
}

/// Per-keyring decoder cache with a fixed time to live.
///
/// Negative answers are cached too. Failed or timed out lookups are not.
/// Expired entries are pruned whenever a fresh answer is stored.
#[derive(Debug)]
pub struct DecoderCache {
    source: Arc<dyn CalldataDecoderSource>,
    ttl: Duration,
    fetch_timeout: Duration,
    entries: Mutex<HashMap<DecoderKey, CachedDecoder>>,
}

impl DecoderCache {
    /// Creates an empty cache over `source`. A lookup that takes longer
    /// than `fetch_timeout` is abandoned.
    #[must_use]
    pub fn new(
        source: Arc<dyn CalldataDecoderSource>,
        ttl: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            source,
            ttl,
            fetch_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Decoder for the call `tx` makes, if one is available.
    pub async fn lookup(&self, tx: &Transaction) -> Option<Bytes> {
        let key = DecoderKey::for_transaction(tx)?;
        let now = Instant::now();

        if let Some(hit) = self.entries.lock().get(&key)
            && now.duration_since(hit.fetched_at) < self.ttl
        {
            debug!(to = %key.to, selector = %hex::encode(key.selector), "decoder cache hit");
            return hit.decoder.clone();
        }

        match tokio::time::timeout(self.fetch_timeout, self.source.fetch(&key)).await {
            Ok(Ok(decoder)) => {
                let decoder = decoder.map(Bytes::from);
                let mut entries = self.entries.lock();
                entries.retain(|_, entry| now.duration_since(entry.fetched_at) < self.ttl);
                entries.insert(
                    key,
                    CachedDecoder {
                        fetched_at: now,
                        decoder: decoder.clone(),
                    },
                );
                decoder
            }
            Ok(Err(err)) => {
                warn!(to = %key.to, error = %err, "calldata decoder lookup failed, signing without it");
                None
            }
            Err(_) => {
                warn!(
                    to = %key.to,
                    timeout_ms = self.fetch_timeout.as_millis(),
                    "calldata decoder lookup timed out, signing without it"
                );
                None
            }
        }
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached entries. Entries that expired since the last
    /// stored answer are still counted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use alloy_primitives::U256;

    use super::*;
    use crate::error::Error;
    use crate::transaction::LegacyTransaction;

    #[derive(Debug, Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CalldataDecoderSource for Counting {
        async fn fetch(&self, key: &DecoderKey) -> Result<Option<Vec<u8>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::ConnectionFailed("offline".into()));
            }
            Ok(Some(key.selector.to_vec()))
        }
    }

    fn call(data: Vec<u8>) -> Transaction {
        Transaction::Legacy(LegacyTransaction {
            chain_id: 1,
            nonce: 0,
            gas_price: U256::from(1u64),
            gas_limit: 50_000,
            to: Some(Address::new([9; 20])),
            value: U256::ZERO,
            data,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn caches_until_expiry() {
        let source = Arc::new(Counting::default());
        let cache = DecoderCache::new(
            source.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        let tx = call(vec![0xa9, 0x05, 0x9c, 0xbb, 0, 1]);

        let first = cache.lookup(&tx).await.unwrap();
        assert_eq!(first.as_ref(), &[0xa9, 0x05, 0x9c, 0xbb]);
        cache.lookup(&tx).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.lookup(&tx).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn short_calldata_skips_lookup() {
        let source = Arc::new(Counting::default());
        let cache = DecoderCache::new(
            source.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        assert!(cache.lookup(&call(vec![1, 2])).await.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let source = Arc::new(Counting {
            fail: true,
            ..Counting::default()
        });
        let cache = DecoderCache::new(
            source.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        let tx = call(vec![1, 2, 3, 4]);
        assert!(cache.lookup(&tx).await.is_none());
        assert!(cache.is_empty());
    }

    #[derive(Debug)]
    struct Hanging;

    #[async_trait]
    impl CalldataDecoderSource for Hanging {
        async fn fetch(&self, _key: &DecoderKey) -> Result<Option<Vec<u8>>> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_lookups_are_abandoned() {
        let cache = DecoderCache::new(
            Arc::new(Hanging),
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        let started = Instant::now();

        assert!(cache.lookup(&call(vec![1, 2, 3, 4])).await.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_pruned() {
        let source = Arc::new(Counting::default());
        let cache = DecoderCache::new(
            source.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        for selector in 0..3u8 {
            cache.lookup(&call(vec![selector, 0, 0, 0])).await.unwrap();
        }
        assert_eq!(cache.len(), 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.lookup(&call(vec![9, 0, 0, 0])).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }
}
