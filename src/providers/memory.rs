//! Memory tier - weight-bounded in-process cache
//!
//! The hot tier. Backed by Moka with a weigher so capacity is a byte
//! budget, not an entry count; eviction happens inside `store` on the
//! request path, which is why this tier advertises
//! `requires_inline_execution`.

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::CacheError;
use crate::key::{CacheKey, HASH_LEN};
use crate::provider::{
    CacheFetch, CacheProvider, EntryMetadata, LatencyZone, ProviderCapabilities, StoreReason,
};

/// Fixed per-entry overhead charged on top of the payload bytes.
const ENTRY_OVERHEAD_BYTES: u64 = 192;

/// Configuration for [`MemoryTier`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTierConfig {
    /// Total byte budget, payload plus per-entry overhead.
    pub max_bytes: u64,
    /// Largest single entry this tier will accept.
    pub max_entry_bytes: u64,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            max_entry_bytes: 32 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
struct MemoryEntry {
    bytes: Bytes,
    metadata: EntryMetadata,
}

/// In-memory cache tier.
pub struct MemoryTier {
    cache: Cache<CacheKey, MemoryEntry>,
    config: MemoryTierConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryTier {
    /// Build the tier with its byte budget pre-committed.
    #[must_use]
    pub fn new(config: MemoryTierConfig) -> Self {
        info!(max_bytes = config.max_bytes, "initializing memory tier");
        let cache = Cache::builder()
            .max_capacity(config.max_bytes)
            .weigher(|_key: &CacheKey, entry: &MemoryEntry| {
                u32::try_from(entry.bytes.len() as u64 + ENTRY_OVERHEAD_BYTES)
                    .unwrap_or(u32::MAX)
            })
            .build();
        Self {
            cache,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Hit count since construction.
    #[must_use]
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Miss count since construction.
    #[must_use]
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CacheProvider for MemoryTier {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            requires_inline_execution: true,
            is_local: true,
            latency_zone: LatencyZone::memory(),
        }
    }

    async fn fetch(
        &self,
        key: &CacheKey,
        ct: &CancellationToken,
    ) -> Result<Option<CacheFetch>, CacheError> {
        if ct.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        match self.cache.get(key).await {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(CacheFetch {
                    bytes: entry.bytes,
                    metadata: entry.metadata,
                }))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn store(
        &self,
        key: &CacheKey,
        bytes: Bytes,
        metadata: &EntryMetadata,
        ct: &CancellationToken,
    ) -> Result<(), CacheError> {
        if ct.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        debug!(%key, len = bytes.len(), "memory store");
        self.cache
            .insert(
                *key,
                MemoryEntry {
                    bytes,
                    metadata: metadata.clone(),
                },
            )
            .await;
        Ok(())
    }

    async fn invalidate(
        &self,
        key: &CacheKey,
        _ct: &CancellationToken,
    ) -> Result<bool, CacheError> {
        Ok(self.cache.remove(key).await.is_some())
    }

    async fn purge_by_source(
        &self,
        source_hash: [u8; HASH_LEN],
        ct: &CancellationToken,
    ) -> Result<u64, CacheError> {
        let victims: Vec<CacheKey> = self
            .cache
            .iter()
            .filter(|(key, _)| key.source_hash() == source_hash)
            .map(|(key, _)| *key)
            .collect();
        let mut removed = 0;
        for key in victims {
            if ct.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            if self.cache.remove(&key).await.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn wants_to_store(&self, key: &CacheKey, size: u64, reason: StoreReason) -> bool {
        if size > self.config.max_entry_bytes {
            return false;
        }
        match reason {
            StoreReason::FreshlyCreated | StoreReason::Missed => true,
            StoreReason::NotQueried => !self.probably_contains(key),
        }
    }

    fn probably_contains(&self, key: &CacheKey) -> bool {
        self.cache.contains_key(key)
    }

    async fn health_check(&self, _ct: &CancellationToken) -> bool {
        // In-process; nothing to probe without mutating.
        true
    }
}
