//! Cache provider trait
//!
//! One tier of the cascade. Implementations must treat "not found" as a
//! miss (`Ok(None)`), never as an error: any error returned from these
//! operations is routed to the health tracker and may quarantine the tier.
//!
//! # Write semantics
//!
//! A single capability bit, `requires_inline_execution`, decides how the
//! cascade stores into a tier: inline tiers are written synchronously on
//! the request path, everything else goes through the bounded upload queue.
//! Tier identity is never baked into the cascade.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::error::CacheError;
use crate::key::{CacheKey, HASH_LEN};

/// Opaque tag grouping providers by expected round-trip class.
///
/// Policies key off the zone rather than the concrete tier type, so custom
/// zones are fine; the constructors below cover the built-in tiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LatencyZone(String);

impl LatencyZone {
    /// In-process memory.
    #[must_use]
    pub fn memory() -> Self {
        Self("memory".to_string())
    }

    /// Local filesystem.
    #[must_use]
    pub fn local_disk() -> Self {
        Self("local-disk".to_string())
    }

    /// Remote object storage or upstream HTTP.
    #[must_use]
    pub fn remote() -> Self {
        Self("remote".to_string())
    }

    /// A custom zone.
    pub fn new(zone: impl Into<String>) -> Self {
        Self(zone.into())
    }

    /// The zone identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LatencyZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static capabilities a provider advertises at registration time.
#[derive(Debug, Clone)]
pub struct ProviderCapabilities {
    /// Writes must happen synchronously on the request path (in-process
    /// tiers). Such tiers are always probed, never bloom-gated.
    pub requires_inline_execution: bool,
    /// Whether the tier lives on this machine; influences promotion.
    pub is_local: bool,
    /// Expected round-trip class.
    pub latency_zone: LatencyZone,
}

/// Why the cascade is offering an artifact to a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreReason {
    /// The factory just produced this artifact.
    FreshlyCreated,
    /// The tier was probed for this key and missed.
    Missed,
    /// The tier was skipped during the probe because the bloom filter said
    /// "probably present" - storing is likely redundant.
    NotQueried,
}

/// Metadata persisted alongside a cache entry.
#[derive(Debug, Clone, Default)]
pub struct EntryMetadata {
    /// MIME type of the payload.
    pub content_type: Option<String>,
    /// Payload length in bytes.
    pub content_length: u64,
    /// First 16 hex chars of the source hash; lets cloud tiers answer
    /// purge-by-source with a native tag query.
    pub source_prefix: Option<String>,
}

impl EntryMetadata {
    /// Metadata for a payload about to be stored under `key`.
    #[must_use]
    pub fn for_payload(key: &CacheKey, bytes: &Bytes, content_type: Option<String>) -> Self {
        Self {
            content_type,
            content_length: bytes.len() as u64,
            source_prefix: Some(key.source_prefix_hex()),
        }
    }
}

/// A successful tier fetch.
#[derive(Debug, Clone)]
pub struct CacheFetch {
    /// The cached payload.
    pub bytes: Bytes,
    /// Metadata stored with it.
    pub metadata: EntryMetadata,
}

/// One tier of the cache cascade.
///
/// Implementations must be cheap to probe, idempotent to store into, and
/// honest about their capabilities; everything else (gating, coalescing,
/// promotion, backpressure) is the cascade's job.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Identifier used in configuration, logs and diagnostics.
    fn name(&self) -> &str;

    /// Static capabilities; must not change after construction.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Look up a key. `Ok(None)` is a miss and must return promptly.
    async fn fetch(
        &self,
        key: &CacheKey,
        ct: &CancellationToken,
    ) -> Result<Option<CacheFetch>, CacheError>;

    /// Store a payload. Idempotent; overwriting an existing entry is
    /// permitted.
    async fn store(
        &self,
        key: &CacheKey,
        bytes: Bytes,
        metadata: &EntryMetadata,
        ct: &CancellationToken,
    ) -> Result<(), CacheError>;

    /// Remove one entry. Best-effort existence: cloud tiers may report
    /// `true` unconditionally.
    async fn invalidate(&self, key: &CacheKey, ct: &CancellationToken)
    -> Result<bool, CacheError>;

    /// Remove every variant derived from the given source hash. Returns the
    /// number of entries removed.
    async fn purge_by_source(
        &self,
        source_hash: [u8; HASH_LEN],
        ct: &CancellationToken,
    ) -> Result<u64, CacheError>;

    /// Whether this tier wants a copy of the artifact. Gate-keeping only;
    /// the tier may still evict later.
    ///
    /// Default policy: always take fresh and missed artifacts; for a store
    /// offered without a preceding probe (`NotQueried`), consult the tier's
    /// own membership check and skip the redundant write.
    fn wants_to_store(&self, key: &CacheKey, size: u64, reason: StoreReason) -> bool {
        let _ = size;
        match reason {
            StoreReason::FreshlyCreated | StoreReason::Missed => true,
            StoreReason::NotQueried => !self.probably_contains(key),
        }
    }

    /// Cheap membership test; `true` may be conservative.
    fn probably_contains(&self, key: &CacheKey) -> bool {
        let _ = key;
        true
    }

    /// Whether the tier is operational. Never mutating.
    async fn health_check(&self, ct: &CancellationToken) -> bool;

    /// Shutdown signal. Called by the cascade in reverse registration order.
    async fn stop(&self) {}
}
