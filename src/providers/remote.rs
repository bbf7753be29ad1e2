//! Remote tier - object-storage adapter
//!
//! The store itself (S3, Azure, anything with keys and user metadata) is an
//! external collaborator behind [`ObjectStore`]; this tier only maps cache
//! semantics onto it. Objects land at `{prefix}{storage_path(key)}` with the
//! source prefix attached as user metadata, so purge-by-source works as a
//! prefix listing. No eviction: lifecycle belongs to the object store.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::key::{CacheKey, HASH_LEN};
use crate::provider::{
    CacheFetch, CacheProvider, EntryMetadata, LatencyZone, ProviderCapabilities,
};

/// User-metadata key carrying the first 16 hex chars of the source hash.
pub const SOURCE_PREFIX_METADATA_KEY: &str = "source-prefix";

/// Payload returned by an object GET.
#[derive(Debug, Clone)]
pub struct ObjectBody {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// Contract the remote tier consumes. Implementations wrap a concrete
/// object-store client; deadlines and retries beyond the single transient
/// retry below are theirs to police.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// GET an object. `Ok(None)` means the object does not exist.
    async fn get(&self, object_key: &str) -> Result<Option<ObjectBody>, CacheError>;

    /// PUT an object with user metadata.
    async fn put(
        &self,
        object_key: &str,
        bytes: Bytes,
        content_type: Option<&str>,
        user_metadata: &[(String, String)],
    ) -> Result<(), CacheError>;

    /// DELETE an object; `true` if it existed (stores that cannot tell may
    /// report `true`).
    async fn delete(&self, object_key: &str) -> Result<bool, CacheError>;

    /// List object keys under a prefix.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError>;

    /// Connectivity probe.
    async fn ping(&self) -> bool;
}

/// Configuration for [`RemoteTier`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteTierConfig {
    /// Key prefix under which every object is stored.
    pub prefix: String,
    /// Name used in configuration, logs and diagnostics.
    pub name: String,
}

impl Default for RemoteTierConfig {
    fn default() -> Self {
        Self {
            prefix: "cache/".to_string(),
            name: "cloud".to_string(),
        }
    }
}

/// Object-storage cache tier.
pub struct RemoteTier {
    store: Arc<dyn ObjectStore>,
    config: RemoteTierConfig,
    zone: LatencyZone,
}

impl RemoteTier {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, config: RemoteTierConfig) -> Self {
        Self {
            store,
            config,
            zone: LatencyZone::remote(),
        }
    }

    /// Override the latency zone (e.g. a same-region store).
    #[must_use]
    pub fn with_latency_zone(mut self, zone: LatencyZone) -> Self {
        self.zone = zone;
        self
    }

    fn object_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.config.prefix, key.storage_path())
    }
}

/// Retry transient failures exactly once; everything else passes through.
async fn retry_transient_once<T, F, Fut>(op: F) -> Result<T, CacheError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, CacheError>>,
{
    match op().await {
        Err(CacheError::Transient(reason)) => {
            debug!(%reason, "retrying transient object-store failure");
            op().await
        }
        other => other,
    }
}

#[async_trait]
impl CacheProvider for RemoteTier {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            requires_inline_execution: false,
            is_local: false,
            latency_zone: self.zone.clone(),
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
        let object_key = self.object_key(key);
        let body = retry_transient_once(|| self.store.get(&object_key)).await?;
        Ok(body.map(|body| CacheFetch {
            metadata: EntryMetadata {
                content_type: body.content_type.clone(),
                content_length: body.bytes.len() as u64,
                source_prefix: Some(key.source_prefix_hex()),
            },
            bytes: body.bytes,
        }))
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
        let object_key = self.object_key(key);
        let user_metadata = vec![(
            SOURCE_PREFIX_METADATA_KEY.to_string(),
            metadata
                .source_prefix
                .clone()
                .unwrap_or_else(|| key.source_prefix_hex()),
        )];
        retry_transient_once(|| {
            self.store.put(
                &object_key,
                bytes.clone(),
                metadata.content_type.as_deref(),
                &user_metadata,
            )
        })
        .await?;
        debug!(%key, object_key, "remote store");
        Ok(())
    }

    async fn invalidate(
        &self,
        key: &CacheKey,
        ct: &CancellationToken,
    ) -> Result<bool, CacheError> {
        if ct.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        self.store.delete(&self.object_key(key)).await
    }

    async fn purge_by_source(
        &self,
        source_hash: [u8; HASH_LEN],
        ct: &CancellationToken,
    ) -> Result<u64, CacheError> {
        let prefix = format!(
            "{}{}",
            self.config.prefix,
            CacheKey::shard_prefix_of(source_hash)
        );
        let keys = self.store.list_prefix(&prefix).await?;
        let mut removed = 0;
        for object_key in keys {
            if ct.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            match self.store.delete(&object_key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(object_key, error = %e, "purge deletion failed"),
            }
        }
        Ok(removed)
    }

    // Listing the store per probe would defeat the point of bloom gating;
    // stay conservative.
    fn probably_contains(&self, _key: &CacheKey) -> bool {
        true
    }

    // No exact membership check exists here, so the default NotQueried
    // policy would decline every cold store. PUTs are idempotent; take them
    // all.
    fn wants_to_store(
        &self,
        _key: &CacheKey,
        _size: u64,
        _reason: crate::provider::StoreReason,
    ) -> bool {
        true
    }

    async fn health_check(&self, _ct: &CancellationToken) -> bool {
        self.store.ping().await
    }
}
