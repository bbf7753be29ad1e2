//! Common utilities for integration tests
//!
//! Shared fakes and builders: an in-memory object store for the remote
//! tier, a recording origin provider, a counting imaging engine, a failing
//! provider for health-tracker tests, and cascade construction helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use cascade_cache::{
    BlobAttributes, BlobRequest, BlobWrapper, CacheCascade, CacheCascadeBuilder, CacheError,
    CacheEvent, CacheFetch, CacheKey, CacheProvider, CascadeConfig, EntryMetadata, ImagingEngine,
    LatencyZone, MemoryTier, MemoryTierConfig, ObjectBody, ObjectStore, OriginProvider,
    ProviderCapabilities, TransformOutput, TransformParams, WatermarkPlanner,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;

/// Opt into log output for a test run via `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn ct() -> CancellationToken {
    CancellationToken::new()
}

pub fn key(name: &str) -> CacheKey {
    CacheKey::from_source_and_params(name.as_bytes(), b"w=100")
}

pub fn payload(key: &CacheKey, data: &[u8]) -> (Bytes, EntryMetadata) {
    let bytes = Bytes::copy_from_slice(data);
    let meta = EntryMetadata::for_payload(key, &bytes, Some("image/jpeg".to_string()));
    (bytes, meta)
}

/// Factory for calls that must be served from a cache tier.
pub async fn must_not_run(_ct: CancellationToken) -> Result<(Bytes, EntryMetadata), CacheError> {
    panic!("factory must not run for this request");
}

/// Cascade with a single default memory tier.
pub fn memory_cascade(config: CascadeConfig) -> Arc<CacheCascade> {
    CacheCascadeBuilder::new()
        .with_provider(Arc::new(MemoryTier::new(MemoryTierConfig::default())))
        .with_config(config)
        .build()
        .expect("cascade should build")
}

/// Collects every cascade event for later assertions.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<CacheEvent>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> cascade_cache::EventCallback {
        let events = Arc::clone(&self.events);
        Arc::new(move |event: &CacheEvent| {
            events.lock().push(event.clone());
        })
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().clone()
    }

    pub fn count_matching(&self, predicate: impl Fn(&CacheEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

// ---------------------------------------------------------------------------
// Remote tier fake

#[derive(Clone)]
struct StoredObject {
    bytes: Bytes,
    content_type: Option<String>,
    user_metadata: Vec<(String, String)>,
}

/// In-memory [`ObjectStore`] standing in for S3/Azure in tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    unavailable: AtomicBool,
    /// Remaining operations that fail with a transient error.
    fail_budget: AtomicU32,
    /// Artificial latency applied to every PUT.
    put_delay_ms: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate an outage: every operation fails until restored.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` operations with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    /// Slow every PUT down; keeps upload tasks in flight for queue tests.
    pub fn set_put_delay_ms(&self, millis: u32) {
        self.put_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn user_metadata_of(&self, object_key: &str) -> Option<Vec<(String, String)>> {
        self.objects
            .lock()
            .get(object_key)
            .map(|o| o.user_metadata.clone())
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Transient("object store unavailable".to_string()));
        }
        if self
            .fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CacheError::Transient("injected transient failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, object_key: &str) -> Result<Option<ObjectBody>, CacheError> {
        self.check_available()?;
        Ok(self.objects.lock().get(object_key).map(|o| ObjectBody {
            bytes: o.bytes.clone(),
            content_type: o.content_type.clone(),
        }))
    }

    async fn put(
        &self,
        object_key: &str,
        bytes: Bytes,
        content_type: Option<&str>,
        user_metadata: &[(String, String)],
    ) -> Result<(), CacheError> {
        self.check_available()?;
        let delay = self.put_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(u64::from(delay))).await;
        }
        self.objects.lock().insert(
            object_key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.map(str::to_string),
                user_metadata: user_metadata.to_vec(),
            },
        );
        Ok(())
    }

    async fn delete(&self, object_key: &str) -> Result<bool, CacheError> {
        self.check_available()?;
        Ok(self.objects.lock().remove(object_key).is_some())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        self.check_available()?;
        Ok(self
            .objects
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Provider fakes

/// Provider whose every operation fails; for health-tracker tests.
pub struct FailingTier {
    name: String,
}

impl FailingTier {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl CacheProvider for FailingTier {
    fn name(&self) -> &str {
        &self.name
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
        _key: &CacheKey,
        _ct: &CancellationToken,
    ) -> Result<Option<CacheFetch>, CacheError> {
        Err(CacheError::Transient("injected fetch failure".to_string()))
    }

    async fn store(
        &self,
        _key: &CacheKey,
        _bytes: Bytes,
        _metadata: &EntryMetadata,
        _ct: &CancellationToken,
    ) -> Result<(), CacheError> {
        Err(CacheError::Transient("injected store failure".to_string()))
    }

    async fn invalidate(
        &self,
        _key: &CacheKey,
        _ct: &CancellationToken,
    ) -> Result<bool, CacheError> {
        Err(CacheError::Transient("injected invalidate failure".to_string()))
    }

    async fn purge_by_source(
        &self,
        _source_hash: [u8; 32],
        _ct: &CancellationToken,
    ) -> Result<u64, CacheError> {
        Err(CacheError::Transient("injected purge failure".to_string()))
    }

    async fn health_check(&self, _ct: &CancellationToken) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Pipeline fakes

/// Origin provider serving from a fixed map, counting fetches.
pub struct RecordingOrigin {
    prefix: String,
    blobs: Mutex<HashMap<String, Bytes>>,
    fetches: AtomicU32,
    supplied_etag: Mutex<Option<String>>,
}

impl RecordingOrigin {
    pub fn new(prefix: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.into(),
            blobs: Mutex::new(HashMap::new()),
            fetches: AtomicU32::new(0),
            supplied_etag: Mutex::new(None),
        })
    }

    pub fn insert(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.blobs.lock().insert(path.into(), data.into());
    }

    /// Attach a provider-supplied ETag to every fetched blob.
    pub fn set_supplied_etag(&self, etag: impl Into<String>) {
        *self.supplied_etag.lock() = Some(etag.into());
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginProvider for RecordingOrigin {
    async fn fetch(&self, virtual_path: &str) -> Result<BlobWrapper, CacheError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .blobs
            .lock()
            .get(virtual_path)
            .cloned()
            .ok_or_else(|| CacheError::not_found(virtual_path.to_string()))?;
        let mut attrs = BlobAttributes::with_content_type("image/png");
        attrs.etag = self.supplied_etag.lock().clone();
        Ok(BlobWrapper::from_bytes(bytes, attrs))
    }

    fn get_prefixes(&self) -> Vec<String> {
        vec![self.prefix.clone()]
    }

    fn supports_path(&self, virtual_path: &str) -> bool {
        virtual_path.starts_with(&self.prefix)
    }

    fn get_latency_zone(&self, _virtual_path: &str) -> LatencyZone {
        LatencyZone::remote()
    }
}

/// Imaging engine that prepends a marker, counting transforms.
pub struct CountingEngine {
    transforms: AtomicU32,
}

impl CountingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            transforms: AtomicU32::new(0),
        })
    }

    pub fn transform_count(&self) -> u32 {
        self.transforms.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImagingEngine for CountingEngine {
    async fn transform(
        &self,
        source: Bytes,
        watermarks: &[Bytes],
        params: &TransformParams,
    ) -> Result<TransformOutput, CacheError> {
        self.transforms.fetch_add(1, Ordering::SeqCst);
        let mut out = Vec::new();
        out.extend_from_slice(b"transformed[");
        out.extend_from_slice(params.canonical_bytes());
        out.extend_from_slice(b"]:");
        out.extend_from_slice(&source);
        for watermark in watermarks {
            out.extend_from_slice(b"+");
            out.extend_from_slice(watermark);
        }
        Ok(TransformOutput {
            bytes: Bytes::from(out),
            content_type: "image/webp".to_string(),
        })
    }
}

/// Watermark planner returning a fixed dependency list.
pub struct FixedWatermarks {
    paths: Vec<String>,
}

impl FixedWatermarks {
    pub fn new(paths: Vec<String>) -> Arc<Self> {
        Arc::new(Self { paths })
    }
}

impl WatermarkPlanner for FixedWatermarks {
    fn dependency_paths(&self, _request: &BlobRequest) -> Vec<String> {
        self.paths.clone()
    }
}
