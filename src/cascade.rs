//! Cache cascade - ordered tiers behind one `get_or_create`
//!
//! Orchestrates the registered providers (fast to slow), the rotating bloom
//! filter, the request coalescer and the bounded upload queue. Guarantees
//! exactly one factory invocation per distinct fingerprint under concurrent
//! load, promotes artifacts upward with the right write semantics per tier,
//! and degrades (drop stores, store synchronously, fail fast) instead of
//! queueing unbounded work.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bloom::{BloomConfig, BloomState, RotatingBloomFilter};
use crate::coalesce::RequestCoalescer;
use crate::error::CacheError;
use crate::events::{CacheEvent, EventCallback, emit};
use crate::health::{HealthTracker, ProviderHealthSnapshot};
use crate::key::{CacheKey, HASH_LEN};
use crate::provider::{CacheProvider, EntryMetadata, ProviderCapabilities, StoreReason};
use crate::upload::{EnqueueOutcome, UploadQueue};

/// Serialize [`Duration`] config fields as integer milliseconds.
pub mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Cascade-scoped configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// When false, every miss runs its own factory.
    pub enable_request_coalescing: bool,
    /// Bound on the wait behind another caller's computation.
    #[serde(with = "serde_duration")]
    pub coalescing_timeout: Duration,
    /// Backpressure cap on queued write-behind bytes.
    pub max_upload_queue_bytes: u64,
    /// When the queue is full, fall back to storing on the request path
    /// instead of dropping the store.
    pub store_synchronously_when_queue_full: bool,
    /// Bloom filter sizing and rotation.
    pub bloom: BloomConfig,
    /// Consecutive failures before a provider is quarantined.
    pub health_failure_threshold: u32,
    /// Initial quarantine window; doubles per quarantine.
    #[serde(with = "serde_duration")]
    pub health_backoff: Duration,
    /// Upper bound on the quarantine window.
    #[serde(with = "serde_duration")]
    pub health_backoff_max: Duration,
    /// How long shutdown waits for the upload queue to drain.
    #[serde(with = "serde_duration")]
    pub shutdown_grace: Duration,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            enable_request_coalescing: true,
            coalescing_timeout: Duration::from_secs(15),
            max_upload_queue_bytes: 128 * 1024 * 1024,
            store_synchronously_when_queue_full: true,
            bloom: BloomConfig::default(),
            health_failure_threshold: 3,
            health_backoff: Duration::from_secs(30),
            health_backoff_max: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Which path served the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheStatus {
    /// An inline local tier.
    MemoryHit,
    /// A non-inline local tier.
    DiskHit,
    /// A remote tier.
    CloudHit,
    /// An in-flight upload task.
    QueueHit,
    /// The factory ran.
    Created,
}

/// A served artifact.
#[derive(Debug, Clone)]
pub struct CacheResult {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub status: CacheStatus,
}

/// Diagnostics row for one registered provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDiagnostics {
    pub name: String,
    pub latency_zone: String,
    pub hits: u64,
    pub health: ProviderHealthSnapshot,
}

/// Read-only snapshot for the host's diagnostics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CascadeDiagnostics {
    pub providers: Vec<ProviderDiagnostics>,
    pub misses: u64,
    pub created: u64,
    pub queue_hits: u64,
    pub coalesced_waits: u64,
    pub coalescing_timeouts: u64,
    pub coalescer_active_entries: usize,
    pub upload_queue_bytes: u64,
    pub upload_queue_tasks: usize,
    pub bloom: BloomState,
}

impl CascadeDiagnostics {
    /// Render for a JSON diagnostics endpoint.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

struct RegisteredProvider {
    provider: Arc<dyn CacheProvider>,
    /// Cached at registration; capabilities are static by contract.
    capabilities: ProviderCapabilities,
    hits: AtomicU64,
}

impl RegisteredProvider {
    fn status(&self) -> CacheStatus {
        if !self.capabilities.is_local {
            CacheStatus::CloudHit
        } else if self.capabilities.requires_inline_execution {
            CacheStatus::MemoryHit
        } else {
            CacheStatus::DiskHit
        }
    }
}

/// Builder for [`CacheCascade`]. Register providers fast to slow.
pub struct CacheCascadeBuilder {
    providers: Vec<Arc<dyn CacheProvider>>,
    config: CascadeConfig,
    on_event: Option<EventCallback>,
}

impl CacheCascadeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            config: CascadeConfig::default(),
            on_event: None,
        }
    }

    /// Append a provider; probe order is registration order.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn CacheProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: CascadeConfig) -> Self {
        self.config = config;
        self
    }

    /// Install the synchronous telemetry callback.
    #[must_use]
    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.on_event = Some(callback);
        self
    }

    /// Build the cascade. The provider list is immutable afterwards.
    pub fn build(self) -> Result<Arc<CacheCascade>, CacheError> {
        if self.providers.is_empty() {
            return Err(anyhow::anyhow!("cache cascade requires at least one provider").into());
        }

        let names: Vec<String> = self.providers.iter().map(|p| p.name().to_string()).collect();
        info!(providers = ?names, "building cache cascade");

        let providers = self
            .providers
            .into_iter()
            .map(|provider| RegisteredProvider {
                capabilities: provider.capabilities(),
                provider,
                hits: AtomicU64::new(0),
            })
            .collect();

        let health = Arc::new(HealthTracker::new(
            names,
            self.config.health_failure_threshold,
            self.config.health_backoff,
            self.config.health_backoff_max,
        ));

        Ok(Arc::new(CacheCascade {
            bloom: RotatingBloomFilter::new(&self.config.bloom),
            coalescer: RequestCoalescer::new(),
            upload_queue: UploadQueue::new(self.config.max_upload_queue_bytes),
            health,
            providers,
            on_event: self.on_event,
            shutting_down: AtomicBool::new(false),
            misses: AtomicU64::new(0),
            created: AtomicU64::new(0),
            queue_hits: AtomicU64::new(0),
            coalesced_waits: AtomicU64::new(0),
            coalescing_timeouts: AtomicU64::new(0),
            config: self.config,
        }))
    }
}

impl Default for CacheCascadeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The tiered cache cascade.
pub struct CacheCascade {
    providers: Vec<RegisteredProvider>,
    bloom: RotatingBloomFilter,
    coalescer: RequestCoalescer,
    upload_queue: Arc<UploadQueue>,
    health: Arc<HealthTracker>,
    config: CascadeConfig,
    on_event: Option<EventCallback>,
    shutting_down: AtomicBool,
    misses: AtomicU64,
    created: AtomicU64,
    queue_hits: AtomicU64,
    coalesced_waits: AtomicU64,
    coalescing_timeouts: AtomicU64,
}

/// Result of one probe pass: either a hit, or the set of providers that
/// were actually queried (and missed).
enum ProbeOutcome {
    Hit(CacheResult),
    Miss { probed: Vec<bool> },
}

impl CacheCascade {
    /// Serve `key` from the fastest available path, running `factory` at
    /// most once across all concurrent callers when coalescing is enabled.
    ///
    /// The factory receives a child of `ct`; cancelling the caller cancels
    /// its factory run, releases the per-key permit and lets the next
    /// waiter retry.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: CacheKey,
        factory: F,
        ct: &CancellationToken,
    ) -> Result<CacheResult, CacheError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = Result<(Bytes, EntryMetadata), CacheError>> + Send,
    {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CacheError::ShuttingDown);
        }
        if ct.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let probed = match self.probe(key, ct).await? {
            ProbeOutcome::Hit(result) => return Ok(result),
            ProbeOutcome::Miss { probed } => probed,
        };

        if !self.config.enable_request_coalescing {
            return self.create(key, factory, ct, probed).await;
        }

        let guard = match self
            .coalescer
            .acquire(key, self.config.coalescing_timeout, ct)
            .await
        {
            Ok(guard) => guard,
            Err(CacheError::CoalescingTimeout) => {
                self.coalescing_timeouts.fetch_add(1, Ordering::Relaxed);
                emit(self.on_event.as_ref(), &CacheEvent::CoalescingTimeout { key });
                return Err(CacheError::CoalescingTimeout);
            }
            Err(e) => return Err(e),
        };

        // Another waiter may have populated the fast tiers while we queued.
        let result = match self.probe(key, ct).await? {
            ProbeOutcome::Hit(result) => {
                self.coalesced_waits.fetch_add(1, Ordering::Relaxed);
                emit(self.on_event.as_ref(), &CacheEvent::CoalescedWait { key });
                Ok(result)
            }
            ProbeOutcome::Miss { probed } => self.create(key, factory, ct, probed).await,
        };
        drop(guard);
        result
    }

    /// Probe providers in registration order, then the upload queue.
    async fn probe(&self, key: CacheKey, ct: &CancellationToken) -> Result<ProbeOutcome, CacheError> {
        let mut probed = vec![false; self.providers.len()];

        for (index, registered) in self.providers.iter().enumerate() {
            if ct.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            if !self.health.is_available(index) {
                continue;
            }
            // Gate slow tiers behind the filter: a key never inserted here
            // cannot be cached here (within the retention window), so skip
            // the round trip.
            if !registered.capabilities.requires_inline_execution
                && !self.bloom.probably_contains(&key)
            {
                continue;
            }

            match registered.provider.fetch(&key, ct).await {
                Ok(Some(fetch)) => {
                    self.health.report_ok(index);
                    registered.hits.fetch_add(1, Ordering::Relaxed);
                    emit(
                        self.on_event.as_ref(),
                        &CacheEvent::Hit {
                            provider: registered.provider.name().to_string(),
                            key,
                        },
                    );
                    self.promote_on_hit(key, &fetch, index, &probed).await;
                    return Ok(ProbeOutcome::Hit(CacheResult {
                        content_type: fetch.metadata.content_type.clone(),
                        bytes: fetch.bytes,
                        status: registered.status(),
                    }));
                }
                Ok(None) => {
                    if let Some(flag) = probed.get_mut(index) {
                        *flag = true;
                    }
                    self.health.report_ok(index);
                }
                Err(CacheError::Cancelled) => return Err(CacheError::Cancelled),
                Err(e) => {
                    if let Some(flag) = probed.get_mut(index) {
                        *flag = true;
                    }
                    warn!(provider = registered.provider.name(), %key, error = %e, "tier fetch failed");
                    self.report_provider_failure(index);
                }
            }
        }

        if let Some((bytes, metadata)) = self.upload_queue.peek(&key) {
            self.queue_hits.fetch_add(1, Ordering::Relaxed);
            emit(self.on_event.as_ref(), &CacheEvent::QueueHit { key });
            return Ok(ProbeOutcome::Hit(CacheResult {
                content_type: metadata.content_type,
                bytes,
                status: CacheStatus::QueueHit,
            }));
        }

        Ok(ProbeOutcome::Miss { probed })
    }

    /// Run the factory, insert into the bloom filter, then offer the fresh
    /// artifact to every tier.
    async fn create<F, Fut>(
        &self,
        key: CacheKey,
        factory: F,
        ct: &CancellationToken,
        probed: Vec<bool>,
    ) -> Result<CacheResult, CacheError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = Result<(Bytes, EntryMetadata), CacheError>> + Send,
    {
        self.misses.fetch_add(1, Ordering::Relaxed);
        emit(self.on_event.as_ref(), &CacheEvent::Miss { key });

        // Factory errors are the caller's business logic: no retry, no
        // conversion.
        let (bytes, metadata) = factory(ct.child_token()).await?;

        self.created.fetch_add(1, Ordering::Relaxed);
        emit(self.on_event.as_ref(), &CacheEvent::Created { key });

        // Observable before any store acknowledgment.
        self.bloom.insert(&key);

        // Tiers skipped by the bloom gate were told nothing; the reason lets
        // them decline the redundant store.
        let recipients: Vec<(usize, StoreReason)> = (0..self.providers.len())
            .map(|index| {
                let reason = if probed.get(index).copied().unwrap_or(false) {
                    StoreReason::FreshlyCreated
                } else {
                    StoreReason::NotQueried
                };
                (index, reason)
            })
            .collect();
        self.distribute(key, &bytes, &metadata, recipients, ct).await;

        Ok(CacheResult {
            content_type: metadata.content_type,
            bytes,
            status: CacheStatus::Created,
        })
    }

    /// Offer a lower-tier hit to the faster tiers that missed.
    async fn promote_on_hit(
        &self,
        key: CacheKey,
        fetch: &crate::provider::CacheFetch,
        hit_index: usize,
        probed: &[bool],
    ) {
        let recipients: Vec<(usize, StoreReason)> = (0..hit_index)
            .filter(|&i| probed.get(i).copied().unwrap_or(false))
            .map(|i| (i, StoreReason::Missed))
            .collect();
        if recipients.is_empty() {
            return;
        }
        let ct = CancellationToken::new();
        self.distribute(key, &fetch.bytes, &fetch.metadata, recipients, &ct)
            .await;
    }

    /// Store into every willing recipient: inline tiers synchronously,
    /// everything else through the upload queue (or the degraded path).
    async fn distribute(
        &self,
        key: CacheKey,
        bytes: &Bytes,
        metadata: &EntryMetadata,
        recipients: Vec<(usize, StoreReason)>,
        ct: &CancellationToken,
    ) {
        let size = bytes.len() as u64;
        let mut async_recipients: Vec<usize> = Vec::new();

        for (index, reason) in recipients {
            let Some(registered) = self.providers.get(index) else {
                continue;
            };
            if !self.health.is_available(index) {
                continue;
            }
            if !registered.provider.wants_to_store(&key, size, reason) {
                continue;
            }
            if registered.capabilities.requires_inline_execution {
                self.store_inline(index, key, bytes.clone(), metadata, ct).await;
            } else {
                async_recipients.push(index);
            }
        }

        if async_recipients.is_empty() {
            return;
        }

        let task_providers: Vec<(usize, Arc<dyn CacheProvider>)> = async_recipients
            .iter()
            .filter_map(|&i| {
                self.providers
                    .get(i)
                    .map(|r| (i, Arc::clone(&r.provider)))
            })
            .collect();
        let health = Arc::clone(&self.health);
        let on_event = self.on_event.clone();

        let outcome = self.upload_queue.enqueue(
            key,
            bytes.clone(),
            metadata.clone(),
            Box::new(move |key, bytes, metadata, task_ct| {
                Box::pin(async move {
                    for (index, provider) in task_providers {
                        match provider.store(&key, bytes.clone(), &metadata, &task_ct).await {
                            Ok(()) => health.report_ok(index),
                            Err(e) => {
                                warn!(provider = provider.name(), %key, error = %e, "write-behind store failed");
                                emit(
                                    on_event.as_ref(),
                                    &CacheEvent::StoreFailed {
                                        provider: provider.name().to_string(),
                                        key,
                                    },
                                );
                                if health.report_failure(index) {
                                    emit(
                                        on_event.as_ref(),
                                        &CacheEvent::ProviderQuarantined {
                                            provider: provider.name().to_string(),
                                        },
                                    );
                                }
                            }
                        }
                    }
                    Ok(())
                })
            }),
        );

        match outcome {
            EnqueueOutcome::Enqueued => {
                for &index in &async_recipients {
                    if let Some(registered) = self.providers.get(index) {
                        emit(
                            self.on_event.as_ref(),
                            &CacheEvent::StoreQueued {
                                provider: registered.provider.name().to_string(),
                                key,
                            },
                        );
                    }
                }
            }
            EnqueueOutcome::AlreadyPresent => {
                debug!(%key, "upload already in flight, store skipped");
            }
            EnqueueOutcome::QueueFull => {
                emit(self.on_event.as_ref(), &CacheEvent::UploadQueueFull { key });
                if self.config.store_synchronously_when_queue_full {
                    for index in async_recipients {
                        self.store_inline(index, key, bytes.clone(), metadata, ct).await;
                    }
                } else {
                    for index in async_recipients {
                        if let Some(registered) = self.providers.get(index) {
                            emit(
                                self.on_event.as_ref(),
                                &CacheEvent::StoreDropped {
                                    provider: registered.provider.name().to_string(),
                                    key,
                                },
                            );
                        }
                    }
                }
            }
        }
    }

    /// Synchronous store with non-fatal error handling.
    async fn store_inline(
        &self,
        index: usize,
        key: CacheKey,
        bytes: Bytes,
        metadata: &EntryMetadata,
        ct: &CancellationToken,
    ) {
        let Some(registered) = self.providers.get(index) else {
            return;
        };
        match registered.provider.store(&key, bytes, metadata, ct).await {
            Ok(()) => self.health.report_ok(index),
            Err(e) => {
                warn!(provider = registered.provider.name(), %key, error = %e, "synchronous store failed");
                emit(
                    self.on_event.as_ref(),
                    &CacheEvent::StoreFailed {
                        provider: registered.provider.name().to_string(),
                        key,
                    },
                );
                self.report_provider_failure(index);
            }
        }
    }

    fn report_provider_failure(&self, index: usize) {
        if self.health.report_failure(index) {
            if let Some(registered) = self.providers.get(index) {
                emit(
                    self.on_event.as_ref(),
                    &CacheEvent::ProviderQuarantined {
                        provider: registered.provider.name().to_string(),
                    },
                );
            }
        }
    }

    /// Remove one entry from every tier. Returns whether any tier had it.
    pub async fn invalidate(&self, key: &CacheKey, ct: &CancellationToken) -> Result<bool, CacheError> {
        let mut existed = false;
        for (index, registered) in self.providers.iter().enumerate() {
            if ct.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            match registered.provider.invalidate(key, ct).await {
                Ok(found) => existed |= found,
                Err(e) => {
                    warn!(provider = registered.provider.name(), %key, error = %e, "invalidate failed");
                    self.report_provider_failure(index);
                }
            }
        }
        Ok(existed)
    }

    /// Remove every variant of a source from every tier. Returns the total
    /// number of entries removed.
    pub async fn purge_by_source(
        &self,
        source_hash: [u8; HASH_LEN],
        ct: &CancellationToken,
    ) -> Result<u64, CacheError> {
        let mut removed = 0;
        for (index, registered) in self.providers.iter().enumerate() {
            if ct.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            match registered.provider.purge_by_source(source_hash, ct).await {
                Ok(count) => removed += count,
                Err(e) => {
                    warn!(provider = registered.provider.name(), error = %e, "purge-by-source failed");
                    self.report_provider_failure(index);
                }
            }
        }
        Ok(removed)
    }

    /// Await completion of every queued upload task.
    pub async fn drain(&self, ct: &CancellationToken) -> Result<(), CacheError> {
        self.upload_queue.drain(ct).await
    }

    /// Sweep `health_check` over every provider, feeding the tracker.
    pub async fn run_health_checks(&self, ct: &CancellationToken) {
        for (index, registered) in self.providers.iter().enumerate() {
            if ct.is_cancelled() {
                return;
            }
            if registered.provider.health_check(ct).await {
                self.health.report_ok(index);
            } else {
                self.report_provider_failure(index);
            }
        }
    }

    /// Refuse new work, drain the upload queue within the grace window and
    /// signal providers to stop in reverse registration order.
    pub async fn shutdown(&self, ct: &CancellationToken) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("cache cascade shutting down");

        if tokio::time::timeout(self.config.shutdown_grace, self.upload_queue.drain(ct))
            .await
            .is_err()
        {
            warn!("upload queue did not drain within the grace window, aborting pending tasks");
            self.upload_queue.abort_pending();
            let _ = tokio::time::timeout(
                Duration::from_secs(1),
                self.upload_queue.drain(ct),
            )
            .await;
        }

        for registered in self.providers.iter().rev() {
            registered.provider.stop().await;
        }
        info!("cache cascade stopped");
    }

    /// Number of keys with an in-flight coalesced computation.
    #[must_use]
    pub fn coalescer_active_entries(&self) -> usize {
        self.coalescer.active_entries()
    }

    /// Bytes currently held by the upload queue.
    #[must_use]
    pub fn upload_queue_bytes(&self) -> u64 {
        self.upload_queue.queued_bytes()
    }

    /// Number of in-flight upload tasks.
    #[must_use]
    pub fn upload_queue_tasks(&self) -> usize {
        self.upload_queue.len()
    }

    /// Read-only snapshot for the diagnostics endpoints.
    #[must_use]
    pub fn diagnostics(&self) -> CascadeDiagnostics {
        let health = self.health.snapshot();
        let providers = self
            .providers
            .iter()
            .zip(health)
            .map(|(registered, health)| ProviderDiagnostics {
                name: registered.provider.name().to_string(),
                latency_zone: registered.capabilities.latency_zone.as_str().to_string(),
                hits: registered.hits.load(Ordering::Relaxed),
                health,
            })
            .collect();
        CascadeDiagnostics {
            providers,
            misses: self.misses.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            queue_hits: self.queue_hits.load(Ordering::Relaxed),
            coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
            coalescing_timeouts: self.coalescing_timeouts.load(Ordering::Relaxed),
            coalescer_active_entries: self.coalescer.active_entries(),
            upload_queue_bytes: self.upload_queue.queued_bytes(),
            upload_queue_tasks: self.upload_queue.len(),
            bloom: self.bloom.state(),
        }
    }
}
