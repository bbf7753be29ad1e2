//! Bounded upload queue
//!
//! Write-behind stores for tiers that do not require inline execution.
//! Deduplicates on fingerprint, bounds total queued bytes, and never blocks
//! the producer: when the cap is reached, `enqueue` reports `QueueFull` and
//! the caller picks a degraded path. Store failures are logged and swallowed
//! so no task failure goes unobserved.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::CacheError;
use crate::key::CacheKey;
use crate::provider::EntryMetadata;

/// Fixed bookkeeping overhead charged per queued task on top of the payload.
const TASK_OVERHEAD_BYTES: u64 = 256;

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Task admitted and spawned.
    Enqueued,
    /// A task for this fingerprint is already in flight.
    AlreadyPresent,
    /// Admitting the task would exceed the byte cap.
    QueueFull,
}

/// The deferred store work an upload task runs.
pub type StoreFn =
    Box<dyn FnOnce(CacheKey, Bytes, EntryMetadata, CancellationToken) -> BoxFuture<'static, Result<(), CacheError>> + Send>;

struct QueuedUpload {
    bytes: Bytes,
    metadata: EntryMetadata,
    size_in_memory: u64,
}

struct Inner {
    tasks: HashMap<CacheKey, QueuedUpload>,
    total_bytes: u64,
}

/// Bounded, deduplicating queue of asynchronous store tasks.
pub struct UploadQueue {
    inner: Mutex<Inner>,
    max_bytes: u64,
    drained: Notify,
    shutdown: CancellationToken,
}

impl UploadQueue {
    #[must_use]
    pub fn new(max_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                total_bytes: 0,
            }),
            max_bytes,
            drained: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Admit a store task if the fingerprint is new and the byte budget
    /// allows, then spawn it. Never blocks.
    pub fn enqueue(
        self: &Arc<Self>,
        key: CacheKey,
        bytes: Bytes,
        metadata: EntryMetadata,
        store_fn: StoreFn,
    ) -> EnqueueOutcome {
        let size = bytes.len() as u64 + TASK_OVERHEAD_BYTES;
        {
            let mut inner = self.inner.lock();
            if inner.tasks.contains_key(&key) {
                return EnqueueOutcome::AlreadyPresent;
            }
            if inner.total_bytes + size > self.max_bytes {
                return EnqueueOutcome::QueueFull;
            }
            inner.total_bytes += size;
            inner.tasks.insert(
                key,
                QueuedUpload {
                    bytes: bytes.clone(),
                    metadata: metadata.clone(),
                    size_in_memory: size,
                },
            );
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let ct = queue.shutdown.child_token();
            let work = store_fn(key, bytes, metadata, ct.clone());
            tokio::select! {
                () = ct.cancelled() => {
                    warn!(%key, "upload task aborted by shutdown");
                }
                result = work => {
                    if let Err(e) = result {
                        // Swallow after logging: a failed write-behind store
                        // must never take down the runtime.
                        error!(%key, error = %e, "upload task store failed");
                    } else {
                        debug!(%key, "upload task completed");
                    }
                }
            }
            queue.complete(key);
        });

        EnqueueOutcome::Enqueued
    }

    /// In-flight payload for a fingerprint, if any. This is the queue-hit
    /// path: a request arriving while its artifact is still being uploaded
    /// is served from the task's buffer.
    #[must_use]
    pub fn peek(&self, key: &CacheKey) -> Option<(Bytes, EntryMetadata)> {
        let inner = self.inner.lock();
        inner
            .tasks
            .get(key)
            .map(|task| (task.bytes.clone(), task.metadata.clone()))
    }

    fn complete(&self, key: CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(task) = inner.tasks.remove(&key) {
            inner.total_bytes = inner.total_bytes.saturating_sub(task.size_in_memory);
        }
        if inner.tasks.is_empty() {
            self.drained.notify_waiters();
        }
    }

    /// Await completion of every task currently queued.
    pub async fn drain(&self, ct: &CancellationToken) -> Result<(), CacheError> {
        loop {
            let notified = self.drained.notified();
            if self.inner.lock().tasks.is_empty() {
                return Ok(());
            }
            tokio::select! {
                () = ct.cancelled() => return Err(CacheError::Cancelled),
                () = notified => {}
            }
        }
    }

    /// Ask in-flight tasks to stop. Best-effort: a task that has already
    /// started its store runs to completion.
    pub fn abort_pending(&self) {
        self.shutdown.cancel();
    }

    /// Number of in-flight tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Whether any task is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total queued bytes, including per-task overhead.
    #[must_use]
    pub fn queued_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn key(name: &str) -> CacheKey {
        CacheKey::for_source(name.as_bytes())
    }

    fn meta(bytes: &Bytes) -> EntryMetadata {
        EntryMetadata {
            content_type: Some("image/jpeg".to_string()),
            content_length: bytes.len() as u64,
            source_prefix: None,
        }
    }

    fn noop_store() -> StoreFn {
        Box::new(|_, _, _, _| Box::pin(async { Ok(()) }))
    }

    fn slow_store(millis: u64) -> StoreFn {
        Box::new(move |_, _, _, _| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn dedup_on_fingerprint() {
        let queue = UploadQueue::new(1024 * 1024);
        let bytes = Bytes::from_static(b"payload");
        let k = key("a");

        assert_eq!(
            queue.enqueue(k, bytes.clone(), meta(&bytes), slow_store(100)),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            queue.enqueue(k, bytes.clone(), meta(&bytes), noop_store()),
            EnqueueOutcome::AlreadyPresent
        );

        queue.drain(&CancellationToken::new()).await.unwrap();
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn byte_cap_rejects_overflow() {
        let queue = UploadQueue::new(2 * (10_240 + TASK_OVERHEAD_BYTES));
        let bytes = Bytes::from(vec![0u8; 10_240]);

        let mut enqueued = 0;
        let mut full = 0;
        for i in 0..10 {
            match queue.enqueue(key(&format!("k{i}")), bytes.clone(), meta(&bytes), slow_store(200)) {
                EnqueueOutcome::Enqueued => enqueued += 1,
                EnqueueOutcome::QueueFull => full += 1,
                EnqueueOutcome::AlreadyPresent => {}
            }
            assert!(queue.queued_bytes() <= 2 * (10_240 + TASK_OVERHEAD_BYTES));
        }
        assert_eq!(enqueued, 2);
        assert_eq!(full, 8);

        queue.drain(&CancellationToken::new()).await.unwrap();
        assert_eq!(queue.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn peek_serves_in_flight_payload() {
        let queue = UploadQueue::new(1024 * 1024);
        let bytes = Bytes::from_static(b"in-flight");
        let k = key("peek");
        queue.enqueue(k, bytes.clone(), meta(&bytes), slow_store(100));

        let (peeked, metadata) = queue.peek(&k).expect("task should be in flight");
        assert_eq!(peeked, bytes);
        assert_eq!(metadata.content_length, bytes.len() as u64);

        queue.drain(&CancellationToken::new()).await.unwrap();
        assert!(queue.peek(&k).is_none());
    }

    #[tokio::test]
    async fn failed_store_is_swallowed_and_accounted() {
        let queue = UploadQueue::new(1024 * 1024);
        let bytes = Bytes::from_static(b"doomed");
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in_task = Arc::clone(&attempts);

        queue.enqueue(
            key("fail"),
            bytes.clone(),
            meta(&bytes),
            Box::new(move |_, _, _, _| {
                Box::pin(async move {
                    attempts_in_task.fetch_add(1, Ordering::SeqCst);
                    Err(CacheError::Transient("remote store down".to_string()))
                })
            }),
        );

        queue.drain(&CancellationToken::new()).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.queued_bytes(), 0);
    }
}
