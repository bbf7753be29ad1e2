//! Cascade event callback
//!
//! A synchronous hook for host telemetry. The callback runs inline on the
//! request path, so implementations must be cheap and must not block.

use std::sync::Arc;

use crate::key::CacheKey;

/// What just happened inside the cascade.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// A tier served the request.
    Hit { provider: String, key: CacheKey },
    /// An in-flight upload task served the request.
    QueueHit { key: CacheKey },
    /// Every tier missed.
    Miss { key: CacheKey },
    /// The factory ran and produced a fresh artifact.
    Created { key: CacheKey },
    /// This caller waited behind another caller's computation.
    CoalescedWait { key: CacheKey },
    /// The coalescing wait expired.
    CoalescingTimeout { key: CacheKey },
    /// A write-behind store was queued for a tier.
    StoreQueued { provider: String, key: CacheKey },
    /// A store was dropped because the queue was full and synchronous
    /// fallback is disabled.
    StoreDropped { provider: String, key: CacheKey },
    /// A synchronous store failed (non-fatal).
    StoreFailed { provider: String, key: CacheKey },
    /// The upload queue refused an enqueue at its byte cap.
    UploadQueueFull { key: CacheKey },
    /// A provider crossed the failure threshold.
    ProviderQuarantined { provider: String },
}

/// Synchronous callback invoked for every [`CacheEvent`].
pub type EventCallback = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Dispatch helper: call the callback if one is installed.
pub(crate) fn emit(callback: Option<&EventCallback>, event: &CacheEvent) {
    if let Some(cb) = callback {
        cb(event);
    }
}
