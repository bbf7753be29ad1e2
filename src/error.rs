//! Error taxonomy for the cache cascade
//!
//! Provider-specific failures are converted into these kinds at the cascade
//! boundary; callers never see a provider's own error types. Factory errors
//! cross the boundary verbatim as [`CacheError::Other`].

use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the cascade, the blob pipeline and the providers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Every tier and the origin both missed.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The coalescing wait expired before the in-flight computation finished.
    #[error("timed out waiting for in-flight computation")]
    CoalescingTimeout,

    /// A tier failed repeatedly and is quarantined for a back-off window.
    #[error("cache provider '{0}' is unhealthy")]
    ProviderUnhealthy(String),

    /// A retryable provider failure. Retried at most once, inside the provider.
    #[error("transient cache failure: {0}")]
    Transient(String),

    /// A tier ran out of room and could not admit the entry.
    #[error("storage full")]
    StorageFull,

    /// The upload queue is at its byte cap.
    #[error("upload queue full")]
    QueueFull,

    /// The cascade refused the call because shutdown has begun.
    #[error("cache cascade is shutting down")]
    ShuttingDown,

    /// A blob core is in a terminal state (stream gone, promotion failed).
    #[error("blob unavailable: {0}")]
    BlobUnavailable(Arc<str>),

    /// Pipeline short-circuit: the client's `If-None-Match` matched.
    #[error("not modified")]
    NotModified,

    /// Filesystem failure in the disk tier.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Factory / business-logic error, propagated verbatim with no retry.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CacheError {
    /// HTTP status class the front-end maps this error to.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::NotModified => 304,
            Self::CoalescingTimeout | Self::ShuttingDown => 503,
            Self::Cancelled => 499,
            _ => 500,
        }
    }

    /// Whether this error means "keep probing the next tier".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Construct a `NotFound` for a key or path description.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Construct a terminal blob error.
    pub fn blob_unavailable(reason: impl Into<Arc<str>>) -> Self {
        Self::BlobUnavailable(reason.into())
    }
}
