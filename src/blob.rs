//! Blob wrapper - shared handles over cached or streamed bytes
//!
//! A blob core is either *consumable* (a single-consumption byte stream,
//! usually backed by a network response) or *reusable* (a fully buffered
//! payload that can be read any number of times). Wrappers share one core;
//! promotion from stream to buffer is one-way and serialized so only the
//! first caller performs the I/O.

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CacheError;
use crate::provider::LatencyZone;

/// Attributes describing a blob independent of where its bytes live.
#[derive(Debug, Clone, Default)]
pub struct BlobAttributes {
    /// MIME type, when known.
    pub content_type: Option<String>,
    /// Estimated byte length; used to pre-size buffers, never trusted.
    pub estimated_len: Option<u64>,
    /// Opaque validator supplied by the origin, if any.
    pub etag: Option<String>,
    /// Last modification instant reported by the origin.
    pub last_modified: Option<SystemTime>,
    /// Human-readable origin descriptor for diagnostics.
    pub storage_ref: Option<String>,
}

impl BlobAttributes {
    /// Attributes carrying only a content type.
    #[must_use]
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Self::default()
        }
    }
}

/// Single-consumption byte stream backing a consumable blob.
pub type BlobStream = BoxStream<'static, Result<Bytes, CacheError>>;

/// What a resolved consumable promise hands back.
pub enum BlobPayload {
    /// Exclusive access to the underlying stream. Handed out at most once
    /// per core.
    Stream(BlobStream),
    /// A view into the buffered payload.
    Bytes(Bytes),
}

impl BlobPayload {
    /// Collect the payload into contiguous bytes, draining the stream if
    /// one was handed out.
    pub async fn into_bytes(self) -> Result<Bytes, CacheError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Stream(stream) => collect_stream(stream, None).await,
        }
    }
}

enum CoreState {
    /// Stream still attached; `None` once it has been handed out.
    Streaming(Option<BlobStream>),
    Buffered(Bytes),
    /// Terminal: the stream is gone and no buffer exists.
    Failed(Arc<str>),
}

struct BlobCore {
    attrs: BlobAttributes,
    /// Raised when more than one reader exists or promotion was requested.
    must_buffer: AtomicBool,
    /// Single-permit promotion lock; the first locker performs the buffering
    /// I/O, later lockers observe the result.
    state: Mutex<CoreState>,
}

impl BlobCore {
    /// Buffer the stream if it has not been buffered yet and return a view.
    ///
    /// Runs to completion once started: aborting midway would lose the
    /// single-consumption stream for every other reference.
    async fn buffered(&self) -> Result<Bytes, CacheError> {
        let mut state = self.state.lock().await;
        match &mut *state {
            CoreState::Buffered(bytes) => Ok(bytes.clone()),
            CoreState::Failed(reason) => Err(CacheError::BlobUnavailable(reason.clone())),
            CoreState::Streaming(slot) => {
                let Some(stream) = slot.take() else {
                    let reason: Arc<str> = Arc::from("stream already consumed");
                    *state = CoreState::Failed(reason.clone());
                    return Err(CacheError::BlobUnavailable(reason));
                };
                match collect_stream(stream, self.attrs.estimated_len).await {
                    Ok(bytes) => {
                        debug!(len = bytes.len(), "promoted blob stream to memory");
                        *state = CoreState::Buffered(bytes.clone());
                        Ok(bytes)
                    }
                    Err(e) => {
                        let reason: Arc<str> = Arc::from(e.to_string().as_str());
                        *state = CoreState::Failed(reason.clone());
                        Err(CacheError::BlobUnavailable(reason))
                    }
                }
            }
        }
    }
}

async fn collect_stream(
    mut stream: BlobStream,
    estimated_len: Option<u64>,
) -> Result<Bytes, CacheError> {
    let capacity = usize::try_from(estimated_len.unwrap_or(0)).unwrap_or(0);
    let mut buf = BytesMut::with_capacity(capacity);
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Shared handle to a blob core.
///
/// Create one with [`BlobWrapper::from_bytes`] or
/// [`BlobWrapper::from_stream`]; share it with [`BlobWrapper::fork_reference`].
/// The core is disposed when the last wrapper and promise are dropped.
pub struct BlobWrapper {
    core: Arc<BlobCore>,
    latency_zone: LatencyZone,
}

impl BlobWrapper {
    /// Wrap an already-buffered payload. The result is reusable from the
    /// start.
    #[must_use]
    pub fn from_bytes(bytes: Bytes, attrs: BlobAttributes) -> Self {
        Self {
            core: Arc::new(BlobCore {
                attrs,
                must_buffer: AtomicBool::new(false),
                state: Mutex::new(CoreState::Buffered(bytes)),
            }),
            latency_zone: LatencyZone::memory(),
        }
    }

    /// Wrap a single-consumption stream.
    #[must_use]
    pub fn from_stream(stream: BlobStream, attrs: BlobAttributes) -> Self {
        Self {
            core: Arc::new(BlobCore {
                attrs,
                must_buffer: AtomicBool::new(false),
                state: Mutex::new(CoreState::Streaming(Some(stream))),
            }),
            latency_zone: LatencyZone::remote(),
        }
    }

    /// Tag the wrapper with the latency zone it was served from.
    #[must_use]
    pub fn with_latency_zone(mut self, zone: LatencyZone) -> Self {
        self.latency_zone = zone;
        self
    }

    /// The zone of the provider or origin this blob came from.
    #[must_use]
    pub fn latency_zone(&self) -> &LatencyZone {
        &self.latency_zone
    }

    /// Attributes recorded at creation time.
    #[must_use]
    pub fn attributes(&self) -> &BlobAttributes {
        &self.core.attrs
    }

    /// One-shot promise for exclusive (possibly streaming) access.
    #[must_use]
    pub fn fetch_consumable(&self) -> ConsumablePromise {
        ConsumablePromise {
            core: Arc::clone(&self.core),
        }
    }

    /// Repeatable promise that buffers on first use.
    #[must_use]
    pub fn fetch_memory(&self) -> MemoryPromise {
        MemoryPromise {
            core: Arc::clone(&self.core),
        }
    }

    /// Additional reference to the same core. Marks the core `must_buffer`:
    /// once two readers exist, streaming access is no longer exclusive and
    /// every subsequent read goes through the buffer.
    #[must_use]
    pub fn fork_reference(&self) -> Self {
        self.core.must_buffer.store(true, Ordering::Release);
        Self {
            core: Arc::clone(&self.core),
            latency_zone: self.latency_zone.clone(),
        }
    }

    /// Hint that multiple consumers will follow; promotes to memory eagerly.
    pub async fn indicate_interest(&self) -> Result<(), CacheError> {
        self.core.must_buffer.store(true, Ordering::Release);
        self.core.buffered().await.map(|_| ())
    }

    /// Whether the payload is already buffered and reusable.
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        self.core
            .state
            .try_lock()
            .map(|state| matches!(&*state, CoreState::Buffered(_)))
            .unwrap_or(false)
    }

    /// Buffered view of the whole payload; promotes if necessary.
    pub async fn bytes(&self, ct: &CancellationToken) -> Result<Bytes, CacheError> {
        if ct.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        self.core.buffered().await
    }
}

/// One-shot promise yielding exclusive access to the blob's bytes.
///
/// Resolving consumes the promise; dropping it unresolved releases its
/// reference.
pub struct ConsumablePromise {
    core: Arc<BlobCore>,
}

impl ConsumablePromise {
    /// Resolve to the stream if it is still attached and no buffering has
    /// been requested, else to a buffered view.
    pub async fn resolve(self, ct: &CancellationToken) -> Result<BlobPayload, CacheError> {
        if ct.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        if !self.core.must_buffer.load(Ordering::Acquire) {
            let mut state = self.core.state.lock().await;
            if let CoreState::Streaming(slot) = &mut *state {
                if let Some(stream) = slot.take() {
                    return Ok(BlobPayload::Stream(stream));
                }
            }
            drop(state);
        }
        self.core.buffered().await.map(BlobPayload::Bytes)
    }
}

/// Repeatable promise yielding a buffered view of the blob.
pub struct MemoryPromise {
    core: Arc<BlobCore>,
}

impl MemoryPromise {
    /// Resolve to the buffered payload, promoting the stream on first use.
    pub async fn resolve(self, ct: &CancellationToken) -> Result<Bytes, CacheError> {
        if ct.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        self.core.buffered().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn chunked_stream(chunks: Vec<Result<Bytes, CacheError>>) -> BlobStream {
        stream::iter(chunks).boxed()
    }

    fn ct() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn memory_blob_is_reusable() {
        let blob = BlobWrapper::from_bytes(
            Bytes::from_static(b"abc"),
            BlobAttributes::with_content_type("image/jpeg"),
        );
        assert!(blob.is_reusable());

        let first = blob.fetch_memory().resolve(&ct()).await.unwrap();
        let second = blob.fetch_memory().resolve(&ct()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(&first[..], b"abc");
    }

    #[tokio::test]
    async fn consumable_hands_out_the_stream_exactly_once() {
        let blob = BlobWrapper::from_stream(
            chunked_stream(vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"c"))]),
            BlobAttributes::default(),
        );

        let payload = blob.fetch_consumable().resolve(&ct()).await.unwrap();
        let bytes = match payload {
            BlobPayload::Stream(s) => collect_stream(s, None).await.unwrap(),
            BlobPayload::Bytes(_) => panic!("expected exclusive stream access"),
        };
        assert_eq!(&bytes[..], b"abc");

        // The stream is gone and nothing was buffered: terminal state.
        let err = blob.fetch_consumable().resolve(&ct()).await;
        assert!(matches!(err, Err(CacheError::BlobUnavailable(_))));
    }

    #[tokio::test]
    async fn fork_forces_buffering() {
        let blob = BlobWrapper::from_stream(
            chunked_stream(vec![Ok(Bytes::from_static(b"xyz"))]),
            BlobAttributes::default(),
        );
        let forked = blob.fork_reference();

        let payload = blob.fetch_consumable().resolve(&ct()).await.unwrap();
        match payload {
            BlobPayload::Bytes(bytes) => assert_eq!(&bytes[..], b"xyz"),
            BlobPayload::Stream(_) => panic!("must_buffer set, stream must not escape"),
        }

        let again = forked.fetch_memory().resolve(&ct()).await.unwrap();
        assert_eq!(&again[..], b"xyz");
    }

    #[tokio::test]
    async fn promotion_failure_is_terminal_for_every_promise() {
        let blob = BlobWrapper::from_stream(
            chunked_stream(vec![
                Ok(Bytes::from_static(b"partial")),
                Err(CacheError::blob_unavailable("source stream closed")),
            ]),
            BlobAttributes::default(),
        );
        let second = blob.fetch_memory();

        let err = blob.fetch_memory().resolve(&ct()).await;
        assert!(matches!(err, Err(CacheError::BlobUnavailable(_))));

        // Later promises observe the same terminal error, no retry.
        let err = second.resolve(&ct()).await;
        assert!(matches!(err, Err(CacheError::BlobUnavailable(_))));
    }

    #[tokio::test]
    async fn indicate_interest_promotes_eagerly() {
        let blob = BlobWrapper::from_stream(
            chunked_stream(vec![Ok(Bytes::from_static(b"hot"))]),
            BlobAttributes::default(),
        );
        blob.indicate_interest().await.unwrap();
        assert!(blob.is_reusable());
    }

    #[tokio::test]
    async fn cancelled_token_stops_resolution() {
        let blob = BlobWrapper::from_bytes(Bytes::from_static(b"abc"), BlobAttributes::default());
        let token = CancellationToken::new();
        token.cancel();
        let err = blob.fetch_memory().resolve(&token).await;
        assert!(matches!(err, Err(CacheError::Cancelled)));
    }
}
