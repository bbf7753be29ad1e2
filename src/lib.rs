//! Cascade Cache
//!
//! A tiered blob cache cascade for image-serving workloads, featuring:
//! - **Memory tier**: weight-bounded in-process caching (Moka)
//! - **Disk tier**: sharded files with an append-only metadata log
//! - **Remote tier**: object-storage adapter with purge-by-source
//! - **Request Coalescing**: per-key semaphores, exactly one factory run
//!   per fingerprint under concurrent load
//! - **Bloom Gating**: rotating bloom filter keeps cold keys off slow tiers
//! - **Bounded Upload Queue**: write-behind stores with byte backpressure
//! - **Blob Pipeline**: source fetch, imaging transform, derivative cache
//!   composed as single-fire promises, with `If-None-Match` short-circuit
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use cascade_cache::{
//!     CacheCascadeBuilder, CacheKey, EntryMetadata, MemoryTier, MemoryTierConfig,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cascade = CacheCascadeBuilder::new()
//!         .with_provider(Arc::new(MemoryTier::new(MemoryTierConfig::default())))
//!         .build()?;
//!
//!     let key = CacheKey::from_source_and_params(b"/img.jpg", b"w=100");
//!     let ct = CancellationToken::new();
//!     let result = cascade
//!         .get_or_create(
//!             key,
//!             |_ct| async move {
//!                 let bytes = Bytes::from_static(b"...derivative bytes...");
//!                 let meta = EntryMetadata::for_payload(
//!                     &key,
//!                     &bytes,
//!                     Some("image/jpeg".to_string()),
//!                 );
//!                 Ok((bytes, meta))
//!             },
//!             &ct,
//!         )
//!         .await?;
//!
//!     println!("served {} bytes ({:?})", result.bytes.len(), result.status);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Request -> Memory -> Disk -> Cloud -> Upload Queue -> Coalesced Factory
//!            | hit     | hit   | hit    | queue hit     | exactly once
//!            return    return  return   return          store upward
//! ```
//!
//! On a miss the cascade takes a per-key permit, re-probes, runs the factory
//! at most once, inserts the key into the bloom filter and then promotes the
//! artifact upward: inline tiers store synchronously, everything else goes
//! through the bounded upload queue (falling back to synchronous stores, or
//! dropping, when the queue is full).

pub mod blob;
pub mod bloom;
pub mod cascade;
pub mod coalesce;
pub mod error;
pub mod events;
pub mod health;
pub mod key;
pub mod pipeline;
pub mod provider;
pub mod providers;
pub mod upload;

pub use blob::{
    BlobAttributes, BlobPayload, BlobStream, BlobWrapper, ConsumablePromise, MemoryPromise,
};
pub use bloom::{BloomConfig, BloomState, RotatingBloomFilter};
pub use cascade::{
    CacheCascade, CacheCascadeBuilder, CacheResult, CacheStatus, CascadeConfig,
    CascadeDiagnostics, ProviderDiagnostics,
};
pub use error::CacheError;
pub use events::{CacheEvent, EventCallback};
pub use health::ProviderHealthSnapshot;
pub use key::CacheKey;
pub use pipeline::{
    BlobPipeline, BlobPipelineBuilder, BlobPromise, BlobRequest, ImagingEngine, OriginProvider,
    OriginRouter, PipelineResponse, ServedBlob, TransformOutput, TransformParams,
    WatermarkPlanner, weak_etag,
};
pub use provider::{
    CacheFetch, CacheProvider, EntryMetadata, LatencyZone, ProviderCapabilities, StoreReason,
};
pub use providers::{
    DiskTier, DiskTierConfig, MemoryTier, MemoryTierConfig, ObjectBody, ObjectStore, RemoteTier,
    RemoteTierConfig,
};
pub use upload::{EnqueueOutcome, UploadQueue};

// Re-export the cancellation token type threaded through the public API.
pub use tokio_util::sync::CancellationToken;

// Re-export async_trait for custom provider implementations.
pub use async_trait::async_trait;
