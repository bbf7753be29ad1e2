//! Blob pipeline - source fetch, imaging transform, derivative cache
//!
//! Composes the request path as single-fire promises, outermost first:
//! derivative cache (cascade keyed on the variant fingerprint) wraps the
//! imaging transform, which wraps the source cache (cascade keyed on the
//! source fingerprint), which wraps the origin fetch. Cache keys are
//! computed eagerly from the request, so the outer cascade probes without
//! waking any inner stage - and the variant fingerprint doubles as the weak
//! ETag, which is what lets `If-None-Match` short-circuit before any I/O.
//!
//! The origin providers and the imaging engine are external collaborators,
//! consumed through the traits below.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::blob::{BlobAttributes, BlobWrapper};
use crate::cascade::{CacheCascade, CacheStatus};
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::provider::{EntryMetadata, LatencyZone};

// ---------------------------------------------------------------------------
// Collaborator contracts

/// A blob origin (filesystem, object storage, upstream HTTP).
#[async_trait]
pub trait OriginProvider: Send + Sync {
    /// Fetch the blob behind a virtual path.
    async fn fetch(&self, virtual_path: &str) -> Result<BlobWrapper, CacheError>;

    /// Static registration hints; the router prefers the longest matching
    /// prefix.
    fn get_prefixes(&self) -> Vec<String>;

    /// Whether this origin can serve the path.
    fn supports_path(&self, virtual_path: &str) -> bool;

    /// Expected round-trip class for the path.
    fn get_latency_zone(&self, virtual_path: &str) -> LatencyZone;
}

/// The imaging engine: an opaque `source bytes -> derivative bytes`
/// transformation.
#[async_trait]
pub trait ImagingEngine: Send + Sync {
    async fn transform(
        &self,
        source: Bytes,
        watermarks: &[Bytes],
        params: &TransformParams,
    ) -> Result<TransformOutput, CacheError>;
}

/// Injected watermarking policy: which extra source blobs a request needs.
pub trait WatermarkPlanner: Send + Sync {
    fn dependency_paths(&self, request: &BlobRequest) -> Vec<String>;
}

/// Canonical transformation parameters.
///
/// The pipeline treats the contents as opaque canonical bytes; query
/// normalization happens in the routing layer before a request gets here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformParams {
    canonical: String,
}

impl TransformParams {
    pub fn new(canonical: impl Into<String>) -> Self {
        Self {
            canonical: canonical.into(),
        }
    }

    /// The canonical serialization that feeds the variant hash.
    #[must_use]
    pub fn canonical_bytes(&self) -> &[u8] {
        self.canonical.as_bytes()
    }

    /// The canonical form as text (diagnostics).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

/// Output of one imaging transform.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub bytes: Bytes,
    pub content_type: String,
}

// ---------------------------------------------------------------------------
// Requests and responses

/// One image request as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct BlobRequest {
    pub virtual_path: String,
    /// `None` means the untransformed source blob is being served.
    pub params: Option<TransformParams>,
    /// Raw `If-None-Match` header value, if the client sent one.
    pub if_none_match: Option<String>,
}

impl BlobRequest {
    pub fn new(virtual_path: impl Into<String>) -> Self {
        Self {
            virtual_path: virtual_path.into(),
            params: None,
            if_none_match: None,
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: TransformParams) -> Self {
        self.params = Some(params);
        self
    }

    #[must_use]
    pub fn with_if_none_match(mut self, value: impl Into<String>) -> Self {
        self.if_none_match = Some(value.into());
        self
    }

    /// Fingerprint of the derivative this request names. Deterministic and
    /// computed without any I/O.
    #[must_use]
    pub fn variant_key(&self) -> CacheKey {
        match &self.params {
            Some(params) => CacheKey::from_source_and_params(
                self.virtual_path.as_bytes(),
                params.canonical_bytes(),
            ),
            None => CacheKey::for_source(self.virtual_path.as_bytes()),
        }
    }

    /// Fingerprint of the untransformed source blob.
    #[must_use]
    pub fn source_key(&self) -> CacheKey {
        CacheKey::for_source(self.virtual_path.as_bytes())
    }
}

/// A successfully served derivative.
#[derive(Debug, Clone)]
pub struct ServedBlob {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub etag: String,
    pub status: CacheStatus,
}

/// What the pipeline hands the HTTP layer.
#[derive(Debug, Clone)]
pub enum PipelineResponse {
    /// The client's validator matched; no bytes were read anywhere.
    NotModified { etag: String },
    Served(ServedBlob),
}

/// The weak ETag for a variant fingerprint.
#[must_use]
pub fn weak_etag(key: &CacheKey) -> String {
    format!("W/\"{}\"", key.variant_hex())
}

/// Strip weak markers and quotes down to the validator value.
fn etag_value(raw: &str) -> &str {
    let raw = raw.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    raw.trim_matches('"')
}

fn if_none_match_matches(header: &str, variant_hex: &str) -> bool {
    header.trim() == "*"
        || header
            .split(',')
            .any(|candidate| etag_value(candidate) == variant_hex)
}

// ---------------------------------------------------------------------------
// Origin routing

/// Picks the origin provider for a virtual path: longest matching prefix
/// wins, first registered wins ties.
pub struct OriginRouter {
    providers: Vec<Arc<dyn OriginProvider>>,
}

impl OriginRouter {
    #[must_use]
    pub fn new(providers: Vec<Arc<dyn OriginProvider>>) -> Self {
        Self { providers }
    }

    /// Resolve the provider for a path, or `None` when nothing claims it.
    #[must_use]
    pub fn route(&self, virtual_path: &str) -> Option<&Arc<dyn OriginProvider>> {
        let mut best: Option<(&Arc<dyn OriginProvider>, usize)> = None;
        for provider in &self.providers {
            if !provider.supports_path(virtual_path) {
                continue;
            }
            let prefix_len = provider
                .get_prefixes()
                .iter()
                .filter(|prefix| virtual_path.starts_with(prefix.as_str()))
                .map(String::len)
                .max()
                .unwrap_or(0);
            if best.is_none_or(|(_, len)| prefix_len > len) {
                best = Some((provider, prefix_len));
            }
        }
        best.map(|(provider, _)| provider)
    }
}

// ---------------------------------------------------------------------------
// Promises

fn promise_reused() -> CacheError {
    anyhow::anyhow!("blob promise already consumed").into()
}

/// One single-fire stage of the pipeline.
///
/// A promise does no work until `try_get_blob` is invoked, and may be
/// invoked at most once.
#[async_trait]
pub trait BlobPromise: Send {
    /// Whether this stage will request additional source blobs (watermarks)
    /// before it can produce its own.
    fn has_dependencies(&self) -> bool {
        false
    }

    /// Whether the stage's cache key can be computed without firing any
    /// inner stage.
    fn cache_key_basis_ready(&self) -> bool;

    /// Fire the stage.
    async fn try_get_blob(
        &mut self,
        pipeline: &BlobPipeline,
        ct: &CancellationToken,
    ) -> Result<BlobWrapper, CacheError>;
}

/// Innermost stage: delegate to the origin provider the router picks.
pub struct OriginFetchPromise {
    path: String,
    fired: bool,
}

impl OriginFetchPromise {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            fired: false,
        }
    }
}

#[async_trait]
impl BlobPromise for OriginFetchPromise {
    fn cache_key_basis_ready(&self) -> bool {
        true
    }

    async fn try_get_blob(
        &mut self,
        pipeline: &BlobPipeline,
        ct: &CancellationToken,
    ) -> Result<BlobWrapper, CacheError> {
        if std::mem::replace(&mut self.fired, true) {
            return Err(promise_reused());
        }
        if ct.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let provider = pipeline
            .router
            .route(&self.path)
            .ok_or_else(|| CacheError::not_found(self.path.clone()))?;
        debug!(path = %self.path, "origin fetch");
        let wrapper = provider.fetch(&self.path).await?;
        Ok(wrapper.with_latency_zone(provider.get_latency_zone(&self.path)))
    }
}

/// Source-side cache stage: cascade keyed on the source fingerprint,
/// wrapping the origin fetch.
pub struct SourceCachePromise {
    key: CacheKey,
    inner: Option<OriginFetchPromise>,
    status: Option<CacheStatus>,
    fired: bool,
}

impl SourceCachePromise {
    #[must_use]
    pub fn new(path: &str) -> Self {
        Self {
            key: CacheKey::for_source(path.as_bytes()),
            inner: Some(OriginFetchPromise::new(path)),
            status: None,
            fired: false,
        }
    }

    /// The cascade status once fired.
    #[must_use]
    pub fn status(&self) -> Option<CacheStatus> {
        self.status
    }
}

#[async_trait]
impl BlobPromise for SourceCachePromise {
    fn cache_key_basis_ready(&self) -> bool {
        true
    }

    async fn try_get_blob(
        &mut self,
        pipeline: &BlobPipeline,
        ct: &CancellationToken,
    ) -> Result<BlobWrapper, CacheError> {
        if std::mem::replace(&mut self.fired, true) {
            return Err(promise_reused());
        }
        let mut origin = self.inner.take().ok_or_else(promise_reused)?;
        let key = self.key;
        let source_hex = key.variant_hex();

        let result = pipeline
            .source_cache
            .get_or_create(
                key,
                |factory_ct| async move {
                    let wrapper = origin.try_get_blob(pipeline, &factory_ct).await?;
                    let attrs = wrapper.attributes().clone();
                    if let Some(provider_etag) = &attrs.etag {
                        if etag_value(provider_etag) != source_hex {
                            pipeline.etag_mismatches.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    let bytes = wrapper.bytes(&factory_ct).await?;
                    let metadata =
                        EntryMetadata::for_payload(&key, &bytes, attrs.content_type);
                    Ok((bytes, metadata))
                },
                ct,
            )
            .await?;

        self.status = Some(result.status);
        let attrs = BlobAttributes {
            content_type: result.content_type,
            estimated_len: Some(result.bytes.len() as u64),
            ..BlobAttributes::default()
        };
        Ok(BlobWrapper::from_bytes(result.bytes, attrs))
    }
}

/// Imaging stage: resolve watermark dependencies, fetch the source blob,
/// run the transform.
pub struct TransformPromise {
    params: TransformParams,
    source: Option<SourceCachePromise>,
    dependencies: Vec<SourceCachePromise>,
    fired: bool,
}

impl TransformPromise {
    #[must_use]
    pub fn new(
        params: TransformParams,
        source: SourceCachePromise,
        dependencies: Vec<SourceCachePromise>,
    ) -> Self {
        Self {
            params,
            source: Some(source),
            dependencies,
            fired: false,
        }
    }
}

#[async_trait]
impl BlobPromise for TransformPromise {
    fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    fn cache_key_basis_ready(&self) -> bool {
        true
    }

    async fn try_get_blob(
        &mut self,
        pipeline: &BlobPipeline,
        ct: &CancellationToken,
    ) -> Result<BlobWrapper, CacheError> {
        if std::mem::replace(&mut self.fired, true) {
            return Err(promise_reused());
        }

        // Dependencies resolve before the transform begins.
        let mut watermark_bytes = Vec::with_capacity(self.dependencies.len());
        for mut dependency in self.dependencies.drain(..) {
            let wrapper = dependency.try_get_blob(pipeline, ct).await?;
            watermark_bytes.push(wrapper.bytes(ct).await?);
        }

        let mut source = self.source.take().ok_or_else(promise_reused)?;
        let source_wrapper = source.try_get_blob(pipeline, ct).await?;
        let source_bytes = source_wrapper.bytes(ct).await?;

        if ct.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let output = pipeline
            .engine
            .transform(source_bytes, &watermark_bytes, &self.params)
            .await?;
        Ok(BlobWrapper::from_bytes(
            output.bytes,
            BlobAttributes::with_content_type(output.content_type),
        ))
    }
}

/// Outermost stage: cascade keyed on the variant fingerprint, wrapping the
/// transform.
pub struct DerivativeCachePromise {
    key: CacheKey,
    inner: Option<TransformPromise>,
    status: Option<CacheStatus>,
    fired: bool,
}

impl DerivativeCachePromise {
    #[must_use]
    pub fn new(key: CacheKey, inner: TransformPromise) -> Self {
        Self {
            key,
            inner: Some(inner),
            status: None,
            fired: false,
        }
    }

    /// The cascade status once fired.
    #[must_use]
    pub fn status(&self) -> Option<CacheStatus> {
        self.status
    }
}

#[async_trait]
impl BlobPromise for DerivativeCachePromise {
    fn has_dependencies(&self) -> bool {
        self.inner.as_ref().is_some_and(TransformPromise::has_dependencies)
    }

    fn cache_key_basis_ready(&self) -> bool {
        true
    }

    async fn try_get_blob(
        &mut self,
        pipeline: &BlobPipeline,
        ct: &CancellationToken,
    ) -> Result<BlobWrapper, CacheError> {
        if std::mem::replace(&mut self.fired, true) {
            return Err(promise_reused());
        }
        let mut inner = self.inner.take().ok_or_else(promise_reused)?;
        let key = self.key;

        let result = pipeline
            .derivative_cache
            .get_or_create(
                key,
                |factory_ct| async move {
                    let wrapper = inner.try_get_blob(pipeline, &factory_ct).await?;
                    let content_type = wrapper.attributes().content_type.clone();
                    let bytes = wrapper.bytes(&factory_ct).await?;
                    let metadata = EntryMetadata::for_payload(&key, &bytes, content_type);
                    Ok((bytes, metadata))
                },
                ct,
            )
            .await?;

        self.status = Some(result.status);
        let attrs = BlobAttributes {
            content_type: result.content_type,
            estimated_len: Some(result.bytes.len() as u64),
            etag: Some(weak_etag(&key)),
            ..BlobAttributes::default()
        };
        Ok(BlobWrapper::from_bytes(result.bytes, attrs))
    }
}

// ---------------------------------------------------------------------------
// The pipeline

/// Builder for [`BlobPipeline`].
pub struct BlobPipelineBuilder {
    derivative_cache: Option<Arc<CacheCascade>>,
    source_cache: Option<Arc<CacheCascade>>,
    engine: Option<Arc<dyn ImagingEngine>>,
    origins: Vec<Arc<dyn OriginProvider>>,
    watermarks: Option<Arc<dyn WatermarkPlanner>>,
}

impl BlobPipelineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            derivative_cache: None,
            source_cache: None,
            engine: None,
            origins: Vec::new(),
            watermarks: None,
        }
    }

    /// Cascade for derivatives, keyed on the variant fingerprint.
    #[must_use]
    pub fn with_derivative_cache(mut self, cascade: Arc<CacheCascade>) -> Self {
        self.derivative_cache = Some(cascade);
        self
    }

    /// Cascade for source blobs, keyed on the source fingerprint.
    /// Typically memory-only plus a shared origin cache.
    #[must_use]
    pub fn with_source_cache(mut self, cascade: Arc<CacheCascade>) -> Self {
        self.source_cache = Some(cascade);
        self
    }

    #[must_use]
    pub fn with_engine(mut self, engine: Arc<dyn ImagingEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Register an origin; routing prefers the longest matching prefix.
    #[must_use]
    pub fn with_origin(mut self, origin: Arc<dyn OriginProvider>) -> Self {
        self.origins.push(origin);
        self
    }

    #[must_use]
    pub fn with_watermark_planner(mut self, planner: Arc<dyn WatermarkPlanner>) -> Self {
        self.watermarks = Some(planner);
        self
    }

    pub fn build(self) -> Result<BlobPipeline, CacheError> {
        let derivative_cache = self
            .derivative_cache
            .ok_or_else(|| anyhow::anyhow!("pipeline requires a derivative cache"))?;
        let source_cache = self
            .source_cache
            .ok_or_else(|| anyhow::anyhow!("pipeline requires a source cache"))?;
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("pipeline requires an imaging engine"))?;
        if self.origins.is_empty() {
            return Err(anyhow::anyhow!("pipeline requires at least one origin provider").into());
        }
        Ok(BlobPipeline {
            derivative_cache,
            source_cache,
            engine,
            router: OriginRouter::new(self.origins),
            watermarks: self.watermarks,
            etag_mismatches: AtomicU64::new(0),
        })
    }
}

impl Default for BlobPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The composed request path.
pub struct BlobPipeline {
    derivative_cache: Arc<CacheCascade>,
    source_cache: Arc<CacheCascade>,
    engine: Arc<dyn ImagingEngine>,
    router: OriginRouter,
    watermarks: Option<Arc<dyn WatermarkPlanner>>,
    /// Origin-supplied validators disagreeing with our computed ones.
    /// Observable, never fatal.
    etag_mismatches: AtomicU64,
}

impl BlobPipeline {
    #[must_use]
    pub fn builder() -> BlobPipelineBuilder {
        BlobPipelineBuilder::new()
    }

    /// Origin router (diagnostics, tests).
    #[must_use]
    pub fn router(&self) -> &OriginRouter {
        &self.router
    }

    /// How often an origin-supplied ETag disagreed with the computed one.
    #[must_use]
    pub fn etag_mismatch_count(&self) -> u64 {
        self.etag_mismatches.load(Ordering::Relaxed)
    }

    /// Build the promise chain for a transforming request.
    #[must_use]
    pub fn derivative_promise(&self, request: &BlobRequest) -> DerivativeCachePromise {
        let dependencies = self
            .watermarks
            .as_ref()
            .map(|planner| planner.dependency_paths(request))
            .unwrap_or_default()
            .into_iter()
            .map(|path| SourceCachePromise::new(&path))
            .collect();
        let source = SourceCachePromise::new(&request.virtual_path);
        let params = request
            .params
            .clone()
            .unwrap_or_else(|| TransformParams::new(""));
        DerivativeCachePromise::new(
            request.variant_key(),
            TransformPromise::new(params, source, dependencies),
        )
    }

    /// Serve one request end to end.
    ///
    /// `If-None-Match` is checked against the variant fingerprint before
    /// anything fires, so a match costs no origin fetch and no cache probe.
    pub async fn serve(
        &self,
        request: BlobRequest,
        ct: &CancellationToken,
    ) -> Result<PipelineResponse, CacheError> {
        let variant_key = request.variant_key();
        let etag = weak_etag(&variant_key);

        if let Some(header) = &request.if_none_match {
            if if_none_match_matches(header, &variant_key.variant_hex()) {
                debug!(path = %request.virtual_path, "validator matched, short-circuiting");
                return Ok(PipelineResponse::NotModified { etag });
            }
        }

        let (bytes, content_type, status) = if request.params.is_some() {
            let mut promise = self.derivative_promise(&request);
            let wrapper = promise.try_get_blob(self, ct).await?;
            let content_type = wrapper.attributes().content_type.clone();
            let bytes = wrapper.bytes(ct).await?;
            (bytes, content_type, promise.status())
        } else {
            let mut promise = SourceCachePromise::new(&request.virtual_path);
            let wrapper = promise.try_get_blob(self, ct).await?;
            let content_type = wrapper.attributes().content_type.clone();
            let bytes = wrapper.bytes(ct).await?;
            (bytes, content_type, promise.status())
        };

        Ok(PipelineResponse::Served(ServedBlob {
            bytes,
            content_type,
            etag,
            status: status.unwrap_or(CacheStatus::Created),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_values_ignore_weak_markers_and_quotes() {
        assert_eq!(etag_value("W/\"abc\""), "abc");
        assert_eq!(etag_value("\"abc\""), "abc");
        assert_eq!(etag_value("abc"), "abc");
    }

    #[test]
    fn if_none_match_handles_lists_and_star() {
        let key = CacheKey::from_source_and_params(b"/img.jpg", b"w=100");
        let hex = key.variant_hex();
        assert!(if_none_match_matches("*", &hex));
        assert!(if_none_match_matches(&weak_etag(&key), &hex));
        assert!(if_none_match_matches(
            &format!("\"zzz\", {}", weak_etag(&key)),
            &hex
        ));
        assert!(!if_none_match_matches("\"zzz\"", &hex));
    }

    #[test]
    fn variant_and_source_keys_differ_only_with_params() {
        let plain = BlobRequest::new("/img.jpg");
        assert_eq!(plain.variant_key(), plain.source_key());

        let transformed =
            BlobRequest::new("/img.jpg").with_params(TransformParams::new("w=100&h=50"));
        assert_ne!(transformed.variant_key(), transformed.source_key());
        assert_eq!(
            transformed.variant_key().source_hash(),
            transformed.source_key().source_hash()
        );
    }
}
