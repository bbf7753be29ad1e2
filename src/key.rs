//! Cache keys
//!
//! A cache key is the content-addressed fingerprint of one derivative: a
//! *source hash* identifying the origin object and a *variant hash* covering
//! the source plus the canonical transformation parameters. Storage paths,
//! purge prefixes and ETags are all derived from it; nothing else in the
//! cascade ever re-hashes.

use sha2::{Digest, Sha256};
use std::fmt;

/// Length in bytes of each of the two fingerprint hashes.
pub const HASH_LEN: usize = 32;

/// Deterministic fingerprint of a (source, transformation) pair.
///
/// Two requests producing semantically identical derivatives produce
/// byte-identical keys; the caller is responsible for canonicalizing the
/// parameter bytes before handing them over; the key treats them as opaque.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    source: [u8; HASH_LEN],
    variant: [u8; HASH_LEN],
}

impl CacheKey {
    /// Fingerprint a source identity plus canonical transformation parameters.
    ///
    /// `source_id` is whatever uniquely names the origin object (typically the
    /// virtual path bytes); `canonical_params` is the canonical serialization
    /// of the transformation.
    #[must_use]
    pub fn from_source_and_params(source_id: &[u8], canonical_params: &[u8]) -> Self {
        let source: [u8; HASH_LEN] = Sha256::digest(source_id).into();

        let mut hasher = Sha256::new();
        hasher.update(source);
        hasher.update(canonical_params);
        let variant: [u8; HASH_LEN] = hasher.finalize().into();

        Self { source, variant }
    }

    /// Rebuild a key from its two raw hashes (disk-index replay, purge
    /// plumbing). The hashes are trusted as-is.
    #[must_use]
    pub fn from_hashes(source: [u8; HASH_LEN], variant: [u8; HASH_LEN]) -> Self {
        Self { source, variant }
    }

    /// Fingerprint a source object with no transformation applied.
    ///
    /// Used by the source-side cache, where the artifact is the untransformed
    /// origin blob itself.
    #[must_use]
    pub fn for_source(source_id: &[u8]) -> Self {
        Self::from_source_and_params(source_id, &[])
    }

    /// The 256-bit source hash.
    #[must_use]
    pub fn source_hash(&self) -> [u8; HASH_LEN] {
        self.source
    }

    /// The 256-bit variant hash. Also the basis for bloom-filter bits and the
    /// pipeline's weak ETag.
    #[must_use]
    pub fn variant_hash(&self) -> [u8; HASH_LEN] {
        self.variant
    }

    /// Full lowercase hex of the source hash.
    #[must_use]
    pub fn source_hex(&self) -> String {
        hex::encode(self.source)
    }

    /// Full lowercase hex of the variant hash.
    #[must_use]
    pub fn variant_hex(&self) -> String {
        hex::encode(self.variant)
    }

    /// First 16 hex characters of the source hash, attached to cloud objects
    /// as the `source-prefix` user metadata.
    #[must_use]
    pub fn source_prefix_hex(&self) -> String {
        let mut s = self.source_hex();
        s.truncate(16);
        s
    }

    /// Three-level sharded relative path:
    /// `{hex(source)[0..4]}/{hex(source)}/{hex(variant)}`.
    #[must_use]
    pub fn storage_path(&self) -> String {
        let source = self.source_hex();
        let shard = &source[..4];
        format!("{shard}/{source}/{}", self.variant_hex())
    }

    /// The listing prefix shared by every variant of one source:
    /// `{hex(source)[0..4]}/{hex(source)}/`.
    #[must_use]
    pub fn source_shard_prefix(&self) -> String {
        Self::shard_prefix_of(self.source)
    }

    /// Listing prefix for an arbitrary source hash (purge-by-source plumbing).
    #[must_use]
    pub fn shard_prefix_of(source_hash: [u8; HASH_LEN]) -> String {
        let source = hex::encode(source_hash);
        let shard = &source[..4];
        format!("{shard}/{source}/")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = self.source_hex();
        let variant = self.variant_hex();
        write!(f, "{}..{}", &source[..8], &variant[..8])
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("source", &self.source_hex())
            .field("variant", &self.variant_hex())
            .finish()
    }
}
