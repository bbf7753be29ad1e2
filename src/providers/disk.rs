//! Disk tier - sharded files plus an append-only metadata log
//!
//! Entries live at `{root}/{storage_path(key)}`; a compact binary log under
//! the root records every create/update/delete and is replayed into an
//! in-memory index on startup, so the hot path never touches directory
//! listings. Writes land in a `.tmp` sibling and are renamed into place.
//!
//! Cleanup runs in the background once tracked bytes exceed the cap,
//! deleting entries older than a minimum age, least-recently-accessed
//! first, until a low watermark is reached. Failed deletions are retried
//! after a retry interval.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::key::{CacheKey, HASH_LEN};
use crate::provider::{
    CacheFetch, CacheProvider, EntryMetadata, LatencyZone, ProviderCapabilities, StoreReason,
};

const LOG_FILE_NAME: &str = "meta.log";

/// Log records outnumbering live entries by this factor trigger a rewrite
/// on startup.
const COMPACTION_FACTOR: usize = 4;

/// Bounded content-type pool size.
const INTERNER_CAP: usize = 128;

/// Configuration for [`DiskTier`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskTierConfig {
    /// Root directory for cached files and the metadata log.
    pub root: PathBuf,
    /// Byte cap; exceeding it schedules a cleanup pass.
    pub max_bytes: u64,
    /// Cleanup deletes down to this fraction of `max_bytes`.
    pub cleanup_watermark: f64,
    /// Entries younger than this are never cleanup victims.
    #[serde(with = "crate::cascade::serde_duration")]
    pub min_age: Duration,
    /// Wait before retrying a failed deletion.
    #[serde(with = "crate::cascade::serde_duration")]
    pub retry_interval: Duration,
}

impl Default for DiskTierConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("cache"),
            max_bytes: 4 * 1024 * 1024 * 1024,
            cleanup_watermark: 0.8,
            min_age: Duration::from_secs(60),
            retry_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct DiskEntry {
    relative_path: String,
    disk_size: u64,
    created_at: i64,
    last_deletion_attempt: i64,
    /// Coarse hour bucket of the last access; orders cleanup victims.
    access_bucket: i32,
    content_type: Option<Arc<str>>,
}

// ---------------------------------------------------------------------------
// Metadata log records

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogEntryType {
    Create = 1,
    Update = 2,
    Delete = 3,
}

#[derive(Debug, Clone, PartialEq)]
struct LogRecord {
    entry_type: u8,
    access_count_key: i32,
    created_at: i64,
    last_deletion_attempt: i64,
    disk_size: i64,
    relative_path: String,
    content_type: Option<String>,
}

impl LogRecord {
    fn from_entry(entry_type: LogEntryType, entry: &DiskEntry) -> Self {
        Self {
            entry_type: entry_type as u8,
            access_count_key: entry.access_bucket,
            created_at: entry.created_at,
            last_deletion_attempt: entry.last_deletion_attempt,
            disk_size: i64::try_from(entry.disk_size).unwrap_or(i64::MAX),
            relative_path: entry.relative_path.clone(),
            content_type: entry.content_type.as_deref().map(str::to_string),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.entry_type);
        buf.put_i32_le(self.access_count_key);
        buf.put_i64_le(self.created_at);
        buf.put_i64_le(self.last_deletion_attempt);
        buf.put_i64_le(self.disk_size);
        put_str(buf, &self.relative_path);
        put_str(buf, self.content_type.as_deref().unwrap_or(""));
    }

    /// Decode one record; `None` on a truncated tail (crash mid-append).
    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 1 + 4 + 8 + 8 + 8 {
            return None;
        }
        let entry_type = buf.get_u8();
        let access_count_key = buf.get_i32_le();
        let created_at = buf.get_i64_le();
        let last_deletion_attempt = buf.get_i64_le();
        let disk_size = buf.get_i64_le();
        let relative_path = get_str(buf)?;
        let content_type = get_str(buf)?;
        Some(Self {
            entry_type,
            access_count_key,
            created_at,
            last_deletion_attempt,
            disk_size,
            relative_path,
            content_type: if content_type.is_empty() {
                None
            } else {
                Some(content_type)
            },
        })
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    let len = u16::try_from(s.len()).unwrap_or(u16::MAX);
    buf.put_u16_le(len);
    buf.put_slice(&s.as_bytes()[..usize::from(len)]);
}

fn get_str(buf: &mut impl Buf) -> Option<String> {
    if buf.remaining() < 2 {
        return None;
    }
    let len = usize::from(buf.get_u16_le());
    if buf.remaining() < len {
        return None;
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).ok()
}

/// Parse `{shard}/{source_hex}/{variant_hex}` back into a key.
fn key_from_relative_path(path: &str) -> Option<CacheKey> {
    let mut parts = path.split('/');
    let _shard = parts.next()?;
    let source_hex = parts.next()?;
    let variant_hex = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let source: [u8; HASH_LEN] = hex::decode(source_hex).ok()?.try_into().ok()?;
    let variant: [u8; HASH_LEN] = hex::decode(variant_hex).ok()?.try_into().ok()?;
    Some(CacheKey::from_hashes(source, variant))
}

// ---------------------------------------------------------------------------
// Content-type interner

/// Bounded string pool. Once saturated, new strings pass through un-pooled;
/// the pool only ever holds [`INTERNER_CAP`] distinct content types.
struct ContentTypeInterner {
    pool: RwLock<HashMap<String, Arc<str>>>,
}

impl ContentTypeInterner {
    fn new() -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
        }
    }

    fn intern(&self, s: &str) -> Arc<str> {
        if let Some(hit) = self.pool.read().get(s) {
            return Arc::clone(hit);
        }
        let mut pool = self.pool.write();
        if let Some(hit) = pool.get(s) {
            return Arc::clone(hit);
        }
        let value: Arc<str> = Arc::from(s);
        if pool.len() < INTERNER_CAP {
            pool.insert(s.to_string(), Arc::clone(&value));
        }
        value
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.pool.read().len()
    }
}

// ---------------------------------------------------------------------------
// The tier

/// Local disk cache tier.
pub struct DiskTier {
    config: DiskTierConfig,
    index: DashMap<CacheKey, DiskEntry>,
    total_bytes: AtomicU64,
    log: Mutex<tokio::fs::File>,
    interner: ContentTypeInterner,
    cleanup_running: AtomicBool,
    /// Keys whose access bucket changed since the last log flush.
    dirty_access: DashSet<CacheKey>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn access_bucket_now() -> i32 {
    i32::try_from(unix_now() / 3600).unwrap_or(i32::MAX)
}

impl DiskTier {
    /// Open the tier, replaying (and if worthwhile, compacting) the
    /// metadata log.
    pub async fn open(config: DiskTierConfig) -> Result<Arc<Self>, CacheError> {
        tokio::fs::create_dir_all(&config.root).await?;
        let log_path = config.root.join(LOG_FILE_NAME);

        let mut index: HashMap<CacheKey, DiskEntry> = HashMap::new();
        let mut replayed_records = 0usize;
        match tokio::fs::read(&log_path).await {
            Ok(raw) => {
                let mut buf = Bytes::from(raw);
                while let Some(record) = LogRecord::decode(&mut buf) {
                    replayed_records += 1;
                    let Some(key) = key_from_relative_path(&record.relative_path) else {
                        warn!(path = %record.relative_path, "skipping unparseable log record");
                        continue;
                    };
                    if record.entry_type == LogEntryType::Delete as u8 {
                        index.remove(&key);
                    } else {
                        index.insert(
                            key,
                            DiskEntry {
                                relative_path: record.relative_path,
                                disk_size: u64::try_from(record.disk_size).unwrap_or(0),
                                created_at: record.created_at,
                                last_deletion_attempt: record.last_deletion_attempt,
                                access_bucket: record.access_count_key,
                                content_type: record.content_type.map(Arc::from),
                            },
                        );
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let compact = replayed_records > COMPACTION_FACTOR * index.len().max(1);
        if compact {
            let mut buf = BytesMut::new();
            for entry in index.values() {
                LogRecord::from_entry(LogEntryType::Create, entry).encode(&mut buf);
            }
            let tmp = log_path.with_extension("log.tmp");
            tokio::fs::write(&tmp, &buf).await?;
            tokio::fs::rename(&tmp, &log_path).await?;
            info!(
                live = index.len(),
                replayed = replayed_records,
                "compacted disk metadata log"
            );
        }

        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;

        let total_bytes = index.values().map(|e| e.disk_size).sum();
        info!(
            entries = index.len(),
            total_bytes,
            root = %config.root.display(),
            "disk tier opened"
        );

        Ok(Arc::new(Self {
            config,
            index: index.into_iter().collect(),
            total_bytes: AtomicU64::new(total_bytes),
            log: Mutex::new(log),
            interner: ContentTypeInterner::new(),
            cleanup_running: AtomicBool::new(false),
            dirty_access: DashSet::new(),
        }))
    }

    /// Bytes currently tracked by the index.
    #[must_use]
    pub fn tracked_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Number of entries in the index.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    fn absolute_path(&self, relative: &str) -> PathBuf {
        self.config.root.join(relative)
    }

    async fn append_record(&self, record: &LogRecord) -> Result<(), CacheError> {
        let mut buf = BytesMut::new();
        record.encode(&mut buf);
        let mut log = self.log.lock().await;
        log.write_all(&buf).await?;
        Ok(())
    }

    async fn remove_entry(&self, key: &CacheKey, delete_file: bool) -> Result<bool, CacheError> {
        let Some((_, entry)) = self.index.remove(key) else {
            return Ok(false);
        };
        self.total_bytes
            .fetch_sub(entry.disk_size, Ordering::Relaxed);
        if delete_file {
            match tokio::fs::remove_file(self.absolute_path(&entry.relative_path)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    // Deletion failed; put the entry back for the retry pass.
                    let mut entry = entry;
                    entry.last_deletion_attempt = unix_now();
                    self.total_bytes
                        .fetch_add(entry.disk_size, Ordering::Relaxed);
                    let record = LogRecord::from_entry(LogEntryType::Update, &entry);
                    self.index.insert(*key, entry);
                    self.append_record(&record).await?;
                    return Err(e.into());
                }
            }
        }
        let record = LogRecord::from_entry(LogEntryType::Delete, &entry);
        self.append_record(&record).await?;
        Ok(true)
    }

    /// Run a cleanup pass if the cap is exceeded and no pass is already
    /// running. Called from `store`, which for this tier executes inside an
    /// upload task, so eviction cost stays off the request path.
    async fn cleanup_if_needed(&self) {
        if self.total_bytes.load(Ordering::Relaxed) <= self.config.max_bytes {
            return;
        }
        if self
            .cleanup_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Err(e) = self.run_cleanup().await {
            warn!(error = %e, "disk cleanup pass failed");
        }
        self.cleanup_running.store(false, Ordering::Release);
    }

    async fn run_cleanup(&self) -> Result<(), CacheError> {
        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let target = (self.config.max_bytes as f64 * self.config.cleanup_watermark) as u64;
        let now = unix_now();
        let min_age = i64::try_from(self.config.min_age.as_secs()).unwrap_or(i64::MAX);
        let retry_after = i64::try_from(self.config.retry_interval.as_secs()).unwrap_or(i64::MAX);

        // Flush dirty access buckets first so victim ordering sees them.
        let dirty: Vec<CacheKey> = self.dirty_access.iter().map(|k| *k).collect();
        for key in dirty {
            self.dirty_access.remove(&key);
            if let Some(entry) = self.index.get(&key) {
                let record = LogRecord::from_entry(LogEntryType::Update, &entry);
                drop(entry);
                self.append_record(&record).await?;
            }
        }

        let mut candidates: Vec<(CacheKey, i32, i64, u64)> = self
            .index
            .iter()
            .filter(|item| {
                let e = item.value();
                now - e.created_at >= min_age
                    && (e.last_deletion_attempt == 0
                        || now - e.last_deletion_attempt >= retry_after)
            })
            .map(|item| {
                let e = item.value();
                (*item.key(), e.access_bucket, e.created_at, e.disk_size)
            })
            .collect();
        candidates.sort_by_key(|&(_, bucket, created, _)| (bucket, created));

        let mut removed = 0u64;
        for (key, _, _, _) in candidates {
            if self.total_bytes.load(Ordering::Relaxed) <= target {
                break;
            }
            match self.remove_entry(&key, true).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    debug!(%key, error = %e, "cleanup deletion failed, will retry later");
                }
            }
        }
        info!(
            removed,
            remaining_bytes = self.total_bytes.load(Ordering::Relaxed),
            "disk cleanup pass finished"
        );
        Ok(())
    }
}

#[async_trait]
impl CacheProvider for DiskTier {
    fn name(&self) -> &str {
        "disk"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            requires_inline_execution: false,
            is_local: true,
            latency_zone: LatencyZone::local_disk(),
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
        let Some(entry) = self.index.get(key).map(|e| e.value().clone()) else {
            return Ok(None);
        };

        let raw = match tokio::fs::read(self.absolute_path(&entry.relative_path)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Index drift: the file vanished underneath us.
                warn!(%key, "indexed file missing on disk, dropping entry");
                let _ = self.remove_entry(key, false).await;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let bucket = access_bucket_now();
        if let Some(mut live) = self.index.get_mut(key) {
            if live.access_bucket != bucket {
                live.access_bucket = bucket;
                drop(live);
                self.dirty_access.insert(*key);
            }
        }

        let bytes = Bytes::from(raw);
        Ok(Some(CacheFetch {
            metadata: EntryMetadata {
                content_type: entry.content_type.as_deref().map(str::to_string),
                content_length: bytes.len() as u64,
                source_prefix: Some(key.source_prefix_hex()),
            },
            bytes,
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
        let relative = key.storage_path();
        let path = self.absolute_path(&relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Concurrent writers of one key write identical bytes; last rename
        // wins either way.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let entry = DiskEntry {
            relative_path: relative,
            disk_size: bytes.len() as u64,
            created_at: unix_now(),
            last_deletion_attempt: 0,
            access_bucket: access_bucket_now(),
            content_type: metadata.content_type.as_deref().map(|s| self.interner.intern(s)),
        };
        let record = LogRecord::from_entry(LogEntryType::Create, &entry);

        let previous = self.index.insert(*key, entry);
        let delta = bytes.len() as u64;
        if let Some(previous) = previous {
            self.total_bytes
                .fetch_sub(previous.disk_size, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(delta, Ordering::Relaxed);
        self.append_record(&record).await?;

        debug!(%key, len = bytes.len(), "disk store");
        self.cleanup_if_needed().await;
        Ok(())
    }

    async fn invalidate(
        &self,
        key: &CacheKey,
        _ct: &CancellationToken,
    ) -> Result<bool, CacheError> {
        self.remove_entry(key, true).await
    }

    async fn purge_by_source(
        &self,
        source_hash: [u8; HASH_LEN],
        ct: &CancellationToken,
    ) -> Result<u64, CacheError> {
        let victims: Vec<CacheKey> = self
            .index
            .iter()
            .filter(|item| item.key().source_hash() == source_hash)
            .map(|item| *item.key())
            .collect();
        let mut removed = 0;
        for key in victims {
            if ct.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            if self.remove_entry(&key, true).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn wants_to_store(&self, key: &CacheKey, size: u64, reason: StoreReason) -> bool {
        if size > self.config.max_bytes {
            return false;
        }
        match reason {
            StoreReason::FreshlyCreated | StoreReason::Missed => true,
            StoreReason::NotQueried => !self.index.contains_key(key),
        }
    }

    fn probably_contains(&self, key: &CacheKey) -> bool {
        self.index.contains_key(key)
    }

    async fn health_check(&self, _ct: &CancellationToken) -> bool {
        tokio::fs::metadata(&self.config.root).await.is_ok()
    }

    async fn stop(&self) {
        let log = self.log.lock().await;
        if let Err(e) = log.sync_all().await {
            warn!(error = %e, "failed to sync disk metadata log on stop");
        }
    }
}
