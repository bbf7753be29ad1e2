//! Integration tests for the disk tier
//!
//! On-disk layout, metadata-log replay across restarts, purge-by-source
//! and the cleanup pass.

mod common;

use cascade_cache::{CacheKey, CacheProvider, DiskTier, DiskTierConfig};
use common::*;
use std::time::Duration;

fn config(root: &std::path::Path) -> DiskTierConfig {
    DiskTierConfig {
        root: root.to_path_buf(),
        ..DiskTierConfig::default()
    }
}

#[tokio::test]
async fn files_land_at_the_sharded_path() {
    let dir = tempfile::tempdir().unwrap();
    let tier = DiskTier::open(config(dir.path())).await.unwrap();

    let k = key("/layout.jpg");
    let (bytes, meta) = payload(&k, b"on-disk");
    tier.store(&k, bytes, &meta, &ct()).await.unwrap();

    let expected = dir.path().join(k.storage_path());
    assert!(expected.is_file(), "missing {}", expected.display());
    assert_eq!(std::fs::read(expected).unwrap(), b"on-disk");
}

#[tokio::test]
async fn index_survives_restart_via_log_replay() {
    let dir = tempfile::tempdir().unwrap();
    let k1 = key("/replay-1.jpg");
    let k2 = key("/replay-2.jpg");

    {
        let tier = DiskTier::open(config(dir.path())).await.unwrap();
        let (bytes, meta) = payload(&k1, b"one");
        tier.store(&k1, bytes, &meta, &ct()).await.unwrap();
        let (bytes, meta) = payload(&k2, b"two");
        tier.store(&k2, bytes, &meta, &ct()).await.unwrap();
        tier.invalidate(&k2, &ct()).await.unwrap();
        tier.stop().await;
    }

    let tier = DiskTier::open(config(dir.path())).await.unwrap();
    assert_eq!(tier.entry_count(), 1);

    let fetched = tier.fetch(&k1, &ct()).await.unwrap().unwrap();
    assert_eq!(&fetched.bytes[..], b"one");
    assert_eq!(fetched.metadata.content_type.as_deref(), Some("image/jpeg"));

    // The deleted entry stays deleted across the restart.
    assert!(tier.fetch(&k2, &ct()).await.unwrap().is_none());
    assert!(!tier.probably_contains(&k2));
}

#[tokio::test]
async fn purge_by_source_removes_every_variant() {
    let dir = tempfile::tempdir().unwrap();
    let tier = DiskTier::open(config(dir.path())).await.unwrap();

    let v1 = CacheKey::from_source_and_params(b"/purge.jpg", b"w=100");
    let v2 = CacheKey::from_source_and_params(b"/purge.jpg", b"w=200");
    let v3 = CacheKey::from_source_and_params(b"/purge.jpg", b"w=300");
    let other = CacheKey::from_source_and_params(b"/keep.jpg", b"w=100");

    for k in [&v1, &v2, &v3, &other] {
        let (bytes, meta) = payload(k, b"variant");
        tier.store(k, bytes, &meta, &ct()).await.unwrap();
    }

    let removed = tier.purge_by_source(v1.source_hash(), &ct()).await.unwrap();
    assert_eq!(removed, 3);
    for k in [&v1, &v2, &v3] {
        assert!(tier.fetch(k, &ct()).await.unwrap().is_none());
    }
    assert!(tier.fetch(&other, &ct()).await.unwrap().is_some());
}

#[tokio::test]
async fn missing_file_is_treated_as_a_miss_and_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let tier = DiskTier::open(config(dir.path())).await.unwrap();

    let k = key("/vanish.jpg");
    let (bytes, meta) = payload(&k, b"gone soon");
    tier.store(&k, bytes, &meta, &ct()).await.unwrap();

    std::fs::remove_file(dir.path().join(k.storage_path())).unwrap();

    assert!(tier.fetch(&k, &ct()).await.unwrap().is_none());
    assert_eq!(tier.entry_count(), 0);
}

#[tokio::test]
async fn overwrite_updates_byte_accounting() {
    let dir = tempfile::tempdir().unwrap();
    let tier = DiskTier::open(config(dir.path())).await.unwrap();

    let k = key("/overwrite.jpg");
    let (bytes, meta) = payload(&k, &[0u8; 1000]);
    tier.store(&k, bytes, &meta, &ct()).await.unwrap();
    assert_eq!(tier.tracked_bytes(), 1000);

    let (bytes, meta) = payload(&k, &[0u8; 400]);
    tier.store(&k, bytes, &meta, &ct()).await.unwrap();
    assert_eq!(tier.tracked_bytes(), 400);
    assert_eq!(tier.entry_count(), 1);
}

#[tokio::test]
async fn cleanup_evicts_down_to_the_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let tier = DiskTier::open(DiskTierConfig {
        root: dir.path().to_path_buf(),
        max_bytes: 10 * 1024,
        cleanup_watermark: 0.5,
        // Everything is immediately eligible.
        min_age: Duration::ZERO,
        retry_interval: Duration::from_secs(300),
    })
    .await
    .unwrap();

    for i in 0..20 {
        let k = key(&format!("/evict-{i}.jpg"));
        let (bytes, meta) = payload(&k, &[0u8; 1024]);
        tier.store(&k, bytes, &meta, &ct()).await.unwrap();
    }

    // The store path runs cleanup once the cap is crossed.
    assert!(
        tier.tracked_bytes() <= 10 * 1024,
        "tracked {} bytes",
        tier.tracked_bytes()
    );
    assert!(tier.entry_count() < 20);
}

#[tokio::test]
async fn replayed_log_compacts_when_mostly_dead() {
    let dir = tempfile::tempdir().unwrap();
    let k = key("/churn.jpg");

    {
        let tier = DiskTier::open(config(dir.path())).await.unwrap();
        // Create/delete churn: many records, one live entry.
        for round in 0..30 {
            let (bytes, meta) = payload(&k, format!("round-{round}").as_bytes());
            tier.store(&k, bytes, &meta, &ct()).await.unwrap();
            if round < 29 {
                tier.invalidate(&k, &ct()).await.unwrap();
            }
        }
        tier.stop().await;
    }
    let log_size_before = std::fs::metadata(dir.path().join("meta.log")).unwrap().len();

    {
        let tier = DiskTier::open(config(dir.path())).await.unwrap();
        assert_eq!(tier.entry_count(), 1);
        let fetched = tier.fetch(&k, &ct()).await.unwrap().unwrap();
        assert_eq!(&fetched.bytes[..], b"round-29");
        tier.stop().await;
    }
    let log_size_after = std::fs::metadata(dir.path().join("meta.log")).unwrap().len();
    assert!(
        log_size_after < log_size_before,
        "log should have been compacted ({log_size_before} -> {log_size_after})"
    );
}
