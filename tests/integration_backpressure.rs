//! Integration tests for upload-queue backpressure
//!
//! The queue must bound its bytes, dedup per fingerprint, serve in-flight
//! payloads as queue hits, and degrade (synchronous store or drop) when
//! full - never block the producer or lose accounting.

mod common;

use cascade_cache::{
    CacheCascadeBuilder, CacheEvent, CacheStatus, CascadeConfig, RemoteTier, RemoteTierConfig,
};
use common::*;
use std::sync::Arc;

const TEN_KIB: usize = 10 * 1024;
const ONE_MIB: u64 = 1024 * 1024;

fn slow_remote(store: &Arc<MemoryObjectStore>, delay_ms: u32) -> Arc<RemoteTier> {
    store.set_put_delay_ms(delay_ms);
    Arc::new(RemoteTier::new(
        Arc::clone(store) as Arc<dyn cascade_cache::ObjectStore>,
        RemoteTierConfig::default(),
    ))
}

/// Scenario: cap 1 MiB, many 10 KiB artifacts with a slow store. Some
/// enqueue, some hit the cap; the byte total never exceeds it; drain
/// completes cleanly.
#[tokio::test]
async fn queue_cap_bounds_bytes_and_drain_completes() {
    let store = MemoryObjectStore::new();
    let recorder = EventRecorder::new();
    let cascade = CacheCascadeBuilder::new()
        .with_provider(slow_remote(&store, 50))
        .with_config(CascadeConfig {
            max_upload_queue_bytes: ONE_MIB,
            store_synchronously_when_queue_full: false,
            ..CascadeConfig::default()
        })
        .with_event_callback(recorder.callback())
        .build()
        .unwrap();

    for i in 0..300 {
        let k = key(&format!("/bulk-{i}.jpg"));
        let data = vec![0u8; TEN_KIB];
        cascade
            .get_or_create(
                k,
                move |_ct| async move {
                    let (bytes, meta) = payload(&k, &data);
                    Ok((bytes, meta))
                },
                &ct(),
            )
            .await
            .unwrap();
        assert!(
            cascade.upload_queue_bytes() <= ONE_MIB,
            "queued bytes exceeded the cap"
        );
    }

    let queued = recorder.count_matching(|e| matches!(e, CacheEvent::StoreQueued { .. }));
    let full = recorder.count_matching(|e| matches!(e, CacheEvent::UploadQueueFull { .. }));
    let dropped = recorder.count_matching(|e| matches!(e, CacheEvent::StoreDropped { .. }));
    assert!(queued > 0, "some stores should have been admitted");
    assert!(full > 0, "the cap should have been hit");
    assert_eq!(full, dropped, "every refused store is dropped in this mode");

    cascade.drain(&ct()).await.unwrap();
    assert_eq!(cascade.upload_queue_tasks(), 0);
    assert_eq!(cascade.upload_queue_bytes(), 0);
}

/// With the synchronous fallback enabled, a full queue degrades to inline
/// stores instead of dropping; nothing is lost.
#[tokio::test]
async fn queue_full_falls_back_to_synchronous_store() {
    let store = MemoryObjectStore::new();
    let recorder = EventRecorder::new();
    let cascade = CacheCascadeBuilder::new()
        .with_provider(slow_remote(&store, 20))
        .with_config(CascadeConfig {
            // Fits roughly four 10 KiB tasks.
            max_upload_queue_bytes: 4 * 11 * 1024,
            store_synchronously_when_queue_full: true,
            ..CascadeConfig::default()
        })
        .with_event_callback(recorder.callback())
        .build()
        .unwrap();

    let total = 20;
    for i in 0..total {
        let k = key(&format!("/sync-{i}.jpg"));
        let data = vec![1u8; TEN_KIB];
        cascade
            .get_or_create(
                k,
                move |_ct| async move {
                    let (bytes, meta) = payload(&k, &data);
                    Ok((bytes, meta))
                },
                &ct(),
            )
            .await
            .unwrap();
    }
    cascade.drain(&ct()).await.unwrap();

    let full = recorder.count_matching(|e| matches!(e, CacheEvent::UploadQueueFull { .. }));
    assert!(full > 0, "the cap should have been hit");
    assert_eq!(
        recorder.count_matching(|e| matches!(e, CacheEvent::StoreDropped { .. })),
        0
    );
    assert_eq!(store.object_count(), total, "every artifact must be stored");
}

/// A request arriving while its artifact is still uploading is served from
/// the in-flight task.
#[tokio::test]
async fn in_flight_upload_serves_queue_hit() {
    let store = MemoryObjectStore::new();
    let cascade = CacheCascadeBuilder::new()
        .with_provider(slow_remote(&store, 150))
        .build()
        .unwrap();

    let k = key("/inflight.jpg");
    let created = cascade
        .get_or_create(k, |_ct| async move { Ok(payload(&k, b"uploading")) }, &ct())
        .await
        .unwrap();
    assert_eq!(created.status, CacheStatus::Created);

    // The PUT is still sleeping; the remote tier misses but the queue has
    // the payload.
    let hit = cascade
        .get_or_create(k, must_not_run, &ct())
        .await
        .unwrap();
    assert_eq!(hit.status, CacheStatus::QueueHit);
    assert_eq!(&hit.bytes[..], b"uploading");

    cascade.drain(&ct()).await.unwrap();
    assert_eq!(store.object_count(), 1);

    // Upload finished: now the tier itself serves.
    let cloud = cascade
        .get_or_create(k, must_not_run, &ct())
        .await
        .unwrap();
    assert_eq!(cloud.status, CacheStatus::CloudHit);
}

/// Identical fingerprints dedup at the queue: a re-created artifact does
/// not enqueue a second task while one is in flight.
#[tokio::test]
async fn queue_dedups_identical_fingerprints() {
    let store = MemoryObjectStore::new();
    let cascade = CacheCascadeBuilder::new()
        .with_provider(slow_remote(&store, 100))
        .with_config(CascadeConfig {
            enable_request_coalescing: false,
            ..CascadeConfig::default()
        })
        .build()
        .unwrap();

    let k = key("/dedup.jpg");
    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..4 {
        let cascade = Arc::clone(&cascade);
        tasks.spawn(async move {
            cascade
                .get_or_create(k, |_ct| async move { Ok(payload(&k, b"same")) }, &ct())
                .await
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.expect("task panicked").expect("call failed");
    }

    assert!(cascade.upload_queue_tasks() <= 1, "dedup must hold per key");
    cascade.drain(&ct()).await.unwrap();
}
