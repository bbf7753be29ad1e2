//! Rotating bloom filter
//!
//! N parallel slots of identical, pre-allocated bit size. Inserts go to the
//! newest slot only; lookups OR across all slots; rotation clears the oldest
//! slot and makes it the newest. A key inserted within the last
//! `slots x rotation_interval` is never reported absent.
//!
//! The reader path is lock-free (atomic loads per bit word, atomic-or on
//! insert); only rotation takes a short exclusive lock.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::key::CacheKey;

/// Sizing and rotation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomConfig {
    /// Expected distinct keys per slot; sizing input, not a hard limit.
    pub estimated_items: u64,
    /// Target false-positive rate at the estimated item count.
    pub false_positive_rate: f64,
    /// Number of rotating slots.
    pub slots: usize,
    /// Wall-clock rotation trigger; the insert-count trigger fires earlier
    /// if the slot fills up first.
    #[serde(with = "crate::cascade::serde_duration")]
    pub rotation_interval: Duration,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            estimated_items: 100_000,
            false_positive_rate: 0.01,
            slots: 3,
            rotation_interval: Duration::from_secs(600),
        }
    }
}

/// Snapshot of the filter's rotation state for the diagnostics surface.
#[derive(Debug, Clone, Serialize)]
pub struct BloomState {
    pub slots: usize,
    pub bits_per_slot: u64,
    pub hash_count: u32,
    pub inserts_in_newest_slot: u64,
    pub rotations: u64,
}

struct RotationClock {
    rotated_at: Instant,
}

/// N-slot rotating bloom filter keyed on the variant hash.
///
/// The variant hash is already a cryptographic digest, so bit positions are
/// derived from it directly by double hashing; no further hashing pass runs
/// on the hot path.
pub struct RotatingBloomFilter {
    slots: Vec<Box<[AtomicU64]>>,
    bits_per_slot: u64,
    hash_count: u32,
    estimated_items: u64,
    rotation_interval: Duration,
    newest: AtomicUsize,
    inserts_in_newest: AtomicU64,
    rotations: AtomicU64,
    rotation: Mutex<RotationClock>,
}

impl RotatingBloomFilter {
    /// Allocate the whole filter up front from the config. Total memory is
    /// exactly `slots x bits_per_slot / 8` and never grows.
    #[must_use]
    pub fn new(config: &BloomConfig) -> Self {
        let slots = config.slots.max(1);
        let (bits_per_slot, hash_count) =
            Self::size_for(config.estimated_items.max(1), config.false_positive_rate);
        let words = usize::try_from(bits_per_slot.div_ceil(64)).unwrap_or(1).max(1);

        let slot_vec = (0..slots)
            .map(|_| {
                (0..words)
                    .map(|_| AtomicU64::new(0))
                    .collect::<Vec<_>>()
                    .into_boxed_slice()
            })
            .collect();

        debug!(
            slots,
            bits_per_slot, hash_count, "allocated rotating bloom filter"
        );

        Self {
            slots: slot_vec,
            bits_per_slot,
            hash_count,
            estimated_items: config.estimated_items.max(1),
            rotation_interval: config.rotation_interval,
            newest: AtomicUsize::new(0),
            inserts_in_newest: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            rotation: Mutex::new(RotationClock {
                rotated_at: Instant::now(),
            }),
        }
    }

    /// Standard bloom sizing: `m = -n ln p / (ln 2)^2`, `k = (m/n) ln 2`,
    /// k clamped to 1..=8.
    fn size_for(items: u64, fpr: f64) -> (u64, u32) {
        let fpr = fpr.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        #[allow(clippy::cast_precision_loss)]
        let n = items as f64;
        let m = (-n * fpr.ln() / (ln2 * ln2)).ceil();
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let bits = (m as u64).max(64);
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let k = ((m / n) * ln2).round() as u32;
        (bits, k.clamp(1, 8))
    }

    fn bit_positions(&self, key: &CacheKey) -> impl Iterator<Item = u64> + '_ {
        let digest = key.variant_hash();
        let mut g1 = [0u8; 8];
        let mut g2 = [0u8; 8];
        g1.copy_from_slice(&digest[0..8]);
        g2.copy_from_slice(&digest[8..16]);
        let g1 = u64::from_le_bytes(g1);
        // Force g2 odd so successive probes never degenerate to one bit.
        let g2 = u64::from_le_bytes(g2) | 1;
        (0..u64::from(self.hash_count))
            .map(move |i| g1.wrapping_add(i.wrapping_mul(g2)) % self.bits_per_slot)
    }

    /// Insert into the newest slot.
    pub fn insert(&self, key: &CacheKey) {
        self.maybe_rotate();
        let newest = self.newest.load(Ordering::Acquire);
        if let Some(slot) = self.slots.get(newest) {
            for bit in self.bit_positions(key) {
                let word = usize::try_from(bit / 64).unwrap_or(0);
                let mask = 1u64 << (bit % 64);
                if let Some(w) = slot.get(word) {
                    w.fetch_or(mask, Ordering::Relaxed);
                }
            }
        }
        self.inserts_in_newest.fetch_add(1, Ordering::Relaxed);
    }

    /// Membership test across every slot. Positive answers may be false at
    /// the configured rate; negative answers are authoritative within the
    /// retention window.
    #[must_use]
    pub fn probably_contains(&self, key: &CacheKey) -> bool {
        let bits: Vec<u64> = self.bit_positions(key).collect();
        self.slots.iter().any(|slot| {
            bits.iter().all(|&bit| {
                let word = usize::try_from(bit / 64).unwrap_or(0);
                let mask = 1u64 << (bit % 64);
                slot.get(word)
                    .is_some_and(|w| w.load(Ordering::Relaxed) & mask != 0)
            })
        })
    }

    /// Coarse rotation trigger, checked on insert.
    fn maybe_rotate(&self) {
        let by_count = self.inserts_in_newest.load(Ordering::Relaxed) >= self.estimated_items;
        if !by_count {
            // Avoid blocking on the lock just to read the clock.
            let Some(clock) = self.rotation.try_lock() else {
                return;
            };
            if clock.rotated_at.elapsed() < self.rotation_interval {
                return;
            }
            drop(clock);
        }
        self.rotate();
    }

    /// Clear the oldest slot and make it the newest. Exclusive, short.
    fn rotate(&self) {
        let mut clock = self.rotation.lock();
        // Another inserter may have rotated while we waited for the lock.
        let stale_by_count = self.inserts_in_newest.load(Ordering::Relaxed) >= self.estimated_items;
        let stale_by_time = clock.rotated_at.elapsed() >= self.rotation_interval;
        if !stale_by_count && !stale_by_time {
            return;
        }

        let next = (self.newest.load(Ordering::Acquire) + 1) % self.slots.len();
        if let Some(slot) = self.slots.get(next) {
            for word in slot.iter() {
                word.store(0, Ordering::Relaxed);
            }
        }
        self.inserts_in_newest.store(0, Ordering::Relaxed);
        self.newest.store(next, Ordering::Release);
        self.rotations.fetch_add(1, Ordering::Relaxed);
        clock.rotated_at = Instant::now();
        debug!(slot = next, "rotated bloom filter");
    }

    /// Diagnostics snapshot.
    #[must_use]
    pub fn state(&self) -> BloomState {
        BloomState {
            slots: self.slots.len(),
            bits_per_slot: self.bits_per_slot,
            hash_count: self.hash_count,
            inserts_in_newest_slot: self.inserts_in_newest.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
        }
    }
}
