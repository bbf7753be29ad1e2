//! Request coalescer
//!
//! Per-key single-permit semaphores over a dynamic key set, so N concurrent
//! misses on one fingerprint run the expensive computation exactly once.
//! Entries are created lazily and removed by the last waiter out; waiter
//! registration is RAII so an early return, timeout or panic never leaks an
//! entry.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::CacheError;
use crate::key::CacheKey;

struct CoalesceEntry {
    semaphore: Arc<Semaphore>,
    waiters: AtomicUsize,
}

impl CoalesceEntry {
    fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            waiters: AtomicUsize::new(0),
        }
    }
}

/// Map of in-flight computations keyed by fingerprint.
pub struct RequestCoalescer {
    entries: DashMap<CacheKey, Arc<CoalesceEntry>>,
}

impl RequestCoalescer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Wait for the per-key permit, bounded by `timeout` and the caller's
    /// token. Holding the returned guard means no other caller is computing
    /// this key.
    pub async fn acquire(
        &self,
        key: CacheKey,
        timeout: Duration,
        ct: &CancellationToken,
    ) -> Result<CoalesceGuard<'_>, CacheError> {
        // Register before waiting: the entry must not disappear while we
        // queue on its semaphore. The increment happens under the map shard
        // lock, so it cannot interleave with the last-out removal below.
        let entry = {
            let slot = self
                .entries
                .entry(key)
                .or_insert_with(|| Arc::new(CoalesceEntry::new()));
            slot.value().waiters.fetch_add(1, Ordering::SeqCst);
            Arc::clone(slot.value())
        };
        let registration = WaiterRegistration {
            coalescer: self,
            key,
            entry: Arc::clone(&entry),
        };

        let semaphore = Arc::clone(&entry.semaphore);
        let permit = tokio::select! {
            () = ct.cancelled() => return Err(CacheError::Cancelled),
            () = tokio::time::sleep(timeout) => return Err(CacheError::CoalescingTimeout),
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| CacheError::ShuttingDown)?
            }
        };

        Ok(CoalesceGuard {
            _permit: permit,
            _registration: registration,
        })
    }

    /// Number of keys with at least one registered waiter. Returns to zero
    /// when no computation is in flight.
    #[must_use]
    pub fn active_entries(&self) -> usize {
        self.entries.len()
    }
}

impl Default for RequestCoalescer {
    fn default() -> Self {
        Self::new()
    }
}

struct WaiterRegistration<'a> {
    coalescer: &'a RequestCoalescer,
    key: CacheKey,
    entry: Arc<CoalesceEntry>,
}

impl Drop for WaiterRegistration<'_> {
    fn drop(&mut self) {
        if self.entry.waiters.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last waiter out removes the entry. The identity check keeps a
            // stale registration from removing a freshly recreated entry,
            // and the count re-check runs under the shard lock so a new
            // waiter registering right now keeps the entry alive.
            self.coalescer.entries.remove_if(&self.key, |_, v| {
                Arc::ptr_eq(v, &self.entry) && v.waiters.load(Ordering::SeqCst) == 0
            });
        }
    }
}

/// Exclusive right to compute one key. Dropping releases the permit and
/// deregisters the waiter.
pub struct CoalesceGuard<'a> {
    _permit: OwnedSemaphorePermit,
    _registration: WaiterRegistration<'a>,
}
