//! Provider health tracking
//!
//! Counts consecutive operation failures per tier and quarantines a tier
//! that crosses the threshold: the cascade skips it for a back-off window
//! (doubling up to a cap) and the other tiers keep serving. Not-found is a
//! miss, never a failure.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

struct QuarantineState {
    until: Option<Instant>,
    backoff: Duration,
}

struct ProviderRecord {
    name: String,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
    quarantines: AtomicU64,
    state: Mutex<QuarantineState>,
}

/// Per-provider health snapshot for the diagnostics surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthSnapshot {
    pub name: String,
    pub available: bool,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub quarantines: u64,
    /// Remaining quarantine, if any.
    pub quarantined_for_ms: Option<u64>,
}

/// Failure accounting for every registered provider, indexed in
/// registration order.
pub struct HealthTracker {
    providers: Vec<ProviderRecord>,
    failure_threshold: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl HealthTracker {
    #[must_use]
    pub fn new(
        provider_names: Vec<String>,
        failure_threshold: u32,
        base_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        let providers = provider_names
            .into_iter()
            .map(|name| ProviderRecord {
                name,
                consecutive_failures: AtomicU32::new(0),
                total_failures: AtomicU64::new(0),
                quarantines: AtomicU64::new(0),
                state: Mutex::new(QuarantineState {
                    until: None,
                    backoff: base_backoff,
                }),
            })
            .collect();
        Self {
            providers,
            failure_threshold: failure_threshold.max(1),
            base_backoff,
            max_backoff,
        }
    }

    /// Whether the provider may be probed or stored into right now. An
    /// expired quarantine is cleared here, re-admitting the provider on
    /// probation.
    #[must_use]
    pub fn is_available(&self, index: usize) -> bool {
        let Some(record) = self.providers.get(index) else {
            return false;
        };
        let mut state = record.state.lock();
        match state.until {
            None => true,
            Some(until) if Instant::now() >= until => {
                state.until = None;
                info!(provider = %record.name, "quarantine expired, provider on probation");
                true
            }
            Some(_) => false,
        }
    }

    /// A successful operation resets the failure streak and the back-off.
    pub fn report_ok(&self, index: usize) {
        if let Some(record) = self.providers.get(index) {
            record.consecutive_failures.store(0, Ordering::Relaxed);
            let mut state = record.state.lock();
            state.backoff = self.base_backoff;
        }
    }

    /// Record a failure; returns `true` when this failure newly quarantined
    /// the provider.
    pub fn report_failure(&self, index: usize) -> bool {
        let Some(record) = self.providers.get(index) else {
            return false;
        };
        record.total_failures.fetch_add(1, Ordering::Relaxed);
        let streak = record.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if streak < self.failure_threshold {
            return false;
        }

        let mut state = record.state.lock();
        if state.until.is_some() {
            return false;
        }
        let backoff = state.backoff;
        state.until = Some(Instant::now() + backoff);
        state.backoff = (backoff * 2).min(self.max_backoff);
        record.quarantines.fetch_add(1, Ordering::Relaxed);
        record.consecutive_failures.store(0, Ordering::Relaxed);
        warn!(
            provider = %record.name,
            backoff_ms = backoff.as_millis() as u64,
            "provider quarantined after repeated failures"
        );
        true
    }

    /// Snapshot all providers for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProviderHealthSnapshot> {
        let now = Instant::now();
        self.providers
            .iter()
            .map(|record| {
                let state = record.state.lock();
                let remaining = state
                    .until
                    .and_then(|until| until.checked_duration_since(now))
                    .map(|d| d.as_millis() as u64);
                ProviderHealthSnapshot {
                    name: record.name.clone(),
                    available: remaining.is_none(),
                    consecutive_failures: record.consecutive_failures.load(Ordering::Relaxed),
                    total_failures: record.total_failures.load(Ordering::Relaxed),
                    quarantines: record.quarantines.load(Ordering::Relaxed),
                    quarantined_for_ms: remaining,
                }
            })
            .collect()
    }
}
