//! Global atomic counters for reconciliation.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when the daemon drains its queue).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters: no allocations, no locking.
pub struct Metrics {
    rules_violated: AtomicU64,
    rules_satisfied: AtomicU64,
    jobs_dispatched: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_exhausted: AtomicU64,
    notifier_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            rules_violated: AtomicU64::new(0),
            rules_satisfied: AtomicU64::new(0),
            jobs_dispatched: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_exhausted: AtomicU64::new(0),
            notifier_failures: AtomicU64::new(0),
        }
    }

    pub fn add_rules_violated(&self, n: u64) {
        self.rules_violated.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "rules_violated", "counter incremented");
    }

    pub fn add_rules_satisfied(&self, n: u64) {
        self.rules_satisfied.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "rules_satisfied", "counter incremented");
    }

    pub fn inc_jobs_dispatched(&self) {
        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_dispatched", "counter incremented");
    }

    pub fn inc_jobs_retried(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_retried", "counter incremented");
    }

    pub fn inc_jobs_exhausted(&self) {
        self.jobs_exhausted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_exhausted", "counter incremented");
    }

    pub fn inc_notifier_failures(&self) {
        self.notifier_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "notifier_failures", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            rules_violated = self.rules_violated(),
            rules_satisfied = self.rules_satisfied(),
            jobs_dispatched = self.jobs_dispatched(),
            jobs_retried = self.jobs_retried(),
            jobs_exhausted = self.jobs_exhausted(),
            notifier_failures = self.notifier_failures(),
        );
    }

    pub fn rules_violated(&self) -> u64 {
        self.rules_violated.load(Ordering::Relaxed)
    }

    pub fn rules_satisfied(&self) -> u64 {
        self.rules_satisfied.load(Ordering::Relaxed)
    }

    pub fn jobs_dispatched(&self) -> u64 {
        self.jobs_dispatched.load(Ordering::Relaxed)
    }

    pub fn jobs_retried(&self) -> u64 {
        self.jobs_retried.load(Ordering::Relaxed)
    }

    pub fn jobs_exhausted(&self) -> u64 {
        self.jobs_exhausted.load(Ordering::Relaxed)
    }

    pub fn notifier_failures(&self) -> u64 {
        self.notifier_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.rules_violated.store(0, Ordering::Relaxed);
        self.rules_satisfied.store(0, Ordering::Relaxed);
        self.jobs_dispatched.store(0, Ordering::Relaxed);
        self.jobs_retried.store(0, Ordering::Relaxed);
        self.jobs_exhausted.store(0, Ordering::Relaxed);
        self.notifier_failures.store(0, Ordering::Relaxed);
    }
}
