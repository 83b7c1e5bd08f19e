//! Metrics registry
//!
//! - Counters only, monotonic
//! - Reset only on process start
//! - Thread-safe but lock-minimal

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters shared by every engine component
///
/// All counters use Relaxed ordering; metrics tolerate eventual consistency.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    objects_created: AtomicU64,
    objects_replaced: AtomicU64,
    objects_removed: AtomicU64,
    rollbacks: AtomicU64,
    rollback_failures: AtomicU64,
    lock_conflicts: AtomicU64,
    changes_observed: AtomicU64,
    matches: AtomicU64,
    evictions: AtomicU64,
    deliveries: AtomicU64,
    dropped_deliveries: AtomicU64,
    backfill_pages: AtomicU64,
    feed_interruptions: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    // Mutation metrics

    pub fn increment_created(&self) {
        self.objects_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_replaced(&self) {
        self.objects_replaced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_removed(&self) {
        self.objects_removed.fetch_add(1, Ordering::Relaxed);
    }

    /// A failed replace was compensated
    pub fn increment_rollbacks(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// A compensating action itself failed
    pub fn increment_rollback_failures(&self) {
        self.rollback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_lock_conflicts(&self) {
        self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    // Broker metrics

    pub fn increment_changes_observed(&self) {
        self.changes_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_matches(&self, count: u64) {
        self.matches.fetch_add(count, Ordering::Relaxed);
    }

    /// A subscription was force-unsubscribed after failing to evaluate
    pub fn increment_evictions(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_feed_interruptions(&self) {
        self.feed_interruptions.fetch_add(1, Ordering::Relaxed);
    }

    // Streamer metrics

    pub fn increment_deliveries(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dropped_deliveries(&self, count: u64) {
        self.dropped_deliveries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_backfill_pages(&self) {
        self.backfill_pages.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            objects_created: self.objects_created.load(Ordering::Relaxed),
            objects_replaced: self.objects_replaced.load(Ordering::Relaxed),
            objects_removed: self.objects_removed.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            rollback_failures: self.rollback_failures.load(Ordering::Relaxed),
            lock_conflicts: self.lock_conflicts.load(Ordering::Relaxed),
            changes_observed: self.changes_observed.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            dropped_deliveries: self.dropped_deliveries.load(Ordering::Relaxed),
            backfill_pages: self.backfill_pages.load(Ordering::Relaxed),
            feed_interruptions: self.feed_interruptions.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub objects_created: u64,
    pub objects_replaced: u64,
    pub objects_removed: u64,
    pub rollbacks: u64,
    pub rollback_failures: u64,
    pub lock_conflicts: u64,
    pub changes_observed: u64,
    pub matches: u64,
    pub evictions: u64,
    pub deliveries: u64,
    pub dropped_deliveries: u64,
    pub backfill_pages: u64,
    pub feed_interruptions: u64,
}
