//! Production instrumentation for the consensus engine.
//!
//! - **Throughput counters**: messages, decisions, applied batches
//! - **Protocol counters**: retries, coin flips, buffered votes
//! - **Recovery counters**: evictions, catch-up requests, snapshots
//!
//! Everything is a relaxed atomic so recording never blocks the engine loop.
//! Counters are process-wide; several engines in one process (tests, the
//! simulator) add to the same totals. Per-engine state such as the applied
//! sequence, epoch or quorum size is read from
//! [`ConsensusEngine::health`](crate::ConsensusEngine::health) instead.
//!
//! ```ignore
//! use rabia_engine::instrumentation::METRICS;
//!
//! METRICS.increment_decisions(StateValue::V1);
//! let snapshot = METRICS.snapshot();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use rabia_types::StateValue;

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

#[derive(Debug)]
pub struct Metrics {
    // === Throughput Counters ===
    messages_sent_total: AtomicU64,
    messages_received_total: AtomicU64,
    decisions_v1_total: AtomicU64,
    decisions_v0_total: AtomicU64,
    batches_applied_total: AtomicU64,
    batches_rejected_total: AtomicU64,
    batches_duplicate_total: AtomicU64,

    // === Protocol Counters ===
    retries_total: AtomicU64,
    coin_flips_total: AtomicU64,
    votes_buffered_total: AtomicU64,
    votes_stale_total: AtomicU64,

    // === Recovery Counters ===
    evictions_total: AtomicU64,
    catch_up_requests_total: AtomicU64,
    snapshots_sent_total: AtomicU64,
    snapshots_restored_total: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_sent_total: u64,
    pub messages_received_total: u64,
    pub decisions_v1_total: u64,
    pub decisions_v0_total: u64,
    pub batches_applied_total: u64,
    pub batches_rejected_total: u64,
    pub batches_duplicate_total: u64,
    pub retries_total: u64,
    pub coin_flips_total: u64,
    pub votes_buffered_total: u64,
    pub votes_stale_total: u64,
    pub evictions_total: u64,
    pub catch_up_requests_total: u64,
    pub snapshots_sent_total: u64,
    pub snapshots_restored_total: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            messages_sent_total: AtomicU64::new(0),
            messages_received_total: AtomicU64::new(0),
            decisions_v1_total: AtomicU64::new(0),
            decisions_v0_total: AtomicU64::new(0),
            batches_applied_total: AtomicU64::new(0),
            batches_rejected_total: AtomicU64::new(0),
            batches_duplicate_total: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            coin_flips_total: AtomicU64::new(0),
            votes_buffered_total: AtomicU64::new(0),
            votes_stale_total: AtomicU64::new(0),
            evictions_total: AtomicU64::new(0),
            catch_up_requests_total: AtomicU64::new(0),
            snapshots_sent_total: AtomicU64::new(0),
            snapshots_restored_total: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------------

    pub fn add_messages_sent(&self, count: u64) {
        self.messages_sent_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_messages_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_decisions(&self, value: StateValue) {
        match value {
            StateValue::V1 => self.decisions_v1_total.fetch_add(1, Ordering::Relaxed),
            _ => self.decisions_v0_total.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn increment_batches_applied(&self) {
        self.batches_applied_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_batches_rejected(&self) {
        self.batches_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_batches_duplicate(&self) {
        self.batches_duplicate_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retries(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_coin_flips(&self) {
        self.coin_flips_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_votes_buffered(&self) {
        self.votes_buffered_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_votes_stale(&self) {
        self.votes_stale_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_evictions(&self, count: u64) {
        self.evictions_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_catch_up_requests(&self) {
        self.catch_up_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_snapshots_sent(&self) {
        self.snapshots_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_snapshots_restored(&self) {
        self.snapshots_restored_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent_total: self.messages_sent_total.load(Ordering::Relaxed),
            messages_received_total: self.messages_received_total.load(Ordering::Relaxed),
            decisions_v1_total: self.decisions_v1_total.load(Ordering::Relaxed),
            decisions_v0_total: self.decisions_v0_total.load(Ordering::Relaxed),
            batches_applied_total: self.batches_applied_total.load(Ordering::Relaxed),
            batches_rejected_total: self.batches_rejected_total.load(Ordering::Relaxed),
            batches_duplicate_total: self.batches_duplicate_total.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            coin_flips_total: self.coin_flips_total.load(Ordering::Relaxed),
            votes_buffered_total: self.votes_buffered_total.load(Ordering::Relaxed),
            votes_stale_total: self.votes_stale_total.load(Ordering::Relaxed),
            evictions_total: self.evictions_total.load(Ordering::Relaxed),
            catch_up_requests_total: self.catch_up_requests_total.load(Ordering::Relaxed),
            snapshots_sent_total: self.snapshots_sent_total.load(Ordering::Relaxed),
            snapshots_restored_total: self.snapshots_restored_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
