//! In-process metrics: atomic counters/gauges with no HTTP
//! exposition of their own — an external endpoint would serialize
//! a [`Snapshot`] of these.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub struct Metrics {
    pub publishes_total: AtomicU64,
    pub applies_total: AtomicU64,
    pub decode_failures_total: AtomicU64,
    pub dead_letters_total: AtomicU64,
    pub snapshot_successes_total: AtomicU64,
    pub snapshot_failures_total: AtomicU64,
    pub lease_held: AtomicI64,
    shard_paused: Vec<AtomicI64>,
}

/// Shards beyond this index still replicate correctly; they simply aren't
/// individually represented in the `shard_paused` gauge vector.
const MAX_TRACKED_SHARDS: usize = 256;

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            publishes_total: AtomicU64::new(0),
            applies_total: AtomicU64::new(0),
            decode_failures_total: AtomicU64::new(0),
            dead_letters_total: AtomicU64::new(0),
            snapshot_successes_total: AtomicU64::new(0),
            snapshot_failures_total: AtomicU64::new(0),
            lease_held: AtomicI64::new(0),
            shard_paused: (0..MAX_TRACKED_SHARDS).map(|_| AtomicI64::new(0)).collect(),
        }
    }

    pub fn record_publish(&self) {
        self.publishes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_apply(&self) {
        self.applies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_letters_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_result(&self, ok: bool) {
        if ok {
            self.snapshot_successes_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.snapshot_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_lease_held(&self, held: bool) {
        self.lease_held.store(held as i64, Ordering::Relaxed);
    }

    pub fn set_shard_paused(&self, shard: u32, paused: bool) {
        if let Some(gauge) = self.shard_paused.get(shard as usize) {
            gauge.store(paused as i64, Ordering::Relaxed);
        }
    }

    pub fn shard_paused(&self, shard: u32) -> Option<bool> {
        self.shard_paused
            .get(shard as usize)
            .map(|g| g.load(Ordering::Relaxed) != 0)
    }

    /// Read-only snapshot a caller can serialize (e.g. for an external
    /// HTTP endpoint, out of this crate's scope).
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            publishes_total: self.publishes_total.load(Ordering::Relaxed),
            applies_total: self.applies_total.load(Ordering::Relaxed),
            decode_failures_total: self.decode_failures_total.load(Ordering::Relaxed),
            dead_letters_total: self.dead_letters_total.load(Ordering::Relaxed),
            snapshot_successes_total: self.snapshot_successes_total.load(Ordering::Relaxed),
            snapshot_failures_total: self.snapshot_failures_total.load(Ordering::Relaxed),
            lease_held: self.lease_held.load(Ordering::Relaxed) != 0,
            paused_shards: self
                .shard_paused
                .iter()
                .enumerate()
                .filter(|(_, g)| g.load(Ordering::Relaxed) != 0)
                .map(|(i, _)| i as u32)
                .collect(),
        }
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").field("snapshot", &self.snapshot()).finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub publishes_total: u64,
    pub applies_total: u64,
    pub decode_failures_total: u64,
    pub dead_letters_total: u64,
    pub snapshot_successes_total: u64,
    pub snapshot_failures_total: u64,
    pub lease_held: bool,
    pub paused_shards: Vec<u32>,
}
