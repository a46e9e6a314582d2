//! Metrics registry
//!
//! - Counters only
//! - Monotonic increase, reset only on process start
//! - Relaxed atomics, no locks

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters of a chaos cell
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    cards_created: AtomicU64,
    cards_removed: AtomicU64,
    replicas_created: AtomicU64,
    replicas_removed: AtomicU64,
    replicas_altered: AtomicU64,
    eras_commenced: AtomicU64,
    shortcut_rpc_failures: AtomicU64,
    rows_pulled: AtomicU64,
    rows_applied: AtomicU64,
    rows_trimmed: AtomicU64,
    trims_rejected: AtomicU64,
    writes: AtomicU64,
    writes_rejected: AtomicU64,
    snapshots_saved: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_cards_created(&self) {
        self.cards_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_cards_removed(&self) {
        self.cards_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_replicas_created(&self) {
        self.replicas_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_replicas_removed(&self) {
        self.replicas_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_replicas_altered(&self) {
        self.replicas_altered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_eras_commenced(&self) {
        self.eras_commenced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_shortcut_rpc_failures(&self) {
        self.shortcut_rpc_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rows_pulled(&self, rows: u64) {
        self.rows_pulled.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn add_rows_applied(&self, rows: u64) {
        self.rows_applied.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn add_rows_trimmed(&self, rows: u64) {
        self.rows_trimmed.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn increment_trims_rejected(&self) {
        self.trims_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_writes(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_writes_rejected(&self) {
        self.writes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_snapshots_saved(&self) {
        self.snapshots_saved.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cards_created: self.cards_created.load(Ordering::Relaxed),
            cards_removed: self.cards_removed.load(Ordering::Relaxed),
            replicas_created: self.replicas_created.load(Ordering::Relaxed),
            replicas_removed: self.replicas_removed.load(Ordering::Relaxed),
            replicas_altered: self.replicas_altered.load(Ordering::Relaxed),
            eras_commenced: self.eras_commenced.load(Ordering::Relaxed),
            shortcut_rpc_failures: self.shortcut_rpc_failures.load(Ordering::Relaxed),
            rows_pulled: self.rows_pulled.load(Ordering::Relaxed),
            rows_applied: self.rows_applied.load(Ordering::Relaxed),
            rows_trimmed: self.rows_trimmed.load(Ordering::Relaxed),
            trims_rejected: self.trims_rejected.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            writes_rejected: self.writes_rejected.load(Ordering::Relaxed),
            snapshots_saved: self.snapshots_saved.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cards_created: u64,
    pub cards_removed: u64,
    pub replicas_created: u64,
    pub replicas_removed: u64,
    pub replicas_altered: u64,
    pub eras_commenced: u64,
    pub shortcut_rpc_failures: u64,
    pub rows_pulled: u64,
    pub rows_applied: u64,
    pub rows_trimmed: u64,
    pub trims_rejected: u64,
    pub writes: u64,
    pub writes_rejected: u64,
    pub snapshots_saved: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_has_zero_values() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_increment_counters() {
        let registry = MetricsRegistry::new();

        registry.increment_cards_created();
        registry.increment_eras_commenced();
        registry.increment_eras_commenced();
        registry.add_rows_pulled(10);
        registry.add_rows_trimmed(4);
        registry.increment_trims_rejected();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.cards_created, 1);
        assert_eq!(snapshot.eras_commenced, 2);
        assert_eq!(snapshot.rows_pulled, 10);
        assert_eq!(snapshot.rows_trimmed, 4);
        assert_eq!(snapshot.trims_rejected, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let registry = MetricsRegistry::new();
        registry.increment_writes();

        let json = serde_json::to_string(&registry.snapshot()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["writes"], 1);
    }

    #[test]
    fn test_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let reg = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..100 {
                        reg.increment_writes();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.snapshot().writes, 1000);
    }
}
