//! Operational counters
//!
//! Counters only, monotonic, reset on process start. Relaxed atomics: exact
//! cross-counter consistency is not required.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Registry of platform counters
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    tables_created: AtomicU64,
    schema_versions: AtomicU64,
    migrations_applied: AtomicU64,
    migrations_failed: AtomicU64,
    records_created: AtomicU64,
    records_updated: AtomicU64,
    records_deleted: AtomicU64,
    validation_rejections: AtomicU64,
    conflicts: AtomicU64,
    isolation_violations: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tables_created: u64,
    pub schema_versions: u64,
    pub migrations_applied: u64,
    pub migrations_failed: u64,
    pub records_created: u64,
    pub records_updated: u64,
    pub records_deleted: u64,
    pub validation_rejections: u64,
    pub conflicts: u64,
    pub isolation_violations: u64,
    pub timeouts: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_tables_created(&self) {
        bump(&self.tables_created);
    }

    pub fn increment_schema_versions(&self) {
        bump(&self.schema_versions);
    }

    pub fn increment_migrations_applied(&self) {
        bump(&self.migrations_applied);
    }

    pub fn increment_migrations_failed(&self) {
        bump(&self.migrations_failed);
    }

    pub fn increment_records_created(&self) {
        bump(&self.records_created);
    }

    pub fn increment_records_updated(&self) {
        bump(&self.records_updated);
    }

    pub fn increment_records_deleted(&self) {
        bump(&self.records_deleted);
    }

    pub fn increment_validation_rejections(&self) {
        bump(&self.validation_rejections);
    }

    pub fn increment_conflicts(&self) {
        bump(&self.conflicts);
    }

    pub fn increment_isolation_violations(&self) {
        bump(&self.isolation_violations);
    }

    pub fn increment_timeouts(&self) {
        bump(&self.timeouts);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            tables_created: load(&self.tables_created),
            schema_versions: load(&self.schema_versions),
            migrations_applied: load(&self.migrations_applied),
            migrations_failed: load(&self.migrations_failed),
            records_created: load(&self.records_created),
            records_updated: load(&self.records_updated),
            records_deleted: load(&self.records_deleted),
            validation_rejections: load(&self.validation_rejections),
            conflicts: load(&self.conflicts),
            isolation_violations: load(&self.isolation_violations),
            timeouts: load(&self.timeouts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        assert_eq!(MetricsRegistry::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_increments_show_in_snapshot() {
        let metrics = MetricsRegistry::new();
        metrics.increment_records_created();
        metrics.increment_records_created();
        metrics.increment_conflicts();
        let snap = metrics.snapshot();
        assert_eq!(snap.records_created, 2);
        assert_eq!(snap.conflicts, 1);
        assert_eq!(snap.records_deleted, 0);
    }
}
