//! Process-wide removal counters.
//!
//! Counts are monotonic and may lag the removals they count under contention.
//! Each increment is mirrored to the `metrics` facade.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;

use super::value::RemovalReason;

pub const METRIC_REMOVED: &str = "farmcache_removed_total";
pub const METRIC_EXPIRED: &str = "farmcache_expired_total";
pub const METRIC_DEPENDENCY_CHANGED: &str = "farmcache_dependency_changed_total";
pub const METRIC_UNDERUSED: &str = "farmcache_underused_total";

#[derive(Debug, Default)]
pub struct CacheStatistics {
    removed: AtomicU64,
    expired: AtomicU64,
    dependency_changed: AtomicU64,
    underused: AtomicU64,
}

/// Point-in-time copy of [`CacheStatistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub removed: u64,
    pub expired: u64,
    pub dependency_changed: u64,
    pub underused: u64,
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, reason: RemovalReason) {
        let (slot, metric) = match reason {
            RemovalReason::Removed => (&self.removed, METRIC_REMOVED),
            RemovalReason::Expired => (&self.expired, METRIC_EXPIRED),
            RemovalReason::DependencyChanged => {
                (&self.dependency_changed, METRIC_DEPENDENCY_CHANGED)
            }
            RemovalReason::Underused => (&self.underused, METRIC_UNDERUSED),
        };
        slot.fetch_add(1, Ordering::Relaxed);
        counter!(metric).increment(1);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            removed: self.removed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            dependency_changed: self.dependency_changed.load(Ordering::Relaxed),
            underused: self.underused.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_increments_matching_counter() {
        let stats = CacheStatistics::new();
        stats.record(RemovalReason::Removed);
        stats.record(RemovalReason::DependencyChanged);
        stats.record(RemovalReason::DependencyChanged);
        stats.record(RemovalReason::Underused);

        assert_eq!(
            stats.snapshot(),
            StatisticsSnapshot {
                removed: 1,
                expired: 0,
                dependency_changed: 2,
                underused: 1,
            }
        );
    }
}
