//! Counters for the cache and the deduplicator.
//!
//! Both structures keep lock-free atomic counters internally and hand out
//! plain snapshot structs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of stale-while-revalidate cache activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Fresh hits.
    pub hits: u64,
    /// Hits that returned a stale value.
    pub stale_hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries dropped to stay within `max_entries`.
    pub evictions: u64,
    /// Entries removed by `sweep_expired`.
    pub expired_swept: u64,
    /// Revalidation tickets handed out.
    pub revalidations_started: u64,
    /// Revalidation requests refused because one was already outstanding.
    pub revalidations_skipped: u64,
    /// Revalidations that ended without a fresh value.
    pub revalidations_failed: u64,
    /// Entries currently held.
    pub entry_count: u64,
}

impl CacheStats {
    /// Hit rate (0.0 to 1.0), counting stale hits as hits.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits + self.stale_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CacheMetrics {
    pub hits: AtomicU64,
    pub stale_hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expired_swept: AtomicU64,
    pub revalidations_started: AtomicU64,
    pub revalidations_skipped: AtomicU64,
    pub revalidations_failed: AtomicU64,
}

impl CacheMetrics {
    pub fn snapshot(&self, entry_count: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_swept: self.expired_swept.load(Ordering::Relaxed),
            revalidations_started: self.revalidations_started.load(Ordering::Relaxed),
            revalidations_skipped: self.revalidations_skipped.load(Ordering::Relaxed),
            revalidations_failed: self.revalidations_failed.load(Ordering::Relaxed),
            entry_count: entry_count as u64,
        }
    }
}

/// Snapshot of request deduplicator activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Calls that started a new upstream request.
    pub leaders: u64,
    /// Calls that joined a request already in flight.
    pub joined: u64,
    /// Calls that ran unregistered because `max_pending` was reached.
    pub bypassed: u64,
    /// Registrations forgotten after `pending_ttl`.
    pub expired: u64,
    /// Registrations currently in flight.
    pub pending: u64,
}

impl DedupStats {
    /// Share of calls served by an existing request (0.0 to 1.0).
    pub fn join_rate(&self) -> f64 {
        let total = self.leaders + self.joined + self.bypassed;
        if total == 0 {
            0.0
        } else {
            self.joined as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct DedupMetrics {
    pub leaders: AtomicU64,
    pub joined: AtomicU64,
    pub bypassed: AtomicU64,
    pub expired: AtomicU64,
}

impl DedupMetrics {
    pub fn snapshot(&self, pending: usize) -> DedupStats {
        DedupStats {
            leaders: self.leaders.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            pending: pending as u64,
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 60,
            stale_hits: 20,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_dedup_stats_join_rate() {
        let stats = DedupStats {
            leaders: 1,
            joined: 4,
            ..Default::default()
        };
        assert!((stats.join_rate() - 0.8).abs() < 0.001);
        assert_eq!(DedupStats::default().join_rate(), 0.0);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = CacheMetrics::default();
        bump(&metrics.hits);
        bump(&metrics.misses);
        bump(&metrics.misses);
        let snap = metrics.snapshot(7);
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.misses, 2);
        assert_eq!(snap.entry_count, 7);
    }
}
