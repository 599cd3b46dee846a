//! Lock-free hit/miss counters for the response cache.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running counters, shared by every clone of a cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
}

impl CacheStats {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Entries written.
    pub stores: u64,
    /// Misses whose response was not a `200` and so was not written.
    pub skipped: u64,
    /// Store reads or writes that failed.
    pub errors: u64,
}

impl CacheStatsSnapshot {
    /// Fraction of lookups served from cache, `0.0` before any lookup.
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_before_any_lookup() {
        assert_eq!(CacheStats::default().snapshot().hit_ratio(), 0.0);
    }

    #[test]
    fn ratio_counts_hits_over_lookups() {
        let stats = CacheStats::default();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_error();
        let snap = stats.snapshot();
        assert_eq!(snap.hit_ratio(), 0.75);
        assert_eq!(snap.errors, 1);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = CacheStats::default();
        stats.record_store();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["stores"], 1);
        assert_eq!(json["hits"], 0);
    }
}
