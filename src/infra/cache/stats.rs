use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters reported by a cache backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    /// Lookups served, hit or miss
    pub total_requests: u64,
    pub hit_rate: f64,
}

/// Lock-free recorder behind [`CacheStats`].
#[derive(Debug, Default)]
pub struct StatsRecorder {
    disabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

impl StatsRecorder {
    pub fn new(enabled: bool) -> Self {
        Self {
            disabled: !enabled,
            ..Self::default()
        }
    }

    pub fn record_hit(&self) {
        self.bump(&self.hits);
    }

    pub fn record_miss(&self) {
        self.bump(&self.misses);
    }

    pub fn record_set(&self) {
        self.bump(&self.sets);
    }

    pub fn record_delete(&self) {
        self.bump(&self.deletes);
    }

    pub fn record_error(&self) {
        self.bump(&self.errors);
    }

    /// Turn an already counted hit into an error.
    pub fn revoke_hit(&self) {
        if self.disabled {
            return;
        }
        let _ = self
            .hits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn bump(&self, counter: &AtomicU64) {
        if !self.disabled {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        CacheStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total_requests,
            hit_rate: if total_requests == 0 {
                0.0
            } else {
                hits as f64 / total_requests as f64
            },
        }
    }

    pub fn reset(&self) {
        for counter in [&self.hits, &self.misses, &self.sets, &self.deletes, &self.errors] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
