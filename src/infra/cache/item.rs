use std::time::Duration;

use tokio::time::Instant;

/// One entry of the in-memory cache.
#[derive(Debug, Clone)]
pub struct CacheItem {
    pub value: String,
    pub created_at: Instant,
    /// `None` when the entry never expires
    pub expires_at: Option<Instant>,
    pub access_count: u64,
    pub last_accessed: Instant,
}

impl CacheItem {
    pub fn new(value: String, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
            access_count: 0,
            last_accessed: now,
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    pub fn touch(&mut self, now: Instant) {
        self.access_count += 1;
        self.last_accessed = now;
    }
}
