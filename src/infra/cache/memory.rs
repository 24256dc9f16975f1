//! In-process cache with TTL, bounded LRU eviction and a background sweeper.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use glob::Pattern;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::backend::CacheBackend;
use super::item::CacheItem;
use super::stats::{CacheStats, StatsRecorder};

struct Entry {
    item: CacheItem,
    tick: u64,
}

/// Items plus an access-ordered index: the smallest tick is the least
/// recently used key.
#[derive(Default)]
struct Store {
    items: HashMap<String, Entry>,
    lru: BTreeMap<u64, String>,
    tick: u64,
}

impl Store {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.items.remove(key)?;
        self.lru.remove(&entry.tick);
        Some(entry)
    }

    fn promote(&mut self, key: &str) {
        let tick = self.next_tick();
        if let Some(entry) = self.items.get_mut(key) {
            self.lru.remove(&entry.tick);
            entry.tick = tick;
            self.lru.insert(tick, key.to_string());
        }
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (_, key) = self.lru.pop_first()?;
        self.items.remove(&key);
        Some(key)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .items
            .iter()
            .filter(|(_, entry)| entry.item.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

struct MemoryInner {
    store: Mutex<Store>,
    max_size: usize,
    stats: StatsRecorder,
}

impl MemoryInner {
    fn sweep(&self) -> usize {
        self.store.lock().purge_expired(Instant::now())
    }
}

/// Bounded in-memory cache backend.
///
/// Every operation takes one short lock over the item map and the LRU index
/// and never awaits while holding it.
pub struct MemoryCacheBackend {
    inner: Arc<MemoryInner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryCacheBackend {
    pub fn new(max_size: usize, enable_stats: bool) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                store: Mutex::new(Store::default()),
                max_size: max_size.max(1),
                stats: StatsRecorder::new(enable_stats),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Start purging expired entries every `interval`. Needs a Tokio runtime.
    pub fn start_sweeper(&self, interval: Duration) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }

        let weak: Weak<MemoryInner> = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let purged = inner.sweep();
                if purged > 0 {
                    debug!(purged, "Removed expired cache entries");
                }
            }
        }));
    }

    /// Remove expired entries now. Returns how many were purged.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    pub fn len(&self) -> usize {
        self.inner.store.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for MemoryCacheBackend {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut store = self.inner.store.lock();

        let expired = match store.items.get_mut(key) {
            None => {
                self.inner.stats.record_miss();
                return None;
            }
            Some(entry) => entry.item.is_expired_at(now),
        };
        if expired {
            store.remove(key);
            self.inner.stats.record_miss();
            return None;
        }

        store.promote(key);
        let entry = store.items.get_mut(key)?;
        entry.item.touch(now);
        self.inner.stats.record_hit();
        Some(entry.item.value.clone())
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> bool {
        let mut store = self.inner.store.lock();
        store.remove(key);

        if store.items.len() >= self.inner.max_size {
            if let Some(evicted) = store.evict_lru() {
                debug!(key = %evicted, "Evicted least recently used cache entry");
            }
        }

        let tick = store.next_tick();
        store.lru.insert(tick, key.to_string());
        store.items.insert(
            key.to_string(),
            Entry {
                item: CacheItem::new(value, ttl),
                tick,
            },
        );
        self.inner.stats.record_set();
        true
    }

    async fn delete(&self, key: &str) -> bool {
        let removed = self.inner.store.lock().remove(key).is_some();
        if removed {
            self.inner.stats.record_delete();
        }
        removed
    }

    async fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut store = self.inner.store.lock();
        let expired = store.items.get(key).map(|entry| entry.item.is_expired_at(now));
        match expired {
            Some(false) => true,
            Some(true) => {
                store.remove(key);
                false
            }
            None => false,
        }
    }

    async fn clear(&self) -> bool {
        let mut store = self.inner.store.lock();
        store.items.clear();
        store.lru.clear();
        true
    }

    async fn keys(&self, pattern: &str) -> Vec<String> {
        let pattern = match Pattern::new(pattern) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(pattern, "Invalid cache key pattern: {}", e);
                self.inner.stats.record_error();
                return Vec::new();
            }
        };

        let now = Instant::now();
        let store = self.inner.store.lock();
        store
            .items
            .iter()
            .filter(|(key, entry)| !entry.item.is_expired_at(now) && pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }

    fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    fn record_error(&self) {
        self.inner.stats.record_error();
    }

    fn record_decode_error(&self) {
        self.inner.stats.revoke_hit();
    }

    async fn shutdown(&self) {
        let task = self.sweeper.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            debug!("Cache sweeper stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = MemoryCacheBackend::new(10, true);
        cache.set("k", "42".to_string(), Some(Duration::from_secs(1))).await;

        assert_eq!(cache.get("k").await.as_deref(), Some("42"));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_recently_read_keys() {
        let cache = MemoryCacheBackend::new(2, true);
        cache.set("a", "1".to_string(), None).await;
        cache.set("b", "2".to_string(), None).await;

        // Reading `a` makes `b` the least recently used entry.
        assert!(cache.get("a").await.is_some());
        cache.set("c", "3".to_string(), None).await;

        assert_eq!(cache.len(), 2);
        assert!(cache.exists("a").await);
        assert!(!cache.exists("b").await);
        assert!(cache.exists("c").await);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let cache = MemoryCacheBackend::new(2, true);
        cache.set("a", "1".to_string(), None).await;
        cache.set("b", "2".to_string(), None).await;
        cache.set("a", "3".to_string(), None).await;

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").await.as_deref(), Some("3"));
        assert!(cache.exists("b").await);
    }

    #[tokio::test]
    async fn test_keys_matches_glob() {
        let cache = MemoryCacheBackend::new(10, true);
        for key in ["user:1", "user:2", "order:1"] {
            cache.set(key, "x".to_string(), None).await;
        }

        let mut keys = cache.keys("user:*").await;
        keys.sort();
        assert_eq!(keys, vec!["user:1", "user:2"]);
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_counted_as_error() {
        let cache = MemoryCacheBackend::new(10, true);
        assert!(cache.keys("user:[").await.is_empty());
        assert_eq!(cache.stats().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_expired_entries() {
        let cache = MemoryCacheBackend::new(10, true);
        cache.start_sweeper(Duration::from_secs(60));
        cache.set("short", "1".to_string(), Some(Duration::from_secs(5))).await;
        cache.set("long", "2".to_string(), None).await;

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(cache.len(), 1);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_counts_only_removed_keys() {
        let cache = MemoryCacheBackend::new(10, true);
        cache.set("a", "1".to_string(), None).await;

        assert!(cache.delete("a").await);
        assert!(!cache.delete("a").await);
        assert_eq!(cache.stats().deletes, 1);
    }
}
