//! Cache manager integration tests against the in-process backend.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use persistence_kit::config::CacheConfig;
use persistence_kit::infra::{cached, CacheManager};

async fn memory_cache(max_size: usize, ttl: Duration) -> CacheManager {
    let config = CacheConfig::memory()
        .with_max_memory_size(max_size)
        .with_default_ttl(ttl);
    CacheManager::connect(config).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_value_expires_after_ttl() {
    let cache = memory_cache(100, Duration::from_secs(1)).await;

    cache.set("k", &42, None).await.unwrap();
    assert_eq!(cache.get::<i32>("k").await.unwrap(), Some(42));

    tokio::time::advance(Duration::from_millis(1500)).await;
    assert_eq!(cache.get::<i32>("k").await.unwrap(), None);

    let stats = cache.get_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.sets, 1);
    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_ttl_never_expires() {
    let cache = memory_cache(100, Duration::from_secs(1)).await;

    cache.set("pinned", &"yes", Some(Duration::ZERO)).await.unwrap();
    tokio::time::advance(Duration::from_secs(3600)).await;

    assert_eq!(
        cache.get::<String>("pinned").await.unwrap().as_deref(),
        Some("yes")
    );
    cache.shutdown().await;
}

#[tokio::test]
async fn test_least_recently_used_entry_is_evicted() {
    let cache = memory_cache(3, Duration::from_secs(60)).await;

    for key in ["a", "b", "c"] {
        cache.set(key, &key, None).await.unwrap();
    }
    cache.get::<String>("a").await.unwrap();
    cache.set("d", &"d", None).await.unwrap();

    assert!(cache.exists("a").await);
    assert!(!cache.exists("b").await);
    assert!(cache.exists("c").await);
    assert!(cache.exists("d").await);
    cache.shutdown().await;
}

#[tokio::test]
async fn test_invalidate_pattern_only_touches_matching_keys() {
    let cache = memory_cache(100, Duration::from_secs(60)).await;
    cache.set("user:1", &1, None).await.unwrap();
    cache.set("user:2", &2, None).await.unwrap();
    cache.set("order:1", &3, None).await.unwrap();

    assert_eq!(cache.invalidate_pattern("user:*").await, 2);

    assert!(!cache.exists("user:1").await);
    assert!(!cache.exists("user:2").await);
    assert!(cache.exists("order:1").await);
    cache.shutdown().await;
}

#[tokio::test]
async fn test_long_keys_stay_addressable_and_in_namespace() {
    let cache = memory_cache(100, Duration::from_secs(60)).await;
    let long_key = format!("user:{}", "x".repeat(400));

    cache.set(&long_key, &"big", None).await.unwrap();
    assert!(cache.normalize_key(&long_key).len() <= 250);
    assert_eq!(
        cache.get::<String>(&long_key).await.unwrap().as_deref(),
        Some("big")
    );

    assert_eq!(cache.invalidate_pattern("user:*").await, 1);
    assert!(!cache.exists(&long_key).await);
    cache.shutdown().await;
}

#[tokio::test]
async fn test_cached_function_runs_once_per_key() {
    let cache = memory_cache(100, Duration::from_secs(60)).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let square = cached(
        cache.clone(),
        None,
        |n: &u64| CacheManager::make_key(&["square", &n.to_string()]),
        move |n: u64| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(n * n)
            }
        },
    );

    assert_eq!(square(4).await.unwrap(), 16);
    assert_eq!(square(4).await.unwrap(), 16);
    assert_eq!(square(5).await.unwrap(), 25);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    cache.shutdown().await;
}

#[tokio::test]
async fn test_clear_and_reset_stats() {
    let cache = common::memory_cache(10);
    cache.set("a", &1, None).await.unwrap();
    cache.get::<i32>("a").await.unwrap();

    assert!(cache.clear().await);
    assert!(!cache.exists("a").await);

    cache.reset_stats();
    assert_eq!(cache.get_stats().total_requests, 0);
}
