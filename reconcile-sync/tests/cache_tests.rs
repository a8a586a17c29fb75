use reconcile_sync::{CacheBackend, MemoryCache, SyncError};
use serde_json::json;

#[tokio::test]
async fn set_then_get() {
    let cache = MemoryCache::new();
    cache.set("sync:k", json!({"a": 1}), 60).await.unwrap();

    assert_eq!(cache.get("sync:k").await.unwrap(), Some(json!({"a": 1})));
    assert_eq!(cache.get("sync:other").await.unwrap(), None);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn zero_ttl_entries_expire_immediately() {
    let cache = MemoryCache::new();
    cache.set("sync:k", json!(1), 0).await.unwrap();

    assert_eq!(cache.get("sync:k").await.unwrap(), None);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn set_overwrites() {
    let cache = MemoryCache::new();
    cache.set("sync:k", json!(1), 60).await.unwrap();
    cache.set("sync:k", json!(2), 60).await.unwrap();

    assert_eq!(cache.get("sync:k").await.unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn unavailable_cache_fails_every_call() {
    let cache = MemoryCache::new();
    cache.set("sync:k", json!(1), 60).await.unwrap();
    cache.set_unavailable(true);

    assert!(matches!(cache.get("sync:k").await, Err(SyncError::Cache(_))));
    assert!(matches!(cache.set("sync:k", json!(2), 60).await, Err(SyncError::Cache(_))));

    cache.set_unavailable(false);
    assert_eq!(cache.get("sync:k").await.unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn ttl_past_the_clock_range_never_expires() {
    let cache = MemoryCache::new();
    cache.set("sync:k", json!(1), u64::MAX).await.unwrap();

    assert_eq!(cache.get("sync:k").await.unwrap(), Some(json!(1)));
    assert_eq!(cache.len(), 1);
}
