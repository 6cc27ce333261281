use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use muster::core::MusterError;
use muster::core::cache::{Cache, CacheConfig, CacheKey, CacheType, FetchResult};
use muster::core::clock::Clock;
use muster::core::rpc::ReadBody;

/// Counts upstream fetches; optionally fails after the first success.
struct CountingSource {
    fetches: AtomicU64,
    fail_after: Option<u64>,
}

#[async_trait]
impl CacheType for CountingSource {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn supports_blocking(&self) -> bool {
        false
    }

    async fn fetch(
        &self,
        _datacenter: &str,
        _token: &str,
        key: &str,
        _min_index: u64,
        _max_wait: Option<Duration>,
    ) -> Result<FetchResult, MusterError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        // Simulate upstream latency so concurrent gets really do overlap.
        tokio::time::sleep(Duration::from_millis(10)).await;
        if let Some(limit) = self.fail_after {
            if n > limit {
                return Err(MusterError::Transient(format!("fetch {n} failed")));
            }
        }
        Ok(FetchResult {
            index: n,
            body: ReadBody::Datacenters(vec![key.to_string()]),
        })
    }
}

fn cache_with(source: Arc<CountingSource>, ttl: Duration) -> Arc<Cache> {
    let mut cache = Cache::new(
        CacheConfig {
            entry_ttl: ttl,
            refresh_blocking_wait: Duration::from_secs(600),
            backoff_min_failures: 2,
            backoff_max_wait: Duration::from_secs(60),
        },
        Clock::new(),
    );
    cache.register(source);
    Arc::new(cache)
}

fn key(k: &str) -> CacheKey {
    CacheKey {
        cache_type: "counting",
        datacenter: "dc1".to_string(),
        token: String::new(),
        key: k.to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_gets_coalesce_to_one_fetch() {
    let source = Arc::new(CountingSource {
        fetches: AtomicU64::new(0),
        fail_after: None,
    });
    let cache = cache_with(source.clone(), Duration::from_secs(600));

    let mut handles = Vec::new();
    for _ in 0..100 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache.get(key("svc-web"), 0, Duration::from_secs(5)).await
        }));
    }

    let mut indexes = Vec::new();
    for handle in handles {
        let (index, body) = handle.await.unwrap().unwrap();
        indexes.push(index);
        assert_eq!(body.as_ref(), &ReadBody::Datacenters(vec!["svc-web".to_string()]));
    }
    assert_eq!(
        source.fetches.load(Ordering::SeqCst),
        1,
        "100 concurrent gets must share one fetch"
    );
    assert!(indexes.iter().all(|i| *i == 1), "all callers see the same value");
}

#[tokio::test(start_paused = true)]
async fn test_second_get_is_served_from_cache() {
    let source = Arc::new(CountingSource {
        fetches: AtomicU64::new(0),
        fail_after: None,
    });
    let cache = cache_with(source.clone(), Duration::from_secs(600));

    cache.get(key("a"), 0, Duration::from_secs(5)).await.unwrap();
    cache.get(key("a"), 0, Duration::from_secs(5)).await.unwrap();
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

    // A different request key is a different entry.
    cache.get(key("b"), 0, Duration::from_secs(5)).await.unwrap();
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_error_newer_than_value_splits_callers() {
    let source = Arc::new(CountingSource {
        fetches: AtomicU64::new(0),
        fail_after: Some(1),
    });
    let cache = cache_with(source.clone(), Duration::from_secs(600));

    let (index, _) = cache.get(key("a"), 0, Duration::from_secs(5)).await.unwrap();
    assert_eq!(index, 1);

    // Force a refetch by asking for something newer; it fails.
    let err = cache
        .get(key("a"), index, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, MusterError::Transient(_)));

    // An any-value caller still gets the stale-but-valid entry.
    let (stale_index, _) = cache.get(key("a"), 0, Duration::from_secs(5)).await.unwrap();
    assert_eq!(stale_index, 1);
}

#[tokio::test(start_paused = true)]
async fn test_prepopulated_entry_serves_without_fetch() {
    let source = Arc::new(CountingSource {
        fetches: AtomicU64::new(0),
        fail_after: None,
    });
    let cache = cache_with(source.clone(), Duration::from_secs(600));

    cache.prepopulate(key("seeded"), 42, ReadBody::Datacenters(vec!["dc1".to_string()]));
    let (index, body) = cache.get(key("seeded"), 0, Duration::from_secs(5)).await.unwrap();
    assert_eq!(index, 42);
    assert_eq!(body.as_ref(), &ReadBody::Datacenters(vec!["dc1".to_string()]));
    assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_entries_are_evicted_after_ttl() {
    let source = Arc::new(CountingSource {
        fetches: AtomicU64::new(0),
        fail_after: None,
    });
    let cache = cache_with(source.clone(), Duration::from_secs(30));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    tokio::spawn(cache.clone().run_eviction(shutdown_tx.subscribe()));

    cache.get(key("short-lived"), 0, Duration::from_secs(5)).await.unwrap();
    assert_eq!(cache.entry_count(), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(cache.entry_count(), 0, "idle entry evicted after its TTL");
    drop(shutdown_tx);
}
