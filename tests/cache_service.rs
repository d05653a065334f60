//! Behavioural tests for the two-tier cache service.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strata::cache::{
    CacheProfile, CacheService, CacheSource, KvEntry, KvError, KvStore, MAX_TTL, MemoryKv,
    generate_cache_key,
};

const BUDGET: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Article {
    id: u64,
    title: String,
}

fn article(id: u64) -> Article {
    Article {
        id,
        title: format!("Article {id}"),
    }
}

fn budget() -> NonZeroUsize {
    NonZeroUsize::new(BUDGET).expect("non-zero budget")
}

fn content_profile() -> CacheProfile {
    CacheProfile::new("content", Duration::from_secs(300))
}

fn service_with(kv: Option<Arc<dyn KvStore>>) -> CacheService {
    CacheService::new(content_profile(), budget(), kv)
}

/// A durable tier whose every operation fails.
struct BrokenKv {
    calls: AtomicUsize,
}

impl BrokenKv {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn fail(&self) -> KvError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        KvError::unavailable("connection refused")
    }
}

#[async_trait]
impl KvStore for BrokenKv {
    async fn get(&self, _key: &str) -> Result<Option<KvEntry>, KvError> {
        Err(self.fail())
    }

    async fn put(&self, _key: &str, _value: &Value, _ttl: Duration) -> Result<(), KvError> {
        Err(self.fail())
    }

    async fn delete(&self, _key: &str) -> Result<(), KvError> {
        Err(self.fail())
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<String>, KvError> {
        Err(self.fail())
    }

    fn name(&self) -> &'static str {
        "broken"
    }
}

#[test]
fn key_generation_is_deterministic() {
    let first = generate_cache_key("content", "post", "42", None);
    let second = generate_cache_key("content", "post", "42", None);
    assert_eq!(first, second);
    assert_eq!(first, "content:post:42");

    let service = service_with(None);
    assert_eq!(service.generate_key("post", "42"), first);

    let versioned = CacheService::new(content_profile().with_version("v2"), budget(), None);
    assert_eq!(versioned.generate_key("post", "42"), "content:post:42:v2");
}

#[tokio::test]
async fn write_then_read_returns_value() {
    let service = service_with(Some(Arc::new(MemoryKv::new())));
    let key = service.generate_key("post", "1");

    service.set(&key, &article(1)).await;

    let cached: Option<Article> = service.get(&key).await;
    assert_eq!(cached, Some(article(1)));
}

#[tokio::test]
async fn delete_then_read_misses_in_every_tier() {
    let kv = Arc::new(MemoryKv::new());
    let service = service_with(Some(kv.clone()));
    let key = service.generate_key("post", "1");

    service.set(&key, &article(1)).await;
    service.delete(&key).await;

    assert_eq!(service.get::<Article>(&key).await, None);
    assert!(kv.get(&key).await.expect("kv read").is_none());
    assert!(!service.has(&key).await);
}

#[tokio::test]
async fn get_or_set_calls_factory_once() {
    let service = service_with(Some(Arc::new(MemoryKv::new())));
    let key = service.generate_key("post", "7");
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let value: Article = service
            .get_or_set(&key, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::convert::Infallible>(article(7))
            })
            .await
            .expect("infallible");
        assert_eq!(value, article(7));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(service.stats().source_loads, 1);
}

#[tokio::test]
async fn get_or_set_propagates_factory_errors_without_caching() {
    let service = service_with(None);
    let key = service.generate_key("post", "9");

    let result: Result<Article, String> = service
        .get_or_set(&key, || async { Err("database down".to_string()) })
        .await;
    assert_eq!(result, Err("database down".to_string()));
    assert!(!service.has(&key).await);
}

#[tokio::test]
async fn concurrent_misses_share_one_load() {
    let service = Arc::new(service_with(Some(Arc::new(MemoryKv::new()))));
    let calls = Arc::new(AtomicUsize::new(0));
    let key = service.generate_key("post", "hot");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        let calls = calls.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            service
                .get_or_set(&key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, std::convert::Infallible>(article(99))
                })
                .await
        }));
    }

    for handle in handles {
        let value = handle.await.expect("task joins").expect("infallible");
        assert_eq!(value, article(99));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn prefix_invalidation_removes_only_matching_keys() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let service = service_with(Some(kv.clone()));

    let post_1 = service.generate_key("post", "1");
    let post_2 = service.generate_key("post", "2");
    let page_1 = service.generate_key("page", "1");
    service.set(&post_1, &article(1)).await;
    service.set(&post_2, &article(2)).await;
    service.set(&page_1, &article(3)).await;

    let removed = service.invalidate("content:post:*").await;
    assert_eq!(removed, 2);

    assert_eq!(service.get::<Article>(&post_1).await, None);
    assert_eq!(service.get::<Article>(&post_2).await, None);
    assert_eq!(service.get::<Article>(&page_1).await, Some(article(3)));

    // A second process sharing the durable tier sees the same result.
    let peer = service_with(Some(kv));
    assert_eq!(peer.get::<Article>(&post_1).await, None);
    assert_eq!(peer.get::<Article>(&page_1).await, Some(article(3)));
}

#[tokio::test]
async fn invalidation_stays_inside_the_namespace() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let content = service_with(Some(kv.clone()));
    let users = CacheService::new(
        CacheProfile::new("user", Duration::from_secs(600)),
        budget(),
        Some(kv.clone()),
    );

    let user_key = users.generate_key("profile", "1");
    users.set(&user_key, &json!({"name": "ada"})).await;
    content
        .set(&content.generate_key("post", "1"), &article(1))
        .await;

    assert_eq!(content.invalidate("*").await, 1);
    assert!(kv.get(&user_key).await.expect("kv read").is_some());
}

#[tokio::test]
async fn reports_which_tier_answered() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let writer = service_with(Some(kv.clone()));
    let reader = service_with(Some(kv));
    let key = writer.generate_key("post", "5");

    let miss = reader.get_with_source::<Article>(&key).await;
    assert!(!miss.hit);
    assert_eq!(miss.source, CacheSource::Miss);
    assert_eq!(miss.ttl, None);

    writer.set(&key, &article(5)).await;

    let from_kv = reader.get_with_source::<Article>(&key).await;
    assert!(from_kv.hit);
    assert_eq!(from_kv.source, CacheSource::Kv);
    assert_eq!(from_kv.data, Some(article(5)));

    let from_memory = reader.get_with_source::<Article>(&key).await;
    assert_eq!(from_memory.source, CacheSource::Memory);
    assert!(from_memory.ttl.is_some_and(|ttl| ttl <= Duration::from_secs(300)));

    let stats = reader.stats();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.memory_hits, 1);
    assert_eq!(stats.kv_hits, 1);
    assert_eq!(stats.kv_misses, 1);
}

#[tokio::test]
async fn delete_never_fails() {
    let service = service_with(None);
    service.delete("content:post:missing").await;

    let broken = Arc::new(BrokenKv::new());
    let degraded = service_with(Some(broken.clone()));
    degraded.delete("content:post:missing").await;
    assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_kv_degrades_to_memory_only() {
    let broken = Arc::new(BrokenKv::new());
    let service = service_with(Some(broken.clone()));
    let key = service.generate_key("post", "1");

    let miss = service.get_with_source::<Article>(&key).await;
    assert_eq!(miss.source, CacheSource::Miss);

    service.set(&key, &article(1)).await;
    let hit = service.get_with_source::<Article>(&key).await;
    assert_eq!(hit.source, CacheSource::Memory);

    let loaded: Article = service
        .get_or_set(&service.generate_key("post", "2"), || async {
            Ok::<_, std::convert::Infallible>(article(2))
        })
        .await
        .expect("infallible");
    assert_eq!(loaded, article(2));

    assert_eq!(service.invalidate("content:*").await, 2);
    assert!(broken.calls.load(Ordering::SeqCst) >= 3);
}

#[tokio::test(start_paused = true)]
async fn ttl_counts_down_and_expires() {
    let service = service_with(Some(Arc::new(MemoryKv::new())));
    let key = service.generate_key("post", "ttl");

    service
        .set_with_ttl(&key, &article(1), Duration::from_secs(10))
        .await;

    let first = service.get_with_source::<Article>(&key).await;
    let first_ttl = first.ttl.expect("ttl reported on hit");
    assert!(first_ttl <= Duration::from_secs(10));

    tokio::time::advance(Duration::from_secs(4)).await;
    let second = service.get_with_source::<Article>(&key).await;
    let second_ttl = second.ttl.expect("ttl reported on hit");
    assert!(second_ttl < first_ttl);
    assert!(second_ttl <= Duration::from_secs(6));

    tokio::time::advance(Duration::from_secs(7)).await;
    let expired = service.get_with_source::<Article>(&key).await;
    assert!(!expired.hit);
    assert_eq!(expired.source, CacheSource::Miss);
}

#[tokio::test]
async fn memory_only_profile_never_touches_kv() {
    let kv = Arc::new(MemoryKv::new());
    let service = CacheService::new(
        CacheProfile::new("session", Duration::from_secs(60)).memory_only(),
        budget(),
        Some(kv.clone()),
    );

    service.set("session:token:abc", &json!({"user": 1})).await;
    assert!(kv.is_empty());
    assert_eq!(service.kv_backend(), None);
}

#[tokio::test]
async fn batch_helpers_round_trip() {
    let service = service_with(None);
    let entries: Vec<(String, Article)> = (1..=3)
        .map(|id| (service.generate_key("post", &id.to_string()), article(id)))
        .collect();

    assert_eq!(service.warm(&entries).await, 3);

    let keys: Vec<&str> = entries.iter().map(|(key, _)| key.as_str()).collect();
    let found = service.get_many::<Article, _>(&keys).await;
    assert_eq!(found.len(), 3);

    service.delete_many(&keys[..2]).await;
    let remaining = service.get_many::<Article, _>(&keys).await;
    assert_eq!(remaining.len(), 1);
    assert!(remaining.contains_key(keys[2]));
}

#[tokio::test]
async fn huge_ttls_are_capped_instead_of_failing() {
    let kv = Arc::new(MemoryKv::new());
    let service = CacheService::new(
        CacheProfile::new("content", Duration::from_secs(1_000_000_000_000_000)),
        budget(),
        Some(kv.clone()),
    );
    let key = service.generate_key("post", "1");

    service.set(&key, &article(1)).await;
    let hit = service.get_with_source::<Article>(&key).await;
    assert_eq!(hit.source, CacheSource::Memory);
    assert!(hit.ttl.is_some_and(|ttl| ttl <= MAX_TTL));

    let from_kv = kv.get(&key).await.expect("kv read").expect("present");
    assert!(from_kv.ttl.is_some_and(|ttl| ttl <= MAX_TTL));

    let loaded: Article = service
        .get_or_set_with_ttl(&service.generate_key("post", "2"), Duration::MAX, || async {
            Ok::<_, std::convert::Infallible>(article(2))
        })
        .await
        .expect("infallible");
    assert_eq!(loaded, article(2));
    assert!(service.has(&service.generate_key("post", "2")).await);
}
