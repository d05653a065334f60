//! Cache admin router exercised through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode, header::CONTENT_TYPE},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use strata::cache::{
    CacheConfig, CacheConsumer, CacheRegistry, CacheTrigger, EventQueue, HEADER_CACHE_SOURCE,
    HEADER_CACHE_STATUS, HEADER_CACHE_TTL, KvStore, MemoryKv,
};
use strata::infra::http::{CacheState, build_cache_router};
use tower::ServiceExt;

struct Harness {
    router: Router,
    registry: Arc<CacheRegistry>,
    queue: Arc<EventQueue>,
}

fn harness(config: CacheConfig) -> Harness {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let registry = Arc::new(CacheRegistry::from_config(&config, Some(kv)));
    let queue = Arc::new(EventQueue::new(
        config.event_queue_limit_non_zero(),
        config.event_log_limit,
    ));
    let consumer = Arc::new(CacheConsumer::new(
        config.clone(),
        registry.clone(),
        queue.clone(),
    ));
    let trigger = Arc::new(CacheTrigger::new(config.clone(), queue.clone(), consumer));

    let router = build_cache_router(CacheState {
        config,
        registry: registry.clone(),
        queue: queue.clone(),
        trigger,
    });

    Harness {
        router,
        registry,
        queue,
    }
}

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            builder = builder.header(CONTENT_TYPE, "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let request = builder.body(body).expect("request should build");

    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, headers, value)
}

#[tokio::test]
async fn health_reports_backend_and_namespaces() {
    let harness = harness(CacheConfig::default());
    harness.registry.service("content");

    let (status, _, body) = send(&harness.router, Method::GET, "/cache/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["kv_backend"], "memory");
    assert_eq!(body["namespaces"], json!(["content"]));
}

#[tokio::test]
async fn entry_lookup_reports_cache_metadata() {
    let harness = harness(CacheConfig::default());
    let content = harness.registry.service("content");
    let key = content.generate_key("post", "42");
    content.set(&key, &json!({"title": "Hello"})).await;

    let uri = format!("/cache/entries/content/{key}");
    let (status, headers, body) = send(&harness.router, Method::GET, &uri, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["title"], "Hello");
    assert_eq!(body["meta"]["cache"]["hit"], true);
    assert_eq!(body["meta"]["cache"]["source"], "memory");
    assert!(body["meta"]["cache"]["ttl"].as_u64().is_some_and(|ttl| ttl <= 300));

    assert_eq!(headers[HEADER_CACHE_STATUS], "HIT");
    assert_eq!(headers[HEADER_CACHE_SOURCE], "memory");
    assert!(headers.contains_key(HEADER_CACHE_TTL));
}

#[tokio::test]
async fn entry_miss_and_unknown_namespace_are_not_found() {
    let harness = harness(CacheConfig::default());

    let (status, _, body) = send(
        &harness.router,
        Method::GET,
        "/cache/entries/content/content:post:404",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "cache_miss");

    let (status, _, body) = send(&harness.router, Method::GET, "/cache/stats/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn invalidate_removes_matching_keys() {
    let harness = harness(CacheConfig::default());
    let content = harness.registry.service("content");
    for id in ["1", "2"] {
        content
            .set(&content.generate_key("post", id), &json!({"id": id}))
            .await;
    }
    content
        .set(&content.generate_key("page", "about"), &json!({"id": "about"}))
        .await;

    let (status, _, body) = send(
        &harness.router,
        Method::POST,
        "/cache/invalidate",
        Some(json!({"pattern": "content:post:*", "namespace": "content"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 2);
    assert!(content.has(&content.generate_key("page", "about")).await);
}

#[tokio::test]
async fn invalidate_rejects_empty_pattern() {
    let harness = harness(CacheConfig::default());
    let (status, _, body) = send(
        &harness.router,
        Method::POST,
        "/cache/invalidate",
        Some(json!({"pattern": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn stats_and_clear_round_trip() {
    let harness = harness(CacheConfig::default());
    let content = harness.registry.service("content");
    let key = content.generate_key("post", "1");
    content.set(&key, &json!({"id": 1})).await;
    let _: Option<Value> = content.get(&key).await;

    let (status, _, body) = send(&harness.router, Method::GET, "/cache/stats/content", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["memory_hits"], 1);
    assert_eq!(body["entry_count"], 1);

    let (status, _, body) = send(&harness.router, Method::POST, "/cache/clear/content", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], json!(["content"]));
    assert!(!content.has(&key).await);

    let (status, _, body) = send(&harness.router, Method::GET, "/cache/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["namespaces"]["content"]["total_requests"], 0);
    assert_eq!(body["events"]["pending"], 0);
}

#[tokio::test]
async fn published_events_invalidate_and_are_logged() {
    let harness = harness(CacheConfig::default());
    let content = harness.registry.service("content");
    let item = content.generate_key("item", "42");
    let list = content.generate_key("list", "recent");
    content.set(&item, &json!({"id": "42"})).await;
    content.set(&list, &json!([])).await;

    let (status, _, body) = send(
        &harness.router,
        Method::POST,
        "/cache/events",
        Some(json!({"event": "content.update", "id": "42"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["event"]["event"]["event"], "content.update");
    assert_eq!(body["report"]["events"], 1);
    assert!(!content.has(&item).await);
    assert!(!content.has(&list).await);

    let (status, _, body) = send(
        &harness.router,
        Method::POST,
        "/cache/events?consume=false",
        Some(json!({"event": "media.upload"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body.get("report").is_none());
    assert_eq!(harness.queue.len(), 1);

    let (status, _, body) =
        send(&harness.router, Method::GET, "/cache/events/recent?limit=5", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body
        .as_array()
        .expect("array body")
        .iter()
        .filter_map(|event| event["event"]["event"].as_str())
        .collect();
    assert_eq!(names, vec!["media.upload", "content.update"]);
}

#[tokio::test]
async fn events_are_refused_when_cache_disabled() {
    let harness = harness(CacheConfig {
        enabled: false,
        ..Default::default()
    });

    let (status, _, body) = send(
        &harness.router,
        Method::POST,
        "/cache/events",
        Some(json!({"event": "config.update"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "cache_disabled");

    let (_, _, body) = send(&harness.router, Method::GET, "/cache/health", None).await;
    assert_eq!(body["status"], "disabled");
}

#[tokio::test]
async fn warm_seeds_common_namespaces() {
    let harness = harness(CacheConfig::default());

    let (status, _, body) = send(
        &harness.router,
        Method::POST,
        "/cache/warm",
        Some(json!({
            "collections": [{"id": "blog"}],
            "content": [{"id": "1"}, {"id": "2"}],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["errors"], 0);

    let content = harness.registry.service("content");
    assert!(content.has(&content.generate_key("item", "1")).await);
    let collections = harness.registry.service("collection");
    assert!(collections.has(&collections.generate_key("item", "blog")).await);
}

#[tokio::test]
async fn events_without_optional_fields_still_invalidate() {
    let harness = harness(CacheConfig::default());
    let users = harness.registry.service("user");
    let by_id = users.generate_key("id", "7");
    let by_email = users.generate_key("email", "a@b.c");
    users.set(&by_id, &json!({"id": "7"})).await;
    users.set(&by_email, &json!({"id": "7"})).await;

    let (status, _, body) = send(
        &harness.router,
        Method::POST,
        "/cache/events",
        Some(json!({"event": "user.update", "id": "7"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["report"]["deletes"], 1);
    assert!(!users.has(&by_id).await);
    assert!(users.has(&by_email).await);

    let content = harness.registry.service("content");
    let list = content.generate_key("list", "recent");
    content.set(&list, &json!([])).await;

    let (status, _, _) = send(
        &harness.router,
        Method::POST,
        "/cache/events",
        Some(json!({"event": "content.update"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!content.has(&list).await);
}
