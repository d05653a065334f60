//! Cache warming.
//!
//! Seeds the hot namespaces from a source of truth before traffic arrives.
//! Source failures are logged and counted; warming never fails the caller.

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use metrics::histogram;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::config::namespaces::{COLLECTION, CONTENT, MEDIA};
use super::registry::CacheRegistry;
use super::service::CacheService;

const METRIC_CACHE_WARM_MS: &str = "strata_cache_warm_ms";
const RECENT_LIMIT: usize = 50;

#[derive(Debug, Error)]
#[error("warm source failed: {message}")]
pub struct WarmError {
    pub message: String,
}

impl WarmError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Rows to warm from. Each row is expected to carry an `id` field.
#[async_trait]
pub trait WarmSource: Send + Sync {
    async fn collections(&self) -> Result<Vec<Value>, WarmError>;

    async fn recent_content(&self, limit: usize) -> Result<Vec<Value>, WarmError>;

    async fn recent_media(&self, limit: usize) -> Result<Vec<Value>, WarmError>;
}

/// A warm source backed by rows supplied up front.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StaticWarmSource {
    pub collections: Vec<Value>,
    pub content: Vec<Value>,
    pub media: Vec<Value>,
}

#[async_trait]
impl WarmSource for StaticWarmSource {
    async fn collections(&self) -> Result<Vec<Value>, WarmError> {
        Ok(self.collections.clone())
    }

    async fn recent_content(&self, limit: usize) -> Result<Vec<Value>, WarmError> {
        Ok(self.content.iter().take(limit).cloned().collect())
    }

    async fn recent_media(&self, limit: usize) -> Result<Vec<Value>, WarmError> {
        Ok(self.media.iter().take(limit).cloned().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmDetail {
    pub namespace: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub warmed: usize,
    pub errors: usize,
    pub details: Vec<WarmDetail>,
}

impl WarmReport {
    fn record(&mut self, namespace: &str, outcome: Result<usize, WarmError>) {
        match outcome {
            Ok(count) => {
                self.warmed += count;
                self.details.push(WarmDetail {
                    namespace: namespace.to_string(),
                    count,
                });
            }
            Err(err) => {
                self.errors += 1;
                warn!(namespace, error = %err, "Cache warming source failed");
            }
        }
    }
}

/// Warm collections, recent content and recent media.
#[instrument(skip_all)]
pub async fn warm_common_caches(registry: &CacheRegistry, source: &dyn WarmSource) -> WarmReport {
    let started_at = Instant::now();
    let mut report = WarmReport::default();

    let collections = registry.service(COLLECTION);
    let outcome = match source.collections().await {
        Ok(rows) => Ok(warm_rows(&collections, rows, "all").await),
        Err(err) => Err(err),
    };
    report.record(COLLECTION, outcome);

    let content = registry.service(CONTENT);
    let outcome = match source.recent_content(RECENT_LIMIT).await {
        Ok(rows) => Ok(warm_rows(&content, rows, "recent").await),
        Err(err) => Err(err),
    };
    report.record(CONTENT, outcome);

    let media = registry.service(MEDIA);
    let outcome = match source.recent_media(RECENT_LIMIT).await {
        Ok(rows) => Ok(warm_rows(&media, rows, "recent").await),
        Err(err) => Err(err),
    };
    report.record(MEDIA, outcome);

    histogram!(METRIC_CACHE_WARM_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
    info!(warmed = report.warmed, errors = report.errors, "Cache warming finished");
    report
}

/// Cache each row under `item:<id>` and the whole list under `list:<list_name>`.
async fn warm_rows(service: &CacheService, rows: Vec<Value>, list_name: &str) -> usize {
    let mut entries: Vec<(String, Value)> = rows
        .iter()
        .filter_map(|row| row_id(row).map(|id| (service.generate_key("item", &id), row.clone())))
        .collect();
    entries.push((service.generate_key("list", list_name), Value::Array(rows)));
    warm_namespace(service, &entries).await
}

fn row_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Write prepared entries into one namespace.
pub async fn warm_namespace(service: &CacheService, entries: &[(String, Value)]) -> usize {
    service.warm(entries).await
}

/// Load and cache every key not already present. Returns how many were
/// loaded; loader failures are logged and skipped.
pub async fn preload<F, Fut, E>(service: &CacheService, keys: &[String], loader: F) -> usize
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Value, E>>,
    E: std::fmt::Display,
{
    let mut loaded = 0;
    for key in keys {
        if service.has(key).await {
            continue;
        }
        match loader(key.clone()).await {
            Ok(value) => {
                service.set(key, &value).await;
                loaded += 1;
            }
            Err(err) => warn!(namespace = service.namespace(), key = %key, error = %err, "Preload failed"),
        }
    }
    loaded
}
