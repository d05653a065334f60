//! Cache admin endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use tracing::info;

use crate::cache::{
    CacheConfig, CacheEvent, CacheMeta, CacheRegistry, CacheService, CacheStats, CacheTrigger,
    ConsumeReport, EventKind, EventQueue, KeyPattern, PatternError, StaticWarmSource, WarmReport,
    warm_common_caches,
};

use super::error::ApiError;

const DEFAULT_RECENT_EVENTS: usize = 20;

#[derive(Clone)]
pub struct CacheState {
    pub config: CacheConfig,
    pub registry: Arc<CacheRegistry>,
    pub queue: Arc<EventQueue>,
    pub trigger: Arc<CacheTrigger>,
}

impl CacheState {
    fn known_service(&self, namespace: &str) -> Result<Arc<CacheService>, ApiError> {
        if let Some(service) = self.registry.existing(namespace) {
            return Ok(service);
        }
        if self.registry.profiles().contains(namespace) {
            return Ok(self.registry.service(namespace));
        }
        Err(ApiError::unknown_namespace(namespace))
    }
}

#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub dropped: u64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub namespaces: BTreeMap<String, CacheStats>,
    pub events: QueueStats,
}

pub(super) async fn stats_all(State(state): State<CacheState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        namespaces: state.registry.all_stats(),
        events: QueueStats {
            pending: state.queue.len(),
            dropped: state.queue.dropped(),
        },
    })
}

pub(super) async fn stats_one(
    State(state): State<CacheState>,
    Path(namespace): Path<String>,
) -> Result<Json<CacheStats>, ApiError> {
    let service = state.known_service(&namespace)?;
    Ok(Json(service.stats()))
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub cleared: Vec<String>,
}

pub(super) async fn clear_all(State(state): State<CacheState>) -> Json<ClearResponse> {
    let cleared = state.registry.namespaces();
    state.registry.clear_all().await;
    info!(namespaces = cleared.len(), "All caches cleared via admin API");
    Json(ClearResponse { cleared })
}

pub(super) async fn clear_one(
    State(state): State<CacheState>,
    Path(namespace): Path<String>,
) -> Result<Json<ClearResponse>, ApiError> {
    let service = state.known_service(&namespace)?;
    service.clear().await;
    Ok(Json(ClearResponse {
        cleared: vec![namespace],
    }))
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub pattern: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub pattern: String,
    pub removed: usize,
}

pub(super) async fn invalidate(
    State(state): State<CacheState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let pattern = KeyPattern::new(request.pattern.trim()).map_err(|err| match err {
        PatternError::Empty => ApiError::bad_request("Pattern is required", None),
        other => ApiError::invalid_pattern(other.to_string()),
    })?;

    let namespace = request
        .namespace
        .as_deref()
        .map(str::trim)
        .filter(|namespace| !namespace.is_empty());
    if let Some(namespace) = namespace {
        state.known_service(namespace)?;
    }

    let removed = state.registry.invalidate(namespace, &pattern).await;
    info!(pattern = %pattern, namespace = ?namespace, removed, "Cache invalidated via admin API");

    Ok(Json(InvalidateResponse {
        pattern: pattern.as_str().to_string(),
        removed,
    }))
}

#[derive(Debug, Serialize)]
pub struct EntryMeta {
    pub cache: CacheMeta,
}

#[derive(Debug, Serialize)]
pub struct EntryResponse {
    pub data: Value,
    pub meta: EntryMeta,
}

pub(super) async fn entry(
    State(state): State<CacheState>,
    Path((namespace, key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let service = state.known_service(&namespace)?;
    let result = service.get_with_source::<Value>(&key).await;
    let meta = CacheMeta::from_result(&result);

    let Some(data) = result.data else {
        return Err(ApiError::cache_miss(&key));
    };

    let mut response = Json(EntryResponse {
        data,
        meta: EntryMeta {
            cache: meta.clone(),
        },
    })
    .into_response();
    meta.apply_headers(response.headers_mut());
    Ok(response)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub namespaces: Vec<String>,
    pub kv_backend: Option<&'static str>,
    pub pending_events: usize,
}

pub(super) async fn health(State(state): State<CacheState>) -> Json<HealthResponse> {
    let status = if state.config.is_enabled() {
        "ok"
    } else {
        "disabled"
    };
    Json(HealthResponse {
        status,
        namespaces: state.registry.namespaces(),
        kv_backend: state.registry.kv_backend(),
        pending_events: state.queue.len(),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct PublishParams {
    /// Consume the queue before responding. Defaults to true.
    pub consume: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct EventView {
    pub id: String,
    pub epoch: u64,
    pub event: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl From<&CacheEvent> for EventView {
    fn from(event: &CacheEvent) -> Self {
        Self {
            id: event.id.to_string(),
            epoch: event.epoch,
            event: event.kind.clone(),
            timestamp: event.timestamp.format(&Rfc3339).ok(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub event: EventView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ConsumeReport>,
}

pub(super) async fn publish_event(
    State(state): State<CacheState>,
    Query(params): Query<PublishParams>,
    Json(kind): Json<EventKind>,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    let consume_now = params.consume.unwrap_or(true);
    let outcome = state
        .trigger
        .trigger(kind, consume_now)
        .await
        .ok_or_else(ApiError::cache_disabled)?;

    let status = if outcome.report.is_some() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((
        status,
        Json(PublishResponse {
            event: EventView::from(&outcome.event),
            report: outcome.report,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct RecentParams {
    pub limit: Option<usize>,
}

pub(super) async fn recent_events(
    State(state): State<CacheState>,
    Query(params): Query<RecentParams>,
) -> Json<Vec<EventView>> {
    let limit = params.limit.unwrap_or(DEFAULT_RECENT_EVENTS);
    let events = state.queue.recent(limit);
    Json(events.iter().map(EventView::from).collect())
}

pub(super) async fn warm(
    State(state): State<CacheState>,
    Json(source): Json<StaticWarmSource>,
) -> Result<Json<WarmReport>, ApiError> {
    if !state.config.is_enabled() {
        return Err(ApiError::cache_disabled());
    }
    let report = warm_common_caches(&state.registry, &source).await;
    Ok(Json(report))
}
