mod cache;
pub mod error;
mod middleware;

pub use cache::CacheState;
pub use error::ApiError;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use middleware::{log_responses, set_request_context};

/// Cache admin router. Every route is JSON in, JSON out.
pub fn build_cache_router(state: CacheState) -> Router {
    Router::new()
        .route("/cache/health", get(cache::health))
        .route("/cache/stats", get(cache::stats_all))
        .route("/cache/stats/{namespace}", get(cache::stats_one))
        .route("/cache/clear", post(cache::clear_all))
        .route("/cache/clear/{namespace}", post(cache::clear_one))
        .route("/cache/invalidate", post(cache::invalidate))
        .route("/cache/entries/{namespace}/{*key}", get(cache::entry))
        .route("/cache/events", post(cache::publish_event))
        .route("/cache/events/recent", get(cache::recent_events))
        .route("/cache/warm", post(cache::warm))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
