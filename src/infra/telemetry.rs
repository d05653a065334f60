use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the global tracing subscriber and register metric descriptions.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "strata_cache_memory_hit_total",
            Unit::Count,
            "Reads answered by the memory tier."
        );
        describe_counter!(
            "strata_cache_memory_miss_total",
            Unit::Count,
            "Reads the memory tier could not answer."
        );
        describe_counter!(
            "strata_cache_memory_evict_total",
            Unit::Count,
            "Memory entries evicted to stay within the byte budget."
        );
        describe_counter!(
            "strata_cache_kv_hit_total",
            Unit::Count,
            "Reads answered by the KV tier."
        );
        describe_counter!(
            "strata_cache_kv_miss_total",
            Unit::Count,
            "Reads the KV tier could not answer, including failed reads."
        );
        describe_counter!(
            "strata_cache_kv_error_total",
            Unit::Count,
            "KV tier operations that failed and were absorbed."
        );
        describe_counter!(
            "strata_cache_source_load_total",
            Unit::Count,
            "Read-through loads served by the source of truth."
        );
        describe_gauge!(
            "strata_cache_event_queue_len",
            Unit::Count,
            "Current number of pending cache events in the queue."
        );
        describe_counter!(
            "strata_cache_event_dropped_total",
            Unit::Count,
            "Cache events dropped due to queue overflow."
        );
        describe_histogram!(
            "strata_cache_consume_ms",
            Unit::Milliseconds,
            "Cache event consumption latency in milliseconds."
        );
        describe_histogram!(
            "strata_cache_warm_ms",
            Unit::Milliseconds,
            "Cache warming latency in milliseconds."
        );
    });
}
