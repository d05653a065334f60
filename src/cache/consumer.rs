//! Cache consumer for executing invalidation plans.
//!
//! Drains events from the queue, folds them into an [`InvalidationPlan`] and
//! runs it against the registry.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::config::CacheConfig;
use super::events::EventQueue;
use super::keys::KeyPattern;
use super::planner::{InvalidationPlan, Target};
use super::registry::CacheRegistry;

const METRIC_CACHE_CONSUME_MS: &str = "strata_cache_consume_ms";

/// Outcome of one consumption pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumeReport {
    pub events: usize,
    /// Keys removed by pattern targets.
    pub removed: usize,
    /// Point deletes issued.
    pub deletes: usize,
}

pub struct CacheConsumer {
    config: CacheConfig,
    registry: Arc<CacheRegistry>,
    queue: Arc<EventQueue>,
}

impl CacheConsumer {
    pub fn new(config: CacheConfig, registry: Arc<CacheRegistry>, queue: Arc<EventQueue>) -> Self {
        Self {
            config,
            registry,
            queue,
        }
    }

    /// Consume one batch of pending events.
    ///
    /// Returns `None` when the queue was empty.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> Option<ConsumeReport> {
        let started_at = Instant::now();
        let events = self.queue.drain(self.config.consume_batch_limit.max(1));
        if events.is_empty() {
            return None;
        }

        let event_ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        let plan = InvalidationPlan::from_events(events);

        info!(
            event_count = event_ids.len(),
            event_ids = ?event_ids,
            plan = %plan,
            "Cache consumption started"
        );

        let mut report = self.execute(&plan).await;
        report.events = event_ids.len();

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_CACHE_CONSUME_MS).record(elapsed_ms);

        info!(
            events = report.events,
            removed = report.removed,
            deletes = report.deletes,
            elapsed_ms,
            "Cache consumption finished"
        );
        Some(report)
    }

    /// Consume batches until the queue is empty.
    pub async fn consume_all(&self) -> ConsumeReport {
        let mut total = ConsumeReport::default();
        while let Some(report) = self.consume().await {
            total.events += report.events;
            total.removed += report.removed;
            total.deletes += report.deletes;
        }
        total
    }

    /// Run a plan against the registry.
    pub async fn execute(&self, plan: &InvalidationPlan) -> ConsumeReport {
        let mut report = ConsumeReport {
            events: plan.event_count(),
            ..Default::default()
        };

        for (namespace, target) in plan.targets() {
            let service = self.registry.service(namespace);
            match target {
                Target::Item { kind, id } => {
                    service.delete(&service.generate_key(kind, id)).await;
                    report.deletes += 1;
                }
                Target::Kind(kind) => {
                    let pattern = service.namespace_pattern(Some(kind));
                    report.removed += self.run_pattern(namespace, &pattern).await;
                }
                Target::All => {
                    let pattern = service.namespace_pattern(None);
                    report.removed += self.run_pattern(namespace, &pattern).await;
                }
            }
        }
        report
    }

    async fn run_pattern(&self, namespace: &str, pattern: &str) -> usize {
        match KeyPattern::new(pattern) {
            Ok(pattern) => self.registry.invalidate(Some(namespace), &pattern).await,
            Err(err) => {
                warn!(namespace, pattern, error = %err, "Skipping invalid plan pattern");
                0
            }
        }
    }
}
