//! Cache trigger service.
//!
//! The entry point write paths use to report changes: publish an event and
//! optionally consume right away.

use std::sync::Arc;

use tracing::debug;

use super::config::CacheConfig;
use super::consumer::{CacheConsumer, ConsumeReport};
use super::events::{CacheEvent, EventKind, EventQueue};

/// Publishes cache events and optionally consumes them immediately.
///
/// ```ignore
/// // After a successful content update:
/// trigger.content_updated(&item.id).await;
/// ```
pub struct CacheTrigger {
    config: CacheConfig,
    queue: Arc<EventQueue>,
    consumer: Arc<CacheConsumer>,
}

impl CacheTrigger {
    pub fn new(config: CacheConfig, queue: Arc<EventQueue>, consumer: Arc<CacheConsumer>) -> Self {
        Self {
            config,
            queue,
            consumer,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    /// Publish an event. With `consume_now`, the pending queue is consumed
    /// before returning. No-op when caching is disabled.
    pub async fn trigger(&self, kind: EventKind, consume_now: bool) -> Option<TriggerOutcome> {
        if !self.config.is_enabled() {
            debug!(event_kind = %kind, "Cache trigger skipped: cache disabled");
            return None;
        }

        let event = self.queue.publish(kind);
        let report = if consume_now {
            Some(self.consumer.consume_all().await)
        } else {
            None
        };
        Some(TriggerOutcome { event, report })
    }

    pub async fn content_updated(&self, id: &str) {
        let kind = EventKind::ContentUpdated {
            id: Some(id.to_string()),
        };
        self.trigger(kind, true).await;
    }

    pub async fn content_deleted(&self, id: &str) {
        let kind = EventKind::ContentDeleted {
            id: Some(id.to_string()),
        };
        self.trigger(kind, true).await;
    }

    pub async fn content_published(&self) {
        self.trigger(EventKind::ContentPublished, true).await;
    }

    pub async fn user_updated(&self, id: &str, email: &str) {
        self.trigger(
            EventKind::UserUpdated {
                id: Some(id.to_string()),
                email: Some(email.to_string()),
            },
            true,
        )
        .await;
    }

    pub async fn config_updated(&self) {
        self.trigger(EventKind::ConfigUpdated, true).await;
    }

    pub async fn media_uploaded(&self) {
        self.trigger(EventKind::MediaUploaded, false).await;
    }
}

/// What a trigger call did.
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub event: CacheEvent,
    /// Present when the queue was consumed inline.
    pub report: Option<ConsumeReport>,
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::cache::config::CacheProfiles;
    use crate::cache::registry::CacheRegistry;

    fn trigger(enabled: bool) -> (CacheTrigger, Arc<CacheRegistry>, Arc<EventQueue>) {
        let config = CacheConfig {
            enabled,
            ..Default::default()
        };
        let registry = Arc::new(CacheRegistry::new(
            CacheProfiles::defaults(),
            NonZeroUsize::new(4096).expect("non-zero"),
            None,
        ));
        let queue = Arc::new(EventQueue::default());
        let consumer = Arc::new(CacheConsumer::new(
            config.clone(),
            registry.clone(),
            queue.clone(),
        ));
        (
            CacheTrigger::new(config, queue.clone(), consumer),
            registry,
            queue,
        )
    }

    #[tokio::test]
    async fn disabled_trigger_is_noop() {
        let (trigger, _, queue) = trigger(false);
        assert!(trigger.trigger(EventKind::ConfigUpdated, false).await.is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn deferred_trigger_leaves_event_queued() {
        let (trigger, _, queue) = trigger(true);
        trigger.media_uploaded().await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn immediate_trigger_consumes() {
        let (trigger, registry, queue) = trigger(true);
        let user = registry.service("user");
        user.set("user:id:7", &"alice").await;
        user.set("user:email:a@b.c", &"alice").await;

        trigger.user_updated("7", "a@b.c").await;

        assert!(queue.is_empty());
        assert!(!user.has("user:id:7").await);
        assert!(!user.has("user:email:a@b.c").await);
    }

    #[tokio::test]
    async fn outcome_reports_consumption() {
        let (trigger, _, _) = trigger(true);
        let outcome = trigger
            .trigger(EventKind::ConfigUpdated, true)
            .await
            .expect("enabled");
        assert_eq!(outcome.event.kind, EventKind::ConfigUpdated);
        assert_eq!(outcome.report.map(|r| r.events), Some(1));
    }
}
