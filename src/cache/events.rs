//! Cache events.
//!
//! Write paths publish what changed; the consumer turns batches of events
//! into invalidations. The queue is bounded: when full, the oldest pending
//! event is dropped and counted.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::lock::MutexExt;

const METRIC_EVENT_QUEUE_LEN: &str = "strata_cache_event_queue_len";
const METRIC_EVENT_DROPPED_TOTAL: &str = "strata_cache_event_dropped_total";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: EventKind,
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// A change in the CMS that can make cached data stale.
///
/// Serialized with an `event` tag holding the dotted event name, e.g.
/// `{"event": "content.update", "id": "42"}`. Payload fields are optional:
/// without them only the pattern-level targets of the event apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EventKind {
    #[serde(rename = "content.create")]
    ContentCreated,
    #[serde(rename = "content.update")]
    ContentUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename = "content.delete")]
    ContentDeleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename = "content.publish")]
    ContentPublished,

    #[serde(rename = "user.update")]
    UserUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
    #[serde(rename = "user.delete")]
    UserDeleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },

    #[serde(rename = "auth.login")]
    AuthLogin {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    #[serde(rename = "auth.logout")]
    AuthLogout {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    #[serde(rename = "config.update")]
    ConfigUpdated,

    #[serde(rename = "plugin.activate")]
    PluginActivated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plugin_id: Option<String>,
    },
    #[serde(rename = "plugin.deactivate")]
    PluginDeactivated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plugin_id: Option<String>,
    },
    #[serde(rename = "plugin.update")]
    PluginUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plugin_id: Option<String>,
    },

    #[serde(rename = "media.upload")]
    MediaUploaded,
    #[serde(rename = "media.update")]
    MediaUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename = "media.delete")]
    MediaDeleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    #[serde(rename = "collection.create")]
    CollectionCreated,
    #[serde(rename = "collection.update")]
    CollectionUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename = "collection.delete")]
    CollectionDeleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ContentCreated => "content.create",
            EventKind::ContentUpdated { .. } => "content.update",
            EventKind::ContentDeleted { .. } => "content.delete",
            EventKind::ContentPublished => "content.publish",
            EventKind::UserUpdated { .. } => "user.update",
            EventKind::UserDeleted { .. } => "user.delete",
            EventKind::AuthLogin { .. } => "auth.login",
            EventKind::AuthLogout { .. } => "auth.logout",
            EventKind::ConfigUpdated => "config.update",
            EventKind::PluginActivated { .. } => "plugin.activate",
            EventKind::PluginDeactivated { .. } => "plugin.deactivate",
            EventKind::PluginUpdated { .. } => "plugin.update",
            EventKind::MediaUploaded => "media.upload",
            EventKind::MediaUpdated { .. } => "media.update",
            EventKind::MediaDeleted { .. } => "media.delete",
            EventKind::CollectionCreated => "collection.create",
            EventKind::CollectionUpdated { .. } => "collection.update",
            EventKind::CollectionDeleted { .. } => "collection.delete",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

struct Queues {
    pending: VecDeque<CacheEvent>,
    recent: VecDeque<CacheEvent>,
}

/// Bounded in-memory event queue with a log of recently published events.
pub struct EventQueue {
    queues: Mutex<Queues>,
    epoch_counter: AtomicU64,
    dropped: AtomicU64,
    limit: NonZeroUsize,
    log_limit: usize,
}

impl EventQueue {
    pub fn new(limit: NonZeroUsize, log_limit: usize) -> Self {
        Self {
            queues: Mutex::new(Queues {
                pending: VecDeque::new(),
                recent: VecDeque::with_capacity(log_limit),
            }),
            epoch_counter: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            limit,
            log_limit,
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Enqueue an event. Returns the event as queued.
    pub fn publish(&self, kind: EventKind) -> CacheEvent {
        let epoch = self.next_epoch();
        let event = CacheEvent::new(kind, epoch);

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = %event.kind,
            "Cache event enqueued"
        );

        let mut queues = self.queues.lock_or_recover("events.publish");
        let mut dropped = 0_u64;
        while queues.pending.len() >= self.limit.get() {
            if let Some(oldest) = queues.pending.pop_front() {
                dropped += 1;
                warn!(
                    event_id = %oldest.id,
                    event_kind = %oldest.kind,
                    "Cache event queue full; dropped oldest event"
                );
            }
        }
        queues.pending.push_back(event.clone());

        if self.log_limit > 0 {
            if queues.recent.len() >= self.log_limit {
                queues.recent.pop_front();
            }
            queues.recent.push_back(event.clone());
        }
        let len = queues.pending.len();
        drop(queues);

        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
            counter!(METRIC_EVENT_DROPPED_TOTAL).increment(dropped);
        }
        gauge!(METRIC_EVENT_QUEUE_LEN).set(len as f64);
        event
    }

    /// Drain up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent> {
        let mut queues = self.queues.lock_or_recover("events.drain");
        let count = limit.min(queues.pending.len());
        let events: Vec<CacheEvent> = queues.pending.drain(..count).collect();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queues.pending.len() as f64);
        events
    }

    pub fn len(&self) -> usize {
        self.queues.lock_or_recover("events.len").pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Recently published events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<CacheEvent> {
        self.queues
            .lock_or_recover("events.recent")
            .recent
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.queues.lock_or_recover("events.clear").pending.clear();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(0.0);
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(1024).unwrap_or(NonZeroUsize::MIN), 100)
    }
}
