//! Durable key-value tier contract and the in-process implementation.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use super::config::clamp_ttl;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {message}")]
    Backend { message: String },
    #[error("kv value could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("kv backend unavailable: {message}")]
    Unavailable { message: String },
}

impl KvError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// A value read from the durable tier.
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    pub value: Value,
    /// Time left before the backend expires the key, when it knows.
    pub ttl: Option<Duration>,
}

/// Durable tier shared across processes.
///
/// Implementations must treat expired keys as absent. Callers never see a
/// stale value past its TTL.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError>;

    async fn put(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Live keys starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at: Instant,
}

/// In-process durable tier for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: DashMap<String, StoredValue>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired keys. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        let now = Instant::now();
        let entry = match self.entries.get(key) {
            Some(stored) if stored.expires_at > now => Some(KvEntry {
                value: stored.value.clone(),
                ttl: Some(stored.expires_at.saturating_duration_since(now)),
            }),
            Some(_) => None,
            None => return Ok(None),
        };

        if entry.is_none() {
            self.entries.remove_if(key, |_, stored| stored.expires_at <= now);
        }
        Ok(entry)
    }

    async fn put(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), KvError> {
        let now = Instant::now();
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.clone(),
                expires_at: now.checked_add(clamp_ttl(ttl)).unwrap_or(now),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().expires_at > now)
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
