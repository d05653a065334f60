//! Process-local memory tier.
//!
//! Holds serialized values behind an LRU bounded by a byte budget. Each entry
//! carries its own deadline; expired entries read as absent and are dropped
//! on access.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::config::clamp_ttl;
use super::keys::KeyPattern;
use super::lock::MutexExt;

const METRIC_MEMORY_EVICT_TOTAL: &str = "strata_cache_memory_evict_total";

#[derive(Debug)]
struct MemoryEntry {
    value: Arc<Value>,
    stored_at: Instant,
    expires_at: Instant,
    size: usize,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

struct Inner {
    entries: LruCache<String, MemoryEntry>,
    bytes: usize,
}

impl Inner {
    fn pop(&mut self, key: &str) -> Option<MemoryEntry> {
        let entry = self.entries.pop(key)?;
        self.bytes = self.bytes.saturating_sub(entry.size);
        Some(entry)
    }
}

/// A live value read from the memory tier.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub value: Arc<Value>,
    pub remaining: Duration,
}

/// Metadata about one stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntryInfo {
    pub key: String,
    pub size: usize,
    pub remaining: Duration,
    pub age: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub bytes: usize,
    pub entries: usize,
}

/// Byte-bounded LRU of JSON values with per-entry expiry.
pub struct MemoryStore {
    namespace: String,
    max_bytes: NonZeroUsize,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(namespace: impl Into<String>, max_bytes: NonZeroUsize) -> Self {
        Self {
            namespace: namespace.into(),
            max_bytes,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes.get()
    }

    /// Read a live entry and mark it most recently used.
    pub fn get(&self, key: &str) -> Option<MemoryHit> {
        let now = Instant::now();
        let mut inner = self.inner.lock_or_recover("memory.get");

        if inner.entries.peek(key)?.is_expired(now) {
            inner.pop(key);
            return None;
        }

        let entry = inner.entries.get(key)?;
        Some(MemoryHit {
            value: Arc::clone(&entry.value),
            remaining: entry.remaining(now),
        })
    }

    /// Metadata for a live entry without touching recency.
    pub fn entry(&self, key: &str) -> Option<MemoryEntryInfo> {
        let now = Instant::now();
        let inner = self.inner.lock_or_recover("memory.entry");
        let entry = inner.entries.peek(key)?;
        if entry.is_expired(now) {
            return None;
        }
        Some(MemoryEntryInfo {
            key: key.to_string(),
            size: entry.size,
            remaining: entry.remaining(now),
            age: now.saturating_duration_since(entry.stored_at),
        })
    }

    /// Store a value, evicting least-recently-used entries until it fits.
    ///
    /// Returns `false` when the value alone exceeds the budget. Any previous
    /// value under `key` is removed either way.
    pub fn insert(&self, key: &str, value: Arc<Value>, size: usize, ttl: Duration) -> bool {
        let now = Instant::now();
        let budget = self.max_bytes.get();
        let mut inner = self.inner.lock_or_recover("memory.insert");

        inner.pop(key);

        if size > budget {
            debug!(
                namespace = %self.namespace,
                key,
                size,
                budget,
                "Value exceeds memory budget; not stored"
            );
            return false;
        }

        let mut evicted = 0_u64;
        while inner.bytes + size > budget {
            match inner.entries.pop_lru() {
                Some((_, entry)) => {
                    inner.bytes = inner.bytes.saturating_sub(entry.size);
                    evicted += 1;
                }
                None => break,
            }
        }

        inner.entries.put(
            key.to_string(),
            MemoryEntry {
                value,
                stored_at: now,
                expires_at: now.checked_add(clamp_ttl(ttl)).unwrap_or(now),
                size,
            },
        );
        inner.bytes += size;
        drop(inner);

        if evicted > 0 {
            counter!(METRIC_MEMORY_EVICT_TOTAL, "namespace" => self.namespace.clone())
                .increment(evicted);
            debug!(namespace = %self.namespace, evicted, "Evicted memory entries");
        }
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock_or_recover("memory.remove").pop(key).is_some()
    }

    /// Remove every key matching `pattern`, live or expired. Returns the
    /// removed keys.
    pub fn remove_matching(&self, pattern: &KeyPattern) -> Vec<String> {
        let mut inner = self.inner.lock_or_recover("memory.remove_matching");
        let doomed: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            inner.pop(key);
        }
        doomed
    }

    /// Drop everything. Returns the number of entries removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock_or_recover("memory.clear");
        let count = inner.entries.len();
        inner.entries.clear();
        inner.bytes = 0;
        count
    }

    pub fn stats(&self) -> MemoryStats {
        let inner = self.inner.lock_or_recover("memory.stats");
        MemoryStats {
            bytes: inner.bytes,
            entries: inner.entries.len(),
        }
    }

    /// Live entries, newest first.
    pub fn snapshot(&self) -> Vec<MemoryEntryInfo> {
        let now = Instant::now();
        let inner = self.inner.lock_or_recover("memory.snapshot");
        let mut entries: Vec<(Instant, MemoryEntryInfo)> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| {
                (
                    entry.stored_at,
                    MemoryEntryInfo {
                        key: key.clone(),
                        size: entry.size,
                        remaining: entry.remaining(now),
                        age: now.saturating_duration_since(entry.stored_at),
                    },
                )
            })
            .collect();
        drop(inner);

        entries.sort_by(|(a, _), (b, _)| b.cmp(a));
        entries.into_iter().map(|(_, info)| info).collect()
    }
}
