//! Cache-aside facade over the memory and durable tiers.
//!
//! One `CacheService` serves one profile. Reads go memory first, then KV;
//! a KV hit is copied back into memory. Writes go to every enabled tier.
//! Tier failures are logged and absorbed: the cache can make a request
//! slower, never make it fail.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::config::CacheProfile;
use super::flight::InFlightLoads;
use super::keys::{KeyPattern, cache_pattern, generate_cache_key};
use super::kv::KvStore;
use super::memory::{MemoryEntryInfo, MemoryStore};
use super::stats::{CacheStats, StatsRecorder};

/// Which tier answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Memory,
    Kv,
    Miss,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSource::Memory => "memory",
            CacheSource::Kv => "kv",
            CacheSource::Miss => "miss",
        }
    }
}

impl std::fmt::Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`CacheService::get_with_source`].
///
/// `hit` is always `data.is_some()`, and `ttl` is `None` on a miss.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<T> {
    pub hit: bool,
    pub data: Option<T>,
    pub source: CacheSource,
    pub ttl: Option<Duration>,
}

impl<T> CacheResult<T> {
    pub fn miss() -> Self {
        Self {
            hit: false,
            data: None,
            source: CacheSource::Miss,
            ttl: None,
        }
    }

    fn hit(data: T, source: CacheSource, ttl: Option<Duration>) -> Self {
        Self {
            hit: true,
            data: Some(data),
            source,
            ttl,
        }
    }
}

/// Where and how an entry is stored, for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryInfo {
    pub key: String,
    pub source: CacheSource,
    pub size: usize,
    pub ttl: Option<Duration>,
    /// Only known for memory entries.
    pub age: Option<Duration>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Probe {
    Counted,
    Silent,
}

struct RawHit {
    value: Arc<Value>,
    source: CacheSource,
    ttl: Option<Duration>,
}

pub struct CacheService {
    profile: CacheProfile,
    /// `{key_prefix}:`, or empty for prefix-less profiles.
    scope: String,
    memory: MemoryStore,
    kv: Option<Arc<dyn KvStore>>,
    stats: StatsRecorder,
    loads: InFlightLoads,
}

impl CacheService {
    pub fn new(
        profile: CacheProfile,
        memory_max_bytes: NonZeroUsize,
        kv: Option<Arc<dyn KvStore>>,
    ) -> Self {
        let kv = kv.filter(|_| profile.kv_enabled);
        let scope = if profile.key_prefix.is_empty() {
            String::new()
        } else {
            format!("{}:", profile.key_prefix)
        };
        Self {
            scope,
            memory: MemoryStore::new(profile.namespace.clone(), memory_max_bytes),
            stats: StatsRecorder::new(profile.namespace.clone()),
            loads: InFlightLoads::new(),
            kv,
            profile,
        }
    }

    pub fn profile(&self) -> &CacheProfile {
        &self.profile
    }

    pub fn namespace(&self) -> &str {
        &self.profile.namespace
    }

    /// Name of the durable tier in use, if any.
    pub fn kv_backend(&self) -> Option<&'static str> {
        self.kv.as_ref().map(|kv| kv.name())
    }

    /// Key for `kind`/`identifier` under this profile's prefix and version.
    pub fn generate_key(&self, kind: &str, identifier: &str) -> String {
        generate_cache_key(
            &self.profile.key_prefix,
            kind,
            identifier,
            self.profile.version.as_deref(),
        )
    }

    /// Pattern covering every key of `kind`, or the whole namespace.
    pub fn namespace_pattern(&self, kind: Option<&str>) -> String {
        match (self.profile.key_prefix.as_str(), kind) {
            ("", Some(kind)) => format!("{kind}:*"),
            ("", None) => "*".to_string(),
            (prefix, kind) => cache_pattern(prefix, kind, None),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_with_source(key).await.data
    }

    pub async fn get_with_source<T: DeserializeOwned>(&self, key: &str) -> CacheResult<T> {
        self.read(key, Probe::Counted).await
    }

    async fn read<T: DeserializeOwned>(&self, key: &str, probe: Probe) -> CacheResult<T> {
        if probe == Probe::Counted {
            self.stats.request();
        }

        let Some(raw) = self.lookup(key, probe).await else {
            return CacheResult::miss();
        };

        match T::deserialize(&*raw.value) {
            Ok(data) => CacheResult::hit(data, raw.source, raw.ttl),
            Err(err) => {
                warn!(
                    namespace = %self.profile.namespace,
                    key,
                    source = %raw.source,
                    error = %err,
                    "Cached value has unexpected shape; treating as miss"
                );
                CacheResult::miss()
            }
        }
    }

    async fn lookup(&self, key: &str, probe: Probe) -> Option<RawHit> {
        let counted = probe == Probe::Counted;

        if self.profile.memory_enabled {
            if let Some(hit) = self.memory.get(key) {
                if counted {
                    self.stats.memory_hit();
                }
                return Some(RawHit {
                    value: hit.value,
                    source: CacheSource::Memory,
                    ttl: Some(hit.remaining),
                });
            }
            if counted {
                self.stats.memory_miss();
            }
        }

        let kv = self.kv.as_ref()?;
        match kv.get(key).await {
            Ok(Some(entry)) => {
                if counted {
                    self.stats.kv_hit();
                }
                let value = Arc::new(entry.value);
                if self.profile.memory_enabled {
                    let ttl = entry.ttl.unwrap_or(self.profile.ttl);
                    self.memory
                        .insert(key, Arc::clone(&value), encoded_len(&value), ttl);
                }
                Some(RawHit {
                    value,
                    source: CacheSource::Kv,
                    ttl: entry.ttl,
                })
            }
            Ok(None) => {
                if counted {
                    self.stats.kv_miss();
                }
                None
            }
            Err(err) => {
                if counted {
                    self.stats.kv_error();
                    self.stats.kv_miss();
                }
                warn!(
                    namespace = %self.profile.namespace,
                    key,
                    backend = kv.name(),
                    error = %err,
                    "KV read failed; treating as miss"
                );
                None
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        self.set_with_ttl(key, value, self.profile.ttl).await;
    }

    pub async fn set_with_ttl<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_value(value) {
            Ok(value) => self.store(key, value, ttl).await,
            Err(err) => warn!(
                namespace = %self.profile.namespace,
                key,
                error = %err,
                "Value could not be serialized; not cached"
            ),
        }
    }

    async fn store(&self, key: &str, value: Value, ttl: Duration) {
        let value = Arc::new(value);

        if self.profile.memory_enabled {
            self.memory
                .insert(key, Arc::clone(&value), encoded_len(&value), ttl);
        }

        if let Some(kv) = self.kv.as_ref()
            && let Err(err) = kv.put(key, &value, ttl).await
        {
            self.stats.kv_error();
            warn!(
                namespace = %self.profile.namespace,
                key,
                backend = kv.name(),
                error = %err,
                "KV write failed"
            );
        }
    }

    /// Remove `key` from every tier. Absent keys are fine.
    pub async fn delete(&self, key: &str) {
        self.memory.remove(key);

        if let Some(kv) = self.kv.as_ref()
            && let Err(err) = kv.delete(key).await
        {
            self.stats.kv_error();
            warn!(
                namespace = %self.profile.namespace,
                key,
                backend = kv.name(),
                error = %err,
                "KV delete failed"
            );
        }
    }

    /// Remove every key matching the glob `pattern` from both tiers.
    ///
    /// Returns the number of distinct keys removed. An invalid pattern is
    /// logged and removes nothing.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        match KeyPattern::new(pattern) {
            Ok(pattern) => self.invalidate_matching(&pattern).await,
            Err(err) => {
                warn!(
                    namespace = %self.profile.namespace,
                    pattern,
                    error = %err,
                    "Invalid invalidation pattern"
                );
                0
            }
        }
    }

    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        self.invalidate(pattern).await
    }

    #[instrument(skip(self, pattern), fields(namespace = %self.profile.namespace, pattern = %pattern))]
    pub async fn invalidate_matching(&self, pattern: &KeyPattern) -> usize {
        let mut removed: BTreeSet<String> =
            self.memory.remove_matching(pattern).into_iter().collect();

        if let Some(kv) = self.kv.as_ref()
            && let Some(prefix) = self.kv_scan_prefix(pattern.literal_prefix())
        {
            match kv.list(prefix).await {
                Ok(keys) => {
                    for key in keys.into_iter().filter(|key| pattern.matches(key)) {
                        match kv.delete(&key).await {
                            Ok(()) => {
                                removed.insert(key);
                            }
                            Err(err) => {
                                self.stats.kv_error();
                                warn!(key = %key, error = %err, "KV delete failed during invalidation");
                            }
                        }
                    }
                }
                Err(err) => {
                    self.stats.kv_error();
                    warn!(prefix, error = %err, "KV listing failed during invalidation");
                }
            }
        }

        info!(removed = removed.len(), "Cache pattern invalidated");
        removed.len()
    }

    /// Narrowest KV listing prefix covering both the pattern and this
    /// namespace. `None` when they cannot overlap.
    fn kv_scan_prefix<'a>(&'a self, literal: &'a str) -> Option<&'a str> {
        if literal.starts_with(self.scope.as_str()) {
            Some(literal)
        } else if self.scope.starts_with(literal) {
            Some(self.scope.as_str())
        } else {
            None
        }
    }

    /// Read-through with the profile TTL. See [`Self::get_or_set_with_ttl`].
    pub async fn get_or_set<T, E, F, Fut>(&self, key: &str, factory: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get_or_set_with_ttl(key, self.profile.ttl, factory).await
    }

    /// Return the cached value or load it with `factory` and cache it.
    ///
    /// Concurrent misses on one key share a single `factory` call: followers
    /// wait for the leader, then read what it stored. A factory error is
    /// returned unchanged and nothing is cached.
    pub async fn get_or_set_with_ttl<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        factory: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let _load = self.loads.acquire(key).await;
        if let Some(value) = self.read::<T>(key, Probe::Silent).await.data {
            debug!(namespace = %self.profile.namespace, key, "Coalesced read-through load");
            return Ok(value);
        }

        let value = factory().await?;
        self.stats.source_load();
        self.set_with_ttl(key, &value, ttl).await;
        Ok(value)
    }

    /// Whether a live entry exists in any tier. Not counted in stats.
    pub async fn has(&self, key: &str) -> bool {
        if self.profile.memory_enabled && self.memory.entry(key).is_some() {
            return true;
        }
        match self.kv.as_ref() {
            Some(kv) => match kv.get(key).await {
                Ok(entry) => entry.is_some(),
                Err(err) => {
                    self.stats.kv_error();
                    warn!(namespace = %self.profile.namespace, key, error = %err, "KV read failed");
                    false
                }
            },
            None => false,
        }
    }

    /// Fetch several keys. Misses are absent from the result.
    pub async fn get_many<T, K>(&self, keys: &[K]) -> HashMap<String, T>
    where
        T: DeserializeOwned,
        K: AsRef<str>,
    {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            let key = key.as_ref();
            if let Some(value) = self.get(key).await {
                found.insert(key.to_string(), value);
            }
        }
        found
    }

    pub async fn set_many<T: Serialize>(&self, entries: &[(String, T)]) {
        for (key, value) in entries {
            self.set(key, value).await;
        }
    }

    pub async fn delete_many<K: AsRef<str>>(&self, keys: &[K]) {
        for key in keys {
            self.delete(key.as_ref()).await;
        }
    }

    /// Seed the cache with known-hot entries. Returns how many were written.
    #[instrument(skip(self, entries), fields(namespace = %self.profile.namespace))]
    pub async fn warm<T: Serialize>(&self, entries: &[(String, T)]) -> usize {
        self.set_many(entries).await;
        info!(count = entries.len(), "Cache warmed");
        entries.len()
    }

    /// Empty the memory tier, reset statistics and remove this namespace's
    /// KV keys. Prefix-less profiles leave KV untouched.
    #[instrument(skip(self), fields(namespace = %self.profile.namespace))]
    pub async fn clear(&self) {
        let cleared = self.memory.clear();
        self.stats.reset();

        let mut kv_cleared = 0_usize;
        if let Some(kv) = self.kv.as_ref()
            && !self.scope.is_empty()
        {
            match kv.list(&self.scope).await {
                Ok(keys) => {
                    for key in keys {
                        match kv.delete(&key).await {
                            Ok(()) => kv_cleared += 1,
                            Err(err) => {
                                self.stats.kv_error();
                                warn!(key = %key, error = %err, "KV delete failed during clear");
                            }
                        }
                    }
                }
                Err(err) => {
                    self.stats.kv_error();
                    warn!(error = %err, "KV listing failed during clear");
                }
            }
        }

        info!(memory = cleared, kv = kv_cleared, "Cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot(self.memory.stats())
    }

    /// Live memory entries, newest first.
    pub fn list_keys(&self) -> Vec<MemoryEntryInfo> {
        self.memory.snapshot()
    }

    /// Storage metadata for `key`, memory tier first.
    pub async fn entry(&self, key: &str) -> Option<CacheEntryInfo> {
        if self.profile.memory_enabled
            && let Some(info) = self.memory.entry(key)
        {
            return Some(CacheEntryInfo {
                key: info.key,
                source: CacheSource::Memory,
                size: info.size,
                ttl: Some(info.remaining),
                age: Some(info.age),
            });
        }

        let kv = self.kv.as_ref()?;
        match kv.get(key).await {
            Ok(entry) => entry.map(|entry| CacheEntryInfo {
                key: key.to_string(),
                source: CacheSource::Kv,
                size: encoded_len(&entry.value),
                ttl: entry.ttl,
                age: None,
            }),
            Err(err) => {
                self.stats.kv_error();
                warn!(namespace = %self.profile.namespace, key, error = %err, "KV read failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("namespace", &self.profile.namespace)
            .field("kv_backend", &self.kv_backend())
            .finish_non_exhaustive()
    }
}

/// Size estimate used for the memory budget: the JSON encoding length.
fn encoded_len(value: &Value) -> usize {
    serde_json::to_vec(value).map_or(0, |bytes| bytes.len())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::cache::kv::MemoryKv;

    fn service_with(profile: CacheProfile, kv: Option<Arc<dyn KvStore>>) -> CacheService {
        CacheService::new(profile, NonZeroUsize::new(1024 * 1024).expect("non-zero"), kv)
    }

    fn content() -> CacheProfile {
        CacheProfile::new("content", Duration::from_secs(300))
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Post {
        id: u32,
        title: String,
    }

    #[test]
    fn generate_key_uses_profile_prefix_and_version() {
        let service = service_with(content(), None);
        assert_eq!(service.generate_key("item", "42"), "content:item:42");

        let bare = service_with(content().with_key_prefix(""), None);
        assert_eq!(bare.generate_key("content", "abc123"), "content:abc123");

        let versioned = service_with(content().with_version("v1"), None);
        assert_eq!(versioned.generate_key("post", "123"), "content:post:123:v1");
    }

    #[tokio::test(start_paused = true)]
    async fn kv_hit_repopulates_memory() {
        let kv = Arc::new(MemoryKv::new());
        kv.put("content:item:1", &json!({"id": 1, "title": "t"}), Duration::from_secs(100))
            .await
            .expect("put");
        let service = service_with(content(), Some(kv));

        let first: CacheResult<Post> = service.get_with_source("content:item:1").await;
        assert_eq!(first.source, CacheSource::Kv);
        assert_eq!(first.ttl, Some(Duration::from_secs(100)));

        let second: CacheResult<Post> = service.get_with_source("content:item:1").await;
        assert_eq!(second.source, CacheSource::Memory);
        assert!(second.hit);
    }

    #[tokio::test(start_paused = true)]
    async fn shape_mismatch_reads_as_miss() {
        let service = service_with(content(), None);
        service.set("k", &json!("not a post")).await;
        let result: CacheResult<Post> = service.get_with_source("k").await;
        assert_eq!(result, CacheResult::miss());
    }

    #[tokio::test(start_paused = true)]
    async fn memory_only_profile_skips_kv() {
        let kv = Arc::new(MemoryKv::new());
        let service = service_with(content().memory_only(), Some(kv.clone()));
        service.set("content:item:1", &1).await;
        assert!(kv.is_empty());
        assert_eq!(service.kv_backend(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_counts_distinct_keys_across_tiers() {
        let kv = Arc::new(MemoryKv::new());
        let service = service_with(content(), Some(kv.clone()));
        service.set("content:item:1", &1).await;
        service.set("content:list:all", &[1]).await;
        kv.put("content:item:2", &json!(2), Duration::from_secs(60))
            .await
            .expect("put");
        kv.put("api:item:1", &json!(2), Duration::from_secs(60))
            .await
            .expect("put");

        assert_eq!(service.invalidate("content:*").await, 3);
        assert_eq!(kv.len(), 1);
        assert_eq!(service.invalidate("").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wide_pattern_stays_inside_namespace_in_kv() {
        let kv = Arc::new(MemoryKv::new());
        let service = service_with(content(), Some(kv.clone()));
        kv.put("api:item:1", &json!(1), Duration::from_secs(60))
            .await
            .expect("put");
        kv.put("content:item:1", &json!(1), Duration::from_secs(60))
            .await
            .expect("put");

        assert_eq!(service.invalidate("*").await, 1);
        assert!(kv.get("api:item:1").await.expect("get").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn get_or_set_error_caches_nothing() {
        let service = service_with(content(), None);
        let calls = AtomicUsize::new(0);

        let result: Result<u32, &str> = service
            .get_or_set("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("source down")
            })
            .await;
        assert_eq!(result, Err("source down"));
        assert!(!service.has("k").await);

        let loaded: Result<u32, &str> = service.get_or_set("k", || async { Ok(7) }).await;
        assert_eq!(loaded, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.stats().source_loads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_resets_stats_and_namespace_kv() {
        let kv = Arc::new(MemoryKv::new());
        let service = service_with(content(), Some(kv.clone()));
        service.set("content:item:1", &1).await;
        let _ = service.get::<u32>("content:item:1").await;
        kv.put("api:item:1", &json!(1), Duration::from_secs(60))
            .await
            .expect("put");

        service.clear().await;

        let stats = service.stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.entry_count, 0);
        assert_eq!(kv.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_reports_memory_then_kv() {
        let kv = Arc::new(MemoryKv::new());
        let service = service_with(content(), Some(kv.clone()));
        service.set("content:item:1", &json!({"id": 1})).await;

        tokio::time::advance(Duration::from_secs(5)).await;
        let info = service.entry("content:item:1").await.expect("entry");
        assert_eq!(info.source, CacheSource::Memory);
        assert_eq!(info.ttl, Some(Duration::from_secs(295)));
        assert_eq!(info.age, Some(Duration::from_secs(5)));
        assert_eq!(info.size, r#"{"id":1}"#.len());

        kv.put("content:item:2", &json!(2), Duration::from_secs(60))
            .await
            .expect("put");
        let info = service.entry("content:item:2").await.expect("entry");
        assert_eq!(info.source, CacheSource::Kv);
        assert_eq!(info.age, None);
    }

    #[tokio::test(start_paused = true)]
    async fn many_operations() {
        let service = service_with(content(), None);
        service
            .set_many(&[("a".to_string(), 1_u32), ("b".to_string(), 2_u32)])
            .await;

        let found: HashMap<String, u32> = service.get_many(&["a", "b", "c"]).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found["b"], 2);

        service.delete_many(&["a", "b"]).await;
        assert!(service.list_keys().is_empty());
    }
}
