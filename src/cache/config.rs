//! Cache configuration and cache profiles.
//!
//! A profile is the per-purpose policy a call site selects (`api`, `content`,
//! `user`, ...): its key prefix, TTL and which tiers it writes to. Runtime
//! knobs for the whole cache live in [`CacheConfig`], populated from the
//! `[cache]` section of `strata.toml`.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_MEMORY_MAX_BYTES: usize = 50 * 1024 * 1024;
const DEFAULT_EVENT_QUEUE_LIMIT: usize = 1024;
const DEFAULT_EVENT_LOG_LIMIT: usize = 100;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 5000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_KV_PURGE_INTERVAL_SECS: u64 = 300;

/// TTL applied to namespaces that have no configured profile.
pub const FALLBACK_TTL: Duration = Duration::from_secs(3600);

/// Longest TTL any tier honours. Longer requests are shortened to this.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `ttl` capped at [`MAX_TTL`].
pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.min(MAX_TTL)
}

/// Namespaces with built-in profiles.
pub mod namespaces {
    pub const API: &str = "api";
    pub const USER: &str = "user";
    pub const CONTENT: &str = "content";
    pub const COLLECTION: &str = "collection";
    pub const MEDIA: &str = "media";
    pub const CONFIG: &str = "config";
    pub const SESSION: &str = "session";
    pub const PLUGIN: &str = "plugin";
}

/// Which durable key-value tier sits behind the memory tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvBackend {
    /// Memory tier only.
    None,
    /// In-process KV with per-key expiry.
    #[default]
    Memory,
    /// `cache_kv` table in Postgres.
    Postgres,
}

impl KvBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            KvBackend::None => "none",
            KvBackend::Memory => "memory",
            KvBackend::Postgres => "postgres",
        }
    }
}

/// Per-profile overrides from `[cache.profiles.<namespace>]`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProfileOverride {
    pub ttl_seconds: Option<u64>,
    pub memory_enabled: Option<bool>,
    pub kv_enabled: Option<bool>,
    pub key_prefix: Option<String>,
    pub version: Option<String>,
}

/// Cache configuration from `strata.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch. When off, triggers are no-ops and the admin API reports
    /// the cache as disabled.
    pub enabled: bool,
    /// Byte budget of each namespace's memory tier.
    pub memory_max_bytes: usize,
    /// Durable tier selection.
    pub kv_backend: KvBackend,
    /// Maximum pending invalidation events before the oldest are dropped.
    pub event_queue_limit: usize,
    /// Number of recent events kept for inspection.
    pub event_log_limit: usize,
    /// Auto-consume interval (ms) for queued invalidation events.
    pub auto_consume_interval_ms: u64,
    /// Maximum events per consumption batch.
    pub consume_batch_limit: usize,
    /// How often expired rows are purged from the Postgres tier.
    pub kv_purge_interval_secs: u64,
    pub profiles: BTreeMap<String, ProfileOverride>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_max_bytes: DEFAULT_MEMORY_MAX_BYTES,
            kv_backend: KvBackend::default(),
            event_queue_limit: DEFAULT_EVENT_QUEUE_LIMIT,
            event_log_limit: DEFAULT_EVENT_LOG_LIMIT,
            auto_consume_interval_ms: DEFAULT_AUTO_CONSUME_INTERVAL_MS,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            kv_purge_interval_secs: DEFAULT_KV_PURGE_INTERVAL_SECS,
            profiles: BTreeMap::new(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            memory_max_bytes: settings.memory_max_bytes.get(),
            kv_backend: settings.kv_backend,
            event_queue_limit: settings.event_queue_limit.get(),
            event_log_limit: settings.event_log_limit,
            auto_consume_interval_ms: settings.auto_consume_interval.as_millis() as u64,
            consume_batch_limit: settings.consume_batch_limit.get(),
            kv_purge_interval_secs: settings.kv_purge_interval.as_secs(),
            profiles: settings.profiles.clone(),
        }
    }
}

impl CacheConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Memory budget as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_max_bytes_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_max_bytes).unwrap_or(NonZeroUsize::MIN)
    }

    /// Event queue limit as NonZeroUsize, clamping to 1 if zero.
    pub fn event_queue_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.event_queue_limit).unwrap_or(NonZeroUsize::MIN)
    }

    /// Built-in profiles with the configured overrides applied.
    pub fn profiles(&self) -> CacheProfiles {
        let mut profiles = CacheProfiles::defaults();
        profiles.apply_overrides(&self.profiles);
        profiles
    }
}

/// Named cache policy selected per call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheProfile {
    pub namespace: String,
    /// First segment of every key generated through this profile. May be empty.
    pub key_prefix: String,
    pub ttl: Duration,
    pub memory_enabled: bool,
    pub kv_enabled: bool,
    /// Appended as the last key segment when set.
    pub version: Option<String>,
}

impl CacheProfile {
    pub fn new(namespace: impl Into<String>, ttl: Duration) -> Self {
        let namespace = namespace.into();
        Self {
            key_prefix: namespace.clone(),
            namespace,
            ttl,
            memory_enabled: true,
            kv_enabled: true,
            version: None,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn memory_only(mut self) -> Self {
        self.kv_enabled = false;
        self
    }

    pub fn kv_only(mut self) -> Self {
        self.memory_enabled = false;
        self
    }

    fn apply(&mut self, overrides: &ProfileOverride) {
        if let Some(seconds) = overrides.ttl_seconds {
            self.ttl = Duration::from_secs(seconds);
        }
        if let Some(enabled) = overrides.memory_enabled {
            self.memory_enabled = enabled;
        }
        if let Some(enabled) = overrides.kv_enabled {
            self.kv_enabled = enabled;
        }
        if let Some(prefix) = overrides.key_prefix.as_ref() {
            self.key_prefix = prefix.clone();
        }
        if let Some(version) = overrides.version.as_ref() {
            self.version = (!version.is_empty()).then(|| version.clone());
        }
    }
}

/// The process-wide set of cache profiles.
#[derive(Debug, Clone)]
pub struct CacheProfiles {
    profiles: BTreeMap<String, CacheProfile>,
}

impl CacheProfiles {
    pub fn defaults() -> Self {
        use namespaces::*;

        let builtin = [
            (API, 300),
            (USER, 600),
            (CONTENT, 300),
            (COLLECTION, 600),
            (MEDIA, 3600),
            (CONFIG, 3600),
            (SESSION, 1800),
            (PLUGIN, 3600),
        ];

        let profiles = builtin
            .into_iter()
            .map(|(namespace, secs)| {
                (
                    namespace.to_string(),
                    CacheProfile::new(namespace, Duration::from_secs(secs)),
                )
            })
            .collect();

        Self { profiles }
    }

    /// Profile for `namespace`, or a fallback profile with a one hour TTL.
    pub fn get(&self, namespace: &str) -> CacheProfile {
        self.profiles
            .get(namespace)
            .cloned()
            .unwrap_or_else(|| CacheProfile::new(namespace, FALLBACK_TTL))
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.profiles.contains_key(namespace)
    }

    pub fn insert(&mut self, profile: CacheProfile) {
        self.profiles.insert(profile.namespace.clone(), profile);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Merge configured overrides. Unknown namespaces become new profiles.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, ProfileOverride>) {
        for (namespace, profile_override) in overrides {
            let profile = self
                .profiles
                .entry(namespace.clone())
                .or_insert_with(|| CacheProfile::new(namespace.as_str(), FALLBACK_TTL));
            profile.apply(profile_override);
        }
    }
}

impl Default for CacheProfiles {
    fn default() -> Self {
        Self::defaults()
    }
}
