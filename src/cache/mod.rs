//! Strata cache system.
//!
//! A cache-aside layer for headless CMS reads:
//!
//! - **Memory tier**: per-namespace LRU bounded by bytes, with per-entry TTL
//! - **KV tier**: durable store shared between processes ([`KvStore`])
//!
//! Call sites pick a profile (`content`, `api`, `user`, ...) through the
//! [`CacheRegistry`] and read/write through the returned [`CacheService`].
//! Writes elsewhere in the CMS publish [`EventKind`]s that the
//! [`CacheConsumer`] turns into invalidations.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! memory_max_bytes = 52428800
//! kv_backend = "memory"
//!
//! [cache.profiles.content]
//! ttl_seconds = 120
//! ```

mod config;
mod consumer;
mod events;
mod flight;
mod keys;
mod kv;
mod lock;
mod memory;
mod meta;
mod planner;
mod registry;
mod service;
mod stats;
mod trigger;
mod warming;

pub use config::{
    CacheConfig, CacheProfile, CacheProfiles, FALLBACK_TTL, KvBackend, MAX_TTL, ProfileOverride,
    clamp_ttl, namespaces,
};
pub use consumer::{CacheConsumer, ConsumeReport};
pub use events::{CacheEvent, Epoch, EventKind, EventQueue};
pub use keys::{
    KeyPattern, ParsedKey, PatternError, cache_pattern, generate_cache_key, hash_query_params,
    parse_cache_key,
};
pub use kv::{KvEntry, KvError, KvStore, MemoryKv};
pub use memory::{MemoryEntryInfo, MemoryStats};
pub use meta::{CacheMeta, HEADER_CACHE_SOURCE, HEADER_CACHE_STATUS, HEADER_CACHE_TTL};
pub use planner::{InvalidationPlan, Target};
pub use registry::CacheRegistry;
pub use service::{CacheEntryInfo, CacheResult, CacheService, CacheSource};
pub use stats::CacheStats;
pub use trigger::{CacheTrigger, TriggerOutcome};
pub use warming::{
    StaticWarmSource, WarmDetail, WarmError, WarmReport, WarmSource, preload, warm_common_caches,
    warm_namespace,
};
