//! Namespace-keyed registry of cache services.
//!
//! Services are created lazily from the configured profiles and share one
//! durable tier. The registry is passed around through application state.

use std::collections::{BTreeMap, btree_map::Entry};
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use super::config::{CacheConfig, CacheProfiles};
use super::keys::KeyPattern;
use super::kv::KvStore;
use super::lock::RwLockExt;
use super::service::CacheService;
use super::stats::CacheStats;

pub struct CacheRegistry {
    profiles: CacheProfiles,
    memory_max_bytes: NonZeroUsize,
    kv: Option<Arc<dyn KvStore>>,
    services: RwLock<BTreeMap<String, Arc<CacheService>>>,
}

impl CacheRegistry {
    pub fn new(
        profiles: CacheProfiles,
        memory_max_bytes: NonZeroUsize,
        kv: Option<Arc<dyn KvStore>>,
    ) -> Self {
        Self {
            profiles,
            memory_max_bytes,
            kv,
            services: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &CacheConfig, kv: Option<Arc<dyn KvStore>>) -> Self {
        Self::new(config.profiles(), config.memory_max_bytes_non_zero(), kv)
    }

    pub fn profiles(&self) -> &CacheProfiles {
        &self.profiles
    }

    pub fn kv_backend(&self) -> Option<&'static str> {
        self.kv.as_ref().map(|kv| kv.name())
    }

    /// The service for `namespace`, created on first use.
    ///
    /// Repeated calls return the same instance.
    pub fn service(&self, namespace: &str) -> Arc<CacheService> {
        if let Some(service) = self.services.read_or_recover("registry.service").get(namespace) {
            return Arc::clone(service);
        }

        let mut services = self.services.write_or_recover("registry.service");
        match services.entry(namespace.to_string()) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(vacant) => {
                let service = Arc::new(CacheService::new(
                    self.profiles.get(namespace),
                    self.memory_max_bytes,
                    self.kv.clone(),
                ));
                info!(namespace, "Cache service created");
                Arc::clone(vacant.insert(service))
            }
        }
    }

    /// An already-created service, without creating one.
    pub fn existing(&self, namespace: &str) -> Option<Arc<CacheService>> {
        self.services
            .read_or_recover("registry.existing")
            .get(namespace)
            .cloned()
    }

    /// Live services ordered by namespace.
    pub fn services(&self) -> Vec<Arc<CacheService>> {
        self.services
            .read_or_recover("registry.services")
            .values()
            .cloned()
            .collect()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.services
            .read_or_recover("registry.namespaces")
            .keys()
            .cloned()
            .collect()
    }

    /// Clear every live service. Returns how many were cleared.
    pub async fn clear_all(&self) -> usize {
        let services = self.services();
        for service in &services {
            service.clear().await;
        }
        info!(namespaces = services.len(), "All caches cleared");
        services.len()
    }

    pub fn all_stats(&self) -> BTreeMap<String, CacheStats> {
        self.services()
            .into_iter()
            .map(|service| (service.namespace().to_string(), service.stats()))
            .collect()
    }

    /// Invalidate `pattern` in one namespace or, with `None`, everywhere.
    ///
    /// The global form also sweeps durable-tier keys that no live service
    /// owns, so keys written by other processes are reachable too.
    pub async fn invalidate(&self, namespace: Option<&str>, pattern: &KeyPattern) -> usize {
        if let Some(namespace) = namespace {
            return self.service(namespace).invalidate_matching(pattern).await;
        }

        let mut removed = 0;
        for service in self.services() {
            removed += service.invalidate_matching(pattern).await;
        }
        removed + self.sweep_kv(pattern).await
    }

    async fn sweep_kv(&self, pattern: &KeyPattern) -> usize {
        let Some(kv) = self.kv.as_ref() else {
            return 0;
        };

        let keys = match kv.list(pattern.literal_prefix()).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(pattern = %pattern, error = %err, "KV listing failed during sweep");
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys.iter().filter(|key| pattern.matches(key)) {
            match kv.delete(key).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(key = %key, error = %err, "KV delete failed during sweep"),
            }
        }
        removed
    }
}
