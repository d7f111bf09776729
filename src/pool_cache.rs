//! The Storage-Pool Name Cache: a bounded map from opaque pool id to the
//! human-readable pool name used inside ledger keys.
//!
//! Wraps a `HashMap`-like structure behind a `tokio::sync::Mutex` and exposes async accessors
//! rather than taking a blocking lock. The fixed-capacity, evict-oldest bound comes from the
//! `lru` crate rather than a hand-rolled eviction list.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;

use crate::error::ProxyError;

const CAPACITY: usize = 100;

/// Per-array lookup of pool id -> pool name, invoked only on a cache miss: fetch all pools from
/// the array, populate the cache, then return the requested name.
#[async_trait]
pub trait PoolLoader: Send + Sync {
    async fn load_pools(&self) -> Result<Vec<(String, String)>, ProxyError>;
}

/// Bounded LRU cache, keyed by `(system_id, pool_id)` so one process-wide cache can serve every
/// BackendSystem without cross-array collisions.
pub struct PoolNameCache {
    inner: Mutex<LruCache<(String, String), String>>,
}

impl Default for PoolNameCache {
    fn default() -> Self {
        PoolNameCache {
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(CAPACITY).unwrap())),
        }
    }
}

impl PoolNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `pool_id`'s name for `system_id`, loading the full pool list from `loader` on a
    /// miss and populating every entry it returns.
    pub async fn resolve(
        &self,
        system_id: &str,
        pool_id: &str,
        loader: &dyn PoolLoader,
    ) -> Result<String, ProxyError> {
        {
            let mut cache = self.inner.lock().await;
            if let Some(name) = cache.get(&(system_id.to_string(), pool_id.to_string())) {
                return Ok(name.clone());
            }
        }

        let pools = loader.load_pools().await?;
        let mut cache = self.inner.lock().await;
        let mut found = None;
        for (id, name) in pools {
            if id == pool_id {
                found = Some(name.clone());
            }
            cache.put((system_id.to_string(), id), name);
        }

        found.ok_or_else(|| ProxyError::PoolLookup(format!("pool '{pool_id}' not found on system '{system_id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLoader(Vec<(String, String)>);

    #[async_trait]
    impl PoolLoader for FixedLoader {
        async fn load_pools(&self) -> Result<Vec<(String, String)>, ProxyError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn resolves_and_caches_on_miss() {
        let cache = PoolNameCache::new();
        let loader = FixedLoader(vec![("3df6b86600000000".into(), "mypool".into())]);

        let name = cache.resolve("sys0", "3df6b86600000000", &loader).await.unwrap();
        assert_eq!(name, "mypool");

        struct PanicLoader;
        #[async_trait]
        impl PoolLoader for PanicLoader {
            async fn load_pools(&self) -> Result<Vec<(String, String)>, ProxyError> {
                panic!("should not be called on a cache hit")
            }
        }
        let name = cache.resolve("sys0", "3df6b86600000000", &PanicLoader).await.unwrap();
        assert_eq!(name, "mypool");
    }

    #[tokio::test]
    async fn unknown_pool_errors() {
        let cache = PoolNameCache::new();
        let loader = FixedLoader(vec![]);
        assert!(cache.resolve("sys0", "missing", &loader).await.is_err());
    }

    #[tokio::test]
    async fn distinguishes_same_pool_id_across_systems() {
        let cache = PoolNameCache::new();
        let loader_a = FixedLoader(vec![("p1".into(), "a-name".into())]);
        let loader_b = FixedLoader(vec![("p1".into(), "b-name".into())]);

        assert_eq!(cache.resolve("sysA", "p1", &loader_a).await.unwrap(), "a-name");
        assert_eq!(cache.resolve("sysB", "p1", &loader_b).await.unwrap(), "b-name");
    }
}
