//! Fingerprint-keyed result caches and the cache builder registry.
//!
//! A [`DataKeyedCache`] derives a [`DataKey`] from the evidence an engine
//! consumes and uses it to query an underlying [`PutCache`]. Caches are built
//! by name through an explicit process-wide registry; the segmented LRU is
//! registered as `"lru"` before first use.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use pipeline_caching::{CacheStats, LruPutCache, PutCache};
use pipeline_core::{
    ConfigError, DataKey, ElementDataRef, EvidenceFingerprinter, EvidenceKeyFilter, FlowData,
    PipelineResult,
};

use crate::config::{CacheConfiguration, LRU_BUILDER};

/// Memoizes engine results per request fingerprint.
pub trait ResultCache: Send + Sync {
    /// Cached result for the flow data's fingerprint.
    fn get(&self, data: &FlowData) -> Option<ElementDataRef>;

    /// Store a result under the flow data's fingerprint.
    fn put(&self, data: &FlowData, value: ElementDataRef);

    /// Look up with a fingerprint computed earlier.
    fn get_by_key(&self, key: &DataKey) -> Option<ElementDataRef>;

    /// Store under a fingerprint computed earlier. Lazy engines use this so
    /// the key reflects the evidence at dispatch time.
    fn put_by_key(&self, key: DataKey, value: ElementDataRef);

    /// Fingerprint of the evidence this cache keys on.
    fn key_for(&self, data: &FlowData) -> DataKey;

    fn stats(&self) -> CacheStats;

    fn reset(&self);
}

/// A [`PutCache`] keyed by evidence fingerprints.
pub struct DataKeyedCache<V> {
    cache: Arc<dyn PutCache<DataKey, V>>,
    filter: Arc<dyn EvidenceKeyFilter>,
}

impl<V> Clone for DataKeyedCache<V> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            filter: self.filter.clone(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> DataKeyedCache<V> {
    pub fn new(cache: Arc<dyn PutCache<DataKey, V>>, filter: Arc<dyn EvidenceKeyFilter>) -> Self {
        Self { cache, filter }
    }

    /// Build over a segmented LRU cache.
    pub fn lru(
        config: &CacheConfiguration,
        filter: Arc<dyn EvidenceKeyFilter>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let cache: LruPutCache<DataKey, V> = LruPutCache::new(&config.lru_config())?;
        Ok(Self::new(Arc::new(cache), filter))
    }

    pub fn filter(&self) -> &Arc<dyn EvidenceKeyFilter> {
        &self.filter
    }

    pub fn key_for(&self, data: &FlowData) -> DataKey {
        self.filter.fingerprint(&data.evidence())
    }

    pub fn get(&self, data: &FlowData) -> Option<V> {
        self.cache.get(&self.key_for(data))
    }

    pub fn put(&self, data: &FlowData, value: V) {
        self.cache.put(self.key_for(data), value)
    }

    pub fn get_by_key(&self, key: &DataKey) -> Option<V> {
        self.cache.get(key)
    }

    pub fn put_by_key(&self, key: DataKey, value: V) {
        self.cache.put(key, value)
    }

    pub fn remove(&self, key: &DataKey) -> Option<V> {
        self.cache.remove(key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn reset(&self) {
        self.cache.reset()
    }
}

impl ResultCache for DataKeyedCache<ElementDataRef> {
    fn get(&self, data: &FlowData) -> Option<ElementDataRef> {
        DataKeyedCache::get(self, data)
    }

    fn put(&self, data: &FlowData, value: ElementDataRef) {
        DataKeyedCache::put(self, data, value)
    }

    fn get_by_key(&self, key: &DataKey) -> Option<ElementDataRef> {
        DataKeyedCache::get_by_key(self, key)
    }

    fn put_by_key(&self, key: DataKey, value: ElementDataRef) {
        DataKeyedCache::put_by_key(self, key, value)
    }

    fn key_for(&self, data: &FlowData) -> DataKey {
        DataKeyedCache::key_for(self, data)
    }

    fn stats(&self) -> CacheStats {
        DataKeyedCache::stats(self)
    }

    fn reset(&self) {
        DataKeyedCache::reset(self)
    }
}

impl<V> fmt::Debug for DataKeyedCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKeyedCache")
            .field("entries", &self.cache.len())
            .field("filter", &self.filter)
            .finish()
    }
}

// ============================================================================
// BUILDER REGISTRY
// ============================================================================

/// Storage backing a result cache.
pub type ResultStore = Arc<dyn PutCache<DataKey, ElementDataRef>>;

/// Builds result-cache storage from a configuration.
pub type CacheBuilder =
    Arc<dyn Fn(&CacheConfiguration) -> PipelineResult<ResultStore> + Send + Sync>;

static CACHE_BUILDERS: Lazy<RwLock<HashMap<String, CacheBuilder>>> = Lazy::new(|| {
    let mut builders: HashMap<String, CacheBuilder> = HashMap::new();
    builders.insert(LRU_BUILDER.to_string(), Arc::new(build_lru_store));
    RwLock::new(builders)
});

fn build_lru_store(config: &CacheConfiguration) -> PipelineResult<ResultStore> {
    let cache: LruPutCache<DataKey, ElementDataRef> = LruPutCache::new(&config.lru_config())?;
    Ok(Arc::new(cache))
}

/// Register a cache builder under `name`, replacing any existing one.
/// Names are case-insensitive.
pub fn register_cache_builder<F>(name: &str, builder: F)
where
    F: Fn(&CacheConfiguration) -> PipelineResult<ResultStore> + Send + Sync + 'static,
{
    let key = name.to_lowercase();
    let replaced = CACHE_BUILDERS
        .write()
        .insert(key.clone(), Arc::new(builder))
        .is_some();
    info!(builder = %key, replaced, "Cache builder registered");
}

/// Names of all registered builders, sorted.
pub fn registered_cache_builders() -> Vec<String> {
    let mut names: Vec<String> = CACHE_BUILDERS.read().keys().cloned().collect();
    names.sort();
    names
}

/// Build a result cache with the builder named in `config`.
pub fn build_result_cache(
    config: &CacheConfiguration,
    filter: Arc<dyn EvidenceKeyFilter>,
) -> PipelineResult<Arc<dyn ResultCache>> {
    config.validate()?;
    let name = config.builder.to_lowercase();
    let builder = CACHE_BUILDERS
        .read()
        .get(&name)
        .cloned()
        .ok_or_else(|| ConfigError::UnknownCacheBuilder { name: name.clone() })?;
    let store = builder(config)?;
    debug!(builder = %name, size = config.size, "Result cache built");
    Ok(Arc::new(DataKeyedCache::new(store, filter)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::{Pipeline, PipelineError, WhitelistFilter};

    fn flow_data(pairs: &[(&str, &str)]) -> FlowData {
        let data = Pipeline::builder()
            .build()
            .unwrap()
            .create_flow_data()
            .unwrap();
        for (k, v) in pairs {
            data.add_evidence(*k, *v).unwrap();
        }
        data
    }

    fn ua_filter() -> Arc<dyn EvidenceKeyFilter> {
        Arc::new(WhitelistFilter::new(["header.user-agent"]))
    }

    #[test]
    fn test_same_filtered_evidence_hits() {
        let cache: DataKeyedCache<u32> =
            DataKeyedCache::lru(&CacheConfiguration::new(10), ua_filter()).unwrap();
        let first = flow_data(&[("header.user-agent", "abc"), ("query.a", "1")]);
        let second = flow_data(&[("query.b", "2"), ("header.user-agent", "abc")]);
        let third = flow_data(&[("header.user-agent", "xyz")]);

        assert_eq!(cache.get(&first), None);
        cache.put(&first, 7);
        assert_eq!(cache.get(&second), Some(7));
        assert_eq!(cache.get(&third), None);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn test_remove_and_reset() {
        let cache: DataKeyedCache<u32> =
            DataKeyedCache::lru(&CacheConfiguration::new(10), ua_filter()).unwrap();
        let data = flow_data(&[("header.user-agent", "abc")]);
        cache.put(&data, 1);
        let key = cache.key_for(&data);
        assert_eq!(cache.remove(&key), Some(1));
        cache.put_by_key(key.clone(), 2);
        assert_eq!(cache.get_by_key(&key), Some(2));
        cache.reset();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_builder_is_preregistered() {
        assert!(registered_cache_builders().contains(&LRU_BUILDER.to_string()));
        let cache = build_result_cache(&CacheConfiguration::new(5), ua_filter()).unwrap();
        let data = flow_data(&[("header.user-agent", "abc")]);
        cache.put(&data, Arc::new(5u8));
        let hit = cache.get(&data).unwrap();
        assert_eq!(*hit.downcast::<u8>().unwrap(), 5);
    }

    #[test]
    fn test_unknown_builder_rejected() {
        let result = build_result_cache(
            &CacheConfiguration::new(5).with_builder("does-not-exist"),
            ua_filter(),
        );
        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::UnknownCacheBuilder { .. }))
        ));
    }

    #[test]
    fn test_custom_builder_registration() {
        register_cache_builder("Unit-Test-Lru", |config: &CacheConfiguration| {
            let cache: LruPutCache<DataKey, ElementDataRef> =
                LruPutCache::new(&config.lru_config().with_concurrency(1))?;
            Ok(Arc::new(cache) as ResultStore)
        });
        assert!(registered_cache_builders().contains(&"unit-test-lru".to_string()));
        let cache = build_result_cache(
            &CacheConfiguration::new(2).with_builder("unit-test-lru"),
            ua_filter(),
        );
        assert!(cache.is_ok());
    }
}
