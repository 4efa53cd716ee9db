//! Loading mode: compute on miss.
//!
//! Concurrent misses for the same key are coalesced through an in-flight
//! table of [`OnceCell`]s. The first caller runs the loader outside any
//! segment lock; later callers for the key block on the cell and receive the
//! same result. A result is stored with insert-if-absent semantics before
//! the in-flight entry is cleared, so a racing caller that just missed the
//! table still ends up with the retained value.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use pipeline_core::PipelineResult;

use crate::config::LruConfig;
use crate::lru::LruPutCache;
use crate::traits::{CacheStats, Loader, LoadingCache, PutCache};

type InFlight<V, E> = Arc<OnceCell<Result<V, E>>>;

/// Segmented LRU cache that fills itself from a [`Loader`].
pub struct LruLoadingCache<K, V, L>
where
    L: Loader<K, V>,
{
    cache: LruPutCache<K, V>,
    loader: L,
    in_flight: Vec<Mutex<HashMap<K, InFlight<V, L::Error>>>>,
    loads: AtomicU64,
    load_failures: AtomicU64,
}

impl<K, V, L> LruLoadingCache<K, V, L>
where
    K: Hash + Eq + Clone + Send + Sync + fmt::Debug,
    V: Clone + Send + Sync,
    L: Loader<K, V>,
    L::Error: Clone + Send + Sync + fmt::Display,
{
    pub fn new(config: &LruConfig, loader: L) -> PipelineResult<Self> {
        let cache = LruPutCache::new(config)?;
        let in_flight = (0..cache.segment_count())
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Ok(Self {
            cache,
            loader,
            in_flight,
            loads: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.cache.capacity()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.cache.contains(key)
    }

    /// Like [`LoadingCache::get_or_load`] but with a loader supplied for this
    /// call only.
    pub fn get_or_load_with<F>(&self, key: &K, loader: F) -> Result<V, L::Error>
    where
        F: FnOnce(&K) -> Result<V, L::Error>,
    {
        if let Some(value) = self.cache.get(key) {
            return Ok(value);
        }

        let shard = &self.in_flight[self.cache.segment_index(key)];
        let cell = shard
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let mut leader = false;
        let result = cell
            .get_or_init(|| {
                leader = true;
                // A previous leader may have stored the value after our lookup.
                if let Some(value) = self.cache.peek(key) {
                    return Ok(value);
                }
                self.loads.fetch_add(1, Ordering::Relaxed);
                match loader(key) {
                    Ok(value) => Ok(self.cache.put_if_absent(key.clone(), value)),
                    Err(err) => {
                        self.load_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(key = ?key, error = %err, "Cache loader failed");
                        Err(err)
                    }
                }
            })
            .clone();

        if leader {
            let mut table = shard.lock();
            if table.get(key).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
                table.remove(key);
            }
        } else {
            debug!(key = ?key, "Joined in-flight load");
        }
        result
    }

    /// Number of loads currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.iter().map(|shard| shard.lock().len()).sum()
    }
}

impl<K, V, L> PutCache<K, V> for LruLoadingCache<K, V, L>
where
    K: Hash + Eq + Clone + Send + Sync + fmt::Debug,
    V: Clone + Send + Sync,
    L: Loader<K, V>,
    L::Error: Clone + Send + Sync + fmt::Display,
{
    fn get(&self, key: &K) -> Option<V> {
        self.cache.get(key)
    }

    fn put(&self, key: K, value: V) {
        self.cache.put(key, value)
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.cache.remove(key)
    }

    fn reset(&self) {
        self.cache.reset();
        self.loads.store(0, Ordering::Relaxed);
        self.load_failures.store(0, Ordering::Relaxed);
    }

    fn len(&self) -> usize {
        self.cache.len()
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            ..self.cache.stats()
        }
    }
}

impl<K, V, L> LoadingCache<K, V> for LruLoadingCache<K, V, L>
where
    K: Hash + Eq + Clone + Send + Sync + fmt::Debug,
    V: Clone + Send + Sync,
    L: Loader<K, V>,
    L::Error: Clone + Send + Sync + fmt::Display,
{
    type Error = L::Error;

    fn get_or_load(&self, key: &K) -> Result<V, L::Error> {
        self.get_or_load_with(key, |k| self.loader.load(k))
    }
}

impl<K, V, L: Loader<K, V>> fmt::Debug for LruLoadingCache<K, V, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruLoadingCache")
            .field("cache", &self.cache)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
