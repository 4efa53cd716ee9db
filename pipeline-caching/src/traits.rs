//! Cache traits and statistics.
//!
//! [`PutCache`] is the lookup/insert surface shared by every cache in the
//! workspace. [`LoadingCache`] adds compute-on-miss through a [`Loader`].
//! Both are object safe so engines can hold a `dyn` cache chosen at runtime.

use serde::{Deserialize, Serialize};

/// A bounded key/value cache.
///
/// Implementations must be safe to share between threads.
pub trait PutCache<K, V>: Send + Sync {
    /// Return the cached value, promoting it to most recently used.
    fn get(&self, key: &K) -> Option<V>;

    /// Insert or update an entry, honouring the cache's update-existing
    /// setting for keys that are already present.
    fn put(&self, key: K, value: V);

    /// Remove an entry, returning its value.
    fn remove(&self, key: &K) -> Option<V>;

    /// Drop every entry and zero the statistics.
    fn reset(&self);

    /// Number of live entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics.
    fn stats(&self) -> CacheStats;
}

/// Computes the value for a key on a cache miss.
pub trait Loader<K, V>: Send + Sync {
    type Error;

    fn load(&self, key: &K) -> Result<V, Self::Error>;
}

impl<K, V, E, F> Loader<K, V> for F
where
    F: Fn(&K) -> Result<V, E> + Send + Sync,
{
    type Error = E;

    fn load(&self, key: &K) -> Result<V, E> {
        self(key)
    }
}

/// A cache that fills itself on a miss.
pub trait LoadingCache<K, V>: PutCache<K, V> {
    type Error;

    /// Return the cached value, loading and storing it if absent. Loader
    /// failures are returned to the caller and leave nothing behind.
    fn get_or_load(&self, key: &K) -> Result<V, Self::Error>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
    /// Number of loader invocations (loading caches only).
    pub loads: u64,
    /// Number of failed loader invocations (loading caches only).
    pub load_failures: u64,
}

impl CacheStats {
    /// Total number of `get` lookups.
    pub fn requests(&self) -> u64 {
        self.hits + self.misses
    }

    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.requests();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate the miss rate (0.0 to 1.0).
    pub fn miss_rate(&self) -> f64 {
        if self.requests() == 0 {
            0.0
        } else {
            1.0 - self.hit_rate()
        }
    }
}
