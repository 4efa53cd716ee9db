//! Pipeline Caching - Segmented LRU Caches
//!
//! Fixed-capacity, thread-safe caches used to memoize engine results and to
//! back trackers. [`LruPutCache`] is a plain lookup/insert cache;
//! [`LruLoadingCache`] computes missing values through a [`Loader`].

pub mod config;
pub mod loading;
pub mod lru;
pub mod traits;

pub use config::{default_concurrency, LruConfig};
pub use loading::LruLoadingCache;
pub use lru::LruPutCache;
pub use traits::{CacheStats, Loader, LoadingCache, PutCache};
