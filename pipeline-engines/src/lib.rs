//! Pipeline Engines - Aspect Engines, Result Caching, Trackers and Lazy Loading
//!
//! An aspect engine derives properties from evidence. This crate wraps an
//! engine in a flow element that can memoize results per request
//! fingerprint and run the engine lazily on an executor, with property reads
//! waiting up to a timeout. Trackers reuse the fingerprint cache to rate
//! limit repeated events.

pub mod aspect;
pub mod cache;
pub mod config;
pub mod engine;
pub mod executor;
pub mod lazy;
pub mod tracker;

pub use aspect::AspectData;
pub use cache::{
    build_result_cache, register_cache_builder, registered_cache_builders, CacheBuilder,
    DataKeyedCache, ResultCache, ResultStore,
};
pub use config::{
    executor_factory, CacheConfiguration, LazyLoadingConfiguration, TrackerConfiguration,
    LRU_BUILDER,
};
pub use engine::{AspectEngine, AspectEngineElement, AspectEngineElementBuilder};
pub use executor::{
    default_executor, default_executor_factory, is_default_executor, ExecutorFactory, Job,
    LazyExecutor, TokioExecutor,
};
pub use lazy::{LazyTask, ProcessHandle, TaskOutcome};
pub use tracker::{
    Clock, DataKeyedTracker, IntervalHooks, IntervalTracker, SessionKeyFilter, Tracker,
    TrackerElement, TrackerHooks, TRACK_PROPERTY,
};
