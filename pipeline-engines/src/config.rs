//! Engine configuration: result caching, lazy loading and trackers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use pipeline_caching::{default_concurrency, LruConfig};
use pipeline_core::config::{env_bool, env_parse};
use pipeline_core::{ConfigError, PipelineResult};

use crate::executor::ExecutorFactory;

/// Builder name of the segmented LRU result cache.
pub const LRU_BUILDER: &str = "lru";

// ============================================================================
// RESULT CACHE
// ============================================================================

/// Result cache settings for one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfiguration {
    /// Name of a registered cache builder.
    pub builder: String,
    /// Maximum number of cached results.
    pub size: usize,
    /// Number of independently locked segments.
    pub concurrency: usize,
    /// Replace existing entries on put.
    pub update_existing: bool,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            builder: LRU_BUILDER.to_string(),
            size: 1000,
            concurrency: default_concurrency(),
            update_existing: true,
        }
    }
}

impl CacheConfiguration {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    pub fn with_builder(mut self, builder: impl Into<String>) -> Self {
        self.builder = builder.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_update_existing(mut self, update_existing: bool) -> Self {
        self.update_existing = update_existing;
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `PIPELINE_CACHE_SIZE`: maximum entries (default: 1000)
    /// - `PIPELINE_CACHE_CONCURRENCY`: segment count (default: logical CPUs)
    /// - `PIPELINE_CACHE_UPDATE_EXISTING`: "true" or "false" (default: true)
    /// - `PIPELINE_CACHE_BUILDER`: registered builder name (default: "lru")
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            builder: std::env::var("PIPELINE_CACHE_BUILDER").unwrap_or(defaults.builder),
            size: env_parse("PIPELINE_CACHE_SIZE", defaults.size),
            concurrency: env_parse("PIPELINE_CACHE_CONCURRENCY", defaults.concurrency),
            update_existing: env_bool("PIPELINE_CACHE_UPDATE_EXISTING", defaults.update_existing),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.builder.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "builder".to_string(),
            }
            .into());
        }
        self.lru_config().validate()
    }

    /// Settings for the underlying LRU cache.
    pub fn lru_config(&self) -> LruConfig {
        LruConfig::new(self.size)
            .with_concurrency(self.concurrency)
            .with_update_existing(self.update_existing)
    }
}

// ============================================================================
// LAZY LOADING
// ============================================================================

/// Lazy property loading settings for one engine.
#[derive(Clone)]
pub struct LazyLoadingConfiguration {
    /// How long a property read waits for the engine's task.
    pub property_timeout: Duration,
    /// Supplies the executor tasks run on. `None` uses the shared default.
    pub executor_factory: Option<ExecutorFactory>,
}

impl Default for LazyLoadingConfiguration {
    fn default() -> Self {
        Self {
            property_timeout: Duration::from_millis(1000),
            executor_factory: None,
        }
    }
}

impl LazyLoadingConfiguration {
    pub fn new(property_timeout: Duration) -> Self {
        Self {
            property_timeout,
            executor_factory: None,
        }
    }

    pub fn with_executor_factory(mut self, factory: ExecutorFactory) -> Self {
        self.executor_factory = Some(factory);
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `PIPELINE_LAZY_TIMEOUT_MS`: property timeout in milliseconds (default: 1000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = env_parse(
            "PIPELINE_LAZY_TIMEOUT_MS",
            defaults.property_timeout.as_millis() as u64,
        );
        Self::new(Duration::from_millis(millis))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.property_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "property_timeout",
                self.property_timeout.as_millis(),
                "property_timeout must be greater than 0",
            )
            .into());
        }
        Ok(())
    }
}

impl fmt::Debug for LazyLoadingConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyLoadingConfiguration")
            .field("property_timeout", &self.property_timeout)
            .field("custom_executor", &self.executor_factory.is_some())
            .finish()
    }
}

/// Convenience for building a factory from a closure.
pub fn executor_factory<F>(factory: F) -> ExecutorFactory
where
    F: Fn() -> PipelineResult<Arc<dyn crate::executor::LazyExecutor>> + Send + Sync + 'static,
{
    Arc::new(factory)
}

// ============================================================================
// TRACKERS
// ============================================================================

/// Settings for interval trackers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfiguration {
    pub cache: CacheConfiguration,
    /// Minimum time between two tracked sightings of the same key.
    pub interval: Duration,
    /// Key sightings per session instead of globally.
    pub per_session: bool,
    /// Stop the flow when the tracker declines an event.
    pub stop_on_repeat: bool,
}

impl Default for TrackerConfiguration {
    fn default() -> Self {
        Self {
            cache: CacheConfiguration::default(),
            interval: Duration::from_millis(20 * 60 * 1000),
            per_session: false,
            stop_on_repeat: false,
        }
    }
}

impl TrackerConfiguration {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    pub fn with_cache(mut self, cache: CacheConfiguration) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_per_session(mut self, per_session: bool) -> Self {
        self.per_session = per_session;
        self
    }

    pub fn with_stop_on_repeat(mut self, stop_on_repeat: bool) -> Self {
        self.stop_on_repeat = stop_on_repeat;
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `PIPELINE_TRACKER_INTERVAL_MS`: minimum interval (default: 20 minutes)
    /// - the `PIPELINE_CACHE_*` variables of [`CacheConfiguration::from_env`]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = env_parse(
            "PIPELINE_TRACKER_INTERVAL_MS",
            defaults.interval.as_millis() as u64,
        );
        Self {
            cache: CacheConfiguration::from_env(),
            interval: Duration::from_millis(millis),
            ..defaults
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.interval.is_zero() {
            return Err(ConfigError::invalid(
                "interval",
                self.interval.as_millis(),
                "interval must be greater than 0",
            )
            .into());
        }
        self.cache.validate()
    }
}
