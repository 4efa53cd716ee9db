//! Pipeline configuration

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, PipelineResult};

/// Settings that control how a pipeline runs its elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// When false, `process` returns an aggregate error if any element
    /// recorded an error. When true, errors stay on the flow data only.
    pub suppress_process_errors: bool,
    /// Close every element when the pipeline is closed.
    pub auto_close_elements: bool,
    /// Upper bound on the number of elements in one parallel group.
    pub max_parallel_elements: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            suppress_process_errors: false,
            auto_close_elements: true,
            max_parallel_elements: 64,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_suppress_process_errors(mut self, suppress: bool) -> Self {
        self.suppress_process_errors = suppress;
        self
    }

    pub fn with_auto_close_elements(mut self, auto_close: bool) -> Self {
        self.auto_close_elements = auto_close;
        self
    }

    pub fn with_max_parallel_elements(mut self, max: usize) -> Self {
        self.max_parallel_elements = max;
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `PIPELINE_SUPPRESS_PROCESS_ERRORS`: "true" or "false" (default: false)
    /// - `PIPELINE_AUTO_CLOSE_ELEMENTS`: "true" or "false" (default: true)
    /// - `PIPELINE_MAX_PARALLEL_ELEMENTS`: group size limit (default: 64)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            suppress_process_errors: env_bool(
                "PIPELINE_SUPPRESS_PROCESS_ERRORS",
                defaults.suppress_process_errors,
            ),
            auto_close_elements: env_bool(
                "PIPELINE_AUTO_CLOSE_ELEMENTS",
                defaults.auto_close_elements,
            ),
            max_parallel_elements: std::env::var("PIPELINE_MAX_PARALLEL_ELEMENTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_parallel_elements),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.max_parallel_elements == 0 {
            return Err(ConfigError::invalid(
                "max_parallel_elements",
                self.max_parallel_elements,
                "max_parallel_elements must be greater than 0",
            )
            .into());
        }
        Ok(())
    }
}

/// Read a boolean environment variable ("true"/"1" or "false"/"0").
pub fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|s| match s.trim().to_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

/// Read a numeric environment variable.
pub fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
