//! Error types for pipeline operations

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
///
/// These are fatal: they surface at construction time (or the first time a
/// misconfigured element runs) and are never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Element '{element}' requires '{required}' to be added to the pipeline before it")]
    MissingPredecessor { element: String, required: String },

    #[error("No cache builder registered under the name '{name}'")]
    UnknownCacheBuilder { name: String },
}

impl ConfigError {
    /// Shorthand for the most common validation failure.
    pub fn invalid(field: &str, value: impl ToString, reason: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Cache errors raised by loading caches.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Loader failed for key {key}: {reason}")]
    Load { key: String, reason: String },
}

/// Failures observed when reading a lazily loaded property.
///
/// Timeout, cancellation and computation failure are distinct variants so
/// callers can tell them apart without inspecting messages.
#[derive(Debug, Clone, Error)]
pub enum LazyLoadError {
    #[error(
        "Failed to retrieve property '{property}' because the processing for engine(s) \
         {engines} took longer than the specified timeout of {timeout:?}"
    )]
    Timeout {
        property: String,
        engines: String,
        timeout: Duration,
    },

    #[error(
        "Failed to retrieve property '{property}' because the processing for engine(s) \
         {engines} was cancelled"
    )]
    Cancelled { property: String, engines: String },

    #[error(
        "Failed to retrieve property '{property}' because processing threw an exception \
         in engine {engine}: {cause}"
    )]
    Failed {
        property: String,
        engine: String,
        cause: Box<PipelineError>,
    },

    #[error(
        "Failed to retrieve property '{property}' because processing threw {} errors \
         in engine(s) {engines}", .causes.len()
    )]
    Aggregate {
        property: String,
        engines: String,
        causes: Vec<LazyLoadError>,
    },
}

impl LazyLoadError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Every underlying cause, flattened out of any aggregate.
    pub fn causes(&self) -> Vec<&LazyLoadError> {
        match self {
            Self::Aggregate { causes, .. } => causes.iter().flat_map(|c| c.causes()).collect(),
            other => vec![other],
        }
    }
}

/// Why a property read found no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPropertyReason {
    /// The property is declared and available but was not written for this
    /// flow data.
    NotInResults,
    /// The property is declared but excluded by the element's configuration.
    PropertyExcluded,
    /// No contributing element declares the property.
    Unknown,
}

impl fmt::Display for MissingPropertyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotInResults => "The element did not populate it for this evidence.",
            Self::PropertyExcluded => {
                "This is because the property has been excluded when configuring the engine."
            }
            Self::Unknown => {
                "The reason for this is unknown. Please check that the aspect and property \
                 name are correct."
            }
        })
    }
}

/// An error recorded against the flow element that raised it.
#[derive(Debug, Clone, Error)]
#[error("{element}: {error}")]
pub struct FlowError {
    pub element: String,
    pub error: PipelineError,
}

impl FlowError {
    pub fn new(element: impl Into<String>, error: PipelineError) -> Self {
        Self {
            element: element.into(),
            error,
        }
    }
}

/// Master error type for all pipeline errors.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Lazy load error: {0}")]
    LazyLoad(#[from] LazyLoadError),

    #[error("Element '{element}' failed: {reason}")]
    Element { element: String, reason: String },

    #[error("Property '{property}' is not present in the results of '{element}'. {reason}")]
    PropertyMissing {
        element: String,
        property: String,
        reason: MissingPropertyReason,
    },

    #[error("Property '{property}' could not be read as {expected}: {reason}")]
    PropertyType {
        property: String,
        expected: String,
        reason: String,
    },

    #[error("Element data '{key}' is not of the requested type")]
    DataTypeMismatch { key: String },

    #[error("Element data '{key}' has not been added to the flow data")]
    DataMissing { key: String },

    #[error("Pipeline metadata error: {reason}")]
    Metadata { reason: String },

    #[error("Pipeline is closed")]
    PipelineClosed,

    #[error("Flow data has already been processed")]
    AlreadyProcessed,

    #[error("Flow data has not yet been processed")]
    NotProcessed,

    #[error("Executor error: {reason}")]
    Executor { reason: String },

    #[error("{} error(s) occurred processing evidence", .0.len())]
    Aggregate(Vec<FlowError>),
}

impl PipelineError {
    /// Convenience constructor for engine and element failures.
    pub fn element(element: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Element {
            element: element.into(),
            reason: reason.into(),
        }
    }

    /// Configuration-class errors abort the pipeline instead of being
    /// accumulated on the flow data.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

// =============================================================================
// TESTS
// =============================================================================
