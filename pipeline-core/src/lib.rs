//! Pipeline Core - Flow Execution
//!
//! Evidence, fingerprints, flow data and the pipeline that runs flow
//! elements over it. Caching and engine crates build on these types.

pub mod config;
pub mod data_key;
pub mod element;
pub mod error;
pub mod evidence;
pub mod filter;
pub mod flow_data;
pub mod pipeline;
pub mod telemetry;

pub use config::PipelineConfig;
pub use data_key::{DataKey, DataKeyBuilder, EvidenceFingerprinter, KeyPart};
pub use element::{Cancellable, ElementProperty, FlowElement};
pub use error::{
    CacheError, ConfigError, FlowError, LazyLoadError, MissingPropertyReason, PipelineError,
    PipelineResult,
};
pub use evidence::{Evidence, EvidenceEntry};
pub use filter::{EvidenceKeyFilter, FilterAggregator, IncludeAll, WhitelistFilter};
pub use flow_data::{ElementDataRef, FlowData, TypedKey};
pub use pipeline::{Pipeline, PipelineBuilder, Stage};
pub use telemetry::init_tracing;
