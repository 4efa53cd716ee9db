//! Flow element contract.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::PipelineResult;
use crate::filter::EvidenceKeyFilter;
use crate::flow_data::FlowData;

/// Metadata for one property an element can populate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementProperty {
    pub name: String,
    pub element_data_key: String,
    /// False when the data source in use cannot populate the property.
    pub available: bool,
}

impl ElementProperty {
    pub fn new(name: impl Into<String>, element_data_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            element_data_key: element_data_key.into(),
            available: true,
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

/// A unit of work in a pipeline.
///
/// Elements read evidence from the flow data and write their results into
/// it under [`FlowElement::element_data_key`]. Implementations must be safe
/// to call from several threads at once; parallel groups share one flow data.
pub trait FlowElement: Send + Sync {
    /// Key under which this element stores its results.
    fn element_data_key(&self) -> &str;

    /// Evidence this element consumes.
    fn evidence_key_filter(&self) -> Arc<dyn EvidenceKeyFilter>;

    /// Properties this element can populate.
    fn properties(&self) -> Vec<ElementProperty> {
        Vec::new()
    }

    /// Data keys of elements that must run before this one.
    fn required_predecessors(&self) -> Vec<String> {
        Vec::new()
    }

    /// Process one flow data.
    fn process(&self, data: &FlowData) -> PipelineResult<()>;

    /// Release resources. Called by the pipeline on close when
    /// `auto_close_elements` is set.
    fn close(&self) -> PipelineResult<()> {
        Ok(())
    }
}

/// Work that can be cancelled when its owning flow data is stopped.
pub trait Cancellable: Send + Sync {
    fn cancel(&self);

    fn is_done(&self) -> bool;
}
