//! Flow execution core.
//!
//! A [`Pipeline`] is an ordered list of stages. A stage is either a single
//! element, run on the calling thread, or a parallel group whose elements
//! run concurrently on the rayon pool and are joined before the next stage.
//! Per-element errors are accumulated on the flow data; configuration errors
//! abort the run.

use parking_lot::RwLock;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::element::{ElementProperty, FlowElement};
use crate::error::{ConfigError, FlowError, PipelineError, PipelineResult};
use crate::filter::{EvidenceKeyFilter, FilterAggregator};
use crate::flow_data::FlowData;

/// One step of a pipeline.
#[derive(Clone)]
pub enum Stage {
    Element(Arc<dyn FlowElement>),
    Parallel(Vec<Arc<dyn FlowElement>>),
}

impl Stage {
    fn elements(&self) -> &[Arc<dyn FlowElement>] {
        match self {
            Stage::Element(element) => std::slice::from_ref(element),
            Stage::Parallel(group) => group,
        }
    }
}

struct PipelineInner {
    id: Uuid,
    stages: Vec<Stage>,
    config: PipelineConfig,
    filter: Arc<FilterAggregator>,
    by_key: HashMap<String, Arc<dyn FlowElement>>,
    metadata: RwLock<HashMap<String, ElementProperty>>,
    closed: AtomicBool,
}

/// A built pipeline. Cloning yields another handle to the same pipeline.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Create a new flow data bound to this pipeline.
    pub fn create_flow_data(&self) -> PipelineResult<FlowData> {
        if self.is_closed() {
            return Err(PipelineError::PipelineClosed);
        }
        Ok(FlowData::new(self.clone()))
    }

    /// Union of every element's evidence filter.
    pub fn evidence_key_filter(&self) -> Arc<dyn EvidenceKeyFilter> {
        self.inner.filter.clone()
    }

    /// True when any stage runs elements in parallel.
    pub fn is_concurrent(&self) -> bool {
        self.inner
            .stages
            .iter()
            .any(|s| matches!(s, Stage::Parallel(_)))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.inner.stages
    }

    /// Every element, parallel groups flattened, in declaration order.
    pub fn elements(&self) -> impl Iterator<Item = &Arc<dyn FlowElement>> {
        self.inner.stages.iter().flat_map(|s| s.elements().iter())
    }

    /// First element registered under `element_data_key`.
    pub fn element(&self, element_data_key: &str) -> Option<Arc<dyn FlowElement>> {
        self.inner.by_key.get(element_data_key).cloned()
    }

    /// Available properties grouped by element data key.
    pub fn element_available_properties(&self) -> HashMap<String, Vec<ElementProperty>> {
        let mut map: HashMap<String, Vec<ElementProperty>> = HashMap::new();
        for element in self.elements() {
            let properties = map
                .entry(element.element_data_key().to_string())
                .or_default();
            for property in element.properties() {
                if property.available
                    && !properties
                        .iter()
                        .any(|p| p.name.eq_ignore_ascii_case(&property.name))
                {
                    properties.push(property);
                }
            }
        }
        map
    }

    /// Metadata for the single element property named `name`.
    pub fn metadata_for_property(&self, name: &str) -> PipelineResult<ElementProperty> {
        let lookup = name.to_lowercase();
        if let Some(found) = self.inner.metadata.read().get(&lookup) {
            return Ok(found.clone());
        }

        let matches: Vec<ElementProperty> = self
            .elements()
            .flat_map(|e| e.properties())
            .filter(|p| p.name.eq_ignore_ascii_case(name))
            .collect();

        match matches.len() {
            0 => {
                let reason = format!("Could not find property '{}'", name);
                error!(pipeline = %self.id(), "{}", reason);
                Err(PipelineError::Metadata { reason })
            }
            1 => {
                let found = matches[0].clone();
                self.inner.metadata.write().insert(lookup, found.clone());
                Ok(found)
            }
            _ => {
                let owners: Vec<&str> = matches
                    .iter()
                    .map(|p| p.element_data_key.as_str())
                    .collect();
                let reason = format!(
                    "Multiple matches for property '{}'. \
                     Flow elements that populate this property are: {:?}",
                    name, owners
                );
                error!(pipeline = %self.id(), "{}", reason);
                Err(PipelineError::Metadata { reason })
            }
        }
    }

    /// Close the pipeline. Further `create_flow_data` calls fail. Elements
    /// are closed when `auto_close_elements` is set; every element is closed
    /// even if an earlier one fails, and the first failure is returned.
    pub fn close(&self) -> PipelineResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(pipeline = %self.id(), "Pipeline closed");
        if !self.inner.config.auto_close_elements {
            return Ok(());
        }
        let mut first_error = None;
        for element in self.elements() {
            if let Err(err) = element.close() {
                warn!(
                    pipeline = %self.id(),
                    element = element.element_data_key(),
                    error = %err,
                    "Element failed to close"
                );
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub(crate) fn run(&self, data: &FlowData) -> PipelineResult<()> {
        debug!(pipeline = %self.id(), flow_data = %data.id(), "Pipeline started processing");

        for stage in &self.inner.stages {
            match stage {
                Stage::Element(element) => {
                    let outcome = element.process(data);
                    record(data, element.as_ref(), outcome)?;
                }
                Stage::Parallel(group) => {
                    let outcomes: Vec<PipelineResult<()>> =
                        group.par_iter().map(|element| element.process(data)).collect();
                    let mut fatal = None;
                    for (element, outcome) in group.iter().zip(outcomes) {
                        if let Err(err) = record(data, element.as_ref(), outcome) {
                            fatal.get_or_insert(err);
                        }
                    }
                    if let Some(err) = fatal {
                        return Err(err);
                    }
                }
            }
            if data.is_stopped() {
                debug!(pipeline = %self.id(), flow_data = %data.id(), "Flow data stopped");
                break;
            }
        }

        let errors = data.errors();
        if !errors.is_empty() && !self.inner.config.suppress_process_errors {
            return Err(PipelineError::Aggregate(errors));
        }

        debug!(pipeline = %self.id(), flow_data = %data.id(), "Pipeline finished processing");
        Ok(())
    }
}

/// Accumulate non-fatal errors on the flow data; pass fatal ones up.
fn record(
    data: &FlowData,
    element: &dyn FlowElement,
    outcome: PipelineResult<()>,
) -> PipelineResult<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(err) if err.is_fatal() => {
            error!(
                flow_data = %data.id(),
                element = element.element_data_key(),
                error = %err,
                "Fatal configuration error, aborting pipeline"
            );
            Err(err)
        }
        Err(err) => {
            data.add_error(FlowError::new(element.element_data_key(), err));
            Ok(())
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.elements().map(|e| e.element_data_key()).collect();
        f.debug_struct("Pipeline")
            .field("id", &self.inner.id)
            .field("elements", &keys)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builds a [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn suppress_process_errors(mut self, suppress: bool) -> Self {
        self.config.suppress_process_errors = suppress;
        self
    }

    pub fn auto_close_elements(mut self, auto_close: bool) -> Self {
        self.config.auto_close_elements = auto_close;
        self
    }

    /// Append an element that runs on its own.
    pub fn add_element(mut self, element: Arc<dyn FlowElement>) -> Self {
        self.stages.push(Stage::Element(element));
        self
    }

    /// Append a group of elements that run concurrently.
    pub fn add_parallel(mut self, group: Vec<Arc<dyn FlowElement>>) -> Self {
        self.stages.push(Stage::Parallel(group));
        self
    }

    pub fn build(self) -> PipelineResult<Pipeline> {
        self.config.validate()?;

        let mut stages = Vec::with_capacity(self.stages.len());
        for stage in self.stages {
            match stage {
                Stage::Parallel(group) if group.is_empty() => {
                    return Err(ConfigError::invalid(
                        "parallel_group",
                        0,
                        "a parallel group must contain at least one element",
                    )
                    .into());
                }
                Stage::Parallel(group) if group.len() > self.config.max_parallel_elements => {
                    return Err(ConfigError::invalid(
                        "parallel_group",
                        group.len(),
                        "parallel group exceeds max_parallel_elements",
                    )
                    .into());
                }
                Stage::Parallel(mut group) if group.len() == 1 => {
                    stages.push(Stage::Element(group.remove(0)));
                }
                other => stages.push(other),
            }
        }

        check_predecessors(&stages)?;

        let mut filter = FilterAggregator::new();
        let mut by_key: HashMap<String, Arc<dyn FlowElement>> = HashMap::new();
        for element in stages.iter().flat_map(|s| s.elements().iter()) {
            filter.add_filter(element.evidence_key_filter());
            by_key
                .entry(element.element_data_key().to_string())
                .or_insert_with(|| element.clone());
        }

        let pipeline = Pipeline {
            inner: Arc::new(PipelineInner {
                id: Uuid::now_v7(),
                stages,
                config: self.config,
                filter: Arc::new(filter),
                by_key,
                metadata: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        };
        info!(
            pipeline = %pipeline.id(),
            elements = pipeline.elements().count(),
            "Pipeline created"
        );
        Ok(pipeline)
    }
}

/// Every required predecessor must appear in an earlier stage.
fn check_predecessors(stages: &[Stage]) -> PipelineResult<()> {
    let mut seen: HashSet<String> = HashSet::new();
    for stage in stages {
        for element in stage.elements() {
            for required in element.required_predecessors() {
                if !seen.contains(&required) {
                    return Err(ConfigError::MissingPredecessor {
                        element: element.element_data_key().to_string(),
                        required,
                    }
                    .into());
                }
            }
        }
        for element in stage.elements() {
            seen.insert(element.element_data_key().to_string());
        }
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
