//! The flow context threaded through every element of a pipeline.
//!
//! A [`FlowData`] carries evidence in and element results out. It is a cheap
//! handle over shared state: clones refer to the same context, which lets
//! lazily evaluated engines keep a reference after `process` has returned.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::data_key::{DataKey, EvidenceFingerprinter};
use crate::element::Cancellable;
use crate::error::{FlowError, PipelineError, PipelineResult};
use crate::evidence::Evidence;
use crate::filter::EvidenceKeyFilter;
use crate::pipeline::Pipeline;

/// Type-erased element data as stored in the flow data.
pub type ElementDataRef = Arc<dyn Any + Send + Sync>;

/// Typed handle to an element's data.
pub struct TypedKey<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedKey<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for TypedKey<T> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<T> fmt::Debug for TypedKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypedKey").field(&self.name).finish()
    }
}

struct FlowDataInner {
    id: Uuid,
    created_at: DateTime<Utc>,
    pipeline: Pipeline,
    evidence: RwLock<Evidence>,
    data: RwLock<HashMap<String, ElementDataRef>>,
    errors: Mutex<Vec<FlowError>>,
    stop_hooks: Mutex<Vec<Arc<dyn Cancellable>>>,
    stopped: AtomicBool,
    processed: AtomicBool,
}

/// Shared per-request context.
#[derive(Clone)]
pub struct FlowData {
    inner: Arc<FlowDataInner>,
}

impl FlowData {
    pub(crate) fn new(pipeline: Pipeline) -> Self {
        let data = Self {
            inner: Arc::new(FlowDataInner {
                id: Uuid::now_v7(),
                created_at: Utc::now(),
                pipeline,
                evidence: RwLock::new(Evidence::new()),
                data: RwLock::new(HashMap::new()),
                errors: Mutex::new(Vec::new()),
                stop_hooks: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
                processed: AtomicBool::new(false),
            }),
        };
        debug!(flow_data = %data.id(), "FlowData created");
        data
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    // ------------------------------------------------------------------
    // Evidence
    // ------------------------------------------------------------------

    /// Add a single evidence value. Evidence is frozen once processing starts.
    pub fn add_evidence(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> PipelineResult<&Self> {
        if self.is_processed() {
            return Err(PipelineError::AlreadyProcessed);
        }
        let key = key.into();
        let value = value.into();
        debug!(flow_data = %self.id(), key = %key, "Evidence set");
        self.inner.evidence.write().add(key, value);
        Ok(self)
    }

    /// Add every entry of `evidence`.
    pub fn add_all_evidence(&self, evidence: &Evidence) -> PipelineResult<&Self> {
        for entry in evidence.iter() {
            self.add_evidence(entry.key.clone(), entry.value.clone())?;
        }
        Ok(self)
    }

    pub fn evidence(&self) -> RwLockReadGuard<'_, Evidence> {
        self.inner.evidence.read()
    }

    pub fn get_evidence(&self, key: &str) -> Option<Value> {
        self.inner.evidence.read().get(key).cloned()
    }

    /// Fingerprint of the evidence selected by `filter`.
    pub fn generate_key(&self, filter: &dyn EvidenceKeyFilter) -> DataKey {
        filter.fingerprint(&self.inner.evidence.read())
    }

    // ------------------------------------------------------------------
    // Processing lifecycle
    // ------------------------------------------------------------------

    /// Run the owning pipeline over this flow data. Allowed once.
    pub fn process(&self) -> PipelineResult<()> {
        if self.inner.processed.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyProcessed);
        }
        if self.inner.pipeline.is_closed() {
            return Err(PipelineError::PipelineClosed);
        }
        self.inner.pipeline.run(self)
    }

    pub fn is_processed(&self) -> bool {
        self.inner.processed.load(Ordering::SeqCst)
    }

    /// Stop processing. Remaining sequential elements are skipped and every
    /// registered cancellable task is cancelled.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let hooks = std::mem::take(&mut *self.inner.stop_hooks.lock());
        if !hooks.is_empty() {
            debug!(flow_data = %self.id(), tasks = hooks.len(), "Cancelling outstanding tasks");
        }
        for hook in hooks {
            hook.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Register work to cancel on [`FlowData::stop`]. If the flow data is
    /// already stopped the task is cancelled straight away.
    pub fn on_stop(&self, task: Arc<dyn Cancellable>) {
        let mut hooks = self.inner.stop_hooks.lock();
        if self.is_stopped() {
            drop(hooks);
            task.cancel();
            return;
        }
        hooks.retain(|h| !h.is_done());
        hooks.push(task);
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    pub fn add_error(&self, error: FlowError) {
        error!(
            flow_data = %self.id(),
            element = %error.element,
            error = %error.error,
            "Error occurred during processing"
        );
        self.inner.errors.lock().push(error);
    }

    pub fn errors(&self) -> Vec<FlowError> {
        self.inner.errors.lock().clone()
    }

    // ------------------------------------------------------------------
    // Element data
    // ------------------------------------------------------------------

    /// Fetch the data stored under `key`, inserting the factory's value if
    /// none exists yet. Fails if existing data has a different type.
    pub fn get_or_add<T, F>(&self, key: &TypedKey<T>, factory: F) -> PipelineResult<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Arc<T>,
    {
        let mut data = self.inner.data.write();
        let entry = data
            .entry(key.name().to_string())
            .or_insert_with(|| factory() as ElementDataRef);
        Arc::clone(entry)
            .downcast::<T>()
            .map_err(|_| PipelineError::DataTypeMismatch {
                key: key.name().to_string(),
            })
    }

    /// Replace whatever is stored under `key`.
    pub fn set<T: Send + Sync + 'static>(&self, key: &TypedKey<T>, value: Arc<T>) {
        self.inner
            .data
            .write()
            .insert(key.name().to_string(), value as ElementDataRef);
    }

    /// Element data lookup for use while processing is under way.
    pub fn try_get<T: Send + Sync + 'static>(&self, key: &TypedKey<T>) -> Option<Arc<T>> {
        let data = self.inner.data.read();
        data.get(key.name())
            .and_then(|entry| Arc::clone(entry).downcast::<T>().ok())
    }

    /// Typed element data. Only valid once the flow data has been processed.
    pub fn get<T: Send + Sync + 'static>(&self, key: &TypedKey<T>) -> PipelineResult<Arc<T>> {
        let entry = self.get_by_name(key.name())?;
        entry
            .downcast::<T>()
            .map_err(|_| PipelineError::DataTypeMismatch {
                key: key.name().to_string(),
            })
    }

    /// Untyped element data. Only valid once the flow data has been processed.
    pub fn get_by_name(&self, key: &str) -> PipelineResult<ElementDataRef> {
        if !self.is_processed() {
            return Err(PipelineError::NotProcessed);
        }
        self.inner
            .data
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::DataMissing {
                key: key.to_string(),
            })
    }

    pub fn data_keys(&self) -> Vec<String> {
        self.inner.data.read().keys().cloned().collect()
    }
}

impl fmt::Debug for FlowData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowData")
            .field("id", &self.inner.id)
            .field("processed", &self.is_processed())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
