//! Result objects produced by aspect engines.
//!
//! An [`AspectData`] holds the properties one or more engines derived for a
//! flow data. When engines run lazily, property reads block until every
//! registered task has finished, and every failure observed is reported
//! together.

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use pipeline_core::{
    ElementProperty, LazyLoadError, MissingPropertyReason, PipelineError, PipelineResult,
};

use crate::lazy::{LazyTask, ProcessHandle, TaskOutcome};

struct RegisteredTask {
    task: Arc<LazyTask>,
    timeout: Duration,
}

/// Property bag written by aspect engines.
pub struct AspectData {
    element_data_key: String,
    properties: RwLock<HashMap<String, Value>>,
    engines: RwLock<Vec<String>>,
    metadata: RwLock<Vec<ElementProperty>>,
    tasks: Mutex<Vec<RegisteredTask>>,
}

impl AspectData {
    pub fn new(element_data_key: impl Into<String>) -> Self {
        Self {
            element_data_key: element_data_key.into(),
            properties: RwLock::new(HashMap::new()),
            engines: RwLock::new(Vec::new()),
            metadata: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn element_data_key(&self) -> &str {
        &self.element_data_key
    }

    /// Record an engine as a contributor. Duplicate names are ignored.
    pub fn add_engine(&self, engine: &str) {
        let mut engines = self.engines.write();
        if !engines.iter().any(|e| e == engine) {
            engines.push(engine.to_string());
        }
    }

    /// Names of the engines that contributed to this object.
    pub fn engines(&self) -> Vec<String> {
        self.engines.read().clone()
    }

    /// Record the properties a contributing engine declares. Used to explain
    /// missing values. The first declaration of a name wins.
    pub fn add_properties(&self, properties: impl IntoIterator<Item = ElementProperty>) {
        let mut metadata = self.metadata.write();
        for property in properties {
            if !metadata
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(&property.name))
            {
                metadata.push(property);
            }
        }
    }

    pub fn property_metadata(&self) -> Vec<ElementProperty> {
        self.metadata.read().clone()
    }

    /// Why `name` has no value, judged from the declared properties.
    pub fn missing_reason(&self, name: &str) -> MissingPropertyReason {
        let metadata = self.metadata.read();
        match metadata.iter().find(|p| p.name.eq_ignore_ascii_case(name)) {
            Some(property) if !property.available => MissingPropertyReason::PropertyExcluded,
            Some(_) => MissingPropertyReason::NotInResults,
            None => MissingPropertyReason::Unknown,
        }
    }

    /// Set a property. Names are case-insensitive.
    pub fn set(&self, name: &str, value: impl Into<Value>) {
        self.properties
            .write()
            .insert(name.to_lowercase(), value.into());
    }

    /// Names of the properties populated so far, without waiting.
    pub fn property_names(&self) -> Vec<String> {
        self.properties.read().keys().cloned().collect()
    }

    /// Register a lazily running computation that property reads must
    /// wait for, for at most `timeout` from the start of each read.
    pub fn register_task(&self, task: Arc<LazyTask>, timeout: Duration) {
        self.tasks.lock().push(RegisteredTask { task, timeout });
    }

    /// Handle to check or cancel the outstanding computations.
    pub fn process_handle(&self) -> ProcessHandle {
        ProcessHandle::new(self.tasks.lock().iter().map(|t| t.task.clone()).collect())
    }

    /// Read a property, waiting for lazy computations first.
    ///
    /// With one failed computation the matching [`LazyLoadError`] variant is
    /// returned; with several, a [`LazyLoadError::Aggregate`] holding each of
    /// them.
    pub fn get(&self, name: &str) -> PipelineResult<Value> {
        self.wait_for_tasks(name)?;
        self.properties
            .read()
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| PipelineError::PropertyMissing {
                element: self.element_data_key.clone(),
                property: name.to_string(),
                reason: self.missing_reason(name),
            })
    }

    /// Whether `name` has a value, waiting for lazy computations first.
    /// Failed computations count as no value.
    pub fn has_value(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    /// Read a property and convert it with serde.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> PipelineResult<T> {
        let value = self.get(name)?;
        serde_json::from_value(value).map_err(|e| PipelineError::PropertyType {
            property: name.to_string(),
            expected: std::any::type_name::<T>().to_string(),
            reason: e.to_string(),
        })
    }

    fn wait_for_tasks(&self, property: &str) -> PipelineResult<()> {
        let tasks: Vec<(Arc<LazyTask>, Duration)> = self
            .tasks
            .lock()
            .iter()
            .map(|t| (t.task.clone(), t.timeout))
            .collect();
        if tasks.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let mut errors = Vec::new();
        for (task, timeout) in &tasks {
            let engine = task.engine().to_string();
            match task.wait_until(started + *timeout) {
                TaskOutcome::Completed => {}
                TaskOutcome::TimedOut => errors.push(LazyLoadError::Timeout {
                    property: property.to_string(),
                    engines: engine,
                    timeout: *timeout,
                }),
                TaskOutcome::Cancelled => errors.push(LazyLoadError::Cancelled {
                    property: property.to_string(),
                    engines: engine,
                }),
                TaskOutcome::Failed(cause) => errors.push(LazyLoadError::Failed {
                    property: property.to_string(),
                    engine,
                    cause: Box::new(cause),
                }),
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => {
                let error = errors.remove(0);
                warn!(
                    element = %self.element_data_key,
                    error = %error,
                    "Lazy property read failed"
                );
                Err(error.into())
            }
            _ => {
                let engines = errors
                    .iter()
                    .map(failed_engine)
                    .collect::<Vec<_>>()
                    .join(", ");
                let error = LazyLoadError::Aggregate {
                    property: property.to_string(),
                    engines,
                    causes: errors,
                };
                warn!(
                    element = %self.element_data_key,
                    error = %error,
                    "Lazy property read failed"
                );
                Err(error.into())
            }
        }
    }

    /// Copy of the properties and contributors, without any tasks.
    pub fn snapshot(&self) -> AspectData {
        let copy = AspectData::new(self.element_data_key.clone());
        *copy.properties.write() = self.properties.read().clone();
        *copy.engines.write() = self.engines.read().clone();
        *copy.metadata.write() = self.metadata.read().clone();
        copy
    }

    /// Copy another object's properties and contributors into this one.
    /// Existing properties with the same name are overwritten.
    pub fn merge_from(&self, other: &AspectData) {
        let incoming = other.properties.read().clone();
        self.properties.write().extend(incoming);
        for engine in other.engines() {
            self.add_engine(&engine);
        }
        self.add_properties(other.property_metadata());
    }
}

fn failed_engine(error: &LazyLoadError) -> &str {
    match error {
        LazyLoadError::Timeout { engines, .. }
        | LazyLoadError::Cancelled { engines, .. }
        | LazyLoadError::Aggregate { engines, .. } => engines,
        LazyLoadError::Failed { engine, .. } => engine,
    }
}

impl fmt::Debug for AspectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AspectData")
            .field("element_data_key", &self.element_data_key)
            .field("engines", &*self.engines.read())
            .field("properties", &self.properties.read().len())
            .field("declared", &self.metadata.read().len())
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}
