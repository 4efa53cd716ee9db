//! Pipeline Test Utilities
//!
//! Shared test infrastructure for the pipeline workspace:
//! - Mock engines and executors
//! - Proptest generators for evidence
//! - Fixtures for common flow setups
//! - Assertions for lazy-loading failures

pub use pipeline_caching::{CacheStats, LruConfig, LruPutCache, PutCache};
pub use pipeline_core::{
    ConfigError, Evidence, EvidenceKeyFilter, FlowData, FlowElement, LazyLoadError, Pipeline,
    PipelineError, PipelineResult, WhitelistFilter,
};
pub use pipeline_engines::{
    AspectData, AspectEngine, AspectEngineElement, CacheConfiguration, LazyExecutor,
    LazyLoadingConfiguration,
};

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// MOCK ENGINES
// ============================================================================

/// Evidence key the mock engine reads by default.
pub const USER_AGENT: &str = "header.user-agent";

/// Configurable aspect engine for tests.
///
/// Writes each configured property, plus `ua_length` computed from the
/// consumed evidence, after sleeping for the configured processing cost.
#[derive(Debug)]
pub struct MockEngine {
    key: String,
    name: String,
    evidence_keys: Vec<String>,
    properties: Vec<(String, Value)>,
    excluded: Vec<String>,
    cost: Duration,
    failure: Option<String>,
    panics: bool,
    calls: AtomicUsize,
    closed: AtomicBool,
}

impl MockEngine {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            key,
            evidence_keys: vec![USER_AGENT.to_string()],
            properties: Vec::new(),
            excluded: Vec::new(),
            cost: Duration::ZERO,
            failure: None,
            panics: false,
            calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Give the engine a name distinct from its data key, for several
    /// engines writing into one result object.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_evidence_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.evidence_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.push((name.into(), value.into()));
        self
    }

    /// Declare a property as excluded by configuration. It is never written.
    pub fn with_excluded_property(mut self, name: impl Into<String>) -> Self {
        self.excluded.push(name.into());
        self
    }

    /// Simulated processing time.
    pub fn with_cost(mut self, cost: Duration) -> Self {
        self.cost = cost;
        self
    }

    /// Make every call fail with an element error.
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Make every call panic instead of returning.
    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl AspectEngine for MockEngine {
    fn element_data_key(&self) -> &str {
        &self.key
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn evidence_key_filter(&self) -> Arc<dyn EvidenceKeyFilter> {
        Arc::new(WhitelistFilter::new(self.evidence_keys.iter().cloned()))
    }

    fn properties(&self) -> Vec<pipeline_core::ElementProperty> {
        let available = self
            .properties
            .iter()
            .map(|(name, _)| pipeline_core::ElementProperty::new(name.clone(), &self.key));
        let excluded = self
            .excluded
            .iter()
            .map(|name| pipeline_core::ElementProperty::new(name.clone(), &self.key).unavailable());
        available.chain(excluded).collect()
    }

    fn process_engine(&self, data: &FlowData, aspect: &AspectData) -> PipelineResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.cost.is_zero() {
            std::thread::sleep(self.cost);
        }
        if self.panics {
            panic!("mock engine '{}' panicked", self.name);
        }
        if let Some(reason) = &self.failure {
            return Err(PipelineError::element(&self.name, reason.clone()));
        }
        let length = data
            .get_evidence(USER_AGENT)
            .and_then(|v| v.as_str().map(str::len))
            .unwrap_or(0);
        aspect.set("ua_length", length);
        for (name, value) in &self.properties {
            aspect.set(name, value.clone());
        }
        Ok(())
    }

    fn close(&self) -> PipelineResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// MOCK EXECUTORS
// ============================================================================

/// Executor that starts a thread per job and counts what it was asked to do.
#[derive(Debug, Default)]
pub struct ThreadPerJobExecutor {
    spawned: AtomicUsize,
    shutdowns: AtomicUsize,
    closed: AtomicBool,
}

impl ThreadPerJobExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl LazyExecutor for ThreadPerJobExecutor {
    fn spawn(&self, job: pipeline_engines::Job) -> PipelineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::Executor {
                reason: "thread-per-job executor is shut down".to_string(),
            });
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);
        std::thread::Builder::new()
            .name("mock-lazy".to_string())
            .spawn(job)
            .map(|_| ())
            .map_err(|e| PipelineError::Executor {
                reason: e.to_string(),
            })
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Executor that holds jobs until released, for deterministic cancellation
/// tests.
#[derive(Default)]
pub struct ManualExecutor {
    queue: Mutex<Vec<pipeline_engines::Job>>,
}

impl ManualExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run every queued job on the calling thread.
    pub fn run_all(&self) {
        let jobs = std::mem::take(&mut *self.queue.lock());
        for job in jobs {
            job();
        }
    }

    /// Drop every queued job without running it, as an executor does when
    /// it is torn down with work still queued.
    pub fn discard_all(&self) {
        let jobs = std::mem::take(&mut *self.queue.lock());
        drop(jobs);
    }
}

impl LazyExecutor for ManualExecutor {
    fn spawn(&self, job: pipeline_engines::Job) -> PipelineResult<()> {
        self.queue.lock().push(job);
        Ok(())
    }
}

/// Lazy-loading settings that always hand out `executor`.
pub fn lazy_config_with(
    timeout: Duration,
    executor: Arc<dyn LazyExecutor>,
) -> LazyLoadingConfiguration {
    LazyLoadingConfiguration::new(timeout).with_executor_factory(
        pipeline_engines::executor_factory(move || Ok(executor.clone())),
    )
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for evidence.

    use super::*;
    use proptest::prelude::*;

    /// Evidence key in one of the common prefixes.
    pub fn arb_evidence_key() -> impl Strategy<Value = String> {
        (
            prop_oneof![Just("header"), Just("query"), Just("cookie")],
            "[a-z][a-z-]{0,10}",
        )
            .prop_map(|(prefix, name)| format!("{}.{}", prefix, name))
    }

    /// Browser-like user agent string.
    pub fn arb_user_agent() -> impl Strategy<Value = String> {
        "Mozilla/5\\.0 \\([A-Za-z0-9; ]{1,20}\\) [A-Za-z]{1,10}/[0-9]{1,3}"
    }

    /// Evidence with up to `max` random entries.
    pub fn arb_evidence(max: usize) -> impl Strategy<Value = Evidence> {
        prop::collection::vec((arb_evidence_key(), "[a-z0-9]{0,12}"), 0..max)
            .prop_map(|pairs| pairs.into_iter().collect::<Evidence>())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built flow setups.

    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use pipeline_engines::Clock;

    pub const DESKTOP_UA: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0";
    pub const MOBILE_UA: &str =
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile/15E148";

    /// Evidence carrying a user agent plus unrelated noise.
    pub fn browser_evidence(user_agent: &str) -> Evidence {
        Evidence::new()
            .with(USER_AGENT, user_agent)
            .with("header.accept-language", "en-GB")
            .with("query.page", "1")
    }

    /// Pipeline with the given elements run in sequence.
    pub fn sequential_pipeline(elements: Vec<Arc<dyn FlowElement>>) -> PipelineResult<Pipeline> {
        elements
            .into_iter()
            .fold(Pipeline::builder(), |builder, element| builder.add_element(element))
            .build()
    }

    /// Create a flow data with `evidence`, without processing it.
    pub fn flow_data(pipeline: &Pipeline, evidence: &Evidence) -> PipelineResult<FlowData> {
        let data = pipeline.create_flow_data()?;
        data.add_all_evidence(evidence)?;
        Ok(data)
    }

    /// Clock that only moves when told to.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Starts at midnight UTC on 2024-01-01.
        pub fn new() -> Self {
            let start = Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_else(Utc::now);
            Self {
                now: Arc::new(Mutex::new(start)),
            }
        }

        pub fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }

        pub fn advance(&self, by: Duration) {
            let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
            *self.now.lock() += by;
        }

        pub fn as_clock(&self) -> Clock {
            let now = self.now.clone();
            Arc::new(move || *now.lock())
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Create and process a flow data with `evidence`.
    pub fn process(pipeline: &Pipeline, evidence: &Evidence) -> PipelineResult<FlowData> {
        let data = flow_data(pipeline, evidence)?;
        data.process()?;
        Ok(data)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over lazy-loading failures.

    use super::*;

    fn lazy_error<T: std::fmt::Debug>(result: &PipelineResult<T>) -> &LazyLoadError {
        match result {
            Err(PipelineError::LazyLoad(e)) => e,
            other => panic!("expected a lazy-load error, got {:?}", other),
        }
    }

    /// Assert the result is a single timeout.
    pub fn assert_timeout<T: std::fmt::Debug>(result: &PipelineResult<T>) {
        let error = lazy_error(result);
        assert!(error.is_timeout(), "expected timeout, got {:?}", error);
    }

    /// Assert the result is a single cancellation.
    pub fn assert_cancelled<T: std::fmt::Debug>(result: &PipelineResult<T>) {
        let error = lazy_error(result);
        assert!(error.is_cancelled(), "expected cancellation, got {:?}", error);
    }

    /// Assert the result is an aggregate of `count` causes and return them.
    pub fn assert_aggregate<T: std::fmt::Debug>(
        result: &PipelineResult<T>,
        count: usize,
    ) -> Vec<LazyLoadError> {
        match lazy_error(result) {
            LazyLoadError::Aggregate { causes, .. } => {
                assert_eq!(causes.len(), count, "unexpected causes: {:?}", causes);
                causes.clone()
            }
            other => panic!("expected aggregate, got {:?}", other),
        }
    }
}
