//! Aspect engines and the flow element that runs them.
//!
//! An [`AspectEngine`] only knows how to derive properties from evidence.
//! [`AspectEngineElement`] composes it with an optional result cache and an
//! optional lazy-loading executor and adapts it to [`FlowElement`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use pipeline_caching::CacheStats;
use pipeline_core::{
    Cancellable, DataKey, ElementDataRef, ElementProperty, EvidenceKeyFilter, FlowData,
    FlowElement, PipelineError, PipelineResult, TypedKey,
};

use crate::aspect::AspectData;
use crate::cache::{build_result_cache, ResultCache};
use crate::config::{CacheConfiguration, LazyLoadingConfiguration};
use crate::executor::{default_executor, is_default_executor, LazyExecutor};
use crate::lazy::LazyTask;

/// Derives properties from evidence.
pub trait AspectEngine: Send + Sync {
    /// Key of the result object this engine writes into.
    fn element_data_key(&self) -> &str;

    /// Name used in logs and lazy-loading errors.
    fn name(&self) -> &str {
        self.element_data_key()
    }

    /// Evidence the engine consumes. Also the basis of result-cache keys.
    fn evidence_key_filter(&self) -> Arc<dyn EvidenceKeyFilter>;

    fn properties(&self) -> Vec<ElementProperty> {
        Vec::new()
    }

    fn required_predecessors(&self) -> Vec<String> {
        Vec::new()
    }

    /// Compute properties for `data` and write them into `aspect`.
    fn process_engine(&self, data: &FlowData, aspect: &AspectData) -> PipelineResult<()>;

    fn close(&self) -> PipelineResult<()> {
        Ok(())
    }
}

struct LazyRuntime {
    timeout: Duration,
    executor: Arc<dyn LazyExecutor>,
    /// Built from a custom factory, so closed with the element.
    owned: bool,
}

/// Flow element wrapping an [`AspectEngine`].
pub struct AspectEngineElement {
    engine: Arc<dyn AspectEngine>,
    cache: Option<Arc<dyn ResultCache>>,
    lazy: Option<LazyRuntime>,
}

impl AspectEngineElement {
    pub fn builder(engine: Arc<dyn AspectEngine>) -> AspectEngineElementBuilder {
        AspectEngineElementBuilder {
            engine,
            cache: None,
            lazy: None,
        }
    }

    pub fn engine(&self) -> &Arc<dyn AspectEngine> {
        &self.engine
    }

    /// Typed key of the result object in the flow data.
    pub fn data_key(&self) -> TypedKey<AspectData> {
        TypedKey::new(self.engine.element_data_key())
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy.is_some()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    /// Install a cached result. Another engine sharing the data key may
    /// already have created the object, so properties are merged in.
    fn install_cached(&self, data: &FlowData, cached: &AspectData) -> PipelineResult<()> {
        let aspect = data.get_or_add(&self.data_key(), || {
            Arc::new(AspectData::new(self.engine.element_data_key()))
        })?;
        aspect.merge_from(cached);
        Ok(())
    }

    fn store(cache: &Option<Arc<dyn ResultCache>>, key: Option<DataKey>, aspect: &AspectData) {
        if let (Some(cache), Some(key)) = (cache, key) {
            cache.put_by_key(key, Arc::new(aspect.snapshot()) as ElementDataRef);
        }
    }

    fn dispatch(
        &self,
        lazy: &LazyRuntime,
        data: &FlowData,
        aspect: Arc<AspectData>,
        key: Option<DataKey>,
    ) -> PipelineResult<()> {
        let name = self.engine.name().to_string();
        let task = LazyTask::new(name.clone());
        aspect.register_task(task.clone(), lazy.timeout);
        data.on_stop(task.clone());

        let engine = self.engine.clone();
        let cache = self.cache.clone();
        let mut guard = JobGuard {
            task: task.clone(),
            flow: data.clone(),
            engine: name,
            started: false,
        };
        let spawned = lazy.executor.spawn(Box::new(move || {
            guard.started = true;
            let (flow, job_task) = (&guard.flow, &guard.task);
            if flow.is_stopped() || job_task.is_cancelled() {
                job_task.cancel();
                return;
            }
            let result = engine.process_engine(flow, &aspect);
            if result.is_ok() && !job_task.is_cancelled() {
                Self::store(&cache, key, &aspect);
            }
            if let Err(e) = &result {
                warn!(
                    engine = %guard.engine,
                    flow_data = %flow.id(),
                    error = %e,
                    "Lazy engine processing failed"
                );
            }
            job_task.complete(result);
        }));

        if let Err(e) = spawned {
            task.complete(Err(e.clone()));
            return Err(e);
        }
        debug!(engine = %self.engine.name(), flow_data = %data.id(), "Lazy processing dispatched");
        Ok(())
    }
}

/// Resolves a lazy task if its job ends without doing so: the engine
/// panicked, or the executor dropped the job before running it.
struct JobGuard {
    task: Arc<LazyTask>,
    flow: FlowData,
    engine: String,
    started: bool,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if self.task.is_done() {
            return;
        }
        if self.flow.is_stopped() {
            self.task.cancel();
            return;
        }
        let reason = if self.started {
            "engine panicked during processing"
        } else {
            "executor dropped the job before it ran"
        };
        warn!(engine = %self.engine, flow_data = %self.flow.id(), reason, "Lazy task abandoned");
        self.task
            .complete(Err(PipelineError::element(self.engine.clone(), reason)));
    }
}

impl FlowElement for AspectEngineElement {
    fn element_data_key(&self) -> &str {
        self.engine.element_data_key()
    }

    fn evidence_key_filter(&self) -> Arc<dyn EvidenceKeyFilter> {
        self.engine.evidence_key_filter()
    }

    fn properties(&self) -> Vec<ElementProperty> {
        self.engine.properties()
    }

    fn required_predecessors(&self) -> Vec<String> {
        self.engine.required_predecessors()
    }

    fn process(&self, data: &FlowData) -> PipelineResult<()> {
        let key = self.cache.as_ref().map(|cache| cache.key_for(data));

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(hit) = cache.get_by_key(key) {
                match hit.downcast::<AspectData>() {
                    Ok(cached) => {
                        debug!(
                            engine = %self.engine.name(),
                            flow_data = %data.id(),
                            "Result cache hit"
                        );
                        return self.install_cached(data, &cached);
                    }
                    Err(_) => {
                        warn!(engine = %self.engine.name(), "Result cache held an unexpected type");
                    }
                }
            }
        }

        let aspect = data.get_or_add(&self.data_key(), || {
            Arc::new(AspectData::new(self.engine.element_data_key()))
        })?;
        aspect.add_engine(self.engine.name());
        aspect.add_properties(self.engine.properties());

        match &self.lazy {
            Some(lazy) => self.dispatch(lazy, data, aspect, key),
            None => {
                self.engine.process_engine(data, &aspect)?;
                Self::store(&self.cache, key, &aspect);
                Ok(())
            }
        }
    }

    fn close(&self) -> PipelineResult<()> {
        if let Some(lazy) = &self.lazy {
            if lazy.owned {
                lazy.executor.shutdown();
            }
        }
        debug!(engine = %self.engine.name(), "Engine closed");
        self.engine.close()
    }
}

impl fmt::Debug for AspectEngineElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AspectEngineElement")
            .field("engine", &self.engine.name())
            .field("cached", &self.cache.is_some())
            .field("lazy", &self.lazy.as_ref().map(|l| l.timeout))
            .finish()
    }
}

/// Builds an [`AspectEngineElement`].
pub struct AspectEngineElementBuilder {
    engine: Arc<dyn AspectEngine>,
    cache: Option<CacheConfiguration>,
    lazy: Option<LazyLoadingConfiguration>,
}

impl AspectEngineElementBuilder {
    /// Memoize results by fingerprint using the named cache builder.
    pub fn with_cache(mut self, config: CacheConfiguration) -> Self {
        self.cache = Some(config);
        self
    }

    /// Run the engine asynchronously with the given property timeout.
    pub fn with_lazy_loading(mut self, config: LazyLoadingConfiguration) -> Self {
        self.lazy = Some(config);
        self
    }

    pub fn build(self) -> PipelineResult<AspectEngineElement> {
        let cache = match &self.cache {
            Some(config) => Some(build_result_cache(
                config,
                self.engine.evidence_key_filter(),
            )?),
            None => None,
        };

        let lazy = match self.lazy {
            Some(config) => {
                config.validate()?;
                let (executor, owned) = match &config.executor_factory {
                    Some(factory) => {
                        let executor = factory()?;
                        let owned = !is_default_executor(&executor);
                        (executor, owned)
                    }
                    None => (default_executor()?, false),
                };
                Some(LazyRuntime {
                    timeout: config.property_timeout,
                    executor,
                    owned,
                })
            }
            None => None,
        };

        debug!(
            engine = %self.engine.name(),
            cached = cache.is_some(),
            lazy = lazy.is_some(),
            "Aspect engine element built"
        );
        Ok(AspectEngineElement {
            engine: self.engine,
            cache,
            lazy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::{Pipeline, PipelineError, WhitelistFilter};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes the user agent length, counting invocations.
    struct LengthEngine {
        calls: AtomicUsize,
        fail: bool,
    }

    impl LengthEngine {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl AspectEngine for LengthEngine {
        fn element_data_key(&self) -> &str {
            "length"
        }

        fn evidence_key_filter(&self) -> Arc<dyn EvidenceKeyFilter> {
            Arc::new(WhitelistFilter::new(["header.user-agent"]))
        }

        fn properties(&self) -> Vec<ElementProperty> {
            vec![ElementProperty::new("chars", "length")]
        }

        fn process_engine(&self, data: &FlowData, aspect: &AspectData) -> PipelineResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::element("length", "no data source"));
            }
            let ua = data
                .get_evidence("header.user-agent")
                .and_then(|v| v.as_str().map(str::len))
                .unwrap_or(0);
            aspect.set("chars", ua);
            Ok(())
        }
    }

    fn run(element: Arc<AspectEngineElement>, ua: &str) -> PipelineResult<Arc<AspectData>> {
        let pipeline = Pipeline::builder().add_element(element.clone()).build()?;
        let data = pipeline.create_flow_data()?;
        data.add_evidence("header.user-agent", ua)?;
        data.process()?;
        data.get(&element.data_key())
    }

    #[test]
    fn test_direct_processing() {
        let engine = LengthEngine::new(false);
        let element = Arc::new(AspectEngineElement::builder(engine.clone()).build().unwrap());
        let aspect = run(element, "abcd").unwrap();
        assert_eq!(aspect.get_as::<usize>("chars").unwrap(), 4);
        assert_eq!(aspect.engines(), vec!["length"]);
    }

    #[test]
    fn test_cache_hit_skips_engine() {
        let engine = LengthEngine::new(false);
        let element = Arc::new(
            AspectEngineElement::builder(engine.clone())
                .with_cache(CacheConfiguration::new(10))
                .build()
                .unwrap(),
        );
        run(element.clone(), "abc").unwrap();
        let second = run(element.clone(), "abc").unwrap();
        assert_eq!(second.get_as::<usize>("chars").unwrap(), 3);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        run(element.clone(), "abcdef").unwrap();
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
        let stats = element.cache_stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_failure_is_not_cached() {
        let engine = LengthEngine::new(true);
        let element = Arc::new(
            AspectEngineElement::builder(engine.clone())
                .with_cache(CacheConfiguration::new(10))
                .build()
                .unwrap(),
        );
        assert!(matches!(
            run(element.clone(), "abc"),
            Err(PipelineError::Aggregate(_))
        ));
        assert!(run(element.clone(), "abc").is_err());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
        assert_eq!(element.cache_stats().unwrap().entry_count, 0);
    }

    #[test]
    fn test_lazy_processing_completes() {
        let engine = LengthEngine::new(false);
        let element = Arc::new(
            AspectEngineElement::builder(engine.clone())
                .with_lazy_loading(LazyLoadingConfiguration::new(Duration::from_secs(5)))
                .build()
                .unwrap(),
        );
        assert!(element.is_lazy());
        let aspect = run(element, "abcde").unwrap();
        assert_eq!(aspect.get_as::<usize>("chars").unwrap(), 5);
        assert!(aspect.process_handle().is_done());
    }

    #[test]
    fn test_lazy_failure_surfaces_on_read() {
        let engine = LengthEngine::new(true);
        let element = Arc::new(
            AspectEngineElement::builder(engine)
                .with_lazy_loading(LazyLoadingConfiguration::new(Duration::from_secs(5)))
                .build()
                .unwrap(),
        );
        // Dispatch succeeds; the failure belongs to the property read.
        let aspect = run(element, "abc").unwrap();
        match aspect.get("chars") {
            Err(PipelineError::LazyLoad(pipeline_core::LazyLoadError::Failed { engine, .. })) => {
                assert_eq!(engine, "length");
            }
            other => panic!("expected failed lazy load, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_cache_builder_fails_build() {
        let result = AspectEngineElement::builder(LengthEngine::new(false))
            .with_cache(CacheConfiguration::new(10).with_builder("nope"))
            .build();
        assert!(matches!(result, Err(ref e) if e.is_fatal()));
    }
}
