//! Lazy property loading through a full pipeline.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pipeline_core::PipelineError;
use pipeline_engines::{
    default_executor_factory, AspectEngineElement, CacheConfiguration, LazyLoadingConfiguration,
};
use pipeline_test_utils::assertions::{assert_aggregate, assert_cancelled, assert_timeout};
use pipeline_test_utils::fixtures::{
    browser_evidence, flow_data, process, sequential_pipeline, DESKTOP_UA, MOBILE_UA,
};
use pipeline_test_utils::{
    lazy_config_with, FlowElement, LazyLoadError, ManualExecutor, MockEngine, ThreadPerJobExecutor,
};

fn lazy_element(
    engine: Arc<MockEngine>,
    timeout: Duration,
    executor: Arc<dyn pipeline_engines::LazyExecutor>,
) -> Arc<AspectEngineElement> {
    Arc::new(
        AspectEngineElement::builder(engine)
            .with_lazy_loading(lazy_config_with(timeout, executor))
            .build()
            .unwrap(),
    )
}

fn as_elements(elements: &[Arc<AspectEngineElement>]) -> Vec<Arc<dyn FlowElement>> {
    elements
        .iter()
        .map(|e| e.clone() as Arc<dyn FlowElement>)
        .collect()
}

// ============================================================================
// TIMEOUTS
// ============================================================================

#[test]
fn test_fast_engine_returns_value_within_timeout() {
    let engine = MockEngine::new("device")
        .with_property("IsMobile", false)
        .with_cost(Duration::from_millis(10))
        .into_arc();
    let element = lazy_element(engine.clone(), Duration::from_secs(2), ThreadPerJobExecutor::new());
    let pipeline = sequential_pipeline(as_elements(&[element.clone()])).unwrap();

    let data = process(&pipeline, &browser_evidence(DESKTOP_UA)).unwrap();
    let device = data.get(&element.data_key()).unwrap();

    assert!(!device.get_as::<bool>("ismobile").unwrap());
    assert_eq!(device.get_as::<usize>("ua_length").unwrap(), DESKTOP_UA.len());
    assert_eq!(engine.calls(), 1);
    assert!(device.process_handle().is_done());
}

#[test]
fn test_slow_engine_times_out() {
    let engine = MockEngine::new("device")
        .with_property("IsMobile", true)
        .with_cost(Duration::from_millis(500))
        .into_arc();
    let element = lazy_element(engine, Duration::from_millis(50), ThreadPerJobExecutor::new());
    let pipeline = sequential_pipeline(as_elements(&[element.clone()])).unwrap();

    let data = process(&pipeline, &browser_evidence(MOBILE_UA)).unwrap();
    let device = data.get(&element.data_key()).unwrap();

    let started = Instant::now();
    let result = device.get("ismobile");
    let waited = started.elapsed();

    assert_timeout(&result);
    assert!(waited >= Duration::from_millis(40), "returned early: {:?}", waited);
    assert!(waited < Duration::from_millis(400), "waited too long: {:?}", waited);
}

#[test]
fn test_process_returns_before_engine_finishes() {
    let engine = MockEngine::new("device")
        .with_cost(Duration::from_millis(300))
        .into_arc();
    let element = lazy_element(engine, Duration::from_secs(2), ThreadPerJobExecutor::new());
    let pipeline = sequential_pipeline(as_elements(&[element.clone()])).unwrap();

    let started = Instant::now();
    let data = process(&pipeline, &browser_evidence(DESKTOP_UA)).unwrap();
    assert!(started.elapsed() < Duration::from_millis(250));

    let device = data.get(&element.data_key()).unwrap();
    assert!(!device.process_handle().is_done());
    assert_eq!(device.get_as::<usize>("ua_length").unwrap(), DESKTOP_UA.len());
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[test]
fn test_stop_before_dispatch_runs_cancels_task() {
    let engine = MockEngine::new("device").into_arc();
    let executor = ManualExecutor::new();
    let element = lazy_element(engine.clone(), Duration::from_secs(5), executor.clone());
    let pipeline = sequential_pipeline(as_elements(&[element.clone()])).unwrap();

    let data = process(&pipeline, &browser_evidence(DESKTOP_UA)).unwrap();
    assert_eq!(executor.pending(), 1);
    data.stop();

    let device = data.get(&element.data_key()).unwrap();
    let started = Instant::now();
    assert_cancelled(&device.get("ua_length"));
    assert!(started.elapsed() < Duration::from_secs(1));

    // The queued job notices the stop and never calls the engine.
    executor.run_all();
    assert_eq!(engine.calls(), 0);
}

#[test]
fn test_stop_wakes_blocked_reader() {
    let engine = MockEngine::new("device")
        .with_cost(Duration::from_millis(800))
        .into_arc();
    let element = lazy_element(engine, Duration::from_secs(5), ThreadPerJobExecutor::new());
    let pipeline = sequential_pipeline(as_elements(&[element.clone()])).unwrap();

    let data = process(&pipeline, &browser_evidence(DESKTOP_UA)).unwrap();
    let device = data.get(&element.data_key()).unwrap();

    let stopper = {
        let data = data.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            data.stop();
        })
    };

    let started = Instant::now();
    let result = device.get("ua_length");
    assert_cancelled(&result);
    assert!(started.elapsed() < Duration::from_millis(700));
    stopper.join().unwrap();
}

// ============================================================================
// FAILURES
// ============================================================================

#[test]
fn test_single_failure_is_reported_as_is() {
    let engine = MockEngine::new("device").failing("no data file").into_arc();
    let element = lazy_element(engine, Duration::from_secs(2), ThreadPerJobExecutor::new());
    let pipeline = sequential_pipeline(as_elements(&[element.clone()])).unwrap();

    let data = process(&pipeline, &browser_evidence(DESKTOP_UA)).unwrap();
    let device = data.get(&element.data_key()).unwrap();

    match device.get("ua_length") {
        Err(PipelineError::LazyLoad(LazyLoadError::Failed { engine, .. })) => {
            assert_eq!(engine, "device");
        }
        other => panic!("expected engine failure, got {:?}", other),
    }
}

#[test]
fn test_engines_sharing_a_key_aggregate_failures() {
    let first = MockEngine::new("device").named("hardware").failing("broken").into_arc();
    let second = MockEngine::new("device").named("software").failing("also broken").into_arc();
    let executor = ThreadPerJobExecutor::new();
    let elements = [
        lazy_element(first, Duration::from_secs(2), executor.clone()),
        lazy_element(second, Duration::from_secs(2), executor.clone()),
    ];
    let pipeline = sequential_pipeline(as_elements(&elements)).unwrap();

    let data = process(&pipeline, &browser_evidence(DESKTOP_UA)).unwrap();
    let device = data.get(&elements[0].data_key()).unwrap();
    assert_eq!(device.engines(), vec!["hardware", "software"]);

    let result = device.get("ua_length");
    let causes = assert_aggregate(&result, 2);
    assert!(causes
        .iter()
        .all(|c| matches!(c, LazyLoadError::Failed { .. })));
    match result {
        Err(PipelineError::LazyLoad(LazyLoadError::Aggregate { engines, .. })) => {
            assert_eq!(engines, "hardware, software");
        }
        other => panic!("expected aggregate, got {:?}", other),
    }
}

#[test]
fn test_one_of_two_engines_failing_keeps_the_other_result() {
    let good = MockEngine::new("device")
        .named("hardware")
        .with_property("vendor", "Acme")
        .into_arc();
    let bad = MockEngine::new("device").named("software").failing("broken").into_arc();
    let executor = ThreadPerJobExecutor::new();
    let elements = [
        lazy_element(good, Duration::from_secs(2), executor.clone()),
        lazy_element(bad, Duration::from_secs(2), executor.clone()),
    ];
    let pipeline = sequential_pipeline(as_elements(&elements)).unwrap();

    let data = process(&pipeline, &browser_evidence(DESKTOP_UA)).unwrap();
    let device = data.get(&elements[0].data_key()).unwrap();

    // Reads report the failure, but the successful engine's values are kept.
    assert!(device.get("vendor").is_err());
    assert!(device.property_names().contains(&"vendor".to_string()));
}

/// The failure cause behind a single failed lazy read.
fn failure_reason(result: &pipeline_core::PipelineResult<serde_json::Value>) -> String {
    match result {
        Err(PipelineError::LazyLoad(LazyLoadError::Failed { cause, .. })) => cause.to_string(),
        other => panic!("expected engine failure, got {:?}", other),
    }
}

#[test]
fn test_panicking_engine_fails_instead_of_timing_out() {
    let engine = MockEngine::new("device").panicking().into_arc();
    let element = lazy_element(engine, Duration::from_secs(5), ThreadPerJobExecutor::new());
    let pipeline = sequential_pipeline(as_elements(&[element.clone()])).unwrap();

    let data = process(&pipeline, &browser_evidence(DESKTOP_UA)).unwrap();
    let device = data.get(&element.data_key()).unwrap();

    let started = Instant::now();
    let result = device.get("ua_length");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(failure_reason(&result).contains("panicked"));
}

#[test]
fn test_job_dropped_by_executor_fails_instead_of_timing_out() {
    let engine = MockEngine::new("device").into_arc();
    let executor = ManualExecutor::new();
    let element = lazy_element(engine.clone(), Duration::from_secs(5), executor.clone());
    let pipeline = sequential_pipeline(as_elements(&[element.clone()])).unwrap();

    let data = process(&pipeline, &browser_evidence(DESKTOP_UA)).unwrap();
    executor.discard_all();

    let device = data.get(&element.data_key()).unwrap();
    let started = Instant::now();
    let result = device.get("ua_length");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(failure_reason(&result).contains("dropped"));
    assert_eq!(engine.calls(), 0);
}

#[test]
fn test_job_dropped_after_stop_is_cancelled() {
    let executor = ManualExecutor::new();
    let element = lazy_element(
        MockEngine::new("device").into_arc(),
        Duration::from_secs(5),
        executor.clone(),
    );
    let pipeline = sequential_pipeline(as_elements(&[element.clone()])).unwrap();

    let data = process(&pipeline, &browser_evidence(DESKTOP_UA)).unwrap();
    data.stop();
    executor.discard_all();

    assert_cancelled(&data.get(&element.data_key()).unwrap().get("ua_length"));
}

// ============================================================================
// CACHING AND LIFECYCLE
// ============================================================================

#[test]
fn test_lazy_result_is_cached_for_same_evidence() {
    let engine = MockEngine::new("device").with_property("IsMobile", true).into_arc();
    let element = Arc::new(
        AspectEngineElement::builder(engine.clone())
            .with_cache(CacheConfiguration::new(16))
            .with_lazy_loading(lazy_config_with(
                Duration::from_secs(2),
                ThreadPerJobExecutor::new(),
            ))
            .build()
            .unwrap(),
    );
    let pipeline = sequential_pipeline(as_elements(&[element.clone()])).unwrap();

    let first = process(&pipeline, &browser_evidence(MOBILE_UA)).unwrap();
    assert!(first
        .get(&element.data_key())
        .unwrap()
        .get_as::<bool>("ismobile")
        .unwrap());

    // Only the user agent is part of the key, so other evidence may differ.
    let evidence = browser_evidence(MOBILE_UA).with("query.page", "7");
    let second = process(&pipeline, &evidence).unwrap();
    let device = second.get(&element.data_key()).unwrap();
    assert!(device.process_handle().is_empty());
    assert!(device.get_as::<bool>("ismobile").unwrap());
    assert_eq!(engine.calls(), 1);
    assert_eq!(element.cache_stats().unwrap().hits, 1);
}

#[test]
fn test_custom_executor_shut_down_on_close() {
    let engine = MockEngine::new("device").into_arc();
    let executor = ThreadPerJobExecutor::new();
    let element = lazy_element(engine.clone(), Duration::from_secs(2), executor.clone());
    let pipeline = sequential_pipeline(as_elements(&[element.clone()])).unwrap();

    let data = flow_data(&pipeline, &browser_evidence(DESKTOP_UA)).unwrap();
    data.process().unwrap();
    data.get(&element.data_key())
        .unwrap()
        .get("ua_length")
        .unwrap();
    assert_eq!(executor.spawned(), 1);

    pipeline.close().unwrap();
    assert_eq!(executor.shutdowns(), 1);
    assert!(engine.is_closed());
    assert!(pipeline.create_flow_data().is_err());
}

#[test]
fn test_closing_element_leaves_shared_executor_running() {
    let borrowed = Arc::new(
        AspectEngineElement::builder(MockEngine::new("device").into_arc())
            .with_lazy_loading(
                LazyLoadingConfiguration::new(Duration::from_secs(2))
                    .with_executor_factory(default_executor_factory()),
            )
            .build()
            .unwrap(),
    );
    borrowed.close().unwrap();

    let engine = MockEngine::new("location").into_arc();
    let element = Arc::new(
        AspectEngineElement::builder(engine.clone())
            .with_lazy_loading(LazyLoadingConfiguration::default())
            .build()
            .unwrap(),
    );
    let pipeline = sequential_pipeline(as_elements(&[element.clone()])).unwrap();

    let data = process(&pipeline, &browser_evidence(DESKTOP_UA)).unwrap();
    let location = data.get(&element.data_key()).unwrap();
    assert_eq!(location.get_as::<usize>("ua_length").unwrap(), DESKTOP_UA.len());
    assert_eq!(engine.calls(), 1);
}

#[test]
fn test_parallel_lazy_engines() {
    let executor = ThreadPerJobExecutor::new();
    let elements = [
        lazy_element(
            MockEngine::new("device").with_cost(Duration::from_millis(100)).into_arc(),
            Duration::from_secs(2),
            executor.clone(),
        ),
        lazy_element(
            MockEngine::new("location").with_cost(Duration::from_millis(100)).into_arc(),
            Duration::from_secs(2),
            executor.clone(),
        ),
    ];
    let pipeline = pipeline_core::Pipeline::builder()
        .add_parallel(as_elements(&elements))
        .build()
        .unwrap();
    assert!(pipeline.is_concurrent());

    let data = process(&pipeline, &browser_evidence(DESKTOP_UA)).unwrap();
    for element in &elements {
        let aspect = data.get(&element.data_key()).unwrap();
        assert_eq!(aspect.get_as::<usize>("ua_length").unwrap(), DESKTOP_UA.len());
    }
    assert_eq!(executor.spawned(), 2);
}
