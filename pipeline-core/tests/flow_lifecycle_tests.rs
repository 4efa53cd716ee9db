use pipeline_core::{
    ElementProperty, Evidence, EvidenceKeyFilter, FlowData, FlowElement, Pipeline,
    PipelineError, PipelineResult, TypedKey, WhitelistFilter,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Copies a header value into its element data, upper-cased.
struct Upper {
    calls: AtomicUsize,
}

impl Upper {
    const KEY: &'static str = "upper";

    fn data_key() -> TypedKey<String> {
        TypedKey::new(Self::KEY)
    }
}

impl FlowElement for Upper {
    fn element_data_key(&self) -> &str {
        Self::KEY
    }

    fn evidence_key_filter(&self) -> Arc<dyn EvidenceKeyFilter> {
        Arc::new(WhitelistFilter::new(["header.user-agent"]))
    }

    fn properties(&self) -> Vec<ElementProperty> {
        vec![ElementProperty::new("value", Self::KEY)]
    }

    fn process(&self, data: &FlowData) -> PipelineResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let value = data
            .get_evidence("header.user-agent")
            .and_then(|v| v.as_str().map(str::to_uppercase))
            .ok_or_else(|| PipelineError::element(Self::KEY, "no user agent"))?;
        data.set(&Self::data_key(), Arc::new(value));
        Ok(())
    }
}

fn pipeline() -> (Pipeline, Arc<Upper>) {
    let element = Arc::new(Upper {
        calls: AtomicUsize::new(0),
    });
    let pipeline = Pipeline::builder()
        .add_element(element.clone())
        .build()
        .expect("build pipeline");
    (pipeline, element)
}

#[test]
fn process_runs_once_and_exposes_results() {
    let (pipeline, element) = pipeline();
    let data = pipeline.create_flow_data().expect("flow data");
    data.add_evidence("Header.User-Agent", "abc").expect("evidence");

    assert!(matches!(
        data.get(&Upper::data_key()),
        Err(PipelineError::NotProcessed)
    ));

    data.process().expect("process");
    assert_eq!(data.get(&Upper::data_key()).unwrap().as_str(), "ABC");
    assert!(matches!(data.process(), Err(PipelineError::AlreadyProcessed)));
    assert!(matches!(
        data.add_evidence("query.x", "1"),
        Err(PipelineError::AlreadyProcessed)
    ));
    assert_eq!(element.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_data_and_wrong_type_are_distinct() {
    let (pipeline, _) = pipeline();
    let data = pipeline.create_flow_data().unwrap();
    data.add_evidence("header.user-agent", "abc").unwrap();
    data.process().unwrap();

    assert!(matches!(
        data.get_by_name("nothing"),
        Err(PipelineError::DataMissing { .. })
    ));
    assert!(matches!(
        data.get(&TypedKey::<u64>::new(Upper::KEY)),
        Err(PipelineError::DataTypeMismatch { .. })
    ));
}

#[test]
fn element_failure_is_reported_in_aggregate() {
    let (pipeline, _) = pipeline();
    let data = pipeline.create_flow_data().unwrap();
    match data.process() {
        Err(PipelineError::Aggregate(errors)) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].element, Upper::KEY);
        }
        other => panic!("expected aggregate error, got {:?}", other),
    }
    assert_eq!(data.errors().len(), 1);
}

#[test]
fn flow_data_fingerprint_uses_pipeline_filter() {
    let (pipeline, _) = pipeline();
    let first = pipeline.create_flow_data().unwrap();
    let evidence = Evidence::new()
        .with("header.user-agent", "abc")
        .with("query.session", json!(42));
    first.add_all_evidence(&evidence).unwrap();

    let second = pipeline.create_flow_data().unwrap();
    second.add_evidence("header.user-agent", "abc").unwrap();

    let filter = pipeline.evidence_key_filter();
    assert_eq!(
        first.generate_key(filter.as_ref()),
        second.generate_key(filter.as_ref())
    );
    assert_ne!(first.id(), second.id());
}
