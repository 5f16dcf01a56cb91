use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver};
use uuid::Uuid;

use factstream::pipeline::blacklist::Blacklist;
use factstream::pipeline::{build_pipeline, PipelineConfig, SignalSink};
use factstream::{
    Fact, FactSpec, FilterScript, InMemoryBlacklist, NoTransformers, PipelineMetrics, ServerError,
    Signal, SubscriptionRequest, TransformRequest, Transformers,
};

struct Upcaster {
    target: u32,
}

impl Transformers for Upcaster {
    fn prepare(&self, fact: &Arc<Fact>) -> Option<TransformRequest> {
        (fact.version() < self.target)
            .then(|| TransformRequest::to_version(Arc::clone(fact), self.target))
    }

    fn transform_batch(
        &self,
        batch: Vec<TransformRequest>,
    ) -> Result<HashMap<Uuid, Arc<Fact>>, ServerError> {
        batch
            .into_iter()
            .map(|req| {
                let fact = Fact::builder(req.fact.ns())
                    .id(req.fact.id())
                    .version(self.target)
                    .payload(req.fact.payload().clone())
                    .build()
                    .map_err(|e| ServerError::TransformationFailed {
                        reason: e.to_string(),
                    })?;
                Ok((fact.id(), Arc::new(fact)))
            })
            .collect()
    }
}

struct FailingTransformers;

impl Transformers for FailingTransformers {
    fn prepare(&self, fact: &Arc<Fact>) -> Option<TransformRequest> {
        Some(TransformRequest {
            fact: Arc::clone(fact),
            target_versions: BTreeSet::from([3]),
        })
    }

    fn transform_batch(
        &self,
        _batch: Vec<TransformRequest>,
    ) -> Result<HashMap<Uuid, Arc<Fact>>, ServerError> {
        Err(ServerError::TransformationFailed {
            reason: "no transformation chain".to_string(),
        })
    }
}

fn chain_for(
    request: &SubscriptionRequest,
    blacklist: Arc<InMemoryBlacklist>,
    transformers: Arc<dyn Transformers>,
    metrics: Arc<PipelineMetrics>,
) -> (Box<dyn SignalSink>, Receiver<Signal>) {
    let (tx, rx) = bounded(64);
    let chain = build_pipeline(
        request,
        blacklist as Arc<dyn Blacklist>,
        transformers,
        metrics,
        tx,
        &PipelineConfig::default(),
    );
    (chain, rx)
}

fn drain(rx: &Receiver<Signal>) -> Vec<Signal> {
    let mut out = Vec::new();
    while let Ok(signal) = rx.try_recv() {
        out.push(signal);
    }
    out
}

fn fact(ns: &str, version: u32) -> Arc<Fact> {
    Arc::new(Fact::builder(ns).version(version).build().unwrap())
}

#[test]
fn signals_traverse_the_whole_chain_in_order() {
    let request = SubscriptionRequest::follow(FactSpec::ns("orders"))
        .build()
        .unwrap();
    let metrics = Arc::new(PipelineMetrics::new());
    let (mut chain, rx) = chain_for(
        &request,
        Arc::new(InMemoryBlacklist::new()),
        Arc::new(NoTransformers),
        Arc::clone(&metrics),
    );

    chain.process(Signal::Fact(fact("orders", 1))).unwrap();
    chain.process(Signal::Fact(fact("orders", 2))).unwrap();
    chain.process(Signal::Catchup).unwrap();

    let seen = drain(&rx);
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].as_fact().unwrap().version(), 1);
    assert_eq!(seen[1].as_fact().unwrap().version(), 2);
    assert!(matches!(seen[2], Signal::Catchup));
    assert_eq!(metrics.facts_delivered(), 2);
}

#[test]
fn blacklisted_facts_never_reach_transformation_or_the_client() {
    let request = SubscriptionRequest::follow(FactSpec::ns("orders"))
        .build()
        .unwrap();
    let metrics = Arc::new(PipelineMetrics::new());
    let blacklist = Arc::new(InMemoryBlacklist::new());
    let (mut chain, rx) = chain_for(
        &request,
        Arc::clone(&blacklist),
        Arc::new(Upcaster { target: 2 }),
        Arc::clone(&metrics),
    );

    let blocked = fact("orders", 1);
    blacklist.block(blocked.id());

    chain.process(Signal::Fact(Arc::clone(&blocked))).unwrap();
    chain.process(Signal::Flush).unwrap();

    let seen = drain(&rx);
    assert_eq!(seen.len(), 1);
    assert!(matches!(seen[0], Signal::Flush));
    assert_eq!(metrics.facts_blacklisted(), 1);
    // The blocked fact was dropped upstream of the batching stage.
    assert_eq!(metrics.transform_batches(), 0);
}

#[test]
fn post_query_filter_sees_transformed_facts() {
    // The script requires version 2; the stored facts are version 1, so they
    // only pass if filtering runs downstream of the transformation.
    let script = FilterScript::Eq {
        path: "header.version".to_string(),
        value: serde_json::json!(2),
    };
    let request = SubscriptionRequest::follow(FactSpec::ns("orders").filter_script(script))
        .build()
        .unwrap();
    let metrics = Arc::new(PipelineMetrics::new());
    let (mut chain, rx) = chain_for(
        &request,
        Arc::new(InMemoryBlacklist::new()),
        Arc::new(Upcaster { target: 2 }),
        metrics,
    );

    chain.process(Signal::Fact(fact("orders", 1))).unwrap();
    chain.process(Signal::Catchup).unwrap();

    let seen = drain(&rx);
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].as_fact().unwrap().version(), 2);
    assert!(matches!(seen[1], Signal::Catchup));
}

#[test]
fn filter_scripts_drop_non_matching_facts() {
    let script = FilterScript::Eq {
        path: "payload.region".to_string(),
        value: serde_json::json!("eu"),
    };
    let request = SubscriptionRequest::follow(FactSpec::ns("orders").filter_script(script))
        .build()
        .unwrap();
    let metrics = Arc::new(PipelineMetrics::new());
    let (mut chain, rx) = chain_for(
        &request,
        Arc::new(InMemoryBlacklist::new()),
        Arc::new(NoTransformers),
        Arc::clone(&metrics),
    );

    let eu = Arc::new(
        Fact::builder("orders")
            .payload(serde_json::json!({"region": "eu"}))
            .build()
            .unwrap(),
    );
    let us = Arc::new(
        Fact::builder("orders")
            .payload(serde_json::json!({"region": "us"}))
            .build()
            .unwrap(),
    );

    chain.process(Signal::Fact(Arc::clone(&eu))).unwrap();
    chain.process(Signal::Fact(us)).unwrap();

    let seen = drain(&rx);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].as_fact().unwrap().id(), eu.id());
    assert_eq!(metrics.facts_filtered(), 1);
}

#[test]
fn failed_transformation_surfaces_as_one_error_signal() {
    let request = SubscriptionRequest::follow(FactSpec::ns("orders"))
        .build()
        .unwrap();
    let metrics = Arc::new(PipelineMetrics::new());
    let (mut chain, rx) = chain_for(
        &request,
        Arc::new(InMemoryBlacklist::new()),
        Arc::new(FailingTransformers),
        Arc::clone(&metrics),
    );

    chain.process(Signal::Fact(fact("orders", 1))).unwrap();
    chain.process(Signal::Fact(fact("orders", 1))).unwrap();
    chain.process(Signal::Catchup).unwrap();

    let seen = drain(&rx);
    assert_eq!(seen.len(), 1);
    assert!(matches!(&seen[0], Signal::Error(e) if e.is_server_origin()));
    assert_eq!(metrics.transform_failures(), 1);
    assert_eq!(metrics.facts_delivered(), 0);
}
