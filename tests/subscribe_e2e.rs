use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use factstream::{
    Fact, FactServer, FactSpec, FactStreamPosition, ServerError, Subscriber, SubscriptionRequest,
    TransformRequest, Transformers,
};

#[derive(Clone, Default)]
struct Collector {
    facts: Arc<Mutex<Vec<Arc<Fact>>>>,
}

impl factstream::FactObserver for Collector {
    fn on_next(&mut self, fact: Arc<Fact>) {
        self.facts.lock().unwrap().push(fact);
    }
}

impl Collector {
    fn ids(&self) -> Vec<Uuid> {
        self.facts.lock().unwrap().iter().map(|f| f.id()).collect()
    }

    fn wait_for(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.facts.lock().unwrap().len() < count {
            assert!(Instant::now() < deadline, "timed out waiting for {count} facts");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

fn fact(ns: &str) -> Fact {
    Fact::builder(ns).build().unwrap()
}

#[test]
fn follow_delivers_history_then_live_facts_in_order() {
    let server = FactServer::in_memory();
    let first = fact("orders");
    let second = fact("orders");
    let expected = vec![first.id(), second.id()];
    server.publish(vec![first]).unwrap();

    let collector = Collector::default();
    let request = SubscriptionRequest::follow(FactSpec::ns("orders"))
        .build()
        .unwrap();
    let sub = server
        .subscribe(request, Box::new(collector.clone()))
        .unwrap();
    sub.await_catchup_for(Duration::from_secs(5)).unwrap();
    assert_eq!(collector.ids().len(), 1);

    let third = fact("payments");
    server.publish(vec![second, third]).unwrap();

    collector.wait_for(2);
    assert_eq!(collector.ids(), expected);
    sub.close();
}

#[test]
fn catchup_subscription_completes() {
    let server = FactServer::in_memory();
    server.publish(vec![fact("orders"), fact("orders")]).unwrap();

    let collector = Collector::default();
    let request = SubscriptionRequest::catchup(FactSpec::ns("orders"))
        .build()
        .unwrap();
    let sub = server
        .subscribe(request, Box::new(collector.clone()))
        .unwrap();

    sub.await_complete_for(Duration::from_secs(5)).unwrap();
    assert_eq!(collector.ids().len(), 2);
}

#[test]
fn starting_after_resumes_mid_stream() {
    let server = FactServer::in_memory();
    let first_pos = server.publish(vec![fact("orders")]).unwrap();
    let second = fact("orders");
    let second_id = second.id();
    server.publish(vec![second]).unwrap();

    let collector = Collector::default();
    let request = SubscriptionRequest::catchup(FactSpec::ns("orders"))
        .starting_after(first_pos)
        .build()
        .unwrap();
    let sub = server
        .subscribe(request, Box::new(collector.clone()))
        .unwrap();

    sub.await_complete_for(Duration::from_secs(5)).unwrap();
    assert_eq!(collector.ids(), vec![second_id]);
}

#[test]
fn id_only_position_resumes_like_a_reconnecting_client() {
    let server = FactServer::in_memory();
    let first_pos = server.publish(vec![fact("orders")]).unwrap();
    let second = fact("orders");
    let second_id = second.id();
    server.publish(vec![second]).unwrap();

    let collector = Collector::default();
    let request = SubscriptionRequest::catchup(FactSpec::ns("orders"))
        .starting_after(FactStreamPosition::without_serial(
            first_pos.fact_id().unwrap(),
        ))
        .build()
        .unwrap();
    let sub = server
        .subscribe(request, Box::new(collector.clone()))
        .unwrap();

    sub.await_complete_for(Duration::from_secs(5)).unwrap();
    assert_eq!(collector.ids(), vec![second_id]);
}

#[test]
fn ephemeral_subscription_starts_at_the_head() {
    let server = FactServer::in_memory();
    server.publish(vec![fact("orders"), fact("orders")]).unwrap();

    let collector = Collector::default();
    let request = SubscriptionRequest::follow(FactSpec::ns("orders"))
        .ephemeral()
        .build()
        .unwrap();
    let sub = server
        .subscribe(request, Box::new(collector.clone()))
        .unwrap();
    sub.await_catchup_for(Duration::from_secs(5)).unwrap();
    assert!(collector.ids().is_empty());

    let live = fact("orders");
    let live_id = live.id();
    server.publish(vec![live]).unwrap();

    collector.wait_for(1);
    assert_eq!(collector.ids(), vec![live_id]);
    sub.close();
}

#[test]
fn blocked_facts_are_dropped_from_every_stream() {
    let server = FactServer::in_memory();
    let bad = fact("orders");
    let bad_id = bad.id();
    let good = fact("orders");
    let good_id = good.id();
    server.publish(vec![bad, good]).unwrap();

    server.blacklist().block(bad_id);

    let collector = Collector::default();
    let request = SubscriptionRequest::catchup(FactSpec::ns("orders"))
        .build()
        .unwrap();
    let sub = server
        .subscribe(request, Box::new(collector.clone()))
        .unwrap();

    sub.await_complete_for(Duration::from_secs(5)).unwrap();
    assert_eq!(collector.ids(), vec![good_id]);
    assert_eq!(server.metrics().facts_blacklisted(), 1);
}

struct Upcaster;

impl Transformers for Upcaster {
    fn prepare(&self, fact: &Arc<Fact>) -> Option<TransformRequest> {
        (fact.version() < 2).then(|| TransformRequest::to_version(Arc::clone(fact), 2))
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
                    .version(2)
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

#[test]
fn subscribers_receive_upcasted_facts() {
    let server = FactServer::in_memory().with_transformers(Arc::new(Upcaster));
    server
        .publish(vec![
            Fact::builder("orders").version(1).build().unwrap(),
            Fact::builder("orders").version(2).build().unwrap(),
        ])
        .unwrap();

    let collector = Collector::default();
    let request = SubscriptionRequest::catchup(FactSpec::ns("orders"))
        .build()
        .unwrap();
    let sub = server
        .subscribe(request, Box::new(collector.clone()))
        .unwrap();

    sub.await_complete_for(Duration::from_secs(5)).unwrap();
    let versions: Vec<u32> = collector
        .facts
        .lock()
        .unwrap()
        .iter()
        .map(|f| f.version())
        .collect();
    assert_eq!(versions, vec![2, 2]);
    assert!(server.metrics().transform_batches() >= 1);
}

#[test]
fn unrelated_traffic_does_not_defer_the_batch_flush() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let server = Arc::new(FactServer::in_memory().with_transformers(Arc::new(Upcaster)));

    let collector = Collector::default();
    let request = SubscriptionRequest::follow(FactSpec::ns("orders"))
        .max_batch_delay(Duration::from_millis(100))
        .build()
        .unwrap();
    let sub = server
        .subscribe(request, Box::new(collector.clone()))
        .unwrap();
    sub.await_catchup_for(Duration::from_secs(5)).unwrap();

    // Keep the wakeup bus busy with facts the subscription never matches.
    let stop = Arc::new(AtomicBool::new(false));
    let publisher = {
        let server = Arc::clone(&server);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                server.publish(vec![fact("payments")]).unwrap();
                std::thread::sleep(Duration::from_millis(15));
            }
        })
    };

    let started = Instant::now();
    server
        .publish(vec![Fact::builder("orders").version(1).build().unwrap()])
        .unwrap();
    collector.wait_for(1);
    let elapsed = started.elapsed();

    stop.store(true, Ordering::Release);
    publisher.join().unwrap();

    // One batch delay plus slack, not "whenever the bus goes quiet".
    assert!(
        elapsed < Duration::from_millis(600),
        "buffered fact took {elapsed:?} to flush"
    );
    assert_eq!(collector.facts.lock().unwrap()[0].version(), 2);
    sub.close();
}
