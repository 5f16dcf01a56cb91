//! The embedded fact server.
//!
//! [`FactServer`] owns the storage seam, the wakeup bus, and the shared
//! pipeline collaborators (blacklist, transformers, metrics). Each subscribe
//! call builds one signal pipeline and drives it from a dedicated producer
//! thread: stream info, catch-up from storage, an optional fast-forward, the
//! catch-up marker, then either completion or a live loop woken by the bus.
//! A second thread drains the pipeline's channel into the observer, so slow
//! observers exert backpressure on the channel instead of on storage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::error::{FactError, FactResult, SubscriptionError};
use crate::fact::Fact;
use crate::listener::bus::{EventBus, FactNotification};
use crate::metrics::PipelineMetrics;
use crate::pipeline::blacklist::{Blacklist, InMemoryBlacklist};
use crate::pipeline::{build_pipeline, PipelineConfig, SignalSink};
use crate::position::{FactStreamInfo, FactStreamPosition};
use crate::signal::Signal;
use crate::spec::{FactSpec, SubscriptionRequest};
use crate::store::memory::InMemoryFactStore;
use crate::store::{FactStore, StateToken};
use crate::subscription::{FactObserver, Subscriber, Subscription};
use crate::transform::{NoTransformers, Transformers};
use uuid::Uuid;

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of the per-subscription signal channel.
    pub channel_capacity: usize,
    /// Pipeline stage tuning.
    pub pipeline: PipelineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            pipeline: PipelineConfig::default(),
        }
    }
}

/// An embedded fact store server.
pub struct FactServer {
    store: Arc<dyn FactStore>,
    bus: Arc<EventBus>,
    blacklist: Arc<InMemoryBlacklist>,
    transformers: Arc<dyn Transformers>,
    metrics: Arc<PipelineMetrics>,
    cfg: ServerConfig,
}

impl FactServer {
    /// A server over an existing store and wakeup bus.
    ///
    /// The store must post a wakeup to `bus` per committed fact, or live
    /// subscriptions only advance on flush timeouts.
    #[must_use]
    pub fn new(store: Arc<dyn FactStore>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            blacklist: Arc::new(InMemoryBlacklist::new()),
            transformers: Arc::new(NoTransformers),
            metrics: Arc::new(PipelineMetrics::new()),
            cfg: ServerConfig::default(),
        }
    }

    /// A self-contained server over a fresh in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(InMemoryFactStore::with_bus(Arc::clone(&bus)));
        Self::new(store, bus)
    }

    /// Installs a schema transformation engine.
    #[must_use]
    pub fn with_transformers(mut self, transformers: Arc<dyn Transformers>) -> Self {
        self.transformers = transformers;
        self
    }

    /// Overrides the default tuning.
    #[must_use]
    pub fn with_config(mut self, cfg: ServerConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// The fact blacklist; blocked ids are dropped from every stream.
    #[must_use]
    pub fn blacklist(&self) -> &Arc<InMemoryBlacklist> {
        &self.blacklist
    }

    /// Pipeline counters, shared across all subscriptions.
    #[must_use]
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Commits facts unconditionally.
    ///
    /// # Errors
    /// Validation failures reject the whole batch.
    pub fn publish(&self, facts: Vec<Fact>) -> FactResult<FactStreamPosition> {
        self.store.publish(facts)
    }

    /// Commits facts only while the token's observation still holds.
    ///
    /// # Errors
    /// A state mismatch, or validation failures.
    pub fn publish_if_unchanged(
        &self,
        token: StateToken,
        facts: Vec<Fact>,
    ) -> FactResult<FactStreamPosition> {
        self.store.publish_if_unchanged(token, facts)
    }

    /// Acquires a state token over `specs` for conditional publishing.
    ///
    /// # Errors
    /// Backend and script failures.
    pub fn state_for(&self, specs: &[FactSpec]) -> FactResult<StateToken> {
        self.store.state_for(specs)
    }

    /// Fetch a single fact by id.
    ///
    /// # Errors
    /// Backend failures.
    pub fn fetch_by_id(&self, id: Uuid) -> FactResult<Option<Arc<Fact>>> {
        self.store.fetch_by_id(id)
    }

    /// Position of the newest committed fact.
    #[must_use]
    pub fn head(&self) -> FactStreamPosition {
        self.store.head()
    }
}

impl Subscriber for FactServer {
    fn subscribe(
        &self,
        request: SubscriptionRequest,
        observer: Box<dyn FactObserver>,
    ) -> FactResult<Arc<dyn Subscription>> {
        let (tx, rx) = bounded(self.cfg.channel_capacity);
        // Subscribed before the catch-up fetch so no commit falls between.
        let wakeups = request.continuous().then(|| self.bus.subscribe());

        let chain = build_pipeline(
            &request,
            Arc::clone(&self.blacklist) as Arc<dyn Blacklist>,
            Arc::clone(&self.transformers),
            Arc::clone(&self.metrics),
            tx,
            &self.cfg.pipeline,
        );

        let state = Arc::new(SubscriptionState::new());
        let closed = Arc::new(AtomicBool::new(false));

        let delivery_state = Arc::clone(&state);
        let delivery_closed = Arc::clone(&closed);
        let delivery_metrics = Arc::clone(&self.metrics);
        thread::Builder::new()
            .name("factstream-delivery".to_string())
            .spawn(move || {
                deliver(
                    &rx,
                    observer,
                    &delivery_state,
                    &delivery_closed,
                    &delivery_metrics,
                );
            })
            .map_err(|e| FactError::internal(format!("spawning delivery thread: {e}")))?;

        let producer = Producer {
            store: Arc::clone(&self.store),
            request,
            wakeups,
            closed: Arc::clone(&closed),
        };
        thread::Builder::new()
            .name("factstream-producer".to_string())
            .spawn(move || producer.run(chain))
            .map_err(|e| FactError::internal(format!("spawning producer thread: {e}")))?;

        Ok(Arc::new(ServerSubscription { state, closed }))
    }
}

struct Producer {
    store: Arc<dyn FactStore>,
    request: SubscriptionRequest,
    wakeups: Option<Receiver<FactNotification>>,
    closed: Arc<AtomicBool>,
}

impl Producer {
    fn run(self, mut chain: Box<dyn SignalSink>) {
        if let Err(e) = self.drive(chain.as_mut()) {
            debug!(error = %e, "producer stopped with error");
            let _ = chain.process(Signal::Error(e));
        }
    }

    fn drive(&self, chain: &mut dyn SignalSink) -> FactResult<()> {
        let head = self.store.head();
        let start_serial = self
            .request
            .starting_after()
            .and_then(|p| p.serial())
            .unwrap_or(0);
        chain.process(Signal::Info(FactStreamInfo {
            start_serial,
            target_serial: head.serial().unwrap_or(0),
        }))?;

        let mut position = self.request.starting_after();
        if !self.request.ephemeral() {
            for fact in self.store.fetch_since(&self.request, position.as_ref())? {
                if self.closed.load(Ordering::Acquire) {
                    return Ok(());
                }
                position = fact
                    .serial()
                    .map(|serial| FactStreamPosition::of(fact.id(), serial));
                chain.process(Signal::Fact(fact))?;
            }
        }

        // Non-matching (or skipped) facts may have advanced the stream past
        // the last delivered one; hand the client the head as a resume point.
        if head.is_ordered() && position.map_or(true, |p| !p.is_ordered() || head.is_after(&p)) {
            chain.process(Signal::FastForward(head))?;
            position = Some(head);
        }

        chain.process(Signal::Catchup)?;
        if !self.request.continuous() {
            chain.process(Signal::Complete)?;
            return Ok(());
        }
        self.follow(chain, position)
    }

    fn follow(
        &self,
        chain: &mut dyn SignalSink,
        mut position: Option<FactStreamPosition>,
    ) -> FactResult<()> {
        let Some(wakeups) = &self.wakeups else {
            return Err(FactError::internal("continuous subscription without bus"));
        };
        // Anchored when the first unflushed fact is delivered, not per wakeup:
        // a steady stream of unrelated wakeups must not defer the flush.
        let mut flush_deadline: Option<Instant> = None;
        loop {
            if self.closed.load(Ordering::Acquire) {
                info!("subscription closed, producer stopping");
                return Ok(());
            }
            let wait = match flush_deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => self.request.max_batch_delay(),
            };
            match wakeups.recv_timeout(wait) {
                Ok(wakeup) => {
                    if !self.concerns_us(&wakeup) {
                        continue;
                    }
                    let mut delivered = false;
                    for fact in self.store.fetch_since(&self.request, position.as_ref())? {
                        position = fact
                            .serial()
                            .map(|serial| FactStreamPosition::of(fact.id(), serial));
                        delivered = true;
                        chain.process(Signal::Fact(fact))?;
                    }
                    if delivered && flush_deadline.is_none() {
                        flush_deadline = Some(Instant::now() + self.request.max_batch_delay());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if flush_deadline.take().is_some() {
                        chain.process(Signal::Flush)?;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SubscriptionError::Disconnected {
                        path: "wakeup bus".to_string(),
                    }
                    .into());
                }
            }
        }
    }

    fn concerns_us(&self, wakeup: &FactNotification) -> bool {
        if wakeup.is_rescan() {
            return true;
        }
        self.request
            .specs()
            .iter()
            .any(|spec| Some(spec.namespace()) == wakeup.ns.as_deref())
    }
}

fn deliver(
    rx: &Receiver<Signal>,
    mut observer: Box<dyn FactObserver>,
    state: &SubscriptionState,
    closed: &AtomicBool,
    metrics: &PipelineMetrics,
) {
    for signal in rx.iter() {
        // Signals already queued when close() ran must not reach the observer.
        if closed.load(Ordering::Acquire) {
            debug!("dropping signal after close");
            metrics.inc_late_deliveries_dropped();
            continue;
        }
        match signal {
            Signal::Fact(fact) => observer.on_next(fact),
            Signal::Flush => {}
            Signal::Catchup => {
                state.mark_caught_up();
                observer.on_catchup();
            }
            Signal::Complete => {
                state.mark_complete();
                observer.on_complete();
                return;
            }
            Signal::FastForward(position) => observer.on_fast_forward(position),
            Signal::Info(info) => observer.on_stream_info(info),
            Signal::Error(error) => {
                state.mark_error(error.clone());
                observer.on_error(error);
                return;
            }
        }
    }
    // Channel drained without a terminal signal: the producer stopped after a
    // close, so anyone still blocked in await_* gets Closed.
    state.mark_detached();
}

#[derive(Debug, Default)]
struct Progress {
    caught_up: bool,
    complete: bool,
    detached: bool,
    error: Option<FactError>,
}

#[derive(Debug)]
struct SubscriptionState {
    progress: Mutex<Progress>,
    cond: Condvar,
}

impl SubscriptionState {
    fn new() -> Self {
        Self {
            progress: Mutex::new(Progress::default()),
            cond: Condvar::new(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Progress)) {
        if let Ok(mut progress) = self.progress.lock() {
            f(&mut progress);
            self.cond.notify_all();
        }
    }

    fn mark_caught_up(&self) {
        self.update(|p| p.caught_up = true);
    }

    fn mark_complete(&self) {
        self.update(|p| {
            p.caught_up = true;
            p.complete = true;
        });
    }

    fn mark_detached(&self) {
        self.update(|p| p.detached = true);
    }

    fn mark_error(&self, error: FactError) {
        self.update(|p| {
            if p.error.is_none() {
                p.error = Some(error);
            }
        });
    }

    fn wait_until(
        &self,
        reached: impl Fn(&Progress) -> bool,
        timeout: Option<Duration>,
    ) -> FactResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut progress = self
            .progress
            .lock()
            .map_err(|_| FactError::internal("subscription state poisoned"))?;
        loop {
            if let Some(error) = &progress.error {
                return Err(error.clone());
            }
            if reached(&progress) {
                return Ok(());
            }
            if progress.detached {
                return Err(SubscriptionError::Closed.into());
            }
            progress = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SubscriptionError::Timeout {
                            duration_ms: timeout.unwrap_or_default().as_millis() as u64,
                        }
                        .into());
                    }
                    let (guard, _) = self
                        .cond
                        .wait_timeout(progress, deadline - now)
                        .map_err(|_| FactError::internal("subscription state poisoned"))?;
                    guard
                }
                None => self
                    .cond
                    .wait(progress)
                    .map_err(|_| FactError::internal("subscription state poisoned"))?,
            };
        }
    }
}

/// Handle for a locally served subscription.
pub struct ServerSubscription {
    state: Arc<SubscriptionState>,
    closed: Arc<AtomicBool>,
}

impl Subscription for ServerSubscription {
    fn await_catchup(&self) -> FactResult<()> {
        self.state.wait_until(|p| p.caught_up, None)
    }

    fn await_catchup_for(&self, timeout: Duration) -> FactResult<()> {
        self.state.wait_until(|p| p.caught_up, Some(timeout))
    }

    fn await_complete(&self) -> FactResult<()> {
        self.state.wait_until(|p| p.complete, None)
    }

    fn await_complete_for(&self, timeout: Duration) -> FactResult<()> {
        self.state.wait_until(|p| p.complete, Some(timeout))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // The producer notices the flag within one batch delay, drops the
        // channel, and the delivery thread marks the state detached.
        self.state.mark_detached();
    }
}

impl Drop for ServerSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Collector {
        facts: Arc<Mutex<Vec<Arc<Fact>>>>,
        fast_forwards: Arc<Mutex<Vec<FactStreamPosition>>>,
        infos: Arc<AtomicUsize>,
    }

    impl Collector {
        fn new() -> (
            Self,
            Arc<Mutex<Vec<Arc<Fact>>>>,
            Arc<Mutex<Vec<FactStreamPosition>>>,
            Arc<AtomicUsize>,
        ) {
            let facts = Arc::new(Mutex::new(Vec::new()));
            let ffs = Arc::new(Mutex::new(Vec::new()));
            let infos = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    facts: Arc::clone(&facts),
                    fast_forwards: Arc::clone(&ffs),
                    infos: Arc::clone(&infos),
                },
                facts,
                ffs,
                infos,
            )
        }
    }

    impl FactObserver for Collector {
        fn on_next(&mut self, fact: Arc<Fact>) {
            self.facts.lock().unwrap().push(fact);
        }
        fn on_fast_forward(&mut self, position: FactStreamPosition) {
            self.fast_forwards.lock().unwrap().push(position);
        }
        fn on_stream_info(&mut self, _info: FactStreamInfo) {
            self.infos.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fact(ns: &str) -> Fact {
        Fact::builder(ns).build().unwrap()
    }

    #[test]
    fn catchup_request_completes_after_existing_facts() {
        let server = FactServer::in_memory();
        server.publish(vec![fact("orders"), fact("orders")]).unwrap();

        let (collector, facts, _, infos) = Collector::new();
        let request = SubscriptionRequest::catchup(FactSpec::ns("orders"))
            .build()
            .unwrap();
        let sub = server.subscribe(request, Box::new(collector)).unwrap();

        sub.await_complete_for(Duration::from_secs(2)).unwrap();
        assert_eq!(facts.lock().unwrap().len(), 2);
        assert_eq!(infos.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ephemeral_subscription_fast_forwards_past_history() {
        let server = FactServer::in_memory();
        let head = server.publish(vec![fact("orders"), fact("orders")]).unwrap();

        let (collector, facts, ffs, _) = Collector::new();
        let request = SubscriptionRequest::follow(FactSpec::ns("orders"))
            .ephemeral()
            .build()
            .unwrap();
        let sub = server.subscribe(request, Box::new(collector)).unwrap();

        sub.await_catchup_for(Duration::from_secs(2)).unwrap();
        assert!(facts.lock().unwrap().is_empty());
        assert_eq!(ffs.lock().unwrap().as_slice(), &[head]);
        sub.close();
    }

    #[test]
    fn await_catchup_times_out_against_the_deadline() {
        let state = SubscriptionState::new();
        let err = state
            .wait_until(|p| p.caught_up, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(
            err,
            FactError::Subscription(SubscriptionError::Timeout { .. })
        ));
    }

    #[test]
    fn signals_queued_before_close_never_reach_the_observer() {
        let (tx, rx) = bounded(8);
        tx.send(Signal::Fact(Arc::new(fact("orders")))).unwrap();
        tx.send(Signal::Catchup).unwrap();
        drop(tx);

        let state = SubscriptionState::new();
        let closed = AtomicBool::new(true);
        let metrics = PipelineMetrics::new();
        let (collector, facts, _, _) = Collector::new();
        deliver(&rx, Box::new(collector), &state, &closed, &metrics);

        assert!(facts.lock().unwrap().is_empty());
        assert_eq!(metrics.late_deliveries_dropped(), 2);
        // The swallowed Catchup never marked progress either.
        let err = state
            .wait_until(|p| p.caught_up, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(
            err,
            FactError::Subscription(SubscriptionError::Closed)
        ));
    }

    #[test]
    fn close_is_idempotent_and_unblocks_waiters() {
        let server = FactServer::in_memory();
        let (collector, _, _, _) = Collector::new();
        let request = SubscriptionRequest::follow(FactSpec::ns("orders"))
            .build()
            .unwrap();
        let sub = server.subscribe(request, Box::new(collector)).unwrap();
        sub.await_catchup_for(Duration::from_secs(2)).unwrap();

        sub.close();
        sub.close();
        let err = sub.await_complete_for(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            FactError::Subscription(SubscriptionError::Closed)
        ));
    }
}
