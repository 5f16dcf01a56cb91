//! Transparent resubscription.
//!
//! Wraps an application observer so that transient server or connection
//! failures surface as a brief pause instead of a terminal error. The wrapper
//! tracks the last fact id delivered, classifies terminal errors into "give
//! up" versus "reconnect", and resumes from the last seen position on a
//! background thread. Reconnecting too often within a short window escalates
//! to the application instead of looping forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FactError, FactResult, SubscriptionError};
use crate::fact::Fact;
use crate::position::{FactStreamInfo, FactStreamPosition};
use crate::spec::SubscriptionRequest;

use super::{FactObserver, Subscriber, Subscription};

/// Reconnect behaviour knobs.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Reconnects tolerated within [`ReconnectConfig::window`] before giving up.
    pub max_reconnects: usize,
    /// Sliding window over which reconnects are counted.
    pub window: Duration,
    /// Pause before a reconnect attempt starts.
    pub pause: Duration,
    /// Base delay between failed subscribe attempts (grows linearly).
    pub backoff: Duration,
    /// Polling slice for the blocking `await_*` operations.
    pub poll_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_reconnects: 5,
            window: Duration::from_millis(3000),
            pause: Duration::from_millis(50),
            backoff: Duration::from_millis(100),
            poll_interval: Duration::from_millis(25),
        }
    }
}

/// Sliding window of reconnect timestamps.
///
/// `record` prunes entries older than the window, adds the new attempt, and
/// answers whether the budget still holds.
#[derive(Debug)]
pub struct ReconnectWindow {
    limit: usize,
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl ReconnectWindow {
    /// A window allowing `limit` reconnects per `window`.
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            stamps: VecDeque::new(),
        }
    }

    /// Records an attempt at `now`; returns true while within budget.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.stamps.front() {
            if now.duration_since(*oldest) > self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
        self.stamps.push_back(now);
        self.stamps.len() <= self.limit
    }

    /// Attempts currently inside the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// True when no attempt is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}

struct Shared {
    subscriber: Arc<dyn Subscriber>,
    request: SubscriptionRequest,
    observer: Mutex<Box<dyn FactObserver>>,
    fact_id_seen: Mutex<Option<Uuid>>,
    current: Mutex<Option<Arc<dyn Subscription>>>,
    closed: AtomicBool,
    terminal: Mutex<Option<FactError>>,
    window: Mutex<ReconnectWindow>,
    cfg: ReconnectConfig,
}

impl Shared {
    fn deliver_terminal(&self, error: FactError) {
        if let Ok(mut terminal) = self.terminal.lock() {
            if terminal.is_none() {
                *terminal = Some(error.clone());
            }
        }
        if let Ok(mut observer) = self.observer.lock() {
            observer.on_error(error);
        }
    }
}

/// A subscription wrapper that survives connectivity failures.
pub struct ReconnectingSubscription {
    shared: Arc<Shared>,
}

impl ReconnectingSubscription {
    /// Opens the underlying subscription and installs the wrapper around it.
    ///
    /// # Errors
    /// Whatever the initial `subscribe` call fails with; no retry is applied
    /// to the very first attempt (wrap the subscriber in
    /// [`super::retry::RetryingSubscriber`] for that).
    pub fn subscribe(
        subscriber: Arc<dyn Subscriber>,
        request: SubscriptionRequest,
        observer: Box<dyn FactObserver>,
        cfg: ReconnectConfig,
    ) -> FactResult<Arc<Self>> {
        let shared = Arc::new(Shared {
            subscriber: Arc::clone(&subscriber),
            request: request.clone(),
            observer: Mutex::new(observer),
            fact_id_seen: Mutex::new(None),
            current: Mutex::new(None),
            closed: AtomicBool::new(false),
            terminal: Mutex::new(None),
            window: Mutex::new(ReconnectWindow::new(cfg.max_reconnects, cfg.window)),
            cfg,
        });

        // Subscribe and install under the same lock the error path takes, so
        // a wire failure racing this call waits for the handle to land
        // instead of finding nothing to detach.
        {
            let mut current = shared
                .current
                .lock()
                .map_err(|_| FactError::internal("subscription state poisoned"))?;
            let underlying = subscriber.subscribe(
                request,
                Box::new(ForwardingObserver {
                    shared: Arc::clone(&shared),
                }),
            )?;
            *current = Some(underlying);
        }
        Ok(Arc::new(Self { shared }))
    }

    /// Last fact id delivered to the application, if any.
    #[must_use]
    pub fn fact_id_seen(&self) -> Option<Uuid> {
        self.shared.fact_id_seen.lock().ok().and_then(|g| *g)
    }

    fn await_inner(
        &self,
        timeout: Option<Duration>,
        wait: impl Fn(&dyn Subscription, Duration) -> FactResult<()>,
    ) -> FactResult<()> {
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(SubscriptionError::Closed.into());
            }
            if let Ok(terminal) = self.shared.terminal.lock() {
                if let Some(error) = terminal.clone() {
                    return Err(error);
                }
            }

            let slice = match deadline {
                Some((deadline, requested)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SubscriptionError::Timeout {
                            duration_ms: requested.as_millis() as u64,
                        }
                        .into());
                    }
                    self.shared.cfg.poll_interval.min(deadline - now)
                }
                None => self.shared.cfg.poll_interval,
            };

            let current = self.shared.current.lock().ok().and_then(|g| g.clone());
            match current {
                Some(subscription) => match wait(subscription.as_ref(), slice) {
                    Ok(()) => return Ok(()),
                    // Timed out this slice, or the underlying handle died
                    // mid-wait while a reconnect is pending: poll again.
                    Err(FactError::Subscription(
                        SubscriptionError::Timeout { .. } | SubscriptionError::Closed,
                    )) => {}
                    Err(other) => return Err(other),
                },
                None => thread::sleep(slice),
            }
        }
    }
}

impl Subscription for ReconnectingSubscription {
    fn await_catchup(&self) -> FactResult<()> {
        self.await_inner(None, |s, slice| s.await_catchup_for(slice))
    }

    fn await_catchup_for(&self, timeout: Duration) -> FactResult<()> {
        self.await_inner(Some(timeout), |s, slice| s.await_catchup_for(slice))
    }

    fn await_complete(&self) -> FactResult<()> {
        self.await_inner(None, |s, slice| s.await_complete_for(slice))
    }

    fn await_complete_for(&self, timeout: Duration) -> FactResult<()> {
        self.await_inner(Some(timeout), |s, slice| s.await_complete_for(slice))
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let current = self.shared.current.lock().ok().and_then(|mut g| g.take());
        if let Some(subscription) = current {
            subscription.close();
        }
    }
}

impl Drop for ReconnectingSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

struct ForwardingObserver {
    shared: Arc<Shared>,
}

impl FactObserver for ForwardingObserver {
    fn on_next(&mut self, fact: Arc<Fact>) {
        if self.shared.closed.load(Ordering::Acquire) {
            // A few late deliveries after close are expected; drop them.
            debug!(fact_id = %fact.id(), "dropping delivery after close");
            return;
        }
        let id = fact.id();
        if let Ok(mut observer) = self.shared.observer.lock() {
            observer.on_next(fact);
        }
        if let Ok(mut seen) = self.shared.fact_id_seen.lock() {
            *seen = Some(id);
        }
    }

    fn on_catchup(&mut self) {
        if let Ok(mut observer) = self.shared.observer.lock() {
            observer.on_catchup();
        }
    }

    fn on_complete(&mut self) {
        if let Ok(mut observer) = self.shared.observer.lock() {
            observer.on_complete();
        }
    }

    fn on_fast_forward(&mut self, position: FactStreamPosition) {
        if let Ok(mut observer) = self.shared.observer.lock() {
            observer.on_fast_forward(position);
        }
    }

    fn on_stream_info(&mut self, info: FactStreamInfo) {
        if let Ok(mut observer) = self.shared.observer.lock() {
            observer.on_stream_info(info);
        }
    }

    fn on_error(&mut self, error: FactError) {
        // Detach the failed handle first; its close must not race the
        // reconnect installing a fresh one.
        let detached = self.shared.current.lock().ok().and_then(|mut g| g.take());
        if let Some(subscription) = &detached {
            subscription.close();
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }

        if error.is_fatal_for_subscription() {
            self.shared.deliver_terminal(error);
            return;
        }

        // Only the error that detached a live handle schedules a reconnect;
        // with no handle to detach, one is already in flight and this error
        // is a straggler from the dead wire.
        if detached.is_none() {
            return;
        }

        let within_budget = self
            .shared
            .window
            .lock()
            .map(|mut w| w.record(Instant::now()))
            .unwrap_or(false);
        if !within_budget {
            warn!(error = %error, "reconnect rate exceeded, escalating to observer");
            let exhausted = SubscriptionError::ReconnectsExhausted {
                attempts: self.shared.cfg.max_reconnects + 1,
                window_ms: self.shared.cfg.window.as_millis() as u64,
            };
            self.shared.deliver_terminal(exhausted.into());
            return;
        }

        debug!(error = %error, "scheduling reconnect");
        let shared = Arc::clone(&self.shared);
        let _ = thread::Builder::new()
            .name("factstream-reconnect".to_string())
            .spawn(move || {
                thread::sleep(shared.cfg.pause);
                reconnect_loop(&shared);
            });
    }
}

fn reconnect_loop(shared: &Arc<Shared>) {
    let mut attempt: u32 = 0;
    loop {
        if shared.closed.load(Ordering::Acquire) {
            return;
        }

        let seen = shared.fact_id_seen.lock().ok().and_then(|g| *g);
        let request = match seen {
            // Only the id is known client-side; the store resolves its serial.
            Some(id) => shared
                .request
                .resuming_after(FactStreamPosition::without_serial(id)),
            None => shared.request.clone(),
        };

        let observer = Box::new(ForwardingObserver {
            shared: Arc::clone(shared),
        });
        // Same lock discipline as the initial subscribe: the fresh wire's
        // first error must block until its handle is installed.
        let Ok(mut current) = shared.current.lock() else {
            return;
        };
        match shared.subscriber.subscribe(request, observer) {
            Ok(subscription) => {
                if shared.closed.load(Ordering::Acquire) {
                    drop(current);
                    subscription.close();
                    return;
                }
                *current = Some(subscription);
                info!(resumed_after = ?seen, "resubscribed");
                return;
            }
            Err(e) => {
                drop(current);
                attempt = attempt.saturating_add(1);
                warn!(attempt, error = %e, "resubscribe failed");
                thread::sleep(shared.cfg.backoff.saturating_mul(attempt));
            }
        }
    }
}
