//! Bounded retry around the initial subscribe call.
//!
//! [`super::reconnect::ReconnectingSubscription`] only takes over once a
//! subscription exists; this decorator covers the window before that, retrying
//! `subscribe` itself when the failure is retryable.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::{FactError, FactResult};
use crate::fact::Fact;
use crate::position::{FactStreamInfo, FactStreamPosition};
use crate::spec::SubscriptionRequest;

use super::{FactObserver, Subscriber, Subscription};

/// Retry knobs for [`RetryingSubscriber`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total subscribe attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts (grows linearly).
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// A [`Subscriber`] decorator that retries retryable subscribe failures.
///
/// `subscribe` consumes the observer, so each attempt hands the inner
/// subscriber a lightweight forwarder over the one shared observer; a failed
/// attempt never delivered anything through it.
pub struct RetryingSubscriber {
    inner: Arc<dyn Subscriber>,
    cfg: RetryConfig,
}

impl RetryingSubscriber {
    /// Wraps `inner` with the given retry policy.
    #[must_use]
    pub fn new(inner: Arc<dyn Subscriber>, cfg: RetryConfig) -> Self {
        let cfg = RetryConfig {
            max_attempts: cfg.max_attempts.max(1),
            ..cfg
        };
        Self { inner, cfg }
    }
}

impl Subscriber for RetryingSubscriber {
    fn subscribe(
        &self,
        request: SubscriptionRequest,
        observer: Box<dyn FactObserver>,
    ) -> FactResult<Arc<dyn Subscription>> {
        let shared = Arc::new(Mutex::new(observer));
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let forwarder = Box::new(SharedObserver {
                inner: Arc::clone(&shared),
            });
            match self.inner.subscribe(request.clone(), forwarder) {
                Ok(subscription) => return Ok(subscription),
                Err(e) if e.is_retryable() && attempt < self.cfg.max_attempts => {
                    warn!(attempt, error = %e, "subscribe failed, retrying");
                    thread::sleep(self.cfg.backoff.saturating_mul(attempt));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct SharedObserver {
    inner: Arc<Mutex<Box<dyn FactObserver>>>,
}

impl FactObserver for SharedObserver {
    fn on_next(&mut self, fact: Arc<Fact>) {
        if let Ok(mut observer) = self.inner.lock() {
            observer.on_next(fact);
        }
    }

    fn on_catchup(&mut self) {
        if let Ok(mut observer) = self.inner.lock() {
            observer.on_catchup();
        }
    }

    fn on_complete(&mut self) {
        if let Ok(mut observer) = self.inner.lock() {
            observer.on_complete();
        }
    }

    fn on_fast_forward(&mut self, position: FactStreamPosition) {
        if let Ok(mut observer) = self.inner.lock() {
            observer.on_fast_forward(position);
        }
    }

    fn on_stream_info(&mut self, info: FactStreamInfo) {
        if let Ok(mut observer) = self.inner.lock() {
            observer.on_stream_info(info);
        }
    }

    fn on_error(&mut self, error: FactError) {
        if let Ok(mut observer) = self.inner.lock() {
            observer.on_error(error);
        }
    }
}
