//! Client-side subscription surface.
//!
//! The transport hands a stream of signals to an application observer; these
//! traits are the seam between the two. [`reconnect`] wraps any
//! [`Subscriber`] with transparent resume-after-failure, [`retry`] wraps one
//! with a bounded retry loop around the initial subscribe call.

pub mod reconnect;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use crate::error::{FactError, FactResult};
use crate::fact::Fact;
use crate::position::{FactStreamInfo, FactStreamPosition};
use crate::spec::SubscriptionRequest;

/// Application-level stream observer.
///
/// Callbacks arrive from a single delivery thread, in stream order.
pub trait FactObserver: Send {
    /// One fact of stream content.
    fn on_next(&mut self, fact: Arc<Fact>);

    /// All facts that existed at subscribe time have been delivered.
    fn on_catchup(&mut self) {}

    /// The stream is exhausted (non-continuous subscriptions only).
    fn on_complete(&mut self) {}

    /// Skip the resume position forward without content.
    fn on_fast_forward(&mut self, _position: FactStreamPosition) {}

    /// Catch-up progress data.
    fn on_stream_info(&mut self, _info: FactStreamInfo) {}

    /// Terminal failure; no further callbacks follow.
    fn on_error(&mut self, _error: FactError) {}
}

/// A live subscription handle.
pub trait Subscription: Send + Sync {
    /// Blocks until the stream has caught up with the head.
    ///
    /// # Errors
    /// `SubscriptionError::Closed` when closed while waiting.
    fn await_catchup(&self) -> FactResult<()>;

    /// Like [`Subscription::await_catchup`] with a deadline.
    ///
    /// # Errors
    /// `SubscriptionError::Timeout` at the deadline, `Closed` when closed.
    fn await_catchup_for(&self, timeout: Duration) -> FactResult<()>;

    /// Blocks until the stream completes.
    ///
    /// # Errors
    /// `SubscriptionError::Closed` when closed while waiting.
    fn await_complete(&self) -> FactResult<()>;

    /// Like [`Subscription::await_complete`] with a deadline.
    ///
    /// # Errors
    /// `SubscriptionError::Timeout` at the deadline, `Closed` when closed.
    fn await_complete_for(&self, timeout: Duration) -> FactResult<()>;

    /// Closes the subscription. Idempotent, never blocks on in-flight work.
    fn close(&self);
}

/// Opens subscriptions; implemented by the transport (or the local server).
pub trait Subscriber: Send + Sync {
    /// Opens a subscription delivering to `observer`.
    ///
    /// # Errors
    /// Validation and connection failures.
    fn subscribe(
        &self,
        request: SubscriptionRequest,
        observer: Box<dyn FactObserver>,
    ) -> FactResult<Arc<dyn Subscription>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: all three seams must be object-safe.
    fn _observer(_: &dyn FactObserver) {}
    fn _subscription(_: &dyn Subscription) {}
    fn _subscriber(_: &dyn Subscriber) {}

    #[test]
    fn observer_default_methods_are_optional() {
        struct OnlyNext(usize);
        impl FactObserver for OnlyNext {
            fn on_next(&mut self, _fact: Arc<Fact>) {
                self.0 += 1;
            }
        }

        let mut obs = OnlyNext(0);
        obs.on_next(Arc::new(Fact::builder("orders").build().unwrap()));
        obs.on_catchup();
        obs.on_complete();
        assert_eq!(obs.0, 1);
    }
}
