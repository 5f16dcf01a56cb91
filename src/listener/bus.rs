//! In-process wakeup bus.
//!
//! The listener posts "a fact in this namespace may have landed" events here;
//! waiting subscription producers hold a receiver each. Delivery is
//! fire-and-forget and at-least-once: a duplicate wakeup only causes a
//! redundant re-poll, a dropped one is recovered by the next rescan or poll
//! timeout, so `try_send` never blocks the listener.

use std::sync::Mutex;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// A wakeup posted by the notification listener.
///
/// `ns`/`typ` narrow what changed; both `None` is the parameterless "rescan"
/// event telling every waiter to re-poll regardless of its filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactNotification {
    /// Namespace that changed, when known.
    pub ns: Option<String>,
    /// Fact type that changed, when known.
    pub typ: Option<String>,
}

impl FactNotification {
    /// Targeted wakeup.
    #[must_use]
    pub fn of(ns: impl Into<String>, typ: Option<String>) -> Self {
        Self {
            ns: Some(ns.into()),
            typ,
        }
    }

    /// Parameterless "re-poll everything" wakeup.
    #[must_use]
    pub const fn rescan() -> Self {
        Self { ns: None, typ: None }
    }

    /// True for the parameterless rescan event.
    #[must_use]
    pub const fn is_rescan(&self) -> bool {
        self.ns.is_none() && self.typ.is_none()
    }
}

/// Fire-and-forget publish/subscribe bus for wakeup events.
#[derive(Debug)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<FactNotification>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-subscriber queue depth; wakeups are tiny and coalescing is fine.
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

impl EventBus {
    /// Creates a bus with the default per-subscriber queue capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Creates a bus with an explicit per-subscriber queue capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Registers a subscriber and returns its receiving end.
    pub fn subscribe(&self) -> Receiver<FactNotification> {
        let (tx, rx) = bounded(self.capacity);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Posts an event to every live subscriber.
    ///
    /// Full queues are skipped (the subscriber will re-poll anyway) and
    /// disconnected subscribers are pruned.
    pub fn post(&self, event: &FactNotification) {
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Number of live subscribers (after the last prune).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}
