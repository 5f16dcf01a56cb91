//! Change notification listener.
//!
//! Detects "something new might be visible in storage" with low latency and
//! minimal load. The listener owns one long-lived connection to the storage
//! backend's notification channel and runs a dedicated thread: wait for
//! notifications with a timeout, deduplicate, and wake local waiters through
//! the [`EventBus`]. A quiet period triggers a synchronous health-check round
//! trip; a failed round trip means the connection is dead and the listener
//! reconnects with backoff. On startup and after every reconnect a
//! parameterless rescan event is posted so that waiters who missed a targeted
//! notification re-poll anyway.

pub mod bus;
pub mod dedup;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{FactResult, TransportError};
use crate::metrics::PipelineMetrics;

use self::bus::{EventBus, FactNotification};
use self::dedup::DedupSet;

/// A raw message from the backend's notification channel.
#[derive(Debug, Clone)]
pub struct RawNotification {
    /// Channel the message arrived on.
    pub channel: String,
    /// Uninterpreted payload; expected to be JSON.
    pub payload: String,
}

/// A parsed change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    /// Channel the notification arrived on.
    pub channel: String,
    /// Namespace the inserted fact belongs to.
    pub ns: String,
    /// Fact type, when the backend knows it.
    pub typ: Option<String>,
    /// Transaction that produced the insert.
    pub tx_id: u64,
}

#[derive(Debug, Deserialize)]
struct NotificationPayload {
    ns: String,
    #[serde(rename = "type")]
    typ: Option<String>,
    #[serde(rename = "txId")]
    tx_id: u64,
}

impl NotificationEvent {
    /// Parses a raw notification payload.
    ///
    /// # Errors
    /// Returns the serde error for malformed payloads; callers log and skip.
    pub fn parse(raw: &RawNotification) -> Result<Self, serde_json::Error> {
        let payload: NotificationPayload = serde_json::from_str(&raw.payload)?;
        Ok(Self {
            channel: raw.channel.clone(),
            ns: payload.ns,
            typ: payload.typ,
            tx_id: payload.tx_id,
        })
    }
}

/// Errors from the low-level notification channel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    /// The backend connection failed.
    #[error("notification channel i/o error: {message}")]
    Io {
        /// Backend-supplied detail.
        message: String,
    },

    /// A round trip did not complete in time.
    #[error("notification channel round trip timed out")]
    Timeout,

    /// The channel was closed.
    #[error("notification channel closed")]
    Closed,
}

/// The backend's low-level notification channel.
///
/// One instance is owned by the listener thread; implementations need not be
/// `Sync`.
pub trait NotificationChannel: Send {
    /// Blocks up to `timeout` for notifications; an empty result means the
    /// timeout elapsed quietly.
    ///
    /// # Errors
    /// Connection-level failures; the listener reconnects on any error.
    fn wait_for_notifications(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<RawNotification>, ChannelError>;

    /// Synchronous health-check round trip: send a marker, expect it back.
    ///
    /// # Errors
    /// `ChannelError::Timeout` when the marker does not return in time; the
    /// listener treats that as a dead connection.
    fn ping(&mut self, timeout: Duration) -> Result<(), ChannelError>;
}

/// Creates notification channels; used for the initial connection and for
/// every reconnect.
pub trait NotificationConnector: Send + Sync {
    /// Opens a fresh channel.
    ///
    /// # Errors
    /// Backend connection failures.
    fn connect(&self) -> Result<Box<dyn NotificationChannel>, ChannelError>;
}

/// Listener tuning knobs.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// How long to wait for notifications before health-checking.
    pub poll_interval: Duration,
    /// Round-trip budget for the health check.
    pub health_timeout: Duration,
    /// Base delay between reconnect attempts (grows linearly).
    pub reconnect_backoff: Duration,
    /// Capacity of the dedup recency set.
    pub dedup_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            health_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_millis(500),
            dedup_capacity: 1024,
        }
    }
}

/// Handle to the running listener thread.
#[derive(Debug)]
pub struct NotificationListener {
    stop: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationListener {
    /// Connects and starts the listener thread.
    ///
    /// The initial connection is made synchronously: failing to obtain any
    /// connection at startup is fatal to the server and surfaces here.
    ///
    /// # Errors
    /// `TransportError::ConnectionFailed` when no initial connection can be
    /// obtained.
    pub fn spawn(
        connector: Arc<dyn NotificationConnector>,
        bus: Arc<EventBus>,
        metrics: Arc<PipelineMetrics>,
        cfg: ListenerConfig,
    ) -> FactResult<Self> {
        let channel = connector.connect().map_err(|e| {
            TransportError::ConnectionFailed {
                message: format!("notification listener setup: {e}"),
            }
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("factstream-listener".to_string())
            .spawn(move || listener_loop(channel, connector, bus, metrics, cfg, &thread_stop))
            .map_err(|e| crate::error::FactError::internal(format!("spawn listener: {e}")))?;

        Ok(Self {
            stop,
            join: Mutex::new(Some(join)),
        })
    }

    /// Stops the listener. Idempotent; returns once the thread has exited.
    pub fn close(&self) {
        self.stop.store(true, Ordering::Release);
        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        // Signal, but do not join: the thread observes the flag at its next
        // poll tick and exits on its own.
        self.stop.store(true, Ordering::Release);
        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                drop(handle);
            }
        }
    }
}

fn listener_loop(
    mut channel: Box<dyn NotificationChannel>,
    connector: Arc<dyn NotificationConnector>,
    bus: Arc<EventBus>,
    metrics: Arc<PipelineMetrics>,
    cfg: ListenerConfig,
    stop: &AtomicBool,
) {
    let mut dedup = DedupSet::new(cfg.dedup_capacity);

    // Closes the race between "subscription starts polling" and "listener
    // wasn't yet listening".
    bus.post(&FactNotification::rescan());

    while !stop.load(Ordering::Acquire) {
        match channel.wait_for_notifications(cfg.poll_interval) {
            Ok(raws) if !raws.is_empty() => {
                handle_batch(&raws, &mut dedup, &bus, &metrics);
            }
            Ok(_) => {
                // Quiet period: verify the connection is actually alive.
                if let Err(e) = channel.ping(cfg.health_timeout) {
                    warn!(error = %e, "notification channel failed health check, reconnecting");
                    match reconnect(connector.as_ref(), &cfg, stop) {
                        Some(fresh) => channel = fresh,
                        None => return,
                    }
                    bus.post(&FactNotification::rescan());
                }
            }
            Err(e) => {
                warn!(error = %e, "notification channel error, reconnecting");
                match reconnect(connector.as_ref(), &cfg, stop) {
                    Some(fresh) => channel = fresh,
                    None => return,
                }
                bus.post(&FactNotification::rescan());
            }
        }
    }
    debug!("notification listener stopped");
}

fn handle_batch(
    raws: &[RawNotification],
    dedup: &mut DedupSet,
    bus: &EventBus,
    metrics: &PipelineMetrics,
) {
    for raw in raws {
        let event = match NotificationEvent::parse(raw) {
            Ok(event) => event,
            Err(e) => {
                // One bad payload must not take the loop or its batch down.
                warn!(channel = %raw.channel, error = %e, "skipping malformed notification payload");
                continue;
            }
        };

        let key = (event.ns.clone(), event.typ.clone(), event.tx_id);
        if dedup.insert(key) {
            bus.post(&FactNotification::of(event.ns, event.typ));
            metrics.inc_notifications_posted();
        } else {
            metrics.inc_notifications_deduped();
        }
    }
}

fn reconnect(
    connector: &dyn NotificationConnector,
    cfg: &ListenerConfig,
    stop: &AtomicBool,
) -> Option<Box<dyn NotificationChannel>> {
    let mut attempt: u32 = 0;
    while !stop.load(Ordering::Acquire) {
        attempt = attempt.saturating_add(1);
        thread::sleep(cfg.reconnect_backoff.saturating_mul(attempt));
        match connector.connect() {
            Ok(channel) => {
                info!(attempt, "notification listener reconnected");
                return Some(channel);
            }
            Err(e) => {
                warn!(attempt, error = %e, "notification reconnect failed");
            }
        }
    }
    None
}
