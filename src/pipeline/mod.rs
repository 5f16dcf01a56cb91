//! Server-side signal pipeline.
//!
//! One chain is built per subscription, as an explicit ordered list of stage
//! structs each holding its `parent` (the next stage toward the transport) —
//! composition, not inheritance. A stage intercepts the signals it cares about
//! and delegates everything else unchanged; no stage may reorder signals.
//!
//! Fixed stage order, producer-facing to transport-facing:
//! blacklist → buffered transformation → post-query filter → metrics →
//! channel sink. Blacklist runs before transformation so blocked facts never
//! pay transformation cost; the post-query filter runs after it so filter
//! scripts see the fact the client will see.
//!
//! Chains are driven by exactly one producer thread; stages are `Send` but
//! deliberately not shared.

pub mod blacklist;
pub mod buffer;
pub mod filter;

use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use tracing::debug;

use crate::error::FactResult;
use crate::metrics::PipelineMetrics;
use crate::signal::Signal;
use crate::spec::SubscriptionRequest;
use crate::transform::Transformers;

use self::blacklist::{Blacklist, BlacklistStage};
use self::buffer::BufferedTransformStage;
use self::filter::PostQueryFilterStage;

/// A pipeline stage (or the terminal sink).
pub trait SignalSink: Send {
    /// Handles one signal, forwarding to the parent stage as appropriate.
    ///
    /// # Errors
    /// Unrecoverable stage failures; the driver stops feeding the chain.
    fn process(&mut self, signal: Signal) -> FactResult<()>;
}

/// Terminal sink: hands signals to the transport's channel.
///
/// A disconnected or full receiver means the subscription is gone or going;
/// late deliveries are counted and dropped rather than treated as errors.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Sender<Signal>,
    metrics: Arc<PipelineMetrics>,
    disconnected: bool,
}

impl ChannelSink {
    /// Wraps a transport channel.
    #[must_use]
    pub fn new(tx: Sender<Signal>, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            tx,
            metrics,
            disconnected: false,
        }
    }

    /// True once the receiving side went away.
    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        self.disconnected
    }
}

impl SignalSink for ChannelSink {
    fn process(&mut self, signal: Signal) -> FactResult<()> {
        if self.disconnected {
            self.metrics.inc_late_deliveries_dropped();
            return Ok(());
        }
        match self.tx.try_send(signal) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(signal)) => {
                // Blocking here is correct: the producer thread is the only
                // driver and backpressure must reach it.
                if self.tx.send(signal).is_err() {
                    self.disconnected = true;
                    self.metrics.inc_late_deliveries_dropped();
                    debug!("subscription channel closed, dropping signal");
                }
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                self.disconnected = true;
                self.metrics.inc_late_deliveries_dropped();
                debug!("subscription channel closed, dropping signal");
                Ok(())
            }
        }
    }
}

/// Counts delivered facts; otherwise fully transparent.
#[derive(Debug)]
pub struct MetricsStage<P> {
    parent: P,
    metrics: Arc<PipelineMetrics>,
}

impl<P: SignalSink> MetricsStage<P> {
    /// Wraps `parent` with fact counting.
    #[must_use]
    pub fn new(parent: P, metrics: Arc<PipelineMetrics>) -> Self {
        Self { parent, metrics }
    }
}

impl<P: SignalSink> SignalSink for MetricsStage<P> {
    fn process(&mut self, signal: Signal) -> FactResult<()> {
        if signal.is_fact() {
            self.metrics.inc_facts_delivered();
        }
        self.parent.process(signal)
    }
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Buffered-transform stage flushes when this many entries are queued.
    pub max_buffer_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 1000,
        }
    }
}

/// Builds the stage chain for one subscription.
///
/// Returns the outermost (producer-facing) stage.
#[must_use]
pub fn build_pipeline(
    request: &SubscriptionRequest,
    blacklist: Arc<dyn Blacklist>,
    transformers: Arc<dyn Transformers>,
    metrics: Arc<PipelineMetrics>,
    sink: Sender<Signal>,
    cfg: &PipelineConfig,
) -> Box<dyn SignalSink> {
    let sink = ChannelSink::new(sink, Arc::clone(&metrics));
    let counted = MetricsStage::new(sink, Arc::clone(&metrics));
    let filtered = PostQueryFilterStage::new(counted, request, Arc::clone(&metrics));
    let transformed = BufferedTransformStage::new(
        filtered,
        transformers,
        cfg.max_buffer_size,
        Arc::clone(&metrics),
    );
    Box::new(BlacklistStage::new(transformed, blacklist, metrics))
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use crate::fact::Fact;
    use crossbeam_channel::bounded;

    fn fact_signal() -> Signal {
        Signal::Fact(Arc::new(Fact::builder("orders").build().unwrap()))
    }

    #[test]
    fn metrics_stage_counts_facts_only() {
        let metrics = Arc::new(PipelineMetrics::new());
        let (sink, seen) = RecordingSink::new();
        let mut stage = MetricsStage::new(sink, Arc::clone(&metrics));

        stage.process(fact_signal()).unwrap();
        stage.process(Signal::Flush).unwrap();
        stage.process(fact_signal()).unwrap();
        stage.process(Signal::Catchup).unwrap();

        assert_eq!(metrics.facts_delivered(), 2);
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn channel_sink_forwards_in_order() {
        let metrics = Arc::new(PipelineMetrics::new());
        let (tx, rx) = bounded(8);
        let mut sink = ChannelSink::new(tx, metrics);

        sink.process(fact_signal()).unwrap();
        sink.process(Signal::Catchup).unwrap();

        assert!(rx.recv().unwrap().is_fact());
        assert!(matches!(rx.recv().unwrap(), Signal::Catchup));
    }

    #[test]
    fn channel_sink_tolerates_a_closed_subscription() {
        let metrics = Arc::new(PipelineMetrics::new());
        let (tx, rx) = bounded(8);
        drop(rx);
        let mut sink = ChannelSink::new(tx, Arc::clone(&metrics));

        sink.process(fact_signal()).unwrap();
        sink.process(fact_signal()).unwrap();

        assert!(sink.is_disconnected());
        assert_eq!(metrics.late_deliveries_dropped(), 2);
    }
}
