//! Order-preserving batched schema transformation.
//!
//! The stage runs in one of two modes. In `Direct` mode facts that need no
//! transformation pass straight through — no allocation, lowest latency. The
//! first fact that does need transformation flips the stage to `Buffering`:
//! from then on *every* signal, transformable or not, queues in arrival order
//! behind the outstanding transformation, because emitting a later no-op fact
//! early would reorder the stream.
//!
//! A flush collects the distinct pending transformations into one batch call,
//! substitutes the results back into their original slots, and emits the whole
//! buffer in arrival order. The buffer is flushed when it reaches its size
//! limit, when a Flush/Catchup/Complete/Error signal arrives, or on an
//! explicit [`BufferedTransformStage::flush`]. If the batch call fails, the
//! buffered signals are abandoned and a single Error signal is emitted
//! instead — partial delivery of a batch with an unresolved transformation is
//! never attempted.
//!
//! Not safe for concurrent `process` calls: buffer and mode are stage-local
//! and mutated in place. The server guarantees at most one thread drives a
//! given subscription's pipeline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::error;
use uuid::Uuid;

use crate::error::FactResult;
use crate::metrics::PipelineMetrics;
use crate::signal::Signal;
use crate::transform::{TransformRequest, Transformers};

use super::SignalSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Direct,
    Buffering,
}

enum Buffered {
    /// Emitted as-is on flush.
    Ready(Signal),
    /// Substituted with the batch result on flush.
    Pending(TransformRequest),
}

/// The buffered transforming stage.
pub struct BufferedTransformStage<P> {
    parent: P,
    transformers: Arc<dyn Transformers>,
    max_buffer_size: usize,
    metrics: Arc<PipelineMetrics>,
    mode: Mode,
    buffer: Vec<Buffered>,
    // Fact id -> buffer slots awaiting that id's transformation result.
    index: HashMap<Uuid, Vec<usize>>,
}

impl<P: SignalSink> BufferedTransformStage<P> {
    /// Builds the stage for one subscription.
    #[must_use]
    pub fn new(
        parent: P,
        transformers: Arc<dyn Transformers>,
        max_buffer_size: usize,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            parent,
            transformers,
            max_buffer_size: max_buffer_size.max(1),
            metrics,
            mode: Mode::Direct,
            buffer: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// True while at least one transformation is outstanding.
    #[must_use]
    pub fn is_buffering(&self) -> bool {
        self.mode == Mode::Buffering
    }

    /// Flushes the buffer: one batch transformation call, then emission in
    /// original arrival order. Returns the stage to direct mode.
    ///
    /// # Errors
    /// Propagates parent-stage failures. A failed batch call is not an error
    /// here — it is emitted downstream as a single `Signal::Error`.
    pub fn flush(&mut self) -> FactResult<()> {
        if self.buffer.is_empty() {
            self.mode = Mode::Direct;
            return Ok(());
        }

        let batch: Vec<TransformRequest> = {
            let mut distinct: Vec<TransformRequest> = Vec::new();
            let mut seen: HashSet<Uuid> = HashSet::new();
            for entry in &self.buffer {
                if let Buffered::Pending(req) = entry {
                    if seen.insert(req.fact.id()) {
                        distinct.push(req.clone());
                    }
                }
            }
            distinct
        };

        let results = if batch.is_empty() {
            HashMap::new()
        } else {
            self.metrics.inc_transform_batches();
            match self.transformers.transform_batch(batch) {
                Ok(results) => results,
                Err(e) => return self.abandon(e.into()),
            }
        };

        // Nothing is emitted until every pending id has a result: a batch with
        // an unresolved transformation is never partially delivered.
        if let Some(missing) = self.index.keys().find(|id| !results.contains_key(id)) {
            let cause = crate::error::ServerError::TransformationFailed {
                reason: format!("no transformation result for fact {missing}"),
            };
            return self.abandon(cause.into());
        }

        let entries = std::mem::take(&mut self.buffer);
        self.index.clear();
        self.mode = Mode::Direct;

        for entry in entries {
            match entry {
                Buffered::Ready(signal) => self.parent.process(signal)?,
                Buffered::Pending(req) => {
                    let transformed = &results[&req.fact.id()];
                    self.parent.process(Signal::Fact(Arc::clone(transformed)))?;
                }
            }
        }
        Ok(())
    }

    fn abandon(&mut self, cause: crate::error::FactError) -> FactResult<()> {
        error!(error = %cause, dropped = self.buffer.len(), "batch transformation failed, abandoning buffer");
        self.metrics.inc_transform_failures();
        self.buffer.clear();
        self.index.clear();
        self.mode = Mode::Direct;
        self.parent.process(Signal::Error(cause))
    }

    fn buffer_signal(&mut self, signal: Signal) {
        self.buffer.push(Buffered::Ready(signal));
    }

    fn buffer_transform(&mut self, request: TransformRequest) {
        let id = request.fact.id();
        let slot = self.buffer.len();
        self.buffer.push(Buffered::Pending(request));
        self.index.entry(id).or_default().push(slot);
    }
}

impl<P: SignalSink> SignalSink for BufferedTransformStage<P> {
    fn process(&mut self, signal: Signal) -> FactResult<()> {
        match signal {
            Signal::Fact(fact) => {
                match self.transformers.prepare(&fact) {
                    Some(request) => {
                        // Switch before buffering: later no-op facts must
                        // queue behind this one.
                        self.mode = Mode::Buffering;
                        self.buffer_transform(request);
                    }
                    None => {
                        if self.mode == Mode::Direct {
                            return self.parent.process(Signal::Fact(fact));
                        }
                        self.buffer_signal(Signal::Fact(fact));
                    }
                }
                if self.buffer.len() >= self.max_buffer_size {
                    return self.flush();
                }
                Ok(())
            }
            signal => {
                if self.mode == Mode::Direct {
                    return self.parent.process(signal);
                }
                let flush_now = signal.forces_flush();
                self.buffer_signal(signal);
                if flush_now || self.buffer.len() >= self.max_buffer_size {
                    return self.flush();
                }
                Ok(())
            }
        }
    }
}
