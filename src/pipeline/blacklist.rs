//! Administrative fact suppression.
//!
//! A blacklisted fact id is dropped from delivery without being deleted from
//! storage. Dropping a fact never triggers a Flush — the latency bound is
//! preserved by the producer's flush logic, not by filtering.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::error::FactResult;
use crate::metrics::PipelineMetrics;
use crate::signal::Signal;

use super::SignalSink;

/// The administrative set of blocked fact ids.
pub trait Blacklist: Send + Sync {
    /// True when delivery of this fact id is blocked.
    fn is_blocked(&self, id: Uuid) -> bool;
}

/// In-memory blacklist, shared across subscriptions.
#[derive(Debug, Default)]
pub struct InMemoryBlacklist {
    blocked: RwLock<HashSet<Uuid>>,
}

impl InMemoryBlacklist {
    /// Creates an empty blacklist.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks a fact id.
    pub fn block(&self, id: Uuid) {
        if let Ok(mut set) = self.blocked.write() {
            set.insert(id);
        }
    }

    /// Unblocks a fact id.
    pub fn unblock(&self, id: Uuid) {
        if let Ok(mut set) = self.blocked.write() {
            set.remove(&id);
        }
    }
}

impl Blacklist for InMemoryBlacklist {
    fn is_blocked(&self, id: Uuid) -> bool {
        self.blocked.read().map(|set| set.contains(&id)).unwrap_or(false)
    }
}

/// Drops Fact signals whose id is blocked; everything else passes.
pub struct BlacklistStage<P> {
    parent: P,
    blacklist: Arc<dyn Blacklist>,
    metrics: Arc<PipelineMetrics>,
}

impl<P: SignalSink> BlacklistStage<P> {
    /// Wraps `parent` with blacklist filtering.
    #[must_use]
    pub fn new(parent: P, blacklist: Arc<dyn Blacklist>, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            parent,
            blacklist,
            metrics,
        }
    }
}

impl<P: SignalSink> SignalSink for BlacklistStage<P> {
    fn process(&mut self, signal: Signal) -> FactResult<()> {
        if let Signal::Fact(fact) = &signal {
            if self.blacklist.is_blocked(fact.id()) {
                self.metrics.inc_facts_blacklisted();
                return Ok(());
            }
        }
        self.parent.process(signal)
    }
}
