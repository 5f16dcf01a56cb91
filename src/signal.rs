//! Pipeline traffic.
//!
//! A [`Signal`] is one unit of traffic between the storage-facing producer and
//! the transport: either a fact, or a control event. Consumers switch on the
//! variant at the point of use; the set is closed on purpose.
//!
//! Ordering invariant: the position of a Fact signal relative to every other
//! signal, as emitted by the source, must be preserved end-to-end. A stage may
//! drop signals (filtering) but must never reorder them.

use std::sync::Arc;

use crate::error::FactError;
use crate::fact::Fact;
use crate::position::{FactStreamInfo, FactStreamPosition};

/// One unit of pipeline traffic.
#[derive(Debug, Clone)]
pub enum Signal {
    /// Stream content: exactly one fact.
    Fact(Arc<Fact>),
    /// Everything buffered so far must be delivered now.
    Flush,
    /// All facts that existed at subscribe time have been delivered.
    Catchup,
    /// The (non-continuous) stream is exhausted.
    Complete,
    /// Skip the client's position forward without delivering intervening facts.
    FastForward(FactStreamPosition),
    /// Progress data for catch-up percentage estimation.
    Info(FactStreamInfo),
    /// Terminal failure; no further fact processing follows.
    Error(FactError),
}

impl Signal {
    /// True for stream content, false for control signals.
    #[must_use]
    pub const fn is_fact(&self) -> bool {
        matches!(self, Self::Fact(_))
    }

    /// True for signals that force a buffered stage to flush.
    #[must_use]
    pub const fn forces_flush(&self) -> bool {
        matches!(
            self,
            Self::Flush | Self::Catchup | Self::Complete | Self::Error(_)
        )
    }

    /// The carried fact, if this is a Fact signal.
    #[must_use]
    pub const fn as_fact(&self) -> Option<&Arc<Fact>> {
        match self {
            Self::Fact(f) => Some(f),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn only_fact_signals_are_content() {
        let fact = Arc::new(Fact::builder("orders").build().unwrap());
        assert!(Signal::Fact(fact).is_fact());
        assert!(!Signal::Flush.is_fact());
        assert!(!Signal::Catchup.is_fact());
        assert!(!Signal::FastForward(FactStreamPosition::none()).is_fact());
    }

    #[test]
    fn flush_catchup_complete_and_error_force_a_flush() {
        assert!(Signal::Flush.forces_flush());
        assert!(Signal::Catchup.forces_flush());
        assert!(Signal::Complete.forces_flush());
        assert!(Signal::Error(
            TransportError::ConnectionFailed {
                message: "gone".to_string()
            }
            .into()
        )
        .forces_flush());

        assert!(!Signal::Info(FactStreamInfo {
            start_serial: 0,
            target_serial: 1
        })
        .forces_flush());
        assert!(!Signal::FastForward(FactStreamPosition::none()).forces_flush());
    }
}
