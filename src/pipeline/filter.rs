//! Post-query filtering.
//!
//! Storage answers a subscription query conservatively; this stage re-checks
//! the request's specs against each fact right before delivery, after
//! transformation may have changed the fact's apparent version. When no spec
//! carries a filter script the storage query is already exact and the check
//! can be skipped entirely.

use std::sync::Arc;

use crate::error::FactResult;
use crate::metrics::PipelineMetrics;
use crate::signal::Signal;
use crate::spec::SubscriptionRequest;

use super::SignalSink;

/// Re-evaluates the subscription's specs against delivered facts.
pub struct PostQueryFilterStage<P> {
    parent: P,
    request: SubscriptionRequest,
    can_be_skipped: bool,
    metrics: Arc<PipelineMetrics>,
}

impl<P: SignalSink> PostQueryFilterStage<P> {
    /// Builds the stage for one subscription.
    #[must_use]
    pub fn new(parent: P, request: &SubscriptionRequest, metrics: Arc<PipelineMetrics>) -> Self {
        // Without scripts the storage query already guarantees the match.
        let can_be_skipped = !request.has_scripts();
        Self {
            parent,
            request: request.clone(),
            can_be_skipped,
            metrics,
        }
    }

    /// True when every fact passes unconditionally.
    #[must_use]
    pub const fn can_be_skipped(&self) -> bool {
        self.can_be_skipped
    }
}

impl<P: SignalSink> SignalSink for PostQueryFilterStage<P> {
    fn process(&mut self, signal: Signal) -> FactResult<()> {
        let Signal::Fact(fact) = &signal else {
            return self.parent.process(signal);
        };
        if self.can_be_skipped {
            return self.parent.process(signal);
        }
        match self.request.matches(fact) {
            Ok(true) => self.parent.process(signal),
            Ok(false) => {
                self.metrics.inc_facts_filtered();
                Ok(())
            }
            // A broken script is a server verdict; surface it downstream.
            Err(e) => self.parent.process(Signal::Error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::Fact;
    use crate::pipeline::testing::RecordingSink;
    use crate::script::FilterScript;
    use crate::spec::FactSpec;
    use serde_json::json;

    fn scripted_request(total: i64) -> SubscriptionRequest {
        SubscriptionRequest::follow(FactSpec::ns("orders").filter_script(FilterScript::Eq {
            path: "payload.total".to_string(),
            value: json!(total),
        }))
        .build()
        .unwrap()
    }

    fn fact(total: i64) -> Arc<Fact> {
        Arc::new(
            Fact::builder("orders")
                .payload(json!({ "total": total }))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn scriptless_request_skips_the_check() {
        let request = SubscriptionRequest::follow(FactSpec::ns("payments"))
            .build()
            .unwrap();
        let metrics = Arc::new(PipelineMetrics::new());
        let (sink, seen) = RecordingSink::new();
        let mut stage = PostQueryFilterStage::new(sink, &request, metrics);
        assert!(stage.can_be_skipped());

        // Even a non-matching namespace passes: upstream guaranteed the match.
        stage.process(Signal::Fact(fact(1))).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn scripted_request_filters_mismatches() {
        let metrics = Arc::new(PipelineMetrics::new());
        let (sink, seen) = RecordingSink::new();
        let mut stage = PostQueryFilterStage::new(sink, &scripted_request(10), Arc::clone(&metrics));

        stage.process(Signal::Fact(fact(10))).unwrap();
        stage.process(Signal::Fact(fact(11))).unwrap();
        stage.process(Signal::Catchup).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_fact());
        assert!(matches!(seen[1], Signal::Catchup));
        assert_eq!(metrics.facts_filtered(), 1);
    }

    #[test]
    fn broken_script_becomes_an_error_signal() {
        let request = SubscriptionRequest::follow(FactSpec::ns("orders").filter_script(
            FilterScript::Regex {
                path: "payload.x".to_string(),
                pattern: "[".to_string(),
            },
        ))
        .build()
        .unwrap();
        let metrics = Arc::new(PipelineMetrics::new());
        let (sink, seen) = RecordingSink::new();
        let mut stage = PostQueryFilterStage::new(sink, &request, metrics);

        stage.process(Signal::Fact(fact(1))).unwrap();

        let seen = seen.lock().unwrap();
        let Signal::Error(err) = &seen[0] else {
            panic!("expected error signal");
        };
        assert!(err.is_server_origin());
    }
}
