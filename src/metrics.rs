//! Counters for pipeline and listener activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters, readable at any time.
///
/// One instance per server is fine; stages share it through an `Arc`.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    facts_delivered: AtomicU64,
    facts_blacklisted: AtomicU64,
    facts_filtered: AtomicU64,
    transform_batches: AtomicU64,
    transform_failures: AtomicU64,
    notifications_posted: AtomicU64,
    notifications_deduped: AtomicU64,
    late_deliveries_dropped: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        /// Current counter value.
        #[must_use]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl PipelineMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter!(inc_facts_delivered, facts_delivered, facts_delivered);
    counter!(inc_facts_blacklisted, facts_blacklisted, facts_blacklisted);
    counter!(inc_facts_filtered, facts_filtered, facts_filtered);
    counter!(inc_transform_batches, transform_batches, transform_batches);
    counter!(inc_transform_failures, transform_failures, transform_failures);
    counter!(inc_notifications_posted, notifications_posted, notifications_posted);
    counter!(inc_notifications_deduped, notifications_deduped, notifications_deduped);
    counter!(inc_late_deliveries_dropped, late_deliveries_dropped, late_deliveries_dropped);
}
