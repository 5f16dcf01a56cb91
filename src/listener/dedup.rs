//! Bounded recency set for notification deduplication.
//!
//! The storage engine may emit several low-level notifications per logical
//! insert and per transaction. Collapsing them to one wakeup per distinct
//! `(namespace, type, transaction)` triple keeps redundant re-polls off the
//! waiting subscriptions. The bound is a capacity, not a time window: once the
//! set is full the oldest entry is evicted and its triple will wake waiters
//! again if it reappears.

use std::collections::{HashSet, VecDeque};

/// Dedup key: `(namespace, type, transaction id)`.
pub type DedupKey = (String, Option<String>, u64);

/// Capacity-bounded recency set with FIFO eviction.
#[derive(Debug)]
pub struct DedupSet {
    capacity: usize,
    seen: HashSet<DedupKey>,
    order: VecDeque<DedupKey>,
}

impl DedupSet {
    /// Creates a set holding at most `capacity` triples (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Records a triple; returns true if it was newly seen.
    pub fn insert(&mut self, key: DedupKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    /// Number of currently retained triples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
