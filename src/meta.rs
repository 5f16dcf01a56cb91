//! Fact metadata.
//!
//! Meta is an insertion-ordered list of (key, value) pairs rather than a map:
//! ordinary keys may carry several values, and single-valued lookups return the
//! first match. Keys prefixed with `_` are reserved for server-assigned entries
//! (`_ser` serial number, `_ts` commit timestamp) and are single-valued — they
//! must be written through [`FactMeta::set_single`], which replaces all prior
//! values instead of appending.

use serde::{Deserialize, Serialize};

/// Reserved meta key carrying the storage-assigned serial number.
pub const KEY_SERIAL: &str = "_ser";

/// Reserved meta key carrying the storage-assigned commit timestamp (epoch millis).
pub const KEY_TIMESTAMP: &str = "_ts";

/// Insertion-ordered fact metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactMeta {
    pairs: Vec<(String, String)>,
}

impl FactMeta {
    /// Creates empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `key` is reserved for server-assigned metadata.
    #[must_use]
    pub fn is_reserved(key: &str) -> bool {
        key.starts_with('_')
    }

    /// Appends a value for `key`, keeping any existing values.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Replaces every value of `key` with a single one.
    ///
    /// This is the required write path for reserved (`_`-prefixed) keys.
    pub fn set_single(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.pairs.retain(|(k, _)| *k != key);
        self.pairs.push((key, value.into()));
    }

    /// First value recorded for `key`, if any.
    #[must_use]
    pub fn first(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value recorded for `key`, in insertion order.
    #[must_use]
    pub fn all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Returns true when no pairs are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of recorded pairs (not distinct keys).
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Iterates pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for FactMeta {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}
