//! Resumable pointers into the global fact stream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A point in the global fact stream: `(fact_id, serial)`.
///
/// The serial exists only for before/after comparison and progress estimation,
/// never for identity. A position may lack a fact id ("no position yet"), and a
/// position without a serial is "not ordered" — kept for legacy and test cases
/// where only the fact id is known (a reconnecting client, for instance).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactStreamPosition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fact_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    serial: Option<u64>,
}

impl FactStreamPosition {
    /// A fully ordered position.
    #[must_use]
    pub const fn of(fact_id: Uuid, serial: u64) -> Self {
        Self {
            fact_id: Some(fact_id),
            serial: Some(serial),
        }
    }

    /// A position known only by fact id.
    #[must_use]
    pub const fn without_serial(fact_id: Uuid) -> Self {
        Self {
            fact_id: Some(fact_id),
            serial: None,
        }
    }

    /// "No position yet."
    #[must_use]
    pub const fn none() -> Self {
        Self {
            fact_id: None,
            serial: None,
        }
    }

    /// The fact id this position points at, if any.
    #[must_use]
    pub const fn fact_id(&self) -> Option<Uuid> {
        self.fact_id
    }

    /// The serial, if this position is ordered.
    #[must_use]
    pub const fn serial(&self) -> Option<u64> {
        self.serial
    }

    /// True when before/after comparison against this position is meaningful.
    #[must_use]
    pub const fn is_ordered(&self) -> bool {
        self.serial.is_some()
    }

    /// True when strictly after `other`; false when either side is unordered.
    #[must_use]
    pub fn is_after(&self, other: &Self) -> bool {
        match (self.serial, other.serial) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        }
    }
}

/// Progress data for a catching-up subscription.
///
/// `start_serial` is where the catch-up began, `target_serial` the stream head
/// at subscribe time; clients derive a progress percentage from a fact's serial
/// relative to these bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactStreamInfo {
    /// Serial at which the catch-up started.
    pub start_serial: u64,
    /// Head serial at subscribe time.
    pub target_serial: u64,
}

impl FactStreamInfo {
    /// Estimated catch-up progress for `serial`, in `[0.0, 1.0]`.
    #[must_use]
    pub fn progress(&self, serial: u64) -> f64 {
        if self.target_serial <= self.start_serial {
            return 1.0;
        }
        let span = (self.target_serial - self.start_serial) as f64;
        let done = serial.saturating_sub(self.start_serial) as f64;
        (done / span).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_positions_compare_by_serial_only() {
        let a = FactStreamPosition::of(Uuid::new_v4(), 5);
        let b = FactStreamPosition::of(Uuid::new_v4(), 9);
        assert!(b.is_after(&a));
        assert!(!a.is_after(&b));
        assert!(!a.is_after(&a));
    }

    #[test]
    fn unordered_positions_never_compare() {
        let ordered = FactStreamPosition::of(Uuid::new_v4(), 5);
        let unordered = FactStreamPosition::without_serial(Uuid::new_v4());
        assert!(!unordered.is_ordered());
        assert!(!unordered.is_after(&ordered));
        assert!(!ordered.is_after(&unordered));
    }

    #[test]
    fn none_position_is_empty() {
        let none = FactStreamPosition::none();
        assert_eq!(none.fact_id(), None);
        assert_eq!(none.serial(), None);
        assert!(!none.is_ordered());
    }

    #[test]
    fn progress_is_clamped() {
        let info = FactStreamInfo {
            start_serial: 10,
            target_serial: 20,
        };
        assert!((info.progress(15) - 0.5).abs() < 1e-9);
        assert!((info.progress(5) - 0.0).abs() < 1e-9);
        assert!((info.progress(25) - 1.0).abs() < 1e-9);

        let empty = FactStreamInfo {
            start_serial: 20,
            target_serial: 20,
        };
        assert!((empty.progress(20) - 1.0).abs() < 1e-9);
    }
}
