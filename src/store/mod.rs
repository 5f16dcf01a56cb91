//! Abstract storage for facts.
//!
//! The persistence/query engine is an external collaborator; this module
//! defines its contract plus an in-memory implementation good enough for
//! embedded use and tests. Facts are append-only: the store assigns each
//! committed fact a monotonic serial and a timestamp, and ids are never
//! reused.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{FactError, FactResult, ServerError};
use crate::fact::Fact;
use crate::position::FactStreamPosition;
use crate::spec::{FactSpec, SubscriptionRequest};

/// Opaque server-side state token for conditional publishing.
///
/// Captures "the newest serial matching these specs" at acquisition time; a
/// conditional publish succeeds only while that observation still holds.
#[derive(Debug, Clone)]
pub struct StateToken {
    pub(crate) serial: u64,
    pub(crate) specs: Arc<Vec<FactSpec>>,
}

/// The storage collaborator.
pub trait FactStore: Send + Sync {
    /// Facts matching `request` strictly after `after`, in serial order.
    ///
    /// # Errors
    /// Backend failures as `ServerError::Storage`; script errors propagate.
    fn fetch_since(
        &self,
        request: &SubscriptionRequest,
        after: Option<&FactStreamPosition>,
    ) -> FactResult<Vec<Arc<Fact>>>;

    /// Fetch a single fact by id.
    ///
    /// # Errors
    /// Backend failures as `ServerError::Storage`.
    fn fetch_by_id(&self, id: Uuid) -> FactResult<Option<Arc<Fact>>>;

    /// Validates and commits `facts`, assigning serials and timestamps.
    /// Returns the position of the last committed fact.
    ///
    /// # Errors
    /// Validation failures (duplicate id, missing namespace) reject the whole
    /// batch; nothing is committed.
    fn publish(&self, facts: Vec<Fact>) -> FactResult<FactStreamPosition>;

    /// Commits `facts` only if no fact matching the token's specs was
    /// committed since the token was acquired.
    ///
    /// # Errors
    /// `ServerError::Storage` with a state-mismatch message when the
    /// condition fails; validation failures as in [`FactStore::publish`].
    fn publish_if_unchanged(
        &self,
        token: StateToken,
        facts: Vec<Fact>,
    ) -> FactResult<FactStreamPosition>;

    /// Acquires a state token over `specs`.
    ///
    /// # Errors
    /// Backend failures as `ServerError::Storage`; script errors propagate.
    fn state_for(&self, specs: &[FactSpec]) -> FactResult<StateToken>;

    /// Position of the newest committed fact, or none on an empty store.
    fn head(&self) -> FactStreamPosition;
}

/// Returns true when the error is the conditional-publish state mismatch.
#[must_use]
pub fn is_state_mismatch(err: &FactError) -> bool {
    matches!(
        err,
        FactError::Server(ServerError::Storage { message }) if message.starts_with("state changed")
    )
}

/// Optimistic conditional publish with bounded retries and linear backoff.
///
/// Acquires a fresh token per attempt; only the state-mismatch error is
/// retried, every other failure surfaces immediately.
///
/// # Errors
/// The final state-mismatch after `max_attempts`, or the first non-mismatch
/// error.
pub fn publish_with_retry(
    store: &dyn FactStore,
    specs: &[FactSpec],
    facts: Vec<Fact>,
    max_attempts: u32,
    backoff: Duration,
) -> FactResult<FactStreamPosition> {
    let max_attempts = max_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let token = store.state_for(specs)?;
        match store.publish_if_unchanged(token, facts.clone()) {
            Ok(position) => return Ok(position),
            Err(e) if is_state_mismatch(&e) && attempt < max_attempts => {
                std::thread::sleep(backoff.saturating_mul(attempt));
            }
            Err(e) => return Err(e),
        }
    }
}
