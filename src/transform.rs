//! Schema transformation collaborator.
//!
//! The *logic* of upcasting a payload from version N to M lives outside this
//! crate. The pipeline only needs two answers from the registry: does this fact
//! need transformation for this subscription, and — batched — what do the
//! transformed facts look like. Batch failures fail the whole batch.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::ServerError;
use crate::fact::Fact;

/// One pending transformation: a fact and the versions the subscriber accepts.
#[derive(Debug, Clone)]
pub struct TransformRequest {
    /// The fact as stored.
    pub fact: Arc<Fact>,
    /// Acceptable target schema versions.
    pub target_versions: BTreeSet<u32>,
}

impl TransformRequest {
    /// Request to bring `fact` to exactly `target` version.
    #[must_use]
    pub fn to_version(fact: Arc<Fact>, target: u32) -> Self {
        Self {
            fact,
            target_versions: BTreeSet::from([target]),
        }
    }
}

/// Registry of schema transformers for one subscription.
pub trait Transformers: Send + Sync {
    /// Returns the transformation this fact needs, or `None` for a no-op.
    fn prepare(&self, fact: &Arc<Fact>) -> Option<TransformRequest>;

    /// Transforms a whole batch; the result maps original fact id to the
    /// transformed fact. A missing id, or an `Err`, fails the batch.
    ///
    /// # Errors
    /// `ServerError::TransformationFailed` when any request cannot be served.
    fn transform_batch(
        &self,
        batch: Vec<TransformRequest>,
    ) -> Result<HashMap<Uuid, Arc<Fact>>, ServerError>;
}

/// A registry that never transforms anything.
///
/// The default for subscriptions that accept facts as stored; with it the
/// buffered stage stays in direct mode permanently.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransformers;

impl Transformers for NoTransformers {
    fn prepare(&self, _fact: &Arc<Fact>) -> Option<TransformRequest> {
        None
    }

    fn transform_batch(
        &self,
        _batch: Vec<TransformRequest>,
    ) -> Result<HashMap<Uuid, Arc<Fact>>, ServerError> {
        Ok(HashMap::new())
    }
}
