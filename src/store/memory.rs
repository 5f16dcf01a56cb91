//! In-memory fact store.
//!
//! Complete implementation of [`FactStore`] for embedded use and tests:
//! append-only vector ordered by serial, duplicate-id rejection, commit-time
//! serial/timestamp stamping through the reserved meta keys, and optional
//! wakeup posting to an [`EventBus`] so local subscriptions go live without a
//! backend notification channel.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use uuid::Uuid;

use crate::error::{FactError, FactResult, ServerError, ValidationError};
use crate::fact::Fact;
use crate::listener::bus::{EventBus, FactNotification};
use crate::position::FactStreamPosition;
use crate::spec::{FactSpec, SubscriptionRequest};

use super::{FactStore, StateToken};

#[derive(Debug, Default)]
struct Inner {
    // Ascending by serial; serial i sits at facts[i - 1].
    facts: Vec<Arc<Fact>>,
    ids: HashSet<Uuid>,
}

/// Thread-safe in-memory [`FactStore`].
#[derive(Default)]
pub struct InMemoryFactStore {
    inner: RwLock<Inner>,
    bus: Option<Arc<EventBus>>,
}

impl InMemoryFactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store that posts a wakeup per committed fact.
    #[must_use]
    pub fn with_bus(bus: Arc<EventBus>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            bus: Some(bus),
        }
    }

    /// Number of committed facts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.facts.len()).unwrap_or(0)
    }

    /// True when nothing has been committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> FactError {
        ServerError::Storage {
            message: "store lock poisoned".to_string(),
        }
        .into()
    }

    /// Serial to start after, resolving id-only positions against the store.
    fn resolve_after_serial(inner: &Inner, after: Option<&FactStreamPosition>) -> u64 {
        let Some(position) = after else { return 0 };
        if let Some(serial) = position.serial() {
            return serial;
        }
        position
            .fact_id()
            .and_then(|id| {
                inner
                    .facts
                    .iter()
                    .find(|f| f.id() == id)
                    .and_then(|f| f.serial())
            })
            .unwrap_or(0)
    }

    fn newest_matching_serial(inner: &Inner, specs: &[FactSpec]) -> FactResult<u64> {
        for fact in inner.facts.iter().rev() {
            for spec in specs {
                if spec.matches(fact)? {
                    return Ok(fact.serial().unwrap_or(0));
                }
            }
        }
        Ok(0)
    }

    fn commit(&self, facts: Vec<Fact>) -> FactResult<FactStreamPosition> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;

        // Validate the whole batch before committing any of it.
        let mut batch_ids = HashSet::new();
        for fact in &facts {
            if inner.ids.contains(&fact.id()) || !batch_ids.insert(fact.id()) {
                return Err(ValidationError::DuplicateFactId { id: fact.id() }.into());
            }
        }

        let ts = Utc::now();
        let mut position = FactStreamPosition::none();
        let mut notifications = Vec::with_capacity(facts.len());
        for fact in facts {
            let serial = inner.facts.len() as u64 + 1;
            let committed = Arc::new(fact.with_commit_meta(serial, ts));
            position = FactStreamPosition::of(committed.id(), serial);
            notifications.push(FactNotification::of(
                committed.ns(),
                committed.typ().map(str::to_string),
            ));
            inner.ids.insert(committed.id());
            inner.facts.push(committed);
        }
        drop(inner);

        if let Some(bus) = &self.bus {
            for notification in &notifications {
                bus.post(notification);
            }
        }
        Ok(position)
    }
}

impl FactStore for InMemoryFactStore {
    fn fetch_since(
        &self,
        request: &SubscriptionRequest,
        after: Option<&FactStreamPosition>,
    ) -> FactResult<Vec<Arc<Fact>>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        let after_serial = Self::resolve_after_serial(&inner, after);

        let mut out = Vec::new();
        for fact in inner.facts.iter().skip(after_serial as usize) {
            if request.matches(fact)? {
                out.push(Arc::clone(fact));
            }
        }
        Ok(out)
    }

    fn fetch_by_id(&self, id: Uuid) -> FactResult<Option<Arc<Fact>>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner.facts.iter().find(|f| f.id() == id).cloned())
    }

    fn publish(&self, facts: Vec<Fact>) -> FactResult<FactStreamPosition> {
        self.commit(facts)
    }

    fn publish_if_unchanged(
        &self,
        token: StateToken,
        facts: Vec<Fact>,
    ) -> FactResult<FactStreamPosition> {
        {
            let inner = self.inner.read().map_err(|_| Self::poisoned())?;
            let newest = Self::newest_matching_serial(&inner, &token.specs)?;
            if newest != token.serial {
                return Err(ServerError::Storage {
                    message: format!(
                        "state changed: token serial {} is no longer newest ({newest})",
                        token.serial
                    ),
                }
                .into());
            }
        }
        self.commit(facts)
    }

    fn state_for(&self, specs: &[FactSpec]) -> FactResult<StateToken> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        let serial = Self::newest_matching_serial(&inner, specs)?;
        Ok(StateToken {
            serial,
            specs: Arc::new(specs.to_vec()),
        })
    }

    fn head(&self) -> FactStreamPosition {
        let Ok(inner) = self.inner.read() else {
            return FactStreamPosition::none();
        };
        inner
            .facts
            .last()
            .and_then(|f| f.serial().map(|s| FactStreamPosition::of(f.id(), s)))
            .unwrap_or_else(FactStreamPosition::none)
    }
}
