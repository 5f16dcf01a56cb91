//! Fact filters and subscription requests.
//!
//! A [`FactSpec`] is one conjunctive filter; a [`SubscriptionRequest`] carries
//! one or more specs and matches a fact when *any* spec matches (OR across
//! specs, AND within one).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FactResult, ValidationError};
use crate::fact::Fact;
use crate::position::FactStreamPosition;
use crate::script::FilterScript;

/// Lower bound for `max_batch_delay`.
pub const MIN_BATCH_DELAY_MS: u64 = 10;

/// Upper bound for `max_batch_delay`.
pub const MAX_BATCH_DELAY_MS: u64 = 300_000;

/// A single conjunctive fact filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactSpec {
    ns: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aggregate_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter_script: Option<FilterScript>,
}

impl FactSpec {
    /// A spec matching every fact in `ns`.
    #[must_use]
    pub fn ns(ns: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            typ: None,
            aggregate_id: None,
            meta: BTreeMap::new(),
            filter_script: None,
        }
    }

    /// Restricts to a fact type.
    #[must_use]
    pub fn typ(mut self, typ: impl Into<String>) -> Self {
        self.typ = Some(typ.into());
        self
    }

    /// Restricts to facts containing this aggregate id.
    #[must_use]
    pub const fn aggregate_id(mut self, id: Uuid) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    /// Requires a meta key/value equality (first value wins on lookup).
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Attaches a boolean filter script.
    #[must_use]
    pub fn filter_script(mut self, script: FilterScript) -> Self {
        self.filter_script = Some(script);
        self
    }

    /// The namespace this spec requires.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// True when this spec carries a filter script.
    #[must_use]
    pub const fn has_script(&self) -> bool {
        self.filter_script.is_some()
    }

    /// Evaluates the spec against a fact.
    ///
    /// # Errors
    /// Propagates a malformed filter script.
    pub fn matches(&self, fact: &Fact) -> FactResult<bool> {
        if fact.ns() != self.ns {
            return Ok(false);
        }
        if let Some(typ) = &self.typ {
            if fact.typ() != Some(typ.as_str()) {
                return Ok(false);
            }
        }
        if let Some(agg) = self.aggregate_id {
            if !fact.aggregate_ids().contains(&agg) {
                return Ok(false);
            }
        }
        for (k, v) in &self.meta {
            if fact.meta().first(k) != Some(v.as_str()) {
                return Ok(false);
            }
        }
        match &self.filter_script {
            Some(script) => script.matches(fact),
            None => Ok(true),
        }
    }
}

/// A subscription request: what to stream, from where, and for how long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    specs: Vec<FactSpec>,
    continuous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    starting_after: Option<FactStreamPosition>,
    #[serde(default)]
    ephemeral: bool,
    max_batch_delay_ms: u64,
}

impl SubscriptionRequest {
    /// Starts building a continuous (follow) request.
    #[must_use]
    pub fn follow(spec: FactSpec) -> SubscriptionRequestBuilder {
        SubscriptionRequestBuilder::new(vec![spec], true)
    }

    /// Starts building a one-shot catch-up request.
    #[must_use]
    pub fn catchup(spec: FactSpec) -> SubscriptionRequestBuilder {
        SubscriptionRequestBuilder::new(vec![spec], false)
    }

    /// The specs; a fact matches the request when any spec matches.
    #[must_use]
    pub fn specs(&self) -> &[FactSpec] {
        &self.specs
    }

    /// Keep streaming after reaching the head?
    #[must_use]
    pub const fn continuous(&self) -> bool {
        self.continuous
    }

    /// Resume-after position (exclusive), if any.
    #[must_use]
    pub const fn starting_after(&self) -> Option<FactStreamPosition> {
        self.starting_after
    }

    /// Start from "now" instead of from the beginning?
    #[must_use]
    pub const fn ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Upper bound on how long facts may sit buffered before a flush.
    #[must_use]
    pub const fn max_batch_delay(&self) -> Duration {
        Duration::from_millis(self.max_batch_delay_ms)
    }

    /// True when any spec carries a filter script.
    #[must_use]
    pub fn has_scripts(&self) -> bool {
        self.specs.iter().any(FactSpec::has_script)
    }

    /// OR across specs, AND within one.
    ///
    /// # Errors
    /// Propagates a malformed filter script.
    pub fn matches(&self, fact: &Fact) -> FactResult<bool> {
        for spec in &self.specs {
            if spec.matches(fact)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// A copy of this request resuming after `position`.
    #[must_use]
    pub fn resuming_after(&self, position: FactStreamPosition) -> Self {
        let mut req = self.clone();
        req.starting_after = Some(position);
        // An ephemeral restart would skip everything published while away.
        req.ephemeral = false;
        req
    }
}

/// Builder for [`SubscriptionRequest`].
#[derive(Debug, Clone)]
pub struct SubscriptionRequestBuilder {
    specs: Vec<FactSpec>,
    continuous: bool,
    starting_after: Option<FactStreamPosition>,
    ephemeral: bool,
    max_batch_delay_ms: u64,
}

impl SubscriptionRequestBuilder {
    fn new(specs: Vec<FactSpec>, continuous: bool) -> Self {
        Self {
            specs,
            continuous,
            starting_after: None,
            ephemeral: false,
            max_batch_delay_ms: MIN_BATCH_DELAY_MS,
        }
    }

    /// Adds another spec (OR semantics).
    #[must_use]
    pub fn or(mut self, spec: FactSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Resume after this position (exclusive).
    #[must_use]
    pub const fn starting_after(mut self, position: FactStreamPosition) -> Self {
        self.starting_after = Some(position);
        self
    }

    /// Start from the current head instead of the beginning.
    #[must_use]
    pub const fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    /// Bounds how long facts may be buffered before being flushed.
    #[must_use]
    pub const fn max_batch_delay(mut self, delay: Duration) -> Self {
        self.max_batch_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Validates and builds the request.
    ///
    /// # Errors
    /// `EmptySpecs` without at least one spec, `BatchDelayOutOfRange` outside
    /// [10ms, 300000ms].
    pub fn build(self) -> FactResult<SubscriptionRequest> {
        if self.specs.is_empty() {
            return Err(ValidationError::EmptySpecs.into());
        }
        if self.max_batch_delay_ms < MIN_BATCH_DELAY_MS
            || self.max_batch_delay_ms > MAX_BATCH_DELAY_MS
        {
            return Err(ValidationError::BatchDelayOutOfRange {
                ms: self.max_batch_delay_ms,
                min: MIN_BATCH_DELAY_MS,
                max: MAX_BATCH_DELAY_MS,
            }
            .into());
        }
        Ok(SubscriptionRequest {
            specs: self.specs,
            continuous: self.continuous,
            starting_after: self.starting_after,
            ephemeral: self.ephemeral,
            max_batch_delay_ms: self.max_batch_delay_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fact() -> Fact {
        Fact::builder("orders")
            .typ("OrderPlaced")
            .aggregate_id(Uuid::from_u128(7))
            .meta("region", "eu")
            .payload(json!({"total": 12}))
            .build()
            .unwrap()
    }

    #[test]
    fn namespace_alone_matches() {
        assert!(FactSpec::ns("orders").matches(&fact()).unwrap());
        assert!(!FactSpec::ns("payments").matches(&fact()).unwrap());
    }

    #[test]
    fn all_conditions_are_conjunctive() {
        let spec = FactSpec::ns("orders")
            .typ("OrderPlaced")
            .aggregate_id(Uuid::from_u128(7))
            .meta("region", "eu");
        assert!(spec.matches(&fact()).unwrap());

        let wrong_type = FactSpec::ns("orders").typ("OrderCancelled");
        assert!(!wrong_type.matches(&fact()).unwrap());

        let wrong_agg = FactSpec::ns("orders").aggregate_id(Uuid::from_u128(8));
        assert!(!wrong_agg.matches(&fact()).unwrap());

        let wrong_meta = FactSpec::ns("orders").meta("region", "us");
        assert!(!wrong_meta.matches(&fact()).unwrap());
    }

    #[test]
    fn script_is_the_last_conjunct() {
        let spec = FactSpec::ns("orders").filter_script(FilterScript::Eq {
            path: "payload.total".to_string(),
            value: json!(12),
        });
        assert!(spec.matches(&fact()).unwrap());
        assert!(spec.has_script());
    }

    #[test]
    fn request_is_or_across_specs() {
        let req = SubscriptionRequest::follow(FactSpec::ns("payments"))
            .or(FactSpec::ns("orders"))
            .build()
            .unwrap();
        assert!(req.matches(&fact()).unwrap());
        assert!(req.continuous());

        let miss = SubscriptionRequest::catchup(FactSpec::ns("payments"))
            .build()
            .unwrap();
        assert!(!miss.matches(&fact()).unwrap());
        assert!(!miss.continuous());
    }

    #[test]
    fn batch_delay_bounds_are_enforced() {
        let too_small = SubscriptionRequest::follow(FactSpec::ns("orders"))
            .max_batch_delay(Duration::from_millis(5))
            .build();
        assert!(too_small.is_err());

        let too_large = SubscriptionRequest::follow(FactSpec::ns("orders"))
            .max_batch_delay(Duration::from_secs(301))
            .build();
        assert!(too_large.is_err());

        let ok = SubscriptionRequest::follow(FactSpec::ns("orders"))
            .max_batch_delay(Duration::from_millis(250))
            .build()
            .unwrap();
        assert_eq!(ok.max_batch_delay(), Duration::from_millis(250));
    }

    #[test]
    fn resuming_clears_ephemeral_and_sets_position() {
        let req = SubscriptionRequest::follow(FactSpec::ns("orders"))
            .ephemeral()
            .build()
            .unwrap();
        let pos = FactStreamPosition::without_serial(Uuid::from_u128(1));
        let resumed = req.resuming_after(pos);
        assert_eq!(resumed.starting_after(), Some(pos));
        assert!(!resumed.ephemeral());
        assert_eq!(resumed.specs(), req.specs());
    }
}
