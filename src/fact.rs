//! The immutable fact envelope.
//!
//! A fact is created by a publisher, validated (namespace and id are
//! mandatory), assigned a monotonic serial and a timestamp by the storage
//! engine at commit time, and is immutable forever after. Pipeline code passes
//! facts as `Arc<Fact>`; stages that merely route a fact must preserve its
//! identity (`Arc::ptr_eq`), not copy it.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{FactResult, ValidationError};
use crate::meta::{FactMeta, KEY_SERIAL, KEY_TIMESTAMP};

/// Immutable event envelope: header metadata plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    id: Uuid,
    ns: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
    #[serde(default)]
    version: u32,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    aggregate_ids: BTreeSet<Uuid>,
    #[serde(default, skip_serializing_if = "FactMeta::is_empty")]
    meta: FactMeta,
    payload: Value,
}

impl Fact {
    /// Starts building a fact in the given namespace.
    #[must_use]
    pub fn builder(ns: impl Into<String>) -> FactBuilder {
        FactBuilder::new(ns)
    }

    /// Unique fact id; never reused by the store.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Namespace (always non-empty).
    #[must_use]
    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// Optional fact type.
    #[must_use]
    pub fn typ(&self) -> Option<&str> {
        self.typ.as_deref()
    }

    /// Schema revision; 0 means "unversioned".
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Aggregate ids this fact belongs to (may be empty).
    #[must_use]
    pub const fn aggregate_ids(&self) -> &BTreeSet<Uuid> {
        &self.aggregate_ids
    }

    /// Header metadata.
    #[must_use]
    pub const fn meta(&self) -> &FactMeta {
        &self.meta
    }

    /// Opaque structured payload.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Storage-assigned serial number, if the fact has been committed.
    #[must_use]
    pub fn serial(&self) -> Option<u64> {
        self.meta.first(KEY_SERIAL).and_then(|s| s.parse().ok())
    }

    /// Storage-assigned commit timestamp, if the fact has been committed.
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.meta
            .first(KEY_TIMESTAMP)
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// Fact header as a JSON object (used by filter scripts).
    #[must_use]
    pub fn header_json(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "ns": self.ns,
            "type": self.typ,
            "version": self.version,
            "aggIds": self.aggregate_ids,
            "meta": self.meta,
        })
    }

    /// Returns a committed copy with serial and timestamp stamped into meta.
    ///
    /// Reserved keys go through `set_single`; a re-stamp replaces any prior
    /// value instead of appending.
    #[must_use]
    pub(crate) fn with_commit_meta(mut self, serial: u64, ts: DateTime<Utc>) -> Self {
        self.meta.set_single(KEY_SERIAL, serial.to_string());
        self.meta
            .set_single(KEY_TIMESTAMP, ts.timestamp_millis().to_string());
        self
    }
}

/// Builder for [`Fact`].
#[derive(Debug, Clone)]
pub struct FactBuilder {
    id: Option<Uuid>,
    ns: String,
    typ: Option<String>,
    version: u32,
    aggregate_ids: BTreeSet<Uuid>,
    meta: FactMeta,
    payload: Value,
}

impl FactBuilder {
    fn new(ns: impl Into<String>) -> Self {
        Self {
            id: None,
            ns: ns.into(),
            typ: None,
            version: 0,
            aggregate_ids: BTreeSet::new(),
            meta: FactMeta::new(),
            payload: Value::Null,
        }
    }

    /// Sets an explicit fact id (defaults to a fresh v4 UUID).
    #[must_use]
    pub const fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the fact type.
    #[must_use]
    pub fn typ(mut self, typ: impl Into<String>) -> Self {
        self.typ = Some(typ.into());
        self
    }

    /// Sets the schema revision.
    #[must_use]
    pub const fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Adds an aggregate id.
    #[must_use]
    pub fn aggregate_id(mut self, id: Uuid) -> Self {
        self.aggregate_ids.insert(id);
        self
    }

    /// Appends a meta value (reserved keys are routed through `set_single`).
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if FactMeta::is_reserved(&key) {
            self.meta.set_single(key, value);
        } else {
            self.meta.add(key, value);
        }
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Validates and builds the fact.
    ///
    /// # Errors
    /// `ValidationError::MissingNamespace` if the namespace is empty or blank,
    /// `ValidationError::MissingId` if an explicit nil id was given.
    pub fn build(self) -> FactResult<Fact> {
        if self.ns.trim().is_empty() {
            return Err(ValidationError::MissingNamespace.into());
        }
        let id = match self.id {
            Some(id) if id.is_nil() => return Err(ValidationError::MissingId.into()),
            Some(id) => id,
            None => Uuid::new_v4(),
        };
        Ok(Fact {
            id,
            ns: self.ns,
            typ: self.typ,
            version: self.version,
            aggregate_ids: self.aggregate_ids,
            meta: self.meta,
            payload: self.payload,
        })
    }
}
