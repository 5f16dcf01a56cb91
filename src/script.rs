//! Filter scripts: serializable boolean predicates over a fact's header and
//! payload.
//!
//! A script is evaluated against the JSON document
//! `{"header": {..}, "payload": ..}` using dotted-path lookup. Scripts are
//! declared by clients inside a [`crate::spec::FactSpec`]; a malformed script
//! (bad regex, unresolvable structure) is a server-origin error, not a silent
//! mismatch.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FactResult, ServerError};
use crate::fact::Fact;

/// A boolean expression over `{"header": .., "payload": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterScript {
    /// Value at `path` equals `value`.
    Eq {
        /// Dotted path, e.g. `payload.customer.id`.
        path: String,
        /// Expected JSON value.
        value: Value,
    },
    /// String value at `path` matches `pattern`.
    Regex {
        /// Dotted path into the document.
        path: String,
        /// Regex applied to the string at `path`.
        pattern: String,
    },
    /// Every sub-expression holds.
    All {
        /// Conjuncts.
        exprs: Vec<FilterScript>,
    },
    /// At least one sub-expression holds.
    Any {
        /// Disjuncts.
        exprs: Vec<FilterScript>,
    },
    /// Negation.
    Not {
        /// Negated expression.
        expr: Box<FilterScript>,
    },
}

impl FilterScript {
    /// Evaluates the script against a fact.
    ///
    /// # Errors
    /// `ServerError::InvalidFilterScript` for a malformed regex.
    pub fn matches(&self, fact: &Fact) -> FactResult<bool> {
        let doc = serde_json::json!({
            "header": fact.header_json(),
            "payload": fact.payload(),
        });
        self.eval(&doc)
    }

    fn eval(&self, doc: &Value) -> FactResult<bool> {
        match self {
            Self::Eq { path, value } => Ok(lookup(doc, path) == Some(value)),
            Self::Regex { path, pattern } => {
                let re = Regex::new(pattern).map_err(|e| ServerError::InvalidFilterScript {
                    reason: format!("bad regex '{pattern}': {e}"),
                })?;
                Ok(lookup(doc, path)
                    .and_then(Value::as_str)
                    .is_some_and(|s| re.is_match(s)))
            }
            Self::All { exprs } => {
                for e in exprs {
                    if !e.eval(doc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any { exprs } => {
                for e in exprs {
                    if e.eval(doc)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not { expr } => Ok(!expr.eval(doc)?),
        }
    }
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = doc;
    for seg in path.split('.') {
        cur = cur.get(seg)?;
    }
    Some(cur)
}
