//! Error types for factstream.
//!
//! All errors are strongly typed using thiserror. The taxonomy matters for the
//! reconnecting client: server-origin errors are terminal, connectivity errors
//! are retried. Every error type is `Clone` because `Signal::Error` carries the
//! cause by value through channels.

use thiserror::Error;
use uuid::Uuid;

/// Validation errors raised before a fact or request touches storage.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Fact namespace is required and must be non-empty")]
    MissingNamespace,

    #[error("Fact id is required")]
    MissingId,

    #[error("Fact id {id} was already published; ids are never reused")]
    DuplicateFactId { id: Uuid },

    #[error("A subscription request needs at least one fact spec")]
    EmptySpecs,

    #[error("maxBatchDelay of {ms}ms is outside the allowed range [{min}ms, {max}ms]")]
    BatchDelayOutOfRange { ms: u64, min: u64, max: u64 },

    #[error("Required field '{field}' is missing")]
    MissingField { field: String },
}

/// Errors surfaced through the subscription lifecycle.
///
/// `Closed` and `Timeout` are deliberately distinct variants: a caller blocked
/// in `await_catchup` must be able to tell "the subscription went away" from
/// "the deadline passed" without string matching.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubscriptionError {
    #[error("Subscription was closed")]
    Closed,

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Channel disconnected: {path}")]
    Disconnected { path: String },

    #[error("Gave up reconnecting: {attempts} attempts within {window_ms}ms")]
    ReconnectsExhausted { attempts: usize, window_ms: u64 },
}

/// Server-origin application errors.
///
/// With one exception these are non-retriable verdicts: the server looked at
/// the request and rejected it, so reconnecting with the same request cannot
/// help. `StaleSubscription` is the exception — it means the server-side
/// subscription state expired, which is a connectivity symptom and is cured
/// by resubscribing from the last seen position.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServerError {
    #[error("Schema transformation failed: {reason}")]
    TransformationFailed { reason: String },

    #[error("Invalid filter script: {reason}")]
    InvalidFilterScript { reason: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Stale subscription: server-side subscription state expired")]
    StaleSubscription,
}

/// Transport errors for client-server communication.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Failed to encode request: {message}")]
    EncodingFailed { message: String },

    #[error("Failed to decode response: {message}")]
    DecodingFailed { message: String },
}

/// Top-level error type for factstream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FactError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl FactError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this error originates from the server's own error family.
    #[must_use]
    pub const fn is_server_origin(&self) -> bool {
        matches!(self, Self::Server(_))
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Subscription(e) => matches!(
                e,
                SubscriptionError::Timeout { .. } | SubscriptionError::Disconnected { .. }
            ),
            Self::Server(e) => matches!(e, ServerError::StaleSubscription),
            Self::Transport(e) => matches!(e, TransportError::ConnectionFailed { .. }),
            Self::Internal { .. } => false,
        }
    }

    /// Classification used by the reconnecting subscription.
    ///
    /// A server-origin error is a verdict about the request and is terminal for
    /// the subscription — except `StaleSubscription`, which only says the
    /// server-side handle went away. Everything else (transport drops,
    /// timeouts, disconnects) is connectivity and worth a reconnect.
    #[must_use]
    pub const fn is_fatal_for_subscription(&self) -> bool {
        match self {
            Self::Server(e) => !matches!(e, ServerError::StaleSubscription),
            Self::Validation(_) | Self::Internal { .. } => true,
            Self::Subscription(_) | Self::Transport(_) => false,
        }
    }
}

/// Result type alias for factstream operations.
pub type FactResult<T> = Result<T, FactError>;
