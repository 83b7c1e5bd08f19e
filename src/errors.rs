//! # Engine Errors
//!
//! The error taxonomy surfaced to callers of the engine. Subsystems keep
//! their own error enums and convert into `LiveError` at the boundary.

use thiserror::Error;

use crate::bus::BusError;
use crate::query::QueryError;
use crate::store::StoreError;

/// Result type for engine operations
pub type LiveResult<T> = Result<T, LiveError>;

/// Engine errors
#[derive(Debug, Clone, Error)]
pub enum LiveError {
    // ==================
    // Caller Errors (terminal, never retried)
    // ==================
    /// Malformed or disallowed object
    #[error("Validation error: {0}")]
    Validation(String),

    /// Malformed or disallowed query
    #[error("Invalid query: {0}")]
    InvalidQuery(#[from] QueryError),

    /// Object or subscription does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller does not own the object or socket
    #[error("Forbidden: {0}")]
    Forbidden(String),

    // ==================
    // Coordination Errors
    // ==================
    /// Lock held by another writer; the caller may retry with backoff
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Post-write re-verification failed and the write was rolled back
    #[error("Inconsistent context: {0}")]
    InconsistentContext(String),

    /// Change feed failed past its retry budget
    #[error("Change feed interrupted: {0}")]
    FeedInterrupted(String),

    /// Subscription vanished while a delivery was in flight
    #[error("Delivery target vanished: socket {socket_id}, query {query_id}")]
    DeliveryRace { socket_id: String, query_id: String },

    // ==================
    // Collaborator Errors
    // ==================
    /// Backing store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Distribution bus failure
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LiveError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Get error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidQuery(_) => "INVALID_QUERY",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::InconsistentContext(_) => "INCONSISTENT_CONTEXT",
            Self::FeedInterrupted(_) => "FEED_INTERRUPTED",
            Self::DeliveryRace { .. } => "DELIVERY_RACE",
            Self::Store(_) => "STORE_ERROR",
            Self::Bus(_) => "BUS_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Short reason sent to sockets in `error` messages
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::InvalidQuery(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::InconsistentContext(_) => "inconsistent_context",
            Self::FeedInterrupted(_) => "feed_interrupted",
            Self::DeliveryRace { .. } => "delivery_race",
            Self::Store(_) => "store",
            Self::Bus(_) => "bus",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the caller may retry the same call
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
