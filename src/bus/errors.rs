//! Bus error types

use thiserror::Error;

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Distribution bus errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The topic has no publisher left
    #[error("Topic '{0}' closed")]
    Closed(String),

    /// Message could not be encoded for transport
    #[error("Encoding failed: {0}")]
    Encoding(String),

    /// Internal bus failure
    #[error("Internal bus error: {0}")]
    Internal(String),
}
