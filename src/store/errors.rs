//! Store error types

use thiserror::Error;

use crate::query::QueryError;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a document store or its change feed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A live object already carries this id
    #[error("Object {0} already exists")]
    DuplicateId(String),

    /// Row referenced by marker does not exist
    #[error("Row {0} not found")]
    RowNotFound(u64),

    /// Predicate evaluation failed
    #[error("Predicate evaluation failed: {0}")]
    Query(#[from] QueryError),

    /// Transient failure; the operation may succeed later
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Internal store failure
    #[error("Internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the failure is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
