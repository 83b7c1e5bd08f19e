//! # Query Errors
//!
//! Error types for query parsing and evaluation.

use thiserror::Error;

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;

/// Query errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    // ==================
    // Parse Errors
    // ==================
    /// Query root is not a JSON object
    #[error("Query must be a JSON object, got {0}")]
    NotAnObject(String),

    /// Operator outside the allowed set
    #[error("Operator not allowed: {0}")]
    OperatorNotAllowed(String),

    /// Operator used with a malformed operand
    #[error("Invalid operand for {operator}: {detail}")]
    InvalidOperand { operator: String, detail: String },

    /// Operator and literal keys mixed in one document
    #[error("Cannot mix operators and fields in the condition for '{0}'")]
    MixedCondition(String),

    /// Empty or malformed field path
    #[error("Invalid field path: '{0}'")]
    InvalidPath(String),

    /// Query nests too deeply
    #[error("Query nesting exceeds {0} levels")]
    TooDeep(usize),

    /// Query targets recipients other than the caller
    #[error("Can only query for objects addressed to yourself (found '{0}')")]
    ForeignRecipient(String),

    // ==================
    // Evaluation Errors
    // ==================
    /// Evaluation ran past its step budget
    #[error("Evaluation exceeded its budget of {0} steps")]
    BudgetExhausted(usize),
}

impl QueryError {
    /// Shorthand for an operand error
    pub fn operand(operator: &str, detail: impl Into<String>) -> Self {
        QueryError::InvalidOperand {
            operator: operator.to_string(),
            detail: detail.into(),
        }
    }

    /// Whether the error was raised while evaluating, not parsing
    pub fn is_evaluation(&self) -> bool {
        matches!(self, QueryError::BudgetExhausted(_))
    }
}
