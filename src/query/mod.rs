//! # Query Language
//!
//! The constrained operator set callers may use to select objects:
//! equality, comparison, membership, logical combinators, existence, type,
//! size, element-match and array-slice. There is no free-form scripting.
//!
//! - **ast**: parsing JSON query documents into a tagged tree
//! - **eval**: matching that tree against documents

pub mod ast;
pub mod errors;
pub mod eval;

pub use ast::{Condition, ElemMatch, FieldOp, FieldPath, JsonType, Query, Slice, MAX_QUERY_DEPTH};
pub use errors::{QueryError, QueryResult};
pub use eval::{compare_values, Evaluator, DEFAULT_EVAL_BUDGET};
