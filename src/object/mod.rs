//! # Object Model
//!
//! Owned, addressed objects with optional visibility contexts.

pub mod types;
pub mod validate;

pub use types::{
    Context, Identity, NewObject, Object, ObjectId, PredicateGroup, Timestamp, CONTEXTS_FIELD,
    ID_FIELD, OWNER_FIELD, RECIPIENTS_FIELD, RESERVED_PREFIX, TIMESTAMP_FIELD,
};
pub use validate::validate_new;
