//! # Mutations
//!
//! Writes against the store: per-object locks, the coordinator that
//! performs create/replace/remove with rollback, and caller-side retry.

pub mod coordinator;
pub mod lock;
pub mod retry;

pub use coordinator::MutationCoordinator;
pub use lock::{LockKey, LockManager, LockTiming, LockToken, MemoryLockManager};
pub use retry::{retry_on_conflict, RetryPolicy};
