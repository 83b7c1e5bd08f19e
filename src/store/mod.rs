//! # Document Store Capability
//!
//! The backing store is an external collaborator; this module specifies the
//! capability the engine consumes and ships an in-memory implementation.
//!
//! Required guarantees:
//! - ordered durable writes (insert, tombstone, restore)
//! - ids bound to one owner for as long as any row carries them
//! - pending rows that stay out of scans until activated
//! - point and predicate queries over live rows
//! - a replayable change feed carrying full documents

pub mod errors;
pub mod memory;
pub mod types;

use async_trait::async_trait;

use crate::object::{Identity, Object, ObjectId};
use crate::rewrite::Predicate;

pub use errors::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use types::{ChangeKind, ChangeRecord, Marker, RowStatus, Scan, StoredDocument};

/// Document store consumed by the engine
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a live row for a fresh id. Fails with `DuplicateId` if any
    /// row, live or tombstoned, already carries the id.
    async fn insert(&self, object: Object) -> StoreResult<StoredDocument>;

    /// Insert a pending row reusing an id of the same owner. Fails with
    /// `DuplicateId` if the id is live or held by another owner.
    async fn insert_pending(&self, object: Object) -> StoreResult<StoredDocument>;

    /// Make a pending row live. Fails with `DuplicateId` if another row
    /// for the id went live in the meantime.
    async fn activate(&self, row: Marker) -> StoreResult<StoredDocument>;

    /// Atomically find the live row with `id` owned by `owner` and tombstone it.
    /// When `expected` is given, the live row must be exactly that row.
    /// Returns the row as it was before tombstoning, or `None`.
    async fn tombstone(
        &self,
        id: &ObjectId,
        owner: &Identity,
        expected: Option<Marker>,
    ) -> StoreResult<Option<StoredDocument>>;

    /// Clear the tombstone on a row
    async fn restore(&self, row: Marker) -> StoreResult<()>;

    /// Physically remove a row. Only used to roll back a failed insert.
    /// The id is released once no row carries it.
    async fn purge(&self, row: Marker) -> StoreResult<()>;

    /// Fetch a row by marker, live or not
    async fn get(&self, row: Marker) -> StoreResult<Option<StoredDocument>>;

    /// Fetch the live row carrying `id`
    async fn find_live(&self, id: &ObjectId) -> StoreResult<Option<StoredDocument>>;

    /// Fetch `row` if it is live or pending and satisfies `predicate`
    async fn find_one(&self, predicate: &Predicate, row: Marker) -> StoreResult<Option<StoredDocument>>;

    /// Live rows satisfying `predicate`, newest first
    async fn find(&self, predicate: &Predicate, scan: Scan) -> StoreResult<Vec<StoredDocument>>;

    /// Append a record to the change feed
    async fn append_change(&self, kind: ChangeKind) -> StoreResult<Marker>;

    /// Latest position of the sequence
    async fn latest_marker(&self) -> StoreResult<Marker>;

    /// Open the change feed after `after`
    async fn watch(&self, after: Marker) -> StoreResult<Box<dyn ChangeFeed>>;
}

/// Resumable cursor over the change feed
#[async_trait]
pub trait ChangeFeed: Send {
    /// Wait for the next change
    async fn next(&mut self) -> StoreResult<ChangeRecord>;
}
