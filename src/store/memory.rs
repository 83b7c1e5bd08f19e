//! In-memory document store
//!
//! Rows, the live-id index, id claims and the change feed share one sequence
//! counter under a single lock. A scan evaluates rows under the read lock and
//! stops as soon as its page is full. Feed readers park on a `Notify` until new changes land.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::errors::{StoreError, StoreResult};
use super::types::{ChangeKind, ChangeRecord, Marker, RowStatus, Scan, StoredDocument};
use super::{ChangeFeed, DocumentStore};
use crate::object::{Identity, Object, ObjectId};
use crate::query::Evaluator;
use crate::rewrite::Predicate;

/// Owner an id is bound to and how many rows carry it
#[derive(Debug)]
struct Claim {
    owner: Identity,
    rows: usize,
}

#[derive(Debug, Default)]
struct State {
    last: Marker,
    rows: BTreeMap<Marker, StoredDocument>,
    live: HashMap<ObjectId, Marker>,
    claims: HashMap<ObjectId, Claim>,
    changes: BTreeMap<Marker, ChangeRecord>,
}

impl State {
    fn allocate(&mut self) -> Marker {
        self.last = self.last.next();
        self.last
    }

    fn add_row(&mut self, object: Object, status: RowStatus) -> StoredDocument {
        let row = self.allocate();
        let claim = self
            .claims
            .entry(object.id.clone())
            .or_insert_with(|| Claim {
                owner: object.owner.clone(),
                rows: 0,
            });
        claim.rows += 1;
        if status == RowStatus::Live {
            self.live.insert(object.id.clone(), row);
        }
        let doc = StoredDocument {
            row,
            object,
            status,
        };
        self.rows.insert(row, doc.clone());
        doc
    }

    fn release_claim(&mut self, id: &ObjectId) {
        if let Some(claim) = self.claims.get_mut(id) {
            claim.rows = claim.rows.saturating_sub(1);
            if claim.rows == 0 {
                self.claims.remove(id);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: RwLock<State>,
    changed: Notify,
}

/// In-process store used by the binary and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> StoreResult<T>) -> StoreResult<T> {
        let state = self
            .shared
            .state
            .read()
            .map_err(|_| StoreError::Internal("Lock poisoned".into()))?;
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut State) -> StoreResult<T>) -> StoreResult<T> {
        let mut state = self
            .shared
            .state
            .write()
            .map_err(|_| StoreError::Internal("Lock poisoned".into()))?;
        f(&mut state)
    }

    /// Number of rows, live or tombstoned
    pub fn row_count(&self) -> StoreResult<usize> {
        self.read(|state| Ok(state.rows.len()))
    }

    /// Number of change records
    pub fn change_count(&self) -> StoreResult<usize> {
        self.read(|state| Ok(state.changes.len()))
    }
}

fn evaluate(predicate: &Predicate, doc: &StoredDocument) -> StoreResult<bool> {
    Ok(predicate.evaluate(&doc.object, &mut Evaluator::default())?)
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, object: Object) -> StoreResult<StoredDocument> {
        self.write(|state| {
            if state.claims.contains_key(&object.id) {
                return Err(StoreError::DuplicateId(object.id.to_string()));
            }
            Ok(state.add_row(object, RowStatus::Live))
        })
    }

    async fn insert_pending(&self, object: Object) -> StoreResult<StoredDocument> {
        self.write(|state| {
            let foreign = state
                .claims
                .get(&object.id)
                .map_or(false, |claim| claim.owner != object.owner);
            if foreign || state.live.contains_key(&object.id) {
                return Err(StoreError::DuplicateId(object.id.to_string()));
            }
            Ok(state.add_row(object, RowStatus::Pending))
        })
    }

    async fn activate(&self, row: Marker) -> StoreResult<StoredDocument> {
        self.write(|state| {
            let doc = state
                .rows
                .get_mut(&row)
                .ok_or(StoreError::RowNotFound(row.0))?;
            if !doc.is_pending() {
                return Err(StoreError::Internal(format!("row {} is not pending", row)));
            }
            if state.live.contains_key(&doc.object.id) {
                return Err(StoreError::DuplicateId(doc.object.id.to_string()));
            }
            doc.status = RowStatus::Live;
            let activated = doc.clone();
            state.live.insert(activated.object.id.clone(), row);
            Ok(activated)
        })
    }

    async fn tombstone(
        &self,
        id: &ObjectId,
        owner: &Identity,
        expected: Option<Marker>,
    ) -> StoreResult<Option<StoredDocument>> {
        self.write(|state| {
            let Some(row) = state.live.get(id).copied() else {
                return Ok(None);
            };
            if expected.map_or(false, |expected| expected != row) {
                return Ok(None);
            }
            let Some(doc) = state.rows.get_mut(&row) else {
                return Err(StoreError::RowNotFound(row.0));
            };
            if &doc.object.owner != owner {
                return Ok(None);
            }
            let before = doc.clone();
            doc.status = RowStatus::Tombstoned;
            state.live.remove(id);
            Ok(Some(before))
        })
    }

    async fn restore(&self, row: Marker) -> StoreResult<()> {
        self.write(|state| {
            let doc = state
                .rows
                .get_mut(&row)
                .ok_or(StoreError::RowNotFound(row.0))?;
            if let Some(&other) = state.live.get(&doc.object.id) {
                if other != row {
                    return Err(StoreError::DuplicateId(doc.object.id.to_string()));
                }
            }
            if doc.is_pending() {
                return Err(StoreError::Internal(format!("row {} is pending", row)));
            }
            doc.status = RowStatus::Live;
            let id = doc.object.id.clone();
            state.live.insert(id, row);
            Ok(())
        })
    }

    async fn purge(&self, row: Marker) -> StoreResult<()> {
        self.write(|state| {
            let doc = state
                .rows
                .remove(&row)
                .ok_or(StoreError::RowNotFound(row.0))?;
            if state.live.get(&doc.object.id) == Some(&row) {
                state.live.remove(&doc.object.id);
            }
            state.release_claim(&doc.object.id);
            Ok(())
        })
    }

    async fn get(&self, row: Marker) -> StoreResult<Option<StoredDocument>> {
        self.read(|state| Ok(state.rows.get(&row).cloned()))
    }

    async fn find_live(&self, id: &ObjectId) -> StoreResult<Option<StoredDocument>> {
        self.read(|state| {
            Ok(state
                .live
                .get(id)
                .and_then(|row| state.rows.get(row))
                .cloned())
        })
    }

    async fn find_one(&self, predicate: &Predicate, row: Marker) -> StoreResult<Option<StoredDocument>> {
        let doc = match self.get(row).await? {
            Some(doc) if doc.is_live() || doc.is_pending() => doc,
            _ => return Ok(None),
        };
        Ok(evaluate(predicate, &doc)?.then_some(doc))
    }

    async fn find(&self, predicate: &Predicate, scan: Scan) -> StoreResult<Vec<StoredDocument>> {
        let empty_window = matches!((scan.since, scan.before), (Some(s), Some(b)) if s.next() >= b);
        if scan.limit == 0 || empty_window {
            return Ok(Vec::new());
        }
        let upper = scan.before.map_or(Bound::Unbounded, Bound::Excluded);
        let lower = scan.since.map_or(Bound::Unbounded, Bound::Excluded);
        self.read(|state| {
            let mut page = Vec::with_capacity(scan.limit.min(state.live.len()));
            for doc in state.rows.range((lower, upper)).rev().map(|(_, doc)| doc) {
                if doc.is_live() && evaluate(predicate, doc)? {
                    page.push(doc.clone());
                    if page.len() == scan.limit {
                        break;
                    }
                }
            }
            Ok(page)
        })
    }

    async fn append_change(&self, kind: ChangeKind) -> StoreResult<Marker> {
        let marker = self.write(|state| {
            let marker = state.allocate();
            state.changes.insert(marker, ChangeRecord { marker, kind });
            Ok(marker)
        })?;
        self.shared.changed.notify_waiters();
        Ok(marker)
    }

    async fn latest_marker(&self) -> StoreResult<Marker> {
        self.read(|state| Ok(state.last))
    }

    async fn watch(&self, after: Marker) -> StoreResult<Box<dyn ChangeFeed>> {
        Ok(Box::new(MemoryFeed {
            shared: Arc::clone(&self.shared),
            cursor: after,
        }))
    }
}

/// Change feed cursor over a `MemoryStore`
#[derive(Debug)]
pub struct MemoryFeed {
    shared: Arc<Shared>,
    cursor: Marker,
}

impl MemoryFeed {
    fn poll_next(&self) -> StoreResult<Option<ChangeRecord>> {
        let state = self
            .shared
            .state
            .read()
            .map_err(|_| StoreError::Internal("Lock poisoned".into()))?;
        Ok(state
            .changes
            .range((Bound::Excluded(self.cursor), Bound::Unbounded))
            .next()
            .map(|(_, record)| record.clone()))
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn next(&mut self) -> StoreResult<ChangeRecord> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            // Register before checking so an append in between is not missed.
            notified.as_mut().enable();

            if let Some(record) = self.poll_next()? {
                self.cursor = record.marker;
                return Ok(record);
            }
            notified.await;
        }
    }
}
