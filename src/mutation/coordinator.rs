//! Mutation coordinator
//!
//! Create, replace and remove against the store. Replace and remove run
//! under the per-object lock; a replace that fails after tombstoning is
//! compensated by purging the new row and restoring the retired one.
//!
//! A replacement row is written pending and only goes live once the
//! verification read has passed. Create never reuses an id another row
//! still carries, so it cannot take over an object mid-replace.
//!
//! Exactly one change record is appended per successful operation, after
//! every other step has succeeded, so rolled-back writes never reach the feed.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::lock::{self, LockKey, LockManager, LockTiming, LockToken};
use crate::errors::{LiveError, LiveResult};
use crate::object::{validate_new, Identity, NewObject, Object, ObjectId, Timestamp};
use crate::observability::MetricsRegistry;
use crate::rewrite::{ContextRewriter, Predicate};
use crate::store::{ChangeKind, DocumentStore, Marker, StoreError, StoredDocument};

/// Performs writes against the store with locking and rollback
pub struct MutationCoordinator {
    store: Arc<dyn DocumentStore>,
    locks: Arc<dyn LockManager>,
    timing: LockTiming,
    rewriter: ContextRewriter,
    metrics: Arc<MetricsRegistry>,
}

impl MutationCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: Arc<dyn LockManager>,
        timing: LockTiming,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            locks,
            timing,
            rewriter: ContextRewriter::new(),
            metrics,
        }
    }

    // ==================
    // Create
    // ==================

    /// Store a new object owned by `owner`.
    ///
    /// Assigns the timestamp and content id when absent. An id that any row
    /// still carries, live or tombstoned, is a validation error.
    pub async fn create(&self, new: NewObject, owner: &Identity) -> LiveResult<ObjectId> {
        validate_new(&new, owner)?;
        let object = build(new, owner, None);
        let id = object.id.clone();

        let doc = match self.store.insert(object).await {
            Ok(doc) => doc,
            Err(StoreError::DuplicateId(id)) => {
                return Err(LiveError::validation(format!(
                    "object {} already exists",
                    id
                )))
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self
            .store
            .append_change(ChangeKind::Insert { doc: doc.clone() })
            .await
        {
            self.metrics.increment_rollbacks();
            if let Err(rollback) = self.store.purge(doc.row).await {
                self.rollback_failed(&id, &rollback);
            }
            return Err(e.into());
        }

        self.metrics.increment_created();
        info!(object_id = %id, owner = %owner, row = %doc.row, "Object created");
        Ok(id)
    }

    // ==================
    // Replace
    // ==================

    /// Swap the live object `id` for `new`, keeping its id and timestamp.
    ///
    /// The swap is conditional on the row observed when the call starts, so
    /// of two concurrent replaces on one object at most one takes effect.
    /// After inserting, the new row is re-read through `verify_query`
    /// rewritten for `owner`; a miss rolls the swap back with
    /// `InconsistentContext`.
    pub async fn replace(
        &self,
        id: &ObjectId,
        new: NewObject,
        verify_query: &Value,
        owner: &Identity,
    ) -> LiveResult<ObjectId> {
        validate_new(&new, owner)?;
        if new.id.as_ref().map_or(false, |given| given != id) {
            return Err(LiveError::validation(format!(
                "replacement id does not match {}",
                id
            )));
        }
        let verify = self.rewriter.rewrite(verify_query, owner)?;

        let current = match self.store.find_live(id).await? {
            Some(doc) if &doc.object.owner == owner => doc,
            Some(_) => return Err(forbidden(id)),
            None => return Err(not_found(id)),
        };

        let key = LockKey::new(id, owner);
        let token = self.lock(&key).await?;
        let result = self
            .replace_locked(id, new, &verify.predicate, owner, current.row)
            .await;
        self.unlock(&key, &token).await;

        if let Ok(marker) = &result {
            self.metrics.increment_replaced();
            info!(object_id = %id, owner = %owner, marker = %marker, "Object replaced");
        }
        result.map(|_| id.clone())
    }

    async fn replace_locked(
        &self,
        id: &ObjectId,
        new: NewObject,
        verify: &Predicate,
        owner: &Identity,
        expected: Marker,
    ) -> LiveResult<Marker> {
        let Some(retired) = self.store.tombstone(id, owner, Some(expected)).await? else {
            return Err(self.diagnose(id, owner, expected).await);
        };

        let object = build(new, owner, Some(&retired.object));
        let pending = match self.store.insert_pending(object).await {
            Ok(doc) => doc,
            Err(e) => {
                self.roll_back(&retired, None).await;
                return Err(e.into());
            }
        };

        match self.commit_replace(&retired, &pending, verify).await {
            Ok(marker) => Ok(marker),
            Err(e) => {
                warn!(object_id = %id, error = %e, "Replace failed after tombstoning");
                self.roll_back(&retired, Some(&pending)).await;
                Err(e)
            }
        }
    }

    async fn commit_replace(
        &self,
        retired: &StoredDocument,
        pending: &StoredDocument,
        verify: &Predicate,
    ) -> LiveResult<Marker> {
        if self.store.find_one(verify, pending.row).await?.is_none() {
            return Err(LiveError::InconsistentContext(format!(
                "object {} is not visible to its owner through the verification query",
                pending.object.id
            )));
        }
        let inserted = self.store.activate(pending.row).await?;
        let marker = self
            .store
            .append_change(ChangeKind::Replace {
                retired: retired.clone(),
                inserted,
            })
            .await?;
        Ok(marker)
    }

    // ==================
    // Remove
    // ==================

    /// Tombstone the live object `id` owned by `owner`.
    ///
    /// Removing an absent or already removed object is `NotFound`.
    pub async fn remove(&self, id: &ObjectId, owner: &Identity) -> LiveResult<()> {
        let key = LockKey::new(id, owner);
        let token = self.lock(&key).await?;
        let result = self.remove_locked(id, owner).await;
        self.unlock(&key, &token).await;

        if result.is_ok() {
            self.metrics.increment_removed();
            info!(object_id = %id, owner = %owner, "Object removed");
        }
        result
    }

    async fn remove_locked(&self, id: &ObjectId, owner: &Identity) -> LiveResult<()> {
        let Some(retired) = self.store.tombstone(id, owner, None).await? else {
            return Err(match self.store.find_live(id).await? {
                Some(_) => forbidden(id),
                None => not_found(id),
            });
        };

        if let Err(e) = self
            .store
            .append_change(ChangeKind::Delete {
                doc: retired.clone(),
            })
            .await
        {
            self.roll_back(&retired, None).await;
            return Err(e.into());
        }
        Ok(())
    }

    // ==================
    // Helpers
    // ==================

    async fn lock(&self, key: &LockKey) -> LiveResult<LockToken> {
        match lock::acquire(self.locks.as_ref(), key, self.timing.ttl, self.timing.wait).await {
            Ok(token) => Ok(token),
            Err(e) => {
                if matches!(e, LiveError::Conflict(_)) {
                    self.metrics.increment_lock_conflicts();
                }
                Err(e)
            }
        }
    }

    async fn unlock(&self, key: &LockKey, token: &LockToken) {
        match self.locks.release(key, token).await {
            Ok(true) => {}
            Ok(false) => warn!(key = key.as_str(), "Lock expired before release"),
            Err(e) => error!(key = key.as_str(), error = %e, "Failed to release lock"),
        }
    }

    /// Why a conditional tombstone found nothing to retire
    async fn diagnose(&self, id: &ObjectId, owner: &Identity, expected: Marker) -> LiveError {
        match self.store.find_live(id).await {
            Ok(None) => not_found(id),
            Ok(Some(doc)) if &doc.object.owner != owner => forbidden(id),
            Ok(Some(doc)) => {
                debug!(object_id = %id, expected = %expected, current = %doc.row, "Object changed underneath replace");
                LiveError::conflict(format!("object {} was replaced concurrently", id))
            }
            Err(e) => e.into(),
        }
    }

    /// Undo a partial replace or remove. Failures are logged and counted;
    /// the caller still reports the original error.
    async fn roll_back(&self, retired: &StoredDocument, replacement: Option<&StoredDocument>) {
        self.metrics.increment_rollbacks();
        let id = &retired.object.id;

        if let Some(replacement) = replacement {
            if let Err(e) = self.store.purge(replacement.row).await {
                self.rollback_failed(id, &e);
                return;
            }
        }
        if let Err(e) = self.store.restore(retired.row).await {
            self.rollback_failed(id, &e);
            return;
        }
        info!(object_id = %id, row = %retired.row, "Rolled back");
    }

    fn rollback_failed(&self, id: &ObjectId, e: &StoreError) {
        self.metrics.increment_rollback_failures();
        error!(object_id = %id, error = %e, "Rollback failed");
    }
}

fn not_found(id: &ObjectId) -> LiveError {
    LiveError::not_found(format!("object {}", id))
}

fn forbidden(id: &ObjectId) -> LiveError {
    LiveError::forbidden(format!("object {} is owned by another identity", id))
}

/// Materialize a validated `NewObject`. A replace keeps the id and
/// timestamp of the object it retires.
fn build(new: NewObject, owner: &Identity, retiring: Option<&Object>) -> Object {
    let NewObject {
        id,
        timestamp,
        recipients,
        payload,
        contexts,
    } = new;

    let mut unique: Vec<Identity> = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        if !unique.contains(&recipient) {
            unique.push(recipient);
        }
    }

    let (id, timestamp) = match retiring {
        Some(old) => (old.id.clone(), old.timestamp),
        None => {
            let timestamp = timestamp.unwrap_or_else(Timestamp::now);
            let id = id.unwrap_or_else(|| {
                Object::content_id(owner, &unique, &payload, &contexts, timestamp)
            });
            (id, timestamp)
        }
    };
    Object {
        id,
        owner: owner.clone(),
        recipients: unique,
        timestamp,
        payload,
        contexts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::lock::MemoryLockManager;
    use crate::object::{Context, PredicateGroup};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: MemoryStore,
        locks: Arc<MemoryLockManager>,
        metrics: Arc<MetricsRegistry>,
        coordinator: MutationCoordinator,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let locks = Arc::new(MemoryLockManager::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let coordinator = MutationCoordinator::new(
            Arc::new(store.clone()),
            locks.clone(),
            LockTiming {
                ttl: Duration::from_secs(5),
                wait: Duration::from_millis(30),
            },
            metrics.clone(),
        );
        Fixture {
            store,
            locks,
            metrics,
            coordinator,
        }
    }

    fn alice() -> Identity {
        Identity::new("alice")
    }

    fn note(value: Value) -> NewObject {
        NewObject::new(vec![alice()], value.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_appends_insert() {
        let f = fixture();
        let id = f.coordinator.create(note(json!({"v": 1})), &alice()).await.unwrap();

        let doc = f.store.find_live(&id).await.unwrap().unwrap();
        assert_eq!(doc.object.owner, alice());
        assert!(doc.object.timestamp.0 > 0);
        assert_eq!(f.store.change_count().unwrap(), 1);
        assert_eq!(f.metrics.snapshot().objects_created, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_live_duplicate() {
        let f = fixture();
        let mut first = note(json!({"v": 1}));
        first.timestamp = Some(Timestamp(10));
        let again = first.clone();

        f.coordinator.create(first, &alice()).await.unwrap();
        let result = f.coordinator.create(again, &alice()).await;
        assert!(matches!(result, Err(LiveError::Validation(_))));
        assert_eq!(f.store.change_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_cannot_reuse_removed_id() {
        let f = fixture();
        let id = f.coordinator.create(note(json!({"v": 1})), &alice()).await.unwrap();
        f.coordinator.remove(&id, &alice()).await.unwrap();

        let mut again = note(json!({"v": 2}));
        again.id = Some(id.clone());
        let result = f.coordinator.create(again, &alice()).await;
        assert!(matches!(result, Err(LiveError::Validation(_))));
        assert!(f.store.find_live(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_requires_owner_in_recipients() {
        let f = fixture();
        let result = f
            .coordinator
            .create(note(json!({"v": 1})), &Identity::new("bob"))
            .await;
        assert!(matches!(result, Err(LiveError::Validation(_))));
    }

    #[tokio::test]
    async fn test_replace_keeps_id_and_timestamp() {
        let f = fixture();
        let id = f.coordinator.create(note(json!({"v": 1})), &alice()).await.unwrap();
        let before = f.store.find_live(&id).await.unwrap().unwrap();

        let replaced = f
            .coordinator
            .replace(&id, note(json!({"v": 2})), &json!({"v": 2}), &alice())
            .await
            .unwrap();
        assert_eq!(replaced, id);

        let after = f.store.find_live(&id).await.unwrap().unwrap();
        assert_eq!(after.object.payload["v"], 2);
        assert_eq!(after.object.timestamp, before.object.timestamp);
        assert!(after.row > before.row);
        assert_eq!(f.store.change_count().unwrap(), 2);
        assert!(!f.locks.is_held(&LockKey::new(&id, &alice())));
    }

    #[tokio::test]
    async fn test_replace_rolls_back_inconsistent_context() {
        let f = fixture();
        let id = f.coordinator.create(note(json!({"v": 1})), &alice()).await.unwrap();

        // The owner's own verification query is shut out by the new context
        let hidden = note(json!({"v": 2})).with_context(Context {
            near_misses: vec![PredicateGroup::single(json!({"v": 2}))],
            neighbors: Vec::new(),
        });
        let result = f
            .coordinator
            .replace(&id, hidden, &json!({"v": 2}), &alice())
            .await;
        assert!(matches!(result, Err(LiveError::InconsistentContext(_))));

        let live = f.store.find_live(&id).await.unwrap().unwrap();
        assert_eq!(live.object.payload["v"], 1);
        assert_eq!(f.store.change_count().unwrap(), 1);
        assert_eq!(f.metrics.snapshot().rollbacks, 1);
        assert_eq!(f.metrics.snapshot().rollback_failures, 0);
        assert!(!f.locks.is_held(&LockKey::new(&id, &alice())));
    }

    #[tokio::test]
    async fn test_replace_missing_and_foreign() {
        let f = fixture();
        let missing = ObjectId::digest(b"missing");
        let result = f
            .coordinator
            .replace(&missing, note(json!({"v": 2})), &json!({}), &alice())
            .await;
        assert!(matches!(result, Err(LiveError::NotFound(_))));

        let id = f.coordinator.create(note(json!({"v": 1})), &alice()).await.unwrap();
        let bob = Identity::new("bob");
        let theirs = NewObject::new(vec![bob.clone()], Default::default());
        let result = f.coordinator.replace(&id, theirs, &json!({}), &bob).await;
        assert!(matches!(result, Err(LiveError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_replace_rejects_bad_verify_query() {
        let f = fixture();
        let id = f.coordinator.create(note(json!({"v": 1})), &alice()).await.unwrap();
        let result = f
            .coordinator
            .replace(&id, note(json!({"v": 2})), &json!({"$where": "1"}), &alice())
            .await;
        assert!(matches!(result, Err(LiveError::InvalidQuery(_))));
        assert_eq!(f.store.find_live(&id).await.unwrap().unwrap().object.payload["v"], 1);
    }

    #[tokio::test]
    async fn test_remove_twice_is_not_found() {
        let f = fixture();
        let id = f.coordinator.create(note(json!({"v": 1})), &alice()).await.unwrap();

        f.coordinator.remove(&id, &alice()).await.unwrap();
        assert!(matches!(
            f.coordinator.remove(&id, &alice()).await,
            Err(LiveError::NotFound(_))
        ));
        assert_eq!(f.store.change_count().unwrap(), 2);
        assert_eq!(f.metrics.snapshot().objects_removed, 1);
    }

    #[tokio::test]
    async fn test_remove_foreign_is_forbidden() {
        let f = fixture();
        let id = f.coordinator.create(note(json!({"v": 1})), &alice()).await.unwrap();
        assert!(matches!(
            f.coordinator.remove(&id, &Identity::new("bob")).await,
            Err(LiveError::Forbidden(_))
        ));
        assert!(f.store.find_live(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_held_lock_is_conflict() {
        let f = fixture();
        let id = f.coordinator.create(note(json!({"v": 1})), &alice()).await.unwrap();
        let key = LockKey::new(&id, &alice());
        f.locks
            .try_acquire(&key, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        let result = f.coordinator.remove(&id, &alice()).await;
        assert!(matches!(result, Err(LiveError::Conflict(_))));
        assert_eq!(f.metrics.snapshot().lock_conflicts, 1);
        assert!(f.store.find_live(&id).await.unwrap().is_some());
    }
}
