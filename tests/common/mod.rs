//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aerolive::bus::LocalBus;
use aerolive::object::{Identity, NewObject, Object, ObjectId};
use aerolive::registry::PushReceiver;
use aerolive::rewrite::Predicate;
use aerolive::store::{
    ChangeFeed, ChangeKind, ChangeRecord, DocumentStore, Marker, MemoryStore, Scan, StoreError,
    StoreResult, StoredDocument,
};
use aerolive::streamer::{Delivery, PushMessage};
use aerolive::{Engine, EngineConfig};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

// =============================================================================
// Fault Injection
// =============================================================================

/// Switches flipped by tests to make a `FaultyStore` misbehave
#[derive(Debug, Default)]
pub struct Faults {
    pub fail_append: AtomicBool,
    pub fail_restore: AtomicBool,
    pub fail_purge: AtomicBool,
    pub fail_find_one: AtomicBool,
    /// Fail this many upcoming `watch` calls
    pub watch_failures: AtomicU32,
    /// Fail this many upcoming feed reads, discarding the record read
    pub feed_failures: AtomicU32,
    /// Pause before every write and point read
    pub delay_ms: AtomicU32,
    /// Park the next `insert_pending` after it lands until `resume` fires
    pub hold_pending: AtomicBool,
    pub pending_held: Notify,
    pub resume: Notify,
}

impl Faults {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check(flag: &AtomicBool, what: &str) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(format!("injected {} failure", what)))
        } else {
            Ok(())
        }
    }

    async fn hold(&self) {
        if self.hold_pending.swap(false, Ordering::SeqCst) {
            self.pending_held.notify_one();
            self.resume.notified().await;
        }
    }

    async fn pause(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        }
    }
}

/// `MemoryStore` wrapper with injectable failures and latency
#[derive(Clone, Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    pub faults: Arc<Faults>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    async fn insert(&self, object: Object) -> StoreResult<StoredDocument> {
        self.faults.pause().await;
        self.inner.insert(object).await
    }

    async fn insert_pending(&self, object: Object) -> StoreResult<StoredDocument> {
        self.faults.pause().await;
        let doc = self.inner.insert_pending(object).await?;
        self.faults.hold().await;
        Ok(doc)
    }

    async fn activate(&self, row: Marker) -> StoreResult<StoredDocument> {
        self.inner.activate(row).await
    }

    async fn tombstone(
        &self,
        id: &ObjectId,
        owner: &Identity,
        expected: Option<Marker>,
    ) -> StoreResult<Option<StoredDocument>> {
        self.faults.pause().await;
        self.inner.tombstone(id, owner, expected).await
    }

    async fn restore(&self, row: Marker) -> StoreResult<()> {
        Faults::check(&self.faults.fail_restore, "restore")?;
        self.inner.restore(row).await
    }

    async fn purge(&self, row: Marker) -> StoreResult<()> {
        Faults::check(&self.faults.fail_purge, "purge")?;
        self.inner.purge(row).await
    }

    async fn get(&self, row: Marker) -> StoreResult<Option<StoredDocument>> {
        self.inner.get(row).await
    }

    async fn find_live(&self, id: &ObjectId) -> StoreResult<Option<StoredDocument>> {
        self.faults.pause().await;
        self.inner.find_live(id).await
    }

    async fn find_one(&self, predicate: &Predicate, row: Marker) -> StoreResult<Option<StoredDocument>> {
        Faults::check(&self.faults.fail_find_one, "find_one")?;
        self.inner.find_one(predicate, row).await
    }

    async fn find(&self, predicate: &Predicate, scan: Scan) -> StoreResult<Vec<StoredDocument>> {
        self.inner.find(predicate, scan).await
    }

    async fn append_change(&self, kind: ChangeKind) -> StoreResult<Marker> {
        Faults::check(&self.faults.fail_append, "append")?;
        self.inner.append_change(kind).await
    }

    async fn latest_marker(&self) -> StoreResult<Marker> {
        self.inner.latest_marker().await
    }

    async fn watch(&self, after: Marker) -> StoreResult<Box<dyn ChangeFeed>> {
        if Faults::take(&self.faults.watch_failures) {
            return Err(StoreError::Unavailable("injected watch failure".into()));
        }
        Ok(Box::new(FlakyFeed {
            inner: self.inner.watch(after).await?,
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct FlakyFeed {
    inner: Box<dyn ChangeFeed>,
    faults: Arc<Faults>,
}

#[async_trait]
impl ChangeFeed for FlakyFeed {
    async fn next(&mut self) -> StoreResult<ChangeRecord> {
        let record = self.inner.next().await?;
        if Faults::take(&self.faults.feed_failures) {
            return Err(StoreError::Unavailable("injected feed failure".into()));
        }
        Ok(record)
    }
}

// =============================================================================
// Engine Helpers
// =============================================================================

pub fn identity(name: &str) -> Identity {
    Identity::new(name)
}

/// An object addressed to `owner` only
pub fn object(owner: &Identity, payload: Value) -> NewObject {
    NewObject::new(
        vec![owner.clone()],
        payload.as_object().cloned().expect("payload must be an object"),
    )
}

/// A started single-process engine over `store`
pub async fn engine_over(store: Arc<dyn DocumentStore>, config: EngineConfig) -> Arc<Engine> {
    let engine = Arc::new(Engine::new(config, store, Arc::new(LocalBus::default())));
    engine.start().await.expect("engine starts");
    engine
}

pub async fn engine() -> Arc<Engine> {
    engine_over(Arc::new(MemoryStore::new()), EngineConfig::default()).await
}

/// Next delivery, failing the test after two seconds
pub async fn next_delivery(rx: &mut PushReceiver) -> Delivery {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery within timeout")
        .expect("socket channel open")
}

/// Collect messages until `done` holds or the timeout passes
pub async fn collect_until(
    rx: &mut PushReceiver,
    mut done: impl FnMut(&[PushMessage]) -> bool,
) -> Vec<PushMessage> {
    let mut messages = Vec::new();
    while !done(&messages) {
        messages.extend(next_delivery(rx).await.messages);
    }
    messages
}

/// Ids in an `updates` message
pub fn update_ids(message: &PushMessage) -> Vec<String> {
    match message {
        PushMessage::Updates { results, .. } => results
            .iter()
            .filter_map(|r| r["_id"].as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Whether no delivery arrives within `ms`
pub async fn quiet_for(rx: &mut PushReceiver, ms: u64) -> bool {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .is_err()
}
