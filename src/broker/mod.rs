//! # Change Broker
//!
//! Follows the store's change feed and matches every change against the
//! live subscription table. Three tasks joined by bounded channels:
//!
//! ```text
//! feed reader ──► matcher ──► publisher ──► ResultSink
//! ```
//!
//! The reader owns the feed cursor and reconnects with bounded backoff,
//! so changes are never skipped across a degraded period. The matcher is
//! the single consistency point: it advances the latest observed marker and
//! evaluates the change under the table lock. The publisher hands batches
//! to the sink one at a time, preserving feed order.

pub mod state;
pub mod table;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, BusMessage, MatchBatch, MessageBus, SUBSCRIPTIONS_TOPIC};
use crate::errors::{LiveError, LiveResult};
use crate::observability::MetricsRegistry;
use crate::store::{ChangeFeed, ChangeRecord, DocumentStore, Marker, StoreError};
use crate::streamer::ResultSink;

pub use state::{BrokerState, FeedRetry};
pub use table::{MatchTable, TableEntry, TOMBSTONE_RETENTION};

/// Pipeline tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Bound of each inter-stage channel
    pub pipeline_capacity: usize,
    pub feed_retry: FeedRetry,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            pipeline_capacity: 1024,
            feed_retry: FeedRetry::default(),
        }
    }
}

/// Matches store changes against live subscriptions
pub struct ChangeBroker {
    store: Arc<dyn DocumentStore>,
    table: Arc<MatchTable>,
    sink: Arc<dyn ResultSink>,
    settings: BrokerSettings,
    metrics: Arc<MetricsRegistry>,
    latest: AtomicU64,
    state: watch::Sender<BrokerState>,
}

impl ChangeBroker {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        table: Arc<MatchTable>,
        sink: Arc<dyn ResultSink>,
        settings: BrokerSettings,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let (state, _) = watch::channel(BrokerState::Starting);
        Self {
            store,
            table,
            sink,
            settings,
            metrics,
            latest: AtomicU64::new(0),
            state,
        }
    }

    /// The subscription table this broker matches against
    pub fn table(&self) -> &Arc<MatchTable> {
        &self.table
    }

    /// Latest change marker observed. Never regresses, including across stop.
    pub fn latest_marker(&self) -> Marker {
        Marker(self.latest.load(Ordering::SeqCst))
    }

    pub fn state(&self) -> BrokerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn state_changes(&self) -> watch::Receiver<BrokerState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: BrokerState) {
        let current = self.state();
        match current.transition(next) {
            Ok(next) if next != current => {
                info!(from = %current, to = %next, "Broker state changed");
                self.state.send_replace(next);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Ignoring broker transition"),
        }
    }

    /// Spawn the pipeline, following the feed from the latest committed change.
    /// Each call begins a new run in `Starting`.
    pub async fn start(self: &Arc<Self>) -> LiveResult<BrokerHandle> {
        let start = self.store.latest_marker().await?;
        self.state.send_replace(BrokerState::Starting);
        self.latest.fetch_max(start.0, Ordering::SeqCst);

        let capacity = self.settings.pipeline_capacity.max(1);
        let (change_tx, change_rx) = mpsc::channel(capacity);
        let (batch_tx, batch_rx) = mpsc::channel(capacity);
        let (shutdown, _) = broadcast::channel(1);

        let reader = tokio::spawn(Arc::clone(self).read_feed(start, change_tx, shutdown.subscribe()));
        let matcher = tokio::spawn(Arc::clone(self).match_changes(change_rx, batch_tx));
        let publisher = tokio::spawn(Arc::clone(self).publish_batches(batch_rx));

        info!(marker = %start, capacity, "Change broker started");
        Ok(BrokerHandle {
            shutdown,
            tasks: vec![reader, matcher, publisher],
        })
    }

    /// Keep the table in sync with registries announcing on the bus
    pub async fn follow_bus(
        self: &Arc<Self>,
        bus: Arc<dyn MessageBus>,
        handle: &mut BrokerHandle,
    ) -> LiveResult<()> {
        // Subscribe before spawning so nothing published after this call is missed.
        let mut changes = bus.subscribe(SUBSCRIPTIONS_TOPIC).await?;
        let mut shutdown = handle.shutdown.subscribe();
        let table = Arc::clone(&self.table);

        handle.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = changes.recv() => match message {
                        Ok(BusMessage::Subscription(change)) => match table.apply(&change) {
                            Ok(applied) => debug!(key = %change.key, version = change.version, applied, "Subscription change"),
                            Err(e) => warn!(key = %change.key, error = %e, "Rejected subscription change"),
                        },
                        Ok(other) => debug!(?other, "Ignoring non-subscription message"),
                        Err(BusError::Closed(topic)) => {
                            info!(topic = %topic, "Subscription topic closed");
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    },
                    _ = shutdown.recv() => return Ok(()),
                }
            }
        }));
        Ok(())
    }

    // ==================
    // Pipeline stages
    // ==================

    async fn read_feed(
        self: Arc<Self>,
        start: Marker,
        changes: mpsc::Sender<ChangeRecord>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> LiveResult<()> {
        let mut cursor = start;
        let mut failures = 0u32;

        let result = 'feed: loop {
            let mut feed: Box<dyn ChangeFeed> = match self.store.watch(cursor).await {
                Ok(feed) => feed,
                Err(e) => {
                    failures += 1;
                    match self.back_off(&e, failures, cursor, &mut shutdown).await {
                        Ok(true) => continue 'feed,
                        Ok(false) => break 'feed Ok(()),
                        Err(e) => break 'feed Err(e),
                    }
                }
            };
            self.set_state(BrokerState::Watching);

            loop {
                let next = tokio::select! {
                    next = feed.next() => next,
                    _ = shutdown.recv() => break 'feed Ok(()),
                };
                match next {
                    Ok(record) => {
                        if failures > 0 {
                            info!(marker = %record.marker, failures, "Change feed resumed");
                            failures = 0;
                        }
                        cursor = record.marker;
                        if changes.send(record).await.is_err() {
                            debug!("Matcher gone; stopping feed reader");
                            break 'feed Ok(());
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        match self.back_off(&e, failures, cursor, &mut shutdown).await {
                            Ok(true) => continue 'feed,
                            Ok(false) => break 'feed Ok(()),
                            Err(e) => break 'feed Err(e),
                        }
                    }
                }
            }
        };

        self.set_state(BrokerState::Stopped);
        result
    }

    /// Enter `Degraded` and wait before reconnecting. Returns false on
    /// shutdown and `FeedInterrupted` once the budget is spent.
    async fn back_off(
        &self,
        cause: &StoreError,
        attempt: u32,
        cursor: Marker,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> LiveResult<bool> {
        self.metrics.increment_feed_interruptions();
        let retry = self.settings.feed_retry;
        if !retry.allows(attempt) {
            error!(attempt, marker = %cursor, error = %cause, "Change feed retry budget exhausted");
            return Err(LiveError::FeedInterrupted(format!(
                "{} after {} attempts",
                cause, attempt
            )));
        }

        self.set_state(BrokerState::Degraded { attempt });
        let pause = retry.backoff(attempt);
        warn!(attempt, marker = %cursor, ?pause, error = %cause, "Change feed interrupted");
        tokio::select! {
            _ = tokio::time::sleep(pause) => Ok(true),
            _ = shutdown.recv() => Ok(false),
        }
    }

    async fn match_changes(
        self: Arc<Self>,
        mut changes: mpsc::Receiver<ChangeRecord>,
        batches: mpsc::Sender<MatchBatch>,
    ) -> LiveResult<()> {
        while let Some(record) = changes.recv().await {
            self.latest.fetch_max(record.marker.0, Ordering::SeqCst);
            self.metrics.increment_changes_observed();

            let batch = self.table.match_change(&record)?;
            debug!(
                marker = %record.marker,
                op = record.kind.name(),
                matches = batch.matches.len(),
                "Matched change"
            );
            if batch.matches.is_empty() {
                continue;
            }
            self.metrics.add_matches(batch.matches.len() as u64);
            if batches.send(batch).await.is_err() {
                debug!("Publisher gone; stopping matcher");
                break;
            }
        }
        Ok(())
    }

    async fn publish_batches(self: Arc<Self>, mut batches: mpsc::Receiver<MatchBatch>) -> LiveResult<()> {
        while let Some(batch) = batches.recv().await {
            let marker = batch.marker;
            match self.sink.publish(batch).await {
                Ok(fan_out) if fan_out.is_empty() => {
                    debug!(marker = %marker, "No eligible targets");
                }
                Ok(fan_out) => debug!(
                    marker = %marker,
                    delivered = fan_out.delivered,
                    dropped = fan_out.dropped,
                    "Published batch"
                ),
                Err(e) => error!(marker = %marker, error = %e, "Failed to publish batch"),
            }
        }
        Ok(())
    }
}

/// Running broker tasks
#[derive(Debug)]
pub struct BrokerHandle {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<LiveResult<()>>>,
}

impl BrokerHandle {
    /// A receiver that fires when the broker stops
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Stop every task and wait for in-flight batches to drain.
    /// Returns the first task failure, e.g. `FeedInterrupted`.
    pub async fn stop(self) -> LiveResult<()> {
        let _ = self.shutdown.send(());
        let mut first = None;
        for task in self.tasks {
            let outcome = match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(LiveError::internal(format!("broker task panicked: {}", e))),
            };
            if let Err(e) = outcome {
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, SubscriptionAction, SubscriptionChange};
    use crate::object::{Identity, Object, ObjectId, Timestamp};
    use crate::registry::{QueryId, SocketId, SubscriptionKey};
    use crate::store::{ChangeKind, MemoryStore};
    use crate::streamer::FanOut;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<MatchBatch>>,
    }

    impl RecordingSink {
        fn markers(&self) -> Vec<Marker> {
            self.batches.lock().unwrap().iter().map(|b| b.marker).collect()
        }
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn publish(&self, batch: MatchBatch) -> LiveResult<FanOut> {
            let targets = batch.matches.len();
            self.batches.lock().unwrap().push(batch);
            Ok(FanOut {
                targets,
                delivered: targets,
                dropped: 0,
            })
        }
    }

    fn added(version: u64, query: Value) -> SubscriptionChange {
        SubscriptionChange {
            key: SubscriptionKey::new(SocketId::from("s1"), QueryId::from("q1")),
            version,
            action: SubscriptionAction::Added {
                caller: Identity::new("alice"),
                query,
                fingerprint: String::new(),
            },
        }
    }

    async fn insert(store: &MemoryStore, n: i64) -> Marker {
        let doc = store
            .insert(Object {
                id: ObjectId::digest(n.to_string().as_bytes()),
                owner: Identity::new("alice"),
                recipients: vec![Identity::new("alice")],
                timestamp: Timestamp(n),
                payload: json!({"n": n}).as_object().cloned().unwrap(),
                contexts: Vec::new(),
            })
            .await
            .unwrap();
        store.append_change(ChangeKind::Insert { doc }).await.unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn broker(store: &MemoryStore, sink: Arc<RecordingSink>) -> Arc<ChangeBroker> {
        Arc::new(ChangeBroker::new(
            Arc::new(store.clone()),
            Arc::new(MatchTable::new()),
            sink,
            BrokerSettings::default(),
            Arc::new(MetricsRegistry::new()),
        ))
    }

    #[tokio::test]
    async fn test_matches_in_feed_order() {
        let store = MemoryStore::new();
        let sink = Arc::new(RecordingSink::default());
        let broker = broker(&store, sink.clone());
        broker.table().apply(&added(1, json!({"n": {"$gte": 0}}))).unwrap();

        let handle = broker.start().await.unwrap();
        let mut markers = Vec::new();
        for n in 0..5 {
            markers.push(insert(&store, n).await);
        }

        eventually(|| sink.markers().len() == 5).await;
        assert_eq!(sink.markers(), markers);
        assert_eq!(broker.latest_marker(), markers[4]);

        handle.stop().await.unwrap();
        assert!(broker.state().is_stopped());
        assert_eq!(broker.latest_marker(), markers[4]);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let store = MemoryStore::new();
        let sink = Arc::new(RecordingSink::default());
        let broker = broker(&store, sink.clone());
        broker.table().apply(&added(1, json!({}))).unwrap();

        broker.start().await.unwrap().stop().await.unwrap();
        assert!(broker.state().is_stopped());

        let handle = broker.start().await.unwrap();
        eventually(|| broker.state().is_watching()).await;
        let marker = insert(&store, 1).await;
        eventually(|| sink.markers() == vec![marker]).await;
        handle.stop().await.unwrap();
        assert!(broker.state().is_stopped());
    }

    #[tokio::test]
    async fn test_starts_at_latest_committed_change() {
        let store = MemoryStore::new();
        let old = insert(&store, 1).await;
        let sink = Arc::new(RecordingSink::default());
        let broker = broker(&store, sink.clone());
        broker.table().apply(&added(1, json!({}))).unwrap();

        let handle = broker.start().await.unwrap();
        assert!(broker.latest_marker() >= old);
        let fresh = insert(&store, 2).await;

        eventually(|| !sink.markers().is_empty()).await;
        assert_eq!(sink.markers(), vec![fresh]);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unmatched_changes_are_not_published() {
        let store = MemoryStore::new();
        let sink = Arc::new(RecordingSink::default());
        let broker = broker(&store, sink.clone());
        broker.table().apply(&added(1, json!({"n": 3}))).unwrap();

        let handle = broker.start().await.unwrap();
        let mut last = Marker::ZERO;
        for n in 0..5 {
            last = insert(&store, n).await;
        }
        eventually(|| broker.latest_marker() == last).await;
        handle.stop().await.unwrap();

        assert_eq!(sink.markers().len(), 1);
        assert_eq!(broker.metrics.snapshot().changes_observed, 5);
        assert_eq!(broker.metrics.snapshot().matches, 1);
    }

    #[tokio::test]
    async fn test_follow_bus_applies_subscription_changes() {
        let store = MemoryStore::new();
        let sink = Arc::new(RecordingSink::default());
        let broker = broker(&store, sink.clone());
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::default());

        let mut handle = broker.start().await.unwrap();
        broker.follow_bus(bus.clone(), &mut handle).await.unwrap();

        bus.publish(SUBSCRIPTIONS_TOPIC, BusMessage::Subscription(added(1, json!({}))))
            .await
            .unwrap();
        let key = SubscriptionKey::new(SocketId::from("s1"), QueryId::from("q1"));
        eventually(|| broker.table().contains(&key)).await;

        let marker = insert(&store, 1).await;
        eventually(|| sink.markers() == vec![marker]).await;
        handle.stop().await.unwrap();
    }
}
