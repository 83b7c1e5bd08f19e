//! # Engine
//!
//! Wires the store, bus, coordinator, registry, broker and streamer into
//! one handle exposing the request-facing operations.
//!
//! In a single process the registry writes straight into the broker's match
//! table and the broker hands batches to the streamer directly. Distributed,
//! both legs go over the bus: subscription changes on `subscriptions`,
//! match batches on `results`.
//!
//! A supervisor task watches each broker run. When the change feed is lost
//! past its retry budget the run is reaped, every subscriber receives a
//! `feed_interrupted` error and the failure is kept until the next `start`
//! or `shutdown`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::{BrokerHandle, BrokerState, ChangeBroker, MatchTable};
use crate::bus::{MessageBus, RESULTS_TOPIC};
use crate::config::EngineConfig;
use crate::errors::{LiveError, LiveResult};
use crate::mutation::{LockManager, MemoryLockManager, MutationCoordinator};
use crate::object::{Identity, NewObject, ObjectId};
use crate::observability::{MetricsRegistry, MetricsSnapshot};
use crate::registry::{
    PushReceiver, QueryId, SocketId, SocketSession, Subscription, SubscriptionMirror,
    SubscriptionRegistry,
};
use crate::store::{DocumentStore, Marker};
use crate::streamer::{BusSink, ResultSink, ResultStreamer};

/// How the broker reaches the registry and streamer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Everything in one process, connected directly
    #[default]
    SingleProcess,
    /// Registry and streamer reach the broker over the bus
    Distributed,
}

struct Running {
    run: u64,
    broker: BrokerHandle,
    streamer: Option<JoinHandle<LiveResult<()>>>,
}

impl Running {
    /// Stop the broker and wait for the streamer. Returns the broker's failure.
    async fn finish(self) -> LiveResult<()> {
        let result = self.broker.stop().await;
        if let Some(streamer) = self.streamer {
            match streamer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Result streamer ended with error"),
                Err(e) => warn!(error = %e, "Result streamer task failed"),
            }
        }
        result
    }
}

/// Broker runs and the failure that ended the last one
#[derive(Default)]
struct Lifecycle {
    running: Mutex<Option<Running>>,
    runs: AtomicU64,
    failure: std::sync::Mutex<Option<LiveError>>,
}

impl Lifecycle {
    fn record_failure(&self, e: LiveError) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(e);
        }
    }

    fn take_failure(&self) -> Option<LiveError> {
        self.failure.lock().ok().and_then(|mut failure| failure.take())
    }

    fn failure(&self) -> Option<LiveError> {
        self.failure.lock().ok().and_then(|failure| failure.clone())
    }

    /// Wait for run `run` to stop on its own, then reap it and tell every
    /// subscriber. Returns quietly if the run was shut down or replaced.
    async fn supervise(
        self: Arc<Self>,
        run: u64,
        mut states: watch::Receiver<BrokerState>,
        broker: Arc<ChangeBroker>,
        registry: Arc<SubscriptionRegistry>,
    ) {
        loop {
            let stopped = states.borrow_and_update().is_stopped();
            if stopped {
                break;
            }
            if states.changed().await.is_err() {
                return;
            }
        }

        let mut running = self.running.lock().await;
        if running.as_ref().map_or(true, |current| current.run != run) {
            return;
        }
        let Some(current) = running.take() else {
            return;
        };
        match current.finish().await {
            Ok(()) => warn!(run, "Change broker stopped unexpectedly"),
            Err(e) => {
                error!(run, error = %e, "Change broker failed; live queries are no longer updated");
                let reason = e.reason();
                self.record_failure(e);
                let reached = registry.notify_all(broker.latest_marker(), reason);
                info!(run, sockets = reached, "Subscribers notified of broker failure");
            }
        }
    }
}

/// The live query engine
pub struct Engine {
    config: EngineConfig,
    bus: Arc<dyn MessageBus>,
    metrics: Arc<MetricsRegistry>,
    coordinator: MutationCoordinator,
    registry: Arc<SubscriptionRegistry>,
    streamer: Arc<ResultStreamer>,
    broker: Arc<ChangeBroker>,
    lifecycle: Arc<Lifecycle>,
}

impl Engine {
    /// Build an engine with in-process object locks
    pub fn new(config: EngineConfig, store: Arc<dyn DocumentStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self::with_locks(config, store, bus, Arc::new(MemoryLockManager::new()))
    }

    /// Build an engine with a custom lock manager
    pub fn with_locks(
        config: EngineConfig,
        store: Arc<dyn DocumentStore>,
        bus: Arc<dyn MessageBus>,
        locks: Arc<dyn LockManager>,
    ) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let table = Arc::new(MatchTable::new());

        let mirror = match config.topology {
            Topology::SingleProcess => SubscriptionMirror::Table(Arc::clone(&table)),
            Topology::Distributed => SubscriptionMirror::Bus(Arc::clone(&bus)),
        };
        let registry = Arc::new(SubscriptionRegistry::new(mirror, Arc::clone(&metrics)));
        let streamer = Arc::new(ResultStreamer::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            config.page_size,
            Arc::clone(&metrics),
        ));

        let sink: Arc<dyn ResultSink> = match config.topology {
            Topology::SingleProcess => Arc::clone(&streamer) as Arc<dyn ResultSink>,
            Topology::Distributed => Arc::new(BusSink::new(Arc::clone(&bus))),
        };
        let broker = Arc::new(ChangeBroker::new(
            Arc::clone(&store),
            table,
            sink,
            config.broker_settings(),
            Arc::clone(&metrics),
        ));

        let coordinator = MutationCoordinator::new(
            store,
            locks,
            config.lock_timing(),
            Arc::clone(&metrics),
        );

        Self {
            config,
            bus,
            metrics,
            coordinator,
            registry,
            streamer,
            broker,
            lifecycle: Arc::new(Lifecycle::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ==================
    // Lifecycle
    // ==================

    /// Start following the change feed.
    ///
    /// A no-op while the broker runs. After the broker stopped on a feed
    /// failure this starts a fresh run from the latest committed change.
    pub async fn start(&self) -> LiveResult<()> {
        let mut running = self.lifecycle.running.lock().await;
        if running.is_some() {
            if !self.broker.state().is_stopped() {
                return Ok(());
            }
            if let Some(stale) = running.take() {
                if let Err(e) = stale.finish().await {
                    self.lifecycle.record_failure(e);
                }
            }
        }
        if let Some(e) = self.lifecycle.take_failure() {
            warn!(error = %e, "Restarting after broker failure");
        }

        let mut broker = self.broker.start().await?;
        let streamer = match self.config.topology {
            Topology::SingleProcess => None,
            Topology::Distributed => {
                self.broker.follow_bus(Arc::clone(&self.bus), &mut broker).await?;
                let results = self.bus.subscribe(RESULTS_TOPIC).await?;
                let shutdown = broker.shutdown_signal();
                Some(tokio::spawn(
                    Arc::clone(&self.streamer).listen(results, shutdown),
                ))
            }
        };

        let run = self.lifecycle.runs.fetch_add(1, Ordering::SeqCst) + 1;
        *running = Some(Running {
            run,
            broker,
            streamer,
        });
        tokio::spawn(Arc::clone(&self.lifecycle).supervise(
            run,
            self.broker.state_changes(),
            Arc::clone(&self.broker),
            Arc::clone(&self.registry),
        ));

        info!(topology = ?self.config.topology, run, "Engine started");
        Ok(())
    }

    /// Stop the broker and streamer tasks.
    ///
    /// Reports the failure that stopped the broker, if it stopped on its own.
    pub async fn shutdown(&self) -> LiveResult<()> {
        let current = self.lifecycle.running.lock().await.take();
        let failure = self.lifecycle.take_failure();
        if current.is_none() && failure.is_none() {
            return Ok(());
        }

        let result = match current {
            Some(current) => current.finish().await,
            None => Ok(()),
        };
        info!(marker = %self.latest_marker(), "Engine stopped");
        match (result, failure) {
            (Err(e), _) | (Ok(()), Some(e)) => Err(e),
            (Ok(()), None) => Ok(()),
        }
    }

    /// The failure that stopped the broker, until the next start or shutdown
    pub fn broker_failure(&self) -> Option<LiveError> {
        self.lifecycle.failure()
    }

    pub fn broker_state(&self) -> BrokerState {
        self.broker.state()
    }

    /// Latest change observed by the broker; the default `since` for clients
    pub fn latest_marker(&self) -> Marker {
        self.broker.latest_marker()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // ==================
    // Mutations
    // ==================

    pub async fn create(&self, object: NewObject, owner: &Identity) -> LiveResult<ObjectId> {
        self.coordinator.create(object, owner).await
    }

    pub async fn replace(
        &self,
        id: &ObjectId,
        object: NewObject,
        verify_query: &Value,
        owner: &Identity,
    ) -> LiveResult<ObjectId> {
        self.coordinator.replace(id, object, verify_query, owner).await
    }

    pub async fn remove(&self, id: &ObjectId, owner: &Identity) -> LiveResult<()> {
        self.coordinator.remove(id, owner).await
    }

    // ==================
    // Subscriptions
    // ==================

    /// Register a socket. Dropping the session tears down its subscriptions.
    pub fn register(&self, identity: Identity) -> LiveResult<(SocketSession, PushReceiver)> {
        self.registry.register(identity)
    }

    /// Subscribe and start the historical backfill.
    ///
    /// Without `since` every live match is backfilled; with it, only rows
    /// written after that marker.
    pub async fn subscribe(
        &self,
        socket_id: &SocketId,
        query: &Value,
        since: Option<Marker>,
        caller: &Identity,
        query_id: Option<QueryId>,
    ) -> LiveResult<Subscription> {
        if since.map_or(false, |since| since > self.latest_marker()) {
            return Err(LiveError::validation(format!(
                "since marker {} is ahead of the latest change",
                since.map_or(0, |m| m.0)
            )));
        }
        let subscription = self
            .registry
            .subscribe(socket_id, query, since, caller, query_id)
            .await?;
        self.streamer
            .spawn_backfill(subscription.clone(), self.latest_marker());
        Ok(subscription)
    }

    pub async fn unsubscribe(&self, socket_id: &SocketId, query_id: &QueryId, caller: &Identity) -> LiveResult<()> {
        self.registry.unsubscribe(socket_id, query_id, caller).await
    }

    pub fn list_active(&self, socket_id: &SocketId) -> LiveResult<BTreeSet<QueryId>> {
        self.registry.list_active(socket_id)
    }
}
