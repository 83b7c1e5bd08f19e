//! # Result Streamer
//!
//! Turns match batches into socket pushes and runs historical backfill for
//! new subscriptions.
//!
//! - Matches for the same socket and marker travel as one [`Delivery`]
//! - Targets missing from the registry are dropped, not treated as errors
//! - Backfill pages newest first and ends with a `complete` page
//!
//! Backfill and live delivery are not deduplicated against each other;
//! subscribers see at-least-once delivery keyed by object id.

pub mod message;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{
    BusError, BusMessage, BusSubscription, MatchBatch, MatchEvent, MessageBus, RESULTS_TOPIC,
};
use crate::errors::LiveResult;
use crate::observability::MetricsRegistry;
use crate::registry::{SocketId, Subscription, SubscriptionKey, SubscriptionRegistry};
use crate::store::{DocumentStore, Marker, Scan};

pub use message::{Delivery, PushMessage};

/// Result of handing a batch to a sink
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    /// Subscriptions the batch addressed
    pub targets: usize,
    /// Messages handed to sockets or listeners
    pub delivered: usize,
    /// Messages whose target vanished
    pub dropped: usize,
}

impl FanOut {
    /// Nothing was eligible to receive the batch
    pub fn is_empty(&self) -> bool {
        self.delivered == 0
    }
}

/// Destination for the broker's match batches
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, batch: MatchBatch) -> LiveResult<FanOut>;
}

/// Publishes batches on the `results` topic for remote streamers
pub struct BusSink {
    bus: Arc<dyn MessageBus>,
}

impl BusSink {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ResultSink for BusSink {
    async fn publish(&self, batch: MatchBatch) -> LiveResult<FanOut> {
        let targets = batch.matches.len();
        let listeners = self
            .bus
            .publish(RESULTS_TOPIC, BusMessage::Results(batch))
            .await?;
        Ok(FanOut {
            targets,
            delivered: listeners,
            dropped: 0,
        })
    }
}

/// Delivers matches and backfill pages to locally registered sockets
pub struct ResultStreamer {
    registry: Arc<SubscriptionRegistry>,
    store: Arc<dyn DocumentStore>,
    page_size: usize,
    metrics: Arc<MetricsRegistry>,
}

impl ResultStreamer {
    /// Create a streamer paging backfill `page_size` objects at a time
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        store: Arc<dyn DocumentStore>,
        page_size: usize,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            registry,
            store,
            page_size: page_size.max(1),
            metrics,
        }
    }

    /// Fan a batch out to the sockets it addresses
    pub async fn deliver(&self, batch: MatchBatch) -> FanOut {
        let targets = batch.matches.len();
        let mut per_socket: BTreeMap<SocketId, Vec<PushMessage>> = BTreeMap::new();
        let mut failed: Vec<SubscriptionKey> = Vec::new();

        for m in batch.matches {
            let messages = per_socket.entry(m.key.socket_id.clone()).or_default();
            let query_id = m.key.query_id.clone();
            match m.event {
                MatchEvent::Update { object } => {
                    messages.push(PushMessage::updates(query_id, vec![object.to_wire()]));
                }
                MatchEvent::Delete { id } => {
                    messages.push(PushMessage::deletes(query_id, vec![id]));
                }
                MatchEvent::Replace { retired, object } => {
                    messages.push(PushMessage::deletes(query_id.clone(), vec![retired]));
                    messages.push(PushMessage::updates(query_id, vec![object.to_wire()]));
                }
                MatchEvent::Error { reason } => {
                    messages.push(PushMessage::error(query_id, reason));
                    failed.push(m.key);
                }
            }
        }

        let mut fan_out = FanOut {
            targets,
            ..FanOut::default()
        };
        for (socket_id, messages) in per_socket {
            let report = self
                .registry
                .deliver(&socket_id, Delivery::new(batch.marker, messages));
            fan_out.delivered += report.delivered;
            fan_out.dropped += report.dropped;
        }

        // Errors are delivered first so the socket learns why its query ended.
        for key in failed {
            if self.registry.evict(&key).await {
                self.metrics.increment_evictions();
                info!(key = %key, "Subscription force-unsubscribed");
            }
        }

        fan_out
    }

    /// Start the one-time historical scan for a new subscription
    pub fn spawn_backfill(self: &Arc<Self>, subscription: Subscription, marker: Marker) -> JoinHandle<()> {
        let streamer = Arc::clone(self);
        let key = subscription.key.clone();
        let (start, started) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            // Held until the handle is tracked, so finishing always untracks it.
            if started.await.is_err() {
                return;
            }
            let key = subscription.key.clone();
            if let Err(e) = streamer.backfill(&subscription, marker).await {
                warn!(key = %key, error = %e, "Backfill failed");
                streamer.registry.deliver(
                    &key.socket_id,
                    Delivery::single(marker, PushMessage::error(key.query_id.clone(), e.reason())),
                );
            }
            streamer.registry.finish_backfill(&key);
        });
        if self.registry.track_backfill(&key, handle.abort_handle()) {
            let _ = start.send(());
        }
        handle
    }

    /// Page live rows newer than the subscription's cursor, newest first
    pub async fn backfill(&self, subscription: &Subscription, marker: Marker) -> LiveResult<()> {
        let key = &subscription.key;
        let predicate = &subscription.rewritten.predicate;
        let mut scan = Scan::first(subscription.since, self.page_size);
        let mut pages = 0usize;

        loop {
            let page = self.store.find(predicate, scan).await?;
            let complete = page.len() < self.page_size;
            let last = page.last().map(|doc| doc.row);
            let results = page.iter().map(|doc| doc.object.to_wire()).collect();

            let report = self.registry.deliver(
                &key.socket_id,
                Delivery::single(
                    marker,
                    PushMessage::historical(key.query_id.clone(), results, complete),
                ),
            );
            self.metrics.increment_backfill_pages();
            pages += 1;

            if report.delivered == 0 {
                debug!(key = %key, "Backfill target vanished");
                return Ok(());
            }
            match (complete, last) {
                (false, Some(last)) => scan = scan.after_page(last),
                _ => break,
            }
        }

        debug!(key = %key, pages, "Backfill complete");
        Ok(())
    }

    /// Consume result batches from a `results` topic listener until shutdown.
    /// Subscribe before spawning so no batch published meanwhile is lost.
    pub async fn listen(
        self: Arc<Self>,
        mut results: BusSubscription,
        mut shutdown: broadcast::Receiver<()>,
    ) -> LiveResult<()> {
        info!(topic = results.topic(), "Result streamer listening");

        loop {
            tokio::select! {
                message = results.recv() => match message {
                    Ok(BusMessage::Results(batch)) => {
                        let marker = batch.marker;
                        let fan_out = self.deliver(batch).await;
                        if fan_out.is_empty() {
                            debug!(marker = marker.0, "No local targets for batch");
                        }
                    }
                    Ok(other) => debug!(?other, "Ignoring non-result message"),
                    Err(BusError::Closed(topic)) => {
                        info!(topic = %topic, "Results topic closed");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                },
                _ = shutdown.recv() => {
                    info!("Result streamer shutting down");
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl ResultSink for ResultStreamer {
    async fn publish(&self, batch: MatchBatch) -> LiveResult<FanOut> {
        Ok(self.deliver(batch).await)
    }
}
