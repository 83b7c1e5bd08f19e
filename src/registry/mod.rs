//! # Subscription Registry
//!
//! Per-socket subscription state for one front-end process.
//!
//! Every mutation is mirrored either straight into the broker's match table
//! (single process) or onto the `subscriptions` bus topic (distributed), each
//! change stamped with a monotonically increasing version.
//!
//! Sockets are held through a [`SocketSession`] guard; dropping it tears down
//! every subscription of the socket, including on abrupt disconnect.

pub mod types;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::broker::MatchTable;
use crate::bus::{BusMessage, MessageBus, SubscriptionAction, SubscriptionChange, SUBSCRIPTIONS_TOPIC};
use crate::errors::{LiveError, LiveResult};
use crate::object::Identity;
use crate::observability::MetricsRegistry;
use crate::rewrite::{ContextRewriter, RewrittenQuery};
use crate::store::Marker;
use crate::streamer::{Delivery, PushMessage};

pub use types::{QueryId, SocketId, SubscriptionKey};

/// Push channel sender for a socket
pub type PushSender = mpsc::UnboundedSender<Delivery>;

/// Push channel receiver for a socket
pub type PushReceiver = mpsc::UnboundedReceiver<Delivery>;

/// Where subscription changes are mirrored
#[derive(Clone)]
pub enum SubscriptionMirror {
    /// Apply directly to an in-process broker table
    Table(Arc<MatchTable>),
    /// Announce on the bus for a remote broker
    Bus(Arc<dyn MessageBus>),
}

impl fmt::Debug for SubscriptionMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table(_) => f.write_str("SubscriptionMirror::Table"),
            Self::Bus(_) => f.write_str("SubscriptionMirror::Bus"),
        }
    }
}

impl SubscriptionMirror {
    async fn apply(&self, change: SubscriptionChange) -> LiveResult<()> {
        match self {
            Self::Table(table) => table.apply(&change).map(|_| ()),
            Self::Bus(bus) => {
                bus.publish(SUBSCRIPTIONS_TOPIC, BusMessage::Subscription(change))
                    .await?;
                Ok(())
            }
        }
    }

    /// Mirror removals from a synchronous context (socket teardown)
    fn apply_detached(&self, changes: Vec<SubscriptionChange>) {
        if changes.is_empty() {
            return;
        }
        match self {
            Self::Table(table) => {
                for change in &changes {
                    if let Err(e) = table.apply(change) {
                        warn!(key = %change.key, error = %e, "Failed to remove subscription from match table");
                    }
                }
            }
            Self::Bus(bus) => match Handle::try_current() {
                Ok(handle) => {
                    let bus = Arc::clone(bus);
                    handle.spawn(async move {
                        for change in changes {
                            let key = change.key.clone();
                            if let Err(e) = bus
                                .publish(SUBSCRIPTIONS_TOPIC, BusMessage::Subscription(change))
                                .await
                            {
                                warn!(key = %key, error = %e, "Failed to announce subscription removal");
                            }
                        }
                    });
                }
                Err(_) => {
                    warn!(count = changes.len(), "No runtime to announce subscription removals");
                }
            },
        }
    }
}

/// A subscription as the registry holds it
#[derive(Debug, Clone)]
pub struct Subscription {
    pub key: SubscriptionKey,
    pub caller: Identity,
    pub query: Value,
    pub rewritten: Arc<RewrittenQuery>,
    pub since: Option<Marker>,
}

#[derive(Debug)]
struct SocketEntry {
    identity: Identity,
    sender: PushSender,
    subscriptions: HashMap<QueryId, Subscription>,
    backfills: HashMap<QueryId, AbortHandle>,
}

/// Outcome of pushing a delivery to a socket
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Messages handed to the socket
    pub delivered: usize,
    /// Messages whose target vanished
    pub dropped: usize,
}

/// Registry of live sockets and their subscriptions
pub struct SubscriptionRegistry {
    sockets: Mutex<HashMap<SocketId, SocketEntry>>,
    version: AtomicU64,
    mirror: SubscriptionMirror,
    rewriter: ContextRewriter,
    metrics: Arc<MetricsRegistry>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("sockets", &self.socket_count())
            .field("mirror", &self.mirror)
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Create a registry mirroring into `mirror`
    pub fn new(mirror: SubscriptionMirror, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            sockets: Mutex::new(HashMap::new()),
            version: AtomicU64::new(0),
            mirror,
            rewriter: ContextRewriter::new(),
            metrics,
        }
    }

    fn lock(&self) -> LiveResult<MutexGuard<'_, HashMap<SocketId, SocketEntry>>> {
        self.sockets
            .lock()
            .map_err(|_| LiveError::Internal("Lock poisoned".into()))
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a socket for `identity`.
    ///
    /// The returned session tears the socket down when dropped.
    pub fn register(self: &Arc<Self>, identity: Identity) -> LiveResult<(SocketSession, PushReceiver)> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = SocketId::generate();

        self.lock()?.insert(
            id.clone(),
            SocketEntry {
                identity: identity.clone(),
                sender,
                subscriptions: HashMap::new(),
                backfills: HashMap::new(),
            },
        );
        info!(socket_id = %id, identity = %identity, "Socket registered");

        Ok((
            SocketSession {
                id,
                identity,
                registry: Arc::clone(self),
            },
            receiver,
        ))
    }

    /// Add a subscription to a socket.
    ///
    /// A missing `query_id` gets a fresh one; a duplicate is rejected.
    pub async fn subscribe(
        &self,
        socket_id: &SocketId,
        query: &Value,
        since: Option<Marker>,
        caller: &Identity,
        query_id: Option<QueryId>,
    ) -> LiveResult<Subscription> {
        let rewritten = Arc::new(self.rewriter.rewrite(query, caller)?);
        let query_id = query_id.unwrap_or_else(QueryId::generate);
        let key = SubscriptionKey::new(socket_id.clone(), query_id.clone());

        let subscription = Subscription {
            key: key.clone(),
            caller: caller.clone(),
            query: query.clone(),
            rewritten: Arc::clone(&rewritten),
            since,
        };

        let version = {
            let mut sockets = self.lock()?;
            let entry = owned_socket(&mut sockets, socket_id, caller)?;
            if entry.subscriptions.contains_key(&query_id) {
                return Err(LiveError::validation(format!(
                    "query id '{}' is already in use on this socket",
                    query_id
                )));
            }
            entry.subscriptions.insert(query_id.clone(), subscription.clone());
            self.next_version()
        };

        let change = SubscriptionChange {
            key: key.clone(),
            version,
            action: SubscriptionAction::Added {
                caller: caller.clone(),
                query: query.clone(),
                fingerprint: rewritten.fingerprint.clone(),
            },
        };
        if let Err(e) = self.mirror.apply(change).await {
            warn!(key = %key, error = %e, "Failed to mirror subscription; rolling back");
            self.evict(&key).await;
            return Err(e);
        }

        debug!(key = %key, fingerprint = %rewritten.fingerprint, "Subscribed");
        Ok(subscription)
    }

    /// Remove a subscription owned by `caller`
    pub async fn unsubscribe(&self, socket_id: &SocketId, query_id: &QueryId, caller: &Identity) -> LiveResult<()> {
        let version = {
            let mut sockets = self.lock()?;
            let entry = owned_socket(&mut sockets, socket_id, caller)?;
            if entry.subscriptions.remove(query_id).is_none() {
                return Err(LiveError::not_found(format!("query id '{}'", query_id)));
            }
            if let Some(backfill) = entry.backfills.remove(query_id) {
                backfill.abort();
            }
            self.next_version()
        };

        let key = SubscriptionKey::new(socket_id.clone(), query_id.clone());
        debug!(key = %key, "Unsubscribed");
        self.mirror
            .apply(SubscriptionChange {
                key,
                version,
                action: SubscriptionAction::Removed,
            })
            .await
    }

    /// Remove a subscription regardless of caller. Returns whether it existed.
    pub async fn evict(&self, key: &SubscriptionKey) -> bool {
        let version = {
            let Ok(mut sockets) = self.lock() else {
                return false;
            };
            let Some(entry) = sockets.get_mut(&key.socket_id) else {
                return false;
            };
            if entry.subscriptions.remove(&key.query_id).is_none() {
                return false;
            }
            if let Some(backfill) = entry.backfills.remove(&key.query_id) {
                backfill.abort();
            }
            self.next_version()
        };

        let change = SubscriptionChange {
            key: key.clone(),
            version,
            action: SubscriptionAction::Removed,
        };
        if let Err(e) = self.mirror.apply(change).await {
            warn!(key = %key, error = %e, "Failed to mirror eviction");
        }
        true
    }

    /// Query ids active on a socket
    pub fn list_active(&self, socket_id: &SocketId) -> LiveResult<BTreeSet<QueryId>> {
        let sockets = self.lock()?;
        let entry = sockets
            .get(socket_id)
            .ok_or_else(|| LiveError::not_found(format!("socket '{}'", socket_id)))?;
        Ok(entry.subscriptions.keys().cloned().collect())
    }

    /// Look up a subscription
    pub fn get(&self, key: &SubscriptionKey) -> Option<Subscription> {
        let sockets = self.lock().ok()?;
        sockets
            .get(&key.socket_id)?
            .subscriptions
            .get(&key.query_id)
            .cloned()
    }

    /// Whether a subscription is present
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.get(key).is_some()
    }

    /// Remember a running backfill so teardown can cancel it.
    /// Aborts it immediately when the subscription is already gone.
    pub fn track_backfill(&self, key: &SubscriptionKey, handle: AbortHandle) -> bool {
        let mut sockets = match self.lock() {
            Ok(sockets) => sockets,
            Err(_) => {
                handle.abort();
                return false;
            }
        };
        match sockets.get_mut(&key.socket_id) {
            Some(entry) if entry.subscriptions.contains_key(&key.query_id) => {
                entry.backfills.insert(key.query_id.clone(), handle);
                true
            }
            _ => {
                handle.abort();
                false
            }
        }
    }

    /// Forget a finished backfill
    pub fn finish_backfill(&self, key: &SubscriptionKey) {
        if let Ok(mut sockets) = self.lock() {
            if let Some(entry) = sockets.get_mut(&key.socket_id) {
                entry.backfills.remove(&key.query_id);
            }
        }
    }

    /// Whether a backfill is tracked for the subscription
    pub fn is_backfilling(&self, key: &SubscriptionKey) -> bool {
        self.lock()
            .map(|sockets| {
                sockets
                    .get(&key.socket_id)
                    .map_or(false, |entry| entry.backfills.contains_key(&key.query_id))
            })
            .unwrap_or(false)
    }

    /// Push an error for every live subscription. Returns how many sockets
    /// were reached.
    pub fn notify_all(&self, marker: Marker, reason: &str) -> usize {
        let Ok(sockets) = self.lock() else {
            return 0;
        };
        let mut reached = 0;
        for (socket_id, entry) in sockets.iter() {
            if entry.subscriptions.is_empty() {
                continue;
            }
            let messages = entry
                .subscriptions
                .keys()
                .map(|query_id| PushMessage::error(query_id.clone(), reason))
                .collect();
            if entry.sender.send(Delivery::new(marker, messages)).is_err() {
                debug!(socket_id = %socket_id, "Socket receiver closed");
                continue;
            }
            reached += 1;
        }
        reached
    }

    /// Push a delivery to a socket, dropping messages for vanished targets
    pub fn deliver(&self, socket_id: &SocketId, delivery: Delivery) -> DeliveryReport {
        let total = delivery.messages.len();
        let Ok(sockets) = self.lock() else {
            return self.dropped(total);
        };
        let Some(entry) = sockets.get(socket_id) else {
            debug!(socket_id = %socket_id, "Delivery target socket vanished");
            return self.dropped(total);
        };

        let Delivery { marker, messages } = delivery;
        let messages: Vec<_> = messages
            .into_iter()
            .filter(|message| entry.subscriptions.contains_key(message.query_id()))
            .collect();
        let kept = messages.len();
        if kept == 0 {
            return self.dropped(total);
        }

        if entry.sender.send(Delivery::new(marker, messages)).is_err() {
            debug!(socket_id = %socket_id, "Socket receiver closed");
            return self.dropped(total);
        }

        self.metrics.increment_deliveries();
        if total > kept {
            self.metrics.add_dropped_deliveries((total - kept) as u64);
        }
        DeliveryReport {
            delivered: kept,
            dropped: total - kept,
        }
    }

    fn dropped(&self, count: usize) -> DeliveryReport {
        self.metrics.add_dropped_deliveries(count as u64);
        DeliveryReport {
            delivered: 0,
            dropped: count,
        }
    }

    /// Tear down a socket and every subscription on it
    fn teardown(&self, socket_id: &SocketId) {
        let entry = match self.lock() {
            Ok(mut sockets) => sockets.remove(socket_id),
            Err(_) => {
                warn!(socket_id = %socket_id, "Registry lock poisoned during teardown");
                return;
            }
        };
        let Some(entry) = entry else {
            return;
        };

        for backfill in entry.backfills.values() {
            backfill.abort();
        }

        let changes: Vec<SubscriptionChange> = entry
            .subscriptions
            .into_keys()
            .map(|query_id| SubscriptionChange {
                key: SubscriptionKey::new(socket_id.clone(), query_id),
                version: self.next_version(),
                action: SubscriptionAction::Removed,
            })
            .collect();

        info!(socket_id = %socket_id, subscriptions = changes.len(), "Socket torn down");
        self.mirror.apply_detached(changes);
    }

    /// Number of registered sockets
    pub fn socket_count(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Number of subscriptions across all sockets
    pub fn subscription_count(&self) -> usize {
        self.lock()
            .map(|s| s.values().map(|e| e.subscriptions.len()).sum())
            .unwrap_or(0)
    }
}

fn owned_socket<'a>(
    sockets: &'a mut HashMap<SocketId, SocketEntry>,
    socket_id: &SocketId,
    caller: &Identity,
) -> LiveResult<&'a mut SocketEntry> {
    let entry = sockets
        .get_mut(socket_id)
        .ok_or_else(|| LiveError::not_found(format!("socket '{}'", socket_id)))?;
    if &entry.identity != caller {
        return Err(LiveError::forbidden(format!(
            "socket '{}' is not owned by '{}'",
            socket_id, caller
        )));
    }
    Ok(entry)
}

/// Scoped registration of one socket.
///
/// Dropping the session removes the socket, cancels its backfills and
/// retracts all of its subscriptions.
#[derive(Debug)]
pub struct SocketSession {
    id: SocketId,
    identity: Identity,
    registry: Arc<SubscriptionRegistry>,
}

impl SocketSession {
    pub fn id(&self) -> &SocketId {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl Drop for SocketSession {
    fn drop(&mut self) {
        self.registry.teardown(&self.id);
    }
}
