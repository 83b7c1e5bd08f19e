//! Messages carried on the distribution bus
//!
//! Everything here is plain serde data so a networked bus can carry it as JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::object::{Identity, Object, ObjectId};
use crate::registry::SubscriptionKey;
use crate::store::Marker;

/// Topic carrying subscription additions and removals
pub const SUBSCRIPTIONS_TOPIC: &str = "subscriptions";

/// Topic carrying match batches from the broker
pub const RESULTS_TOPIC: &str = "results";

/// Envelope for everything published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum BusMessage {
    Subscription(SubscriptionChange),
    Results(MatchBatch),
}

/// A subscription appearing or disappearing.
///
/// `version` increases monotonically per registry; receivers apply changes
/// for the same key last-writer-wins so duplicates and reorderings converge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionChange {
    pub key: SubscriptionKey,
    pub version: u64,
    pub action: SubscriptionAction,
}

/// Whether the subscription is present
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SubscriptionAction {
    /// The caller's raw query; receivers rewrite it deterministically
    Added {
        caller: Identity,
        query: Value,
        fingerprint: String,
    },
    Removed,
}

/// Matches produced for one change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchBatch {
    /// Feed position of the change
    pub marker: Marker,
    pub matches: Vec<Match>,
}

/// One subscription's outcome for a change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub key: SubscriptionKey,
    pub event: MatchEvent,
}

/// What a subscriber should learn about a change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MatchEvent {
    /// A matching object appeared
    Update { object: Object },
    /// A previously matching object went away
    Delete { id: ObjectId },
    /// Retire one object and add its successor, delivered together
    Replace { retired: ObjectId, object: Object },
    /// The subscription failed to evaluate and was evicted
    Error { reason: String },
}
