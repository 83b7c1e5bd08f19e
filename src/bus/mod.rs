//! # Distribution Bus
//!
//! Topic-based publish/subscribe connecting registries, the broker and
//! streamers. Delivery is at-least-once and ordered per topic.

pub mod errors;
pub mod local;
pub mod message;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

pub use errors::{BusError, BusResult};
pub use local::LocalBus;
pub use message::{
    BusMessage, Match, MatchBatch, MatchEvent, SubscriptionAction, SubscriptionChange,
    RESULTS_TOPIC, SUBSCRIPTIONS_TOPIC,
};

/// Publish/subscribe transport
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish to a topic, returning how many listeners received it
    async fn publish(&self, topic: &str, message: BusMessage) -> BusResult<usize>;

    /// Start listening on a topic
    async fn subscribe(&self, topic: &str) -> BusResult<BusSubscription>;
}

/// Listener on one topic
#[derive(Debug)]
pub struct BusSubscription {
    topic: String,
    receiver: broadcast::Receiver<BusMessage>,
}

impl BusSubscription {
    /// Wrap a broadcast receiver
    pub fn new(topic: &str, receiver: broadcast::Receiver<BusMessage>) -> Self {
        Self {
            topic: topic.to_string(),
            receiver,
        }
    }

    /// The topic this listener is attached to
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next message. Lagging skips ahead with a warning.
    pub async fn recv(&mut self) -> BusResult<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Ok(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Bus listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(BusError::Closed(self.topic.clone()));
                }
            }
        }
    }
}
