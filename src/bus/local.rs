//! In-process bus over tokio broadcast channels

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::errors::{BusError, BusResult};
use super::message::BusMessage;
use super::{BusSubscription, MessageBus};

/// Default per-topic buffer
pub const DEFAULT_TOPIC_CAPACITY: usize = 4096;

/// Ordered per-topic bus living in one process
#[derive(Debug)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    capacity: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

impl LocalBus {
    /// Create a bus with the given per-topic buffer
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> BusResult<broadcast::Sender<BusMessage>> {
        if let Some(sender) = self
            .topics
            .read()
            .map_err(|_| BusError::Internal("Lock poisoned".into()))?
            .get(topic)
        {
            return Ok(sender.clone());
        }

        let mut topics = self
            .topics
            .write()
            .map_err(|_| BusError::Internal("Lock poisoned".into()))?;
        let sender = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.clone())
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, message: BusMessage) -> BusResult<usize> {
        // No listeners is not an error; the message is simply unobserved.
        Ok(self.sender(topic)?.send(message).unwrap_or(0))
    }

    async fn subscribe(&self, topic: &str) -> BusResult<BusSubscription> {
        Ok(BusSubscription::new(topic, self.sender(topic)?.subscribe()))
    }
}
