//! Push messages delivered to sockets

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::object::ObjectId;
use crate::registry::QueryId;
use crate::store::Marker;

/// A message pushed to a socket for one of its subscriptions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushMessage {
    /// Matching objects, newest first
    Updates {
        #[serde(rename = "queryId")]
        query_id: QueryId,
        results: Vec<Value>,
        #[serde(default)]
        historical: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        complete: Option<bool>,
    },
    /// Ids of objects that stopped matching
    Deletes {
        #[serde(rename = "queryId")]
        query_id: QueryId,
        results: Vec<ObjectId>,
    },
    /// The subscription failed and was removed
    Error {
        #[serde(rename = "queryId")]
        query_id: QueryId,
        reason: String,
    },
}

impl PushMessage {
    /// Live updates
    pub fn updates(query_id: QueryId, results: Vec<Value>) -> Self {
        Self::Updates {
            query_id,
            results,
            historical: false,
            complete: None,
        }
    }

    /// One page of backfill
    pub fn historical(query_id: QueryId, results: Vec<Value>, complete: bool) -> Self {
        Self::Updates {
            query_id,
            results,
            historical: true,
            complete: Some(complete),
        }
    }

    pub fn deletes(query_id: QueryId, results: Vec<ObjectId>) -> Self {
        Self::Deletes { query_id, results }
    }

    pub fn error(query_id: QueryId, reason: impl Into<String>) -> Self {
        Self::Error {
            query_id,
            reason: reason.into(),
        }
    }

    /// The subscription this message belongs to
    pub fn query_id(&self) -> &QueryId {
        match self {
            Self::Updates { query_id, .. }
            | Self::Deletes { query_id, .. }
            | Self::Error { query_id, .. } => query_id,
        }
    }

    /// Whether this message terminates the subscription
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Everything one socket receives for one feed position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub marker: Marker,
    pub messages: Vec<PushMessage>,
}

impl Delivery {
    pub fn new(marker: Marker, messages: Vec<PushMessage>) -> Self {
        Self { marker, messages }
    }

    /// A single-message delivery
    pub fn single(marker: Marker, message: PushMessage) -> Self {
        Self::new(marker, vec![message])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let page = PushMessage::historical(QueryId::from("q1"), vec![json!({"a": 1})], true);
        assert_eq!(
            serde_json::to_value(&page).unwrap(),
            json!({
                "type": "updates",
                "queryId": "q1",
                "results": [{"a": 1}],
                "historical": true,
                "complete": true
            })
        );

        let live = serde_json::to_value(PushMessage::updates(QueryId::from("q1"), Vec::new())).unwrap();
        assert!(live.get("complete").is_none());
        assert_eq!(live["historical"], false);

        let error = serde_json::to_value(PushMessage::error(QueryId::from("q2"), "boom")).unwrap();
        assert_eq!(error, json!({"type": "error", "queryId": "q2", "reason": "boom"}));
    }
}
