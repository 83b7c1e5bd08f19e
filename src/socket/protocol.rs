//! Socket wire protocol
//!
//! Client frames are single JSON objects tagged by `type`. Replies are
//! single objects; pushes arrive as a JSON array of push messages, one
//! array per delivery.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::LiveError;
use crate::object::ObjectId;
use crate::registry::QueryId;
use crate::store::Marker;

/// Message from a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Create an object, or replace it when `idProof` is given
    Update {
        #[serde(rename = "messageID")]
        message_id: String,
        object: Value,
        /// Verification query the replacement must satisfy for its owner
        #[serde(rename = "idProof", default)]
        id_proof: Option<Value>,
    },

    /// Remove an object
    Delete {
        #[serde(rename = "messageID")]
        message_id: String,
        #[serde(rename = "objectID")]
        object_id: String,
    },

    /// Start a live query
    Subscribe {
        #[serde(rename = "messageID")]
        message_id: String,
        query: Value,
        #[serde(default)]
        since: Option<Marker>,
        #[serde(rename = "queryID", default)]
        query_id: Option<QueryId>,
    },

    /// Stop a live query
    Unsubscribe {
        #[serde(rename = "messageID")]
        message_id: String,
        #[serde(rename = "queryID")]
        query_id: QueryId,
    },
}

impl ClientMessage {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Update { message_id, .. }
            | Self::Delete { message_id, .. }
            | Self::Subscribe { message_id, .. }
            | Self::Unsubscribe { message_id, .. } => message_id,
        }
    }
}

/// Reply to a client message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Success {
        #[serde(rename = "messageID")]
        message_id: String,
        #[serde(rename = "objectID", default, skip_serializing_if = "Option::is_none")]
        object_id: Option<ObjectId>,
        #[serde(rename = "queryID", default, skip_serializing_if = "Option::is_none")]
        query_id: Option<QueryId>,
    },

    Error {
        /// Absent when the frame could not be parsed
        #[serde(rename = "messageID", default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        reason: String,
        detail: String,
    },
}

impl ServerMessage {
    pub fn success(message_id: impl Into<String>) -> Self {
        Self::Success {
            message_id: message_id.into(),
            object_id: None,
            query_id: None,
        }
    }

    pub fn created(message_id: impl Into<String>, object_id: ObjectId) -> Self {
        Self::Success {
            message_id: message_id.into(),
            object_id: Some(object_id),
            query_id: None,
        }
    }

    pub fn subscribed(message_id: impl Into<String>, query_id: QueryId) -> Self {
        Self::Success {
            message_id: message_id.into(),
            object_id: None,
            query_id: Some(query_id),
        }
    }

    pub fn failure(message_id: Option<String>, error: &LiveError) -> Self {
        Self::Error {
            message_id,
            reason: error.reason().to_string(),
            detail: error.to_string(),
        }
    }

    /// Reply to a frame that is not a valid client message
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::Error {
            message_id: None,
            reason: "validation".to_string(),
            detail: detail.into(),
        }
    }
}
