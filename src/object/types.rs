//! # Object Types
//!
//! Objects, their identities and the contexts that gate their visibility.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Prefix reserved for engine-managed fields
pub const RESERVED_PREFIX: char = '_';

/// Reserved field exposing the object id to queries
pub const ID_FIELD: &str = "_id";
/// Reserved field exposing the owner to queries
pub const OWNER_FIELD: &str = "_by";
/// Reserved field exposing the recipients to queries
pub const RECIPIENTS_FIELD: &str = "_to";
/// Reserved field exposing the creation timestamp to queries
pub const TIMESTAMP_FIELD: &str = "_timestamp";
/// Reserved field carrying contexts on the wire
pub const CONTEXTS_FIELD: &str = "_contexts";

/// An authenticated identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap an identity string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content-derived object identifier (lowercase hex SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Parse an id, accepting only 64 lowercase hex characters
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == 64
            && raw
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        valid.then(|| Self(raw.to_string()))
    }

    /// Hash arbitrary bytes into an id
    pub fn digest(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }

    /// The id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Creation time in milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }
}

/// A non-empty set of alternative documents.
///
/// The group matches a query when the query matches at least one
/// alternative, evaluated as the owning object with the alternative's
/// fields overlaid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PredicateGroup(Vec<Map<String, Value>>);

impl PredicateGroup {
    /// Build a group from alternatives
    pub fn new(alternatives: Vec<Map<String, Value>>) -> Self {
        Self(alternatives)
    }

    /// Build a single-alternative group from a JSON object.
    /// Non-object values produce an empty (invalid) group.
    pub fn single(alternative: Value) -> Self {
        match alternative {
            Value::Object(map) => Self(vec![map]),
            _ => Self(Vec::new()),
        }
    }

    /// The alternatives in this group
    pub fn alternatives(&self) -> &[Map<String, Value>] {
        &self.0
    }
}

/// A visibility rule attached to an object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Decoys the query must not match
    #[serde(rename = "nearMisses", default)]
    pub near_misses: Vec<PredicateGroup>,

    /// Siblings the query must also match
    #[serde(default)]
    pub neighbors: Vec<PredicateGroup>,
}

/// An object as submitted by a caller, before the engine assigns identity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewObject {
    /// Caller-supplied id (assigned on create when absent)
    pub id: Option<ObjectId>,
    /// Caller-supplied timestamp (assigned on create when absent)
    pub timestamp: Option<Timestamp>,
    /// Identities the object is addressed to
    pub recipients: Vec<Identity>,
    /// Application fields
    pub payload: Map<String, Value>,
    /// Visibility rules
    pub contexts: Vec<Context>,
}

impl NewObject {
    /// Object addressed to the given recipients with a payload
    pub fn new(recipients: Vec<Identity>, payload: Map<String, Value>) -> Self {
        Self {
            recipients,
            payload,
            ..Default::default()
        }
    }

    /// Attach a context
    pub fn with_context(mut self, context: Context) -> Self {
        self.contexts.push(context);
        self
    }

    /// Parse the wire form: reserved `_id`, `_to`, `_timestamp` and
    /// `_contexts` keys alongside payload fields.
    pub fn from_wire(value: Value) -> Result<Self, String> {
        let Value::Object(mut map) = value else {
            return Err("object must be a JSON object".to_string());
        };

        let id = match map.remove(ID_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(
                ObjectId::parse(&raw).ok_or_else(|| format!("invalid object id '{}'", raw))?,
            ),
            Some(_) => return Err("_id must be a string".to_string()),
        };
        let timestamp = match map.remove(TIMESTAMP_FIELD) {
            None | Some(Value::Null) => None,
            Some(value) => Some(Timestamp(
                value
                    .as_i64()
                    .ok_or_else(|| "_timestamp must be an integer".to_string())?,
            )),
        };
        let recipients = match map.remove(RECIPIENTS_FIELD) {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| format!("_to must be a list of identities: {}", e))?,
            None => Vec::new(),
        };
        let contexts = match map.remove(CONTEXTS_FIELD) {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| format!("_contexts is malformed: {}", e))?,
            None => Vec::new(),
        };
        // Ownership is taken from the authenticated caller, never the payload.
        map.remove(OWNER_FIELD);

        Ok(Self {
            id,
            timestamp,
            recipients,
            payload: map,
            contexts,
        })
    }
}

/// A stored object with engine-assigned identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub id: ObjectId,
    pub owner: Identity,
    pub recipients: Vec<Identity>,
    pub timestamp: Timestamp,
    pub payload: Map<String, Value>,
    pub contexts: Vec<Context>,
}

impl Object {
    /// Derive the content id for an object's fields
    pub fn content_id(
        owner: &Identity,
        recipients: &[Identity],
        payload: &Map<String, Value>,
        contexts: &[Context],
        timestamp: Timestamp,
    ) -> ObjectId {
        // serde_json maps are key-sorted, so this encoding is canonical.
        let canonical = serde_json::json!({
            "owner": owner,
            "recipients": recipients,
            "payload": payload,
            "contexts": contexts,
            "timestamp": timestamp,
        });
        ObjectId::digest(canonical.to_string().as_bytes())
    }

    /// The document queries are evaluated against
    pub fn document(&self) -> Value {
        let mut map = self.payload.clone();
        map.insert(ID_FIELD.to_string(), Value::String(self.id.to_string()));
        map.insert(OWNER_FIELD.to_string(), Value::String(self.owner.to_string()));
        map.insert(
            RECIPIENTS_FIELD.to_string(),
            Value::Array(
                self.recipients
                    .iter()
                    .map(|r| Value::String(r.to_string()))
                    .collect(),
            ),
        );
        map.insert(TIMESTAMP_FIELD.to_string(), Value::from(self.timestamp.0));
        Value::Object(map)
    }

    /// The form pushed to subscribers. Contexts stay private to the owner.
    pub fn to_wire(&self) -> Value {
        self.document()
    }
}
