//! Structural validation for submitted objects.

use std::collections::HashSet;

use serde_json::{Map, Value};

use super::types::{Context, Identity, NewObject, PredicateGroup, RESERVED_PREFIX};
use crate::errors::{LiveError, LiveResult};

/// Check a submitted object before it reaches the store.
///
/// - recipients are non-empty and include the owner
/// - payload keys are non-empty and never use the reserved prefix
/// - every predicate group is non-empty with unique alternatives
pub fn validate_new(object: &NewObject, owner: &Identity) -> LiveResult<()> {
    if object.recipients.is_empty() {
        return Err(LiveError::validation("object must have at least one recipient"));
    }
    if !object.recipients.contains(owner) {
        return Err(LiveError::validation(format!(
            "owner '{}' must be among the recipients",
            owner
        )));
    }
    if object.recipients.iter().any(|r| r.as_str().is_empty()) {
        return Err(LiveError::validation("recipient identities must be non-empty"));
    }
    if let Some(ts) = object.timestamp {
        if ts.0 < 0 {
            return Err(LiveError::validation("timestamp must not be negative"));
        }
    }

    validate_fields(&object.payload, "payload")?;

    for (index, context) in object.contexts.iter().enumerate() {
        validate_context(context)
            .map_err(|e| LiveError::validation(format!("context {}: {}", index, e)))?;
    }

    Ok(())
}

fn validate_fields(fields: &Map<String, Value>, what: &str) -> LiveResult<()> {
    for key in fields.keys() {
        if key.is_empty() {
            return Err(LiveError::validation(format!("{} keys must be non-empty", what)));
        }
        if key.starts_with(RESERVED_PREFIX) {
            return Err(LiveError::validation(format!(
                "{} key '{}' uses the reserved '{}' prefix",
                what, key, RESERVED_PREFIX
            )));
        }
    }
    Ok(())
}

fn validate_context(context: &Context) -> Result<(), String> {
    for group in context.near_misses.iter().chain(context.neighbors.iter()) {
        validate_group(group)?;
    }
    Ok(())
}

fn validate_group(group: &PredicateGroup) -> Result<(), String> {
    let alternatives = group.alternatives();
    if alternatives.is_empty() {
        return Err("predicate groups must not be empty".to_string());
    }

    let mut seen = HashSet::new();
    for alternative in alternatives {
        validate_fields(alternative, "alternative").map_err(|e| e.to_string())?;
        // Maps serialize with sorted keys, so equal alternatives encode equally.
        let encoded = Value::Object(alternative.clone()).to_string();
        if !seen.insert(encoded) {
            return Err("predicate group alternatives must be unique".to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alice() -> Identity {
        Identity::new("alice")
    }

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_valid_object() {
        let object = NewObject::new(vec![alice()], payload(json!({"msg": "hi"})));
        assert!(validate_new(&object, &alice()).is_ok());
    }

    #[test]
    fn test_owner_must_be_recipient() {
        let object = NewObject::new(vec![Identity::new("bob")], Map::new());
        assert!(matches!(
            validate_new(&object, &alice()),
            Err(LiveError::Validation(_))
        ));

        let empty = NewObject::new(Vec::new(), Map::new());
        assert!(validate_new(&empty, &alice()).is_err());
    }

    #[test]
    fn test_reserved_payload_keys_rejected() {
        let object = NewObject::new(vec![alice()], payload(json!({"_by": "bob"})));
        assert!(validate_new(&object, &alice()).is_err());
    }

    #[test]
    fn test_predicate_groups() {
        let empty_group = NewObject::new(vec![alice()], Map::new()).with_context(Context {
            near_misses: vec![PredicateGroup::new(Vec::new())],
            neighbors: Vec::new(),
        });
        assert!(validate_new(&empty_group, &alice()).is_err());

        let duplicate = NewObject::new(vec![alice()], Map::new()).with_context(Context {
            near_misses: Vec::new(),
            neighbors: vec![PredicateGroup::new(vec![
                payload(json!({"a": 1, "b": 2})),
                payload(json!({"b": 2, "a": 1})),
            ])],
        });
        assert!(validate_new(&duplicate, &alice()).is_err());

        let reserved = NewObject::new(vec![alice()], Map::new()).with_context(Context {
            near_misses: vec![PredicateGroup::single(json!({"_to": ["bob"]}))],
            neighbors: Vec::new(),
        });
        assert!(validate_new(&reserved, &alice()).is_err());

        let fine = NewObject::new(vec![alice()], Map::new()).with_context(Context {
            near_misses: vec![PredicateGroup::single(json!({"flag": "x"}))],
            neighbors: vec![PredicateGroup::new(vec![
                payload(json!({"flag": "y"})),
                payload(json!({"flag": "z"})),
            ])],
        });
        assert!(validate_new(&fine, &alice()).is_ok());
    }
}
