//! # Context Rewriter
//!
//! Turns a caller's query into a predicate that also enforces the object's
//! visibility contexts. A context passes when no near-miss group matches the
//! query and every neighbor group does; an object is visible when it has no
//! contexts or any context passes.
//!
//! Each alternative in a group is a document of its own. The query is
//! evaluated against that document alone, so an alternative only matches
//! when it carries every field the query constrains.
//!
//! Rewriting is pure: the same query and caller always produce the same
//! predicate and fingerprint.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::object::{Context, Identity, Object, PredicateGroup, RECIPIENTS_FIELD};
use crate::query::{Evaluator, Query, QueryError, QueryResult};

/// Store-native predicate produced by the rewriter
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Predicate {
    /// Every inner predicate holds
    All { predicates: Vec<Predicate> },
    /// The object's own document matches the query
    Matches { query: Query },
    /// The object's contexts admit the query
    Visible { query: Query },
}

impl Predicate {
    /// Evaluate against an object with the default step budget
    pub fn matches(&self, object: &Object) -> QueryResult<bool> {
        self.evaluate(object, &mut Evaluator::default())
    }

    /// Evaluate against an object, sharing the evaluator's budget
    pub fn evaluate(&self, object: &Object, eval: &mut Evaluator) -> QueryResult<bool> {
        match self {
            Predicate::All { predicates } => {
                for predicate in predicates {
                    if !predicate.evaluate(object, eval)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Matches { query } => eval.query(query, &object.document()),
            Predicate::Visible { query } => visible(query, object, eval),
        }
    }
}

fn visible(query: &Query, object: &Object, eval: &mut Evaluator) -> QueryResult<bool> {
    if object.contexts.is_empty() {
        return Ok(true);
    }
    for context in &object.contexts {
        if context_passes(query, context, eval)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn context_passes(
    query: &Query,
    context: &Context,
    eval: &mut Evaluator,
) -> QueryResult<bool> {
    for group in &context.near_misses {
        if group_matches(query, group, eval)? {
            return Ok(false);
        }
    }
    for group in &context.neighbors {
        if !group_matches(query, group, eval)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn group_matches(query: &Query, group: &PredicateGroup, eval: &mut Evaluator) -> QueryResult<bool> {
    for alternative in group.alternatives() {
        if eval.query(query, &Value::Object(alternative.clone()))? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A rewritten query and its fingerprint
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenQuery {
    pub predicate: Predicate,
    pub fingerprint: String,
}

impl RewrittenQuery {
    /// Evaluate the predicate against an object
    pub fn matches(&self, object: &Object) -> QueryResult<bool> {
        self.predicate.matches(object)
    }
}

/// Stateless rewriter from caller queries to visibility-aware predicates
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextRewriter;

impl ContextRewriter {
    /// Create a rewriter
    pub fn new() -> Self {
        Self
    }

    /// Parse, scope-check and rewrite a JSON query for `caller`
    pub fn rewrite(&self, query: &Value, caller: &Identity) -> QueryResult<RewrittenQuery> {
        let query = Query::parse(query)?;
        self.rewrite_parsed(query, caller)
    }

    /// Scope-check and rewrite an already parsed query
    pub fn rewrite_parsed(&self, query: Query, caller: &Identity) -> QueryResult<RewrittenQuery> {
        check_identity_scope(&query, caller)?;

        let predicate = Predicate::All {
            predicates: vec![
                Predicate::Matches {
                    query: query.clone(),
                },
                Predicate::Visible { query },
            ],
        };
        let fingerprint = fingerprint(&predicate)?;

        Ok(RewrittenQuery {
            predicate,
            fingerprint,
        })
    }
}

/// A caller may only query recipients by their own identity.
fn check_identity_scope(query: &Query, caller: &Identity) -> QueryResult<()> {
    query.visit_fields(&mut |path, condition| {
        if path.root() != RECIPIENTS_FIELD {
            return Ok(());
        }
        match condition
            .string_literals()
            .into_iter()
            .find(|literal| *literal != caller.as_str())
        {
            Some(foreign) => Err(QueryError::ForeignRecipient(foreign.to_string())),
            None => Ok(()),
        }
    })
}

fn fingerprint(predicate: &Predicate) -> QueryResult<String> {
    // Struct fields serialize in declaration order and maps are key-sorted,
    // so equal predicates always encode to the same bytes.
    let encoded = serde_json::to_vec(predicate)
        .map_err(|e| QueryError::operand("predicate", e.to_string()))?;
    Ok(format!("{:x}", Sha256::digest(&encoded)))
}
