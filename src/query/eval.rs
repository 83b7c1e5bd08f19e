//! # Query Evaluation
//!
//! Matches parsed queries against JSON documents with document-store
//! semantics: dotted paths traverse arrays, equality against an array also
//! matches its elements, and a missing field compares equal to `null`.
//!
//! Every evaluation runs against a step budget so that a pathological
//! query/document pair fails instead of monopolising the matcher.

use std::borrow::Cow;
use std::cmp::Ordering;

use serde_json::Value;

use super::ast::{Condition, ElemMatch, FieldOp, FieldPath, Query};
use super::errors::{QueryError, QueryResult};

/// Default number of steps a single evaluation may take
pub const DEFAULT_EVAL_BUDGET: usize = 100_000;

/// Stateful evaluator carrying the remaining step budget
#[derive(Debug)]
pub struct Evaluator {
    budget: usize,
    remaining: usize,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::with_budget(DEFAULT_EVAL_BUDGET)
    }
}

impl Query {
    /// Evaluate this query against a document with the default budget
    pub fn matches(&self, document: &Value) -> QueryResult<bool> {
        Evaluator::default().query(self, document)
    }
}

impl Evaluator {
    /// Create an evaluator with a custom step budget
    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget,
            remaining: budget,
        }
    }

    fn tick(&mut self) -> QueryResult<()> {
        if self.remaining == 0 {
            return Err(QueryError::BudgetExhausted(self.budget));
        }
        self.remaining -= 1;
        Ok(())
    }

    /// Evaluate a query against a document
    pub fn query(&mut self, query: &Query, document: &Value) -> QueryResult<bool> {
        self.tick()?;
        match query {
            Query::And { clauses } => {
                for clause in clauses {
                    if !self.query(clause, document)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Query::Or { clauses } => {
                for clause in clauses {
                    if self.query(clause, document)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Query::Nor { clauses } => {
                for clause in clauses {
                    if self.query(clause, document)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Query::Not { clause } => Ok(!self.query(clause, document)?),
            Query::Field { path, condition } => {
                let candidates = self.resolve_path(document, path)?;
                let candidates: Vec<Cow<'_, Value>> =
                    candidates.into_iter().map(Cow::Borrowed).collect();
                self.condition(condition, candidates)
            }
        }
    }

    fn resolve_path<'v>(&mut self, document: &'v Value, path: &FieldPath) -> QueryResult<Vec<&'v Value>> {
        let segments: Vec<&str> = path.segments().collect();
        let mut out = Vec::new();
        self.resolve(document, &segments, &mut out)?;
        Ok(out)
    }

    fn resolve<'v>(&mut self, value: &'v Value, segments: &[&str], out: &mut Vec<&'v Value>) -> QueryResult<()> {
        self.tick()?;
        let Some((head, rest)) = segments.split_first() else {
            out.push(value);
            return Ok(());
        };

        match value {
            Value::Object(map) => {
                if let Some(child) = map.get(*head) {
                    self.resolve(child, rest, out)?;
                }
            }
            Value::Array(items) => {
                if let Ok(index) = head.parse::<usize>() {
                    if let Some(item) = items.get(index) {
                        self.resolve(item, rest, out)?;
                    }
                }
                for item in items.iter().filter(|item| item.is_object()) {
                    self.resolve(item, segments, out)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn condition(&mut self, condition: &Condition, candidates: Vec<Cow<'_, Value>>) -> QueryResult<bool> {
        self.tick()?;
        match condition {
            Condition::Literal { value } => self.equals(&candidates, value),
            Condition::Operators { ops } => {
                // $slice narrows the candidates for its sibling operators.
                let mut candidates = candidates;
                for op in ops {
                    if let FieldOp::Slice { slice } = op {
                        candidates = candidates
                            .into_iter()
                            .map(|candidate| match candidate.as_ref() {
                                Value::Array(items) => {
                                    Cow::Owned(Value::Array(slice.apply(items).to_vec()))
                                }
                                _ => candidate,
                            })
                            .collect();
                    }
                }
                for op in ops {
                    if !self.operator(op, &candidates)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    fn operator(&mut self, op: &FieldOp, candidates: &[Cow<'_, Value>]) -> QueryResult<bool> {
        self.tick()?;
        match op {
            FieldOp::Eq { value } => self.equals(candidates, value),
            FieldOp::Ne { value } => Ok(!self.equals(candidates, value)?),
            FieldOp::Gt { value } => self.compares(candidates, value, |o| o == Ordering::Greater),
            FieldOp::Gte { value } => self.compares(candidates, value, |o| o != Ordering::Less),
            FieldOp::Lt { value } => self.compares(candidates, value, |o| o == Ordering::Less),
            FieldOp::Lte { value } => self.compares(candidates, value, |o| o != Ordering::Greater),
            FieldOp::In { values } => self.in_list(candidates, values),
            FieldOp::Nin { values } => Ok(!self.in_list(candidates, values)?),
            FieldOp::All { values } => {
                if values.is_empty() {
                    return Ok(false);
                }
                for value in values {
                    if !self.equals(candidates, value)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            FieldOp::Exists { exists } => Ok(candidates.is_empty() != *exists),
            FieldOp::Type { json_type } => self.any_value(candidates, |v| json_type.matches(v)),
            FieldOp::Size { len } => Ok(candidates
                .iter()
                .any(|c| c.as_array().map(|items| items.len() == *len).unwrap_or(false))),
            FieldOp::ElemMatch { matcher } => self.elem_match(candidates, matcher),
            FieldOp::Not { condition } => Ok(!self.condition(condition, candidates.to_vec())?),
            FieldOp::Slice { .. } => Ok(true),
        }
    }

    /// Visit each candidate and, for array candidates, each element.
    fn any_value<F>(&mut self, candidates: &[Cow<'_, Value>], mut test: F) -> QueryResult<bool>
    where
        F: FnMut(&Value) -> bool,
    {
        for candidate in candidates {
            self.tick()?;
            if test(candidate.as_ref()) {
                return Ok(true);
            }
            if let Value::Array(items) = candidate.as_ref() {
                for item in items {
                    self.tick()?;
                    if test(item) {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn equals(&mut self, candidates: &[Cow<'_, Value>], expected: &Value) -> QueryResult<bool> {
        if expected.is_null() && candidates.is_empty() {
            return Ok(true);
        }
        self.any_value(candidates, |value| value == expected)
    }

    fn in_list(&mut self, candidates: &[Cow<'_, Value>], values: &[Value]) -> QueryResult<bool> {
        for value in values {
            if self.equals(candidates, value)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn compares<F>(&mut self, candidates: &[Cow<'_, Value>], bound: &Value, accept: F) -> QueryResult<bool>
    where
        F: Fn(Ordering) -> bool,
    {
        self.any_value(candidates, |value| {
            compare_values(value, bound).map(&accept).unwrap_or(false)
        })
    }

    fn elem_match(&mut self, candidates: &[Cow<'_, Value>], matcher: &ElemMatch) -> QueryResult<bool> {
        for candidate in candidates {
            let Value::Array(items) = candidate.as_ref() else {
                continue;
            };
            for item in items {
                let matched = match matcher {
                    ElemMatch::Query { query } => item.is_object() && self.query(query, item)?,
                    ElemMatch::Operators { ops } => {
                        let single = [Cow::Borrowed(item)];
                        let mut all = true;
                        for op in ops {
                            if !self.operator(op, &single)? {
                                all = false;
                                break;
                            }
                        }
                        all
                    }
                };
                if matched {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// Order two values of the same kind; values of different kinds are unordered
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return Some(a.cmp(&b));
            }
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(query: Value, doc: Value) -> bool {
        Query::parse(&query).unwrap().matches(&doc).unwrap()
    }

    #[test]
    fn test_equality_and_missing_fields() {
        let doc = json!({"name": "Alice", "age": 30});
        assert!(check(json!({"name": "Alice"}), doc.clone()));
        assert!(!check(json!({"name": "Bob"}), doc.clone()));
        assert!(check(json!({"missing": null}), doc.clone()));
        assert!(check(json!({"missing": {"$ne": 1}}), doc.clone()));
        assert!(!check(json!({"age": "30"}), doc));
    }

    #[test]
    fn test_array_semantics() {
        let doc = json!({"tags": ["a", "b"], "items": [{"n": 1}, {"n": 5}]});
        assert!(check(json!({"tags": "a"}), doc.clone()));
        assert!(check(json!({"tags": ["a", "b"]}), doc.clone()));
        assert!(check(json!({"items.n": 5}), doc.clone()));
        assert!(check(json!({"tags.1": "b"}), doc.clone()));
        assert!(check(json!({"tags": {"$all": ["b", "a"]}}), doc.clone()));
        assert!(check(json!({"tags": {"$size": 2}}), doc.clone()));
        assert!(!check(json!({"tags": {"$size": 3}}), doc));
    }

    #[test]
    fn test_comparisons_same_kind_only() {
        let doc = json!({"age": 25, "name": "m"});
        assert!(check(json!({"age": {"$gte": 18, "$lt": 30}}), doc.clone()));
        assert!(!check(json!({"age": {"$gt": 25}}), doc.clone()));
        assert!(!check(json!({"age": {"$gt": "1"}}), doc.clone()));
        assert!(check(json!({"name": {"$gt": "a"}}), doc));
    }

    #[test]
    fn test_membership() {
        let doc = json!({"status": "draft"});
        assert!(check(json!({"status": {"$in": ["draft", "live"]}}), doc.clone()));
        assert!(!check(json!({"status": {"$nin": ["draft"]}}), doc.clone()));
        assert!(check(json!({"other": {"$nin": ["draft"]}}), doc));
    }

    #[test]
    fn test_logical_combinators() {
        let doc = json!({"a": 1, "b": 2});
        assert!(check(json!({"$or": [{"a": 2}, {"b": 2}]}), doc.clone()));
        assert!(!check(json!({"$and": [{"a": 1}, {"b": 3}]}), doc.clone()));
        assert!(check(json!({"$nor": [{"a": 2}, {"b": 3}]}), doc.clone()));
        assert!(check(json!({"$not": {"a": 2}}), doc.clone()));
        assert!(check(json!({"a": {"$not": {"$gt": 5}}}), doc));
    }

    #[test]
    fn test_exists_and_type() {
        let doc = json!({"a": 1.5, "b": null, "c": [1]});
        assert!(check(json!({"a": {"$exists": true}}), doc.clone()));
        assert!(check(json!({"z": {"$exists": false}}), doc.clone()));
        assert!(check(json!({"b": {"$exists": true, "$type": "null"}}), doc.clone()));
        assert!(check(json!({"a": {"$type": "double"}}), doc.clone()));
        assert!(check(json!({"c": {"$type": "array"}}), doc.clone()));
        assert!(check(json!({"c": {"$type": "int"}}), doc));
    }

    #[test]
    fn test_elem_match() {
        let doc = json!({"scores": [3, 8], "people": [{"name": "a", "age": 4}, {"name": "b", "age": 9}]});
        assert!(check(json!({"scores": {"$elemMatch": {"$gt": 5, "$lt": 10}}}), doc.clone()));
        assert!(!check(json!({"scores": {"$elemMatch": {"$gt": 8}}}), doc.clone()));
        assert!(check(json!({"people": {"$elemMatch": {"name": "b", "age": {"$gt": 5}}}}), doc.clone()));
        assert!(!check(json!({"people": {"$elemMatch": {"name": "a", "age": {"$gt": 5}}}}), doc));
    }

    #[test]
    fn test_slice_narrows_siblings() {
        let doc = json!({"xs": [1, 2, 3, 4]});
        assert!(check(json!({"xs": {"$slice": 2, "$all": [1, 2]}}), doc.clone()));
        assert!(!check(json!({"xs": {"$slice": 2, "$all": [4]}}), doc.clone()));
        assert!(check(json!({"xs": {"$slice": -1, "$eq": 4}}), doc.clone()));
        assert!(check(json!({"xs": {"$slice": [1, 2], "$size": 2}}), doc));
    }

    #[test]
    fn test_budget_exhaustion() {
        let doc = json!({"xs": (0..100).collect::<Vec<_>>()});
        let query = Query::parse(&json!({"xs": {"$in": [1000, 1001, 1002]}})).unwrap();
        let result = Evaluator::with_budget(50).query(&query, &doc);
        assert!(matches!(result, Err(QueryError::BudgetExhausted(50))));
        assert!(!query.matches(&doc).unwrap());
    }
}
