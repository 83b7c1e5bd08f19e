//! # Query AST
//!
//! Tagged representation of the constrained query language. Documents are
//! validated against the fixed operator set while parsing, so evaluation never
//! sees an operator it does not understand.

use serde::Serialize;
use serde_json::{Map, Value};

use super::errors::{QueryError, QueryResult};

/// Maximum nesting accepted by the parser
pub const MAX_QUERY_DEPTH: usize = 32;

/// A dotted field path such as `author.name` or `tags.0`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldPath(String);

impl FieldPath {
    /// Parse a dotted path, rejecting empty segments
    pub fn parse(raw: &str) -> QueryResult<Self> {
        if raw.is_empty() || raw.split('.').any(|segment| segment.is_empty()) {
            return Err(QueryError::InvalidPath(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// The path as written
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// First segment of the path
    pub fn root(&self) -> &str {
        self.segments().next().unwrap_or_default()
    }
}

/// JSON type names accepted by `$type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    Null,
    Bool,
    Number,
    Int,
    Double,
    String,
    Array,
    Object,
}

impl JsonType {
    fn parse(name: &str) -> QueryResult<Self> {
        Ok(match name {
            "null" => JsonType::Null,
            "bool" | "boolean" => JsonType::Bool,
            "number" => JsonType::Number,
            "int" | "long" => JsonType::Int,
            "double" => JsonType::Double,
            "string" => JsonType::String,
            "array" => JsonType::Array,
            "object" => JsonType::Object,
            other => return Err(QueryError::operand("$type", format!("unknown type '{}'", other))),
        })
    }

    /// Check whether a value has this type
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            JsonType::Null => value.is_null(),
            JsonType::Bool => value.is_boolean(),
            JsonType::Number => value.is_number(),
            JsonType::Int => value.is_i64() || value.is_u64(),
            JsonType::Double => value.is_f64(),
            JsonType::String => value.is_string(),
            JsonType::Array => value.is_array(),
            JsonType::Object => value.is_object(),
        }
    }
}

/// Array window applied by `$slice`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slice {
    /// Elements to skip; negative counts from the end
    pub skip: i64,
    /// Elements to keep after skipping (None = keep the rest)
    pub limit: Option<usize>,
}

impl Slice {
    /// Apply the window to a list of items
    pub fn apply<'a>(&self, items: &'a [Value]) -> &'a [Value] {
        let len = items.len() as i64;
        let start = if self.skip < 0 {
            (len + self.skip).max(0)
        } else {
            self.skip.min(len)
        } as usize;
        let end = match self.limit {
            Some(limit) => start.saturating_add(limit).min(items.len()),
            None => items.len(),
        };
        &items[start..end]
    }
}

/// Matcher used by `$elemMatch`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum ElemMatch {
    /// Elements are documents matched by a full query
    Query { query: Box<Query> },
    /// Elements are scalars matched by operators
    Operators { ops: Vec<FieldOp> },
}

/// A single field operator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldOp {
    Eq { value: Value },
    Ne { value: Value },
    Gt { value: Value },
    Gte { value: Value },
    Lt { value: Value },
    Lte { value: Value },
    In { values: Vec<Value> },
    Nin { values: Vec<Value> },
    All { values: Vec<Value> },
    Exists { exists: bool },
    Type { json_type: JsonType },
    Size { len: usize },
    ElemMatch { matcher: ElemMatch },
    Not { condition: Box<Condition> },
    Slice { slice: Slice },
}

/// Condition applied to the values found at a field path
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Implicit equality with a literal
    Literal { value: Value },
    /// One or more operators, all of which must hold
    Operators { ops: Vec<FieldOp> },
}

/// A parsed query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Query {
    And { clauses: Vec<Query> },
    Or { clauses: Vec<Query> },
    Nor { clauses: Vec<Query> },
    Not { clause: Box<Query> },
    Field { path: FieldPath, condition: Condition },
}

impl Query {
    /// Parse a JSON query document
    pub fn parse(value: &Value) -> QueryResult<Query> {
        parse_query(value, 0)
    }

    /// A query that matches every document
    pub fn match_all() -> Query {
        Query::And {
            clauses: Vec::new(),
        }
    }

    /// Visit every field clause, including those nested in `$elemMatch`
    pub fn visit_fields<F>(&self, visit: &mut F) -> QueryResult<()>
    where
        F: FnMut(&FieldPath, &Condition) -> QueryResult<()>,
    {
        match self {
            Query::And { clauses } | Query::Or { clauses } | Query::Nor { clauses } => {
                for clause in clauses {
                    clause.visit_fields(visit)?;
                }
                Ok(())
            }
            Query::Not { clause } => clause.visit_fields(visit),
            Query::Field { path, condition } => {
                visit(path, condition)?;
                condition.visit_nested(visit)
            }
        }
    }
}

impl Query {
    fn collect_strings<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Query::And { clauses } | Query::Or { clauses } | Query::Nor { clauses } => {
                for clause in clauses {
                    clause.collect_strings(out);
                }
            }
            Query::Not { clause } => clause.collect_strings(out),
            Query::Field { condition, .. } => condition.collect_strings(out),
        }
    }
}

impl Condition {
    /// Every string literal the condition compares against
    pub fn string_literals(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_strings(&mut out);
        out
    }

    fn collect_strings<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Literal { value } => strings_in(value, out),
            Condition::Operators { ops } => {
                for op in ops {
                    op.collect_strings(out);
                }
            }
        }
    }

    fn visit_nested<F>(&self, visit: &mut F) -> QueryResult<()>
    where
        F: FnMut(&FieldPath, &Condition) -> QueryResult<()>,
    {
        let Condition::Operators { ops } = self else {
            return Ok(());
        };
        for op in ops {
            match op {
                FieldOp::ElemMatch {
                    matcher: ElemMatch::Query { query },
                } => query.visit_fields(visit)?,
                FieldOp::Not { condition } => condition.visit_nested(visit)?,
                _ => {}
            }
        }
        Ok(())
    }
}

impl FieldOp {
    fn collect_strings<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            FieldOp::Eq { value }
            | FieldOp::Ne { value }
            | FieldOp::Gt { value }
            | FieldOp::Gte { value }
            | FieldOp::Lt { value }
            | FieldOp::Lte { value } => strings_in(value, out),
            FieldOp::In { values } | FieldOp::Nin { values } | FieldOp::All { values } => {
                for value in values {
                    strings_in(value, out);
                }
            }
            FieldOp::ElemMatch { matcher } => match matcher {
                ElemMatch::Operators { ops } => {
                    for op in ops {
                        op.collect_strings(out);
                    }
                }
                // Element documents may hold the identity under any key.
                ElemMatch::Query { query } => query.collect_strings(out),
            },
            FieldOp::Not { condition } => condition.collect_strings(out),
            FieldOp::Exists { .. }
            | FieldOp::Type { .. }
            | FieldOp::Size { .. }
            | FieldOp::Slice { .. } => {}
        }
    }
}

fn strings_in<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|item| strings_in(item, out)),
        Value::Object(map) => map.values().for_each(|item| strings_in(item, out)),
        _ => {}
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_depth(depth: usize) -> QueryResult<()> {
    if depth > MAX_QUERY_DEPTH {
        return Err(QueryError::TooDeep(MAX_QUERY_DEPTH));
    }
    Ok(())
}

fn parse_query(value: &Value, depth: usize) -> QueryResult<Query> {
    check_depth(depth)?;
    let map = value
        .as_object()
        .ok_or_else(|| QueryError::NotAnObject(kind_of(value).to_string()))?;

    let mut clauses = Vec::with_capacity(map.len());
    for (key, operand) in map {
        let clause = match key.as_str() {
            "$and" => Query::And {
                clauses: parse_clause_list(key, operand, depth)?,
            },
            "$or" => Query::Or {
                clauses: parse_clause_list(key, operand, depth)?,
            },
            "$nor" => Query::Nor {
                clauses: parse_clause_list(key, operand, depth)?,
            },
            "$not" => Query::Not {
                clause: Box::new(parse_query(operand, depth + 1)?),
            },
            other if other.starts_with('$') => {
                return Err(QueryError::OperatorNotAllowed(other.to_string()))
            }
            field => Query::Field {
                path: FieldPath::parse(field)?,
                condition: parse_condition(field, operand, depth + 1)?,
            },
        };
        clauses.push(clause);
    }

    if clauses.len() == 1 {
        if let Some(only) = clauses.pop() {
            return Ok(only);
        }
    }
    Ok(Query::And { clauses })
}

fn parse_clause_list(operator: &str, operand: &Value, depth: usize) -> QueryResult<Vec<Query>> {
    let items = operand
        .as_array()
        .ok_or_else(|| QueryError::operand(operator, "expected an array of queries"))?;
    if items.is_empty() {
        return Err(QueryError::operand(operator, "expected at least one query"));
    }
    items
        .iter()
        .map(|item| parse_query(item, depth + 1))
        .collect()
}

fn is_operator_document(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().any(|key| key.starts_with('$'))
}

fn parse_condition(field: &str, operand: &Value, depth: usize) -> QueryResult<Condition> {
    check_depth(depth)?;
    match operand {
        Value::Object(map) if is_operator_document(map) => {
            if map.keys().any(|key| !key.starts_with('$')) {
                return Err(QueryError::MixedCondition(field.to_string()));
            }
            Ok(Condition::Operators {
                ops: parse_operators(map, depth)?,
            })
        }
        literal => Ok(Condition::Literal {
            value: literal.clone(),
        }),
    }
}

fn parse_operators(map: &Map<String, Value>, depth: usize) -> QueryResult<Vec<FieldOp>> {
    map.iter()
        .map(|(operator, operand)| parse_operator(operator, operand, depth))
        .collect()
}

fn parse_operator(operator: &str, operand: &Value, depth: usize) -> QueryResult<FieldOp> {
    let value = || operand.clone();
    let list = || -> QueryResult<Vec<Value>> {
        operand
            .as_array()
            .cloned()
            .ok_or_else(|| QueryError::operand(operator, "expected an array"))
    };

    Ok(match operator {
        "$eq" => FieldOp::Eq { value: value() },
        "$ne" => FieldOp::Ne { value: value() },
        "$gt" => FieldOp::Gt { value: value() },
        "$gte" => FieldOp::Gte { value: value() },
        "$lt" => FieldOp::Lt { value: value() },
        "$lte" => FieldOp::Lte { value: value() },
        "$in" => FieldOp::In { values: list()? },
        "$nin" => FieldOp::Nin { values: list()? },
        "$all" => FieldOp::All { values: list()? },
        "$exists" => FieldOp::Exists {
            exists: match operand {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                _ => return Err(QueryError::operand(operator, "expected a boolean")),
            },
        },
        "$type" => FieldOp::Type {
            json_type: match operand {
                Value::String(name) => JsonType::parse(name)?,
                _ => return Err(QueryError::operand(operator, "expected a type name")),
            },
        },
        "$size" => FieldOp::Size {
            len: operand
                .as_u64()
                .map(|n| n as usize)
                .ok_or_else(|| QueryError::operand(operator, "expected a non-negative integer"))?,
        },
        "$elemMatch" => FieldOp::ElemMatch {
            matcher: parse_elem_match(operand, depth + 1)?,
        },
        "$not" => match operand {
            Value::Object(map) if is_operator_document(map) => FieldOp::Not {
                condition: Box::new(parse_condition("$not", operand, depth + 1)?),
            },
            _ => return Err(QueryError::operand(operator, "expected an operator document")),
        },
        "$slice" => FieldOp::Slice {
            slice: parse_slice(operand)?,
        },
        other => return Err(QueryError::OperatorNotAllowed(other.to_string())),
    })
}

fn parse_elem_match(operand: &Value, depth: usize) -> QueryResult<ElemMatch> {
    check_depth(depth)?;
    let map = operand
        .as_object()
        .ok_or_else(|| QueryError::operand("$elemMatch", "expected a document"))?;

    let logical = ["$and", "$or", "$nor"];
    let operator_form = !map.is_empty()
        && map
            .keys()
            .all(|key| key.starts_with('$') && !logical.contains(&key.as_str()));

    if operator_form {
        Ok(ElemMatch::Operators {
            ops: parse_operators(map, depth)?,
        })
    } else {
        Ok(ElemMatch::Query {
            query: Box::new(parse_query(operand, depth)?),
        })
    }
}

fn parse_slice(operand: &Value) -> QueryResult<Slice> {
    match operand {
        Value::Number(n) => {
            let n = n
                .as_i64()
                .ok_or_else(|| QueryError::operand("$slice", "expected an integer"))?;
            if n >= 0 {
                Ok(Slice {
                    skip: 0,
                    limit: Some(n as usize),
                })
            } else {
                Ok(Slice {
                    skip: n,
                    limit: None,
                })
            }
        }
        Value::Array(pair) if pair.len() == 2 => {
            let skip = pair[0]
                .as_i64()
                .ok_or_else(|| QueryError::operand("$slice", "skip must be an integer"))?;
            let limit = pair[1]
                .as_u64()
                .filter(|limit| *limit > 0)
                .ok_or_else(|| QueryError::operand("$slice", "limit must be a positive integer"))?;
            Ok(Slice {
                skip,
                limit: Some(limit as usize),
            })
        }
        _ => Err(QueryError::operand("$slice", "expected n or [skip, n]")),
    }
}
