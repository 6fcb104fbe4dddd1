//! Predicate language for decision points and step guards
//!
//! Predicates are a closed set of typed expressions over a StepResult. They
//! are parsed into an AST and interpreted; nothing is ever executed as code.
//!
//! ```text
//! output.entity_count > 10 && confidence >= 0.8
//! !success || rationale contains "partial"
//! exists output.tables
//! ```
//!
//! Field roots: `success`, `uncertainty`, `confidence`, `rationale`, `output`.
//! Any other root is shorthand for a path inside `output`.

mod parser;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::types::StepResult;

/// Predicate parse errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PredicateError {
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),

    #[error("expected {expected} at offset {offset}, found {found}")]
    Expected {
        expected: String,
        found: String,
        offset: usize,
    },

    #[error("empty expression")]
    Empty,
}

/// Dotted path into a StepResult
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new(path: &str) -> Self {
        Self {
            segments: path
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Resolve against a result; `None` when the path does not exist
    pub fn resolve(&self, result: &StepResult) -> Option<Value> {
        let (root, rest) = self.segments.split_first()?;
        match root.as_str() {
            "success" if rest.is_empty() => Some(Value::Bool(result.success)),
            "uncertainty" if rest.is_empty() => number(result.uncertainty),
            "confidence" if rest.is_empty() => number(result.confidence()),
            "rationale" if rest.is_empty() => Some(Value::String(result.rationale.clone())),
            "output" => walk(&result.output, rest),
            _ => walk(&result.output, &self.segments),
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

fn number(value: f64) -> Option<Value> {
    serde_json::Number::from_f64(value).map(Value::Number)
}

fn walk(value: &Value, segments: &[String]) -> Option<Value> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Contains => "contains",
        }
    }
}

/// Side-effect-free predicate over a StepResult
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Literal(bool),
    /// Field is present and truthy
    Truthy(FieldPath),
    /// Field is present and not null
    Exists(FieldPath),
    Compare {
        field: FieldPath,
        op: CompareOp,
        value: Value,
    },
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Parse an expression
    pub fn parse(input: &str) -> Result<Self, PredicateError> {
        parser::parse(input)
    }

    /// Start a comparison on a field
    pub fn field(path: &str) -> FieldBuilder {
        FieldBuilder {
            field: FieldPath::new(path),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut items) => {
                items.push(other);
                Predicate::And(items)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut items) => {
                items.push(other);
                Predicate::Or(items)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Evaluate against a result
    pub fn evaluate(&self, result: &StepResult) -> bool {
        match self {
            Predicate::Literal(value) => *value,
            Predicate::Truthy(field) => field.resolve(result).map(|v| truthy(&v)).unwrap_or(false),
            Predicate::Exists(field) => field
                .resolve(result)
                .map(|v| !v.is_null())
                .unwrap_or(false),
            Predicate::Compare { field, op, value } => match field.resolve(result) {
                Some(actual) => compare(&actual, *op, value),
                // Missing fields only satisfy inequality
                None => *op == CompareOp::Ne,
            },
            Predicate::Not(inner) => !inner.evaluate(result),
            Predicate::And(items) => items.iter().all(|p| p.evaluate(result)),
            Predicate::Or(items) => items.iter().any(|p| p.evaluate(result)),
        }
    }
}

/// Fluent builder returned by [`Predicate::field`]
pub struct FieldBuilder {
    field: FieldPath,
}

impl FieldBuilder {
    fn cmp(self, op: CompareOp, value: impl Into<Value>) -> Predicate {
        Predicate::Compare {
            field: self.field,
            op,
            value: value.into(),
        }
    }

    pub fn eq(self, value: impl Into<Value>) -> Predicate {
        self.cmp(CompareOp::Eq, value)
    }

    pub fn ne(self, value: impl Into<Value>) -> Predicate {
        self.cmp(CompareOp::Ne, value)
    }

    pub fn gt(self, value: impl Into<Value>) -> Predicate {
        self.cmp(CompareOp::Gt, value)
    }

    pub fn ge(self, value: impl Into<Value>) -> Predicate {
        self.cmp(CompareOp::Ge, value)
    }

    pub fn lt(self, value: impl Into<Value>) -> Predicate {
        self.cmp(CompareOp::Lt, value)
    }

    pub fn le(self, value: impl Into<Value>) -> Predicate {
        self.cmp(CompareOp::Le, value)
    }

    pub fn contains(self, value: impl Into<Value>) -> Predicate {
        self.cmp(CompareOp::Contains, value)
    }

    pub fn exists(self) -> Predicate {
        Predicate::Exists(self.field)
    }

    pub fn truthy(self) -> Predicate {
        Predicate::Truthy(self.field)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn compare(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(actual, expected),
        CompareOp::Ne => !values_equal(actual, expected),
        CompareOp::Gt => numeric(actual, expected, |a, b| a > b),
        CompareOp::Ge => numeric(actual, expected, |a, b| a >= b),
        CompareOp::Lt => numeric(actual, expected, |a, b| a < b),
        CompareOp::Le => numeric(actual, expected, |a, b| a <= b),
        CompareOp::Contains => match actual {
            Value::String(s) => expected.as_str().map(|e| s.contains(e)).unwrap_or(false),
            Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
            Value::Object(map) => expected
                .as_str()
                .map(|key| map.contains_key(key))
                .unwrap_or(false),
            _ => false,
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn numeric(a: &Value, b: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => cmp(x, y),
        _ => false,
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Literal(value) => write!(f, "{}", value),
            Predicate::Truthy(field) => write!(f, "{}", field),
            Predicate::Exists(field) => write!(f, "exists {}", field),
            Predicate::Compare { field, op, value } => {
                write!(f, "{} {} {}", field, op.as_str(), value)
            }
            Predicate::Not(inner) => write!(f, "!({})", inner),
            Predicate::And(items) => write_joined(f, items, " && "),
            Predicate::Or(items) => write_joined(f, items, " || "),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Predicate], sep: &str) -> fmt::Result {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            f.write_str(sep)?;
        }
        match item {
            Predicate::And(_) | Predicate::Or(_) => write!(f, "({})", item)?,
            _ => write!(f, "{}", item)?,
        }
    }
    Ok(())
}

impl Serialize for Predicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Predicate::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(output: Value, uncertainty: f64) -> StepResult {
        StepResult::success(output, uncertainty, "ok")
    }

    #[test]
    fn test_compare_output_fields() {
        let r = result(json!({"entity_count": 12, "kind": "invoice"}), 0.1);
        assert!(Predicate::field("output.entity_count").gt(10).evaluate(&r));
        assert!(Predicate::field("entity_count").ge(12).evaluate(&r));
        assert!(!Predicate::field("entity_count").lt(12).evaluate(&r));
        assert!(Predicate::field("kind").eq("invoice").evaluate(&r));
        assert!(Predicate::field("missing").ne(1).evaluate(&r));
        assert!(!Predicate::field("missing").gt(1).evaluate(&r));
    }

    #[test]
    fn test_builtin_fields() {
        let r = result(json!(null), 0.25);
        assert!(Predicate::field("confidence").ge(0.75).evaluate(&r));
        assert!(Predicate::field("uncertainty").lt(0.3).evaluate(&r));
        assert!(Predicate::field("success").truthy().evaluate(&r));
        assert!(Predicate::field("rationale").contains("o").evaluate(&r));

        let failed = StepResult::failure("boom");
        assert!(!Predicate::field("success").truthy().evaluate(&failed));
    }

    #[test]
    fn test_contains_and_exists() {
        let r = result(json!({"tags": ["a", "b"], "meta": {"lang": "en"}}), 0.0);
        assert!(Predicate::field("tags").contains("b").evaluate(&r));
        assert!(!Predicate::field("tags").contains("c").evaluate(&r));
        assert!(Predicate::field("meta").contains("lang").evaluate(&r));
        assert!(Predicate::field("tags.1").eq("b").evaluate(&r));
        assert!(Predicate::field("meta.lang").exists().evaluate(&r));
        assert!(!Predicate::field("meta.country").exists().evaluate(&r));
    }

    #[test]
    fn test_combinators() {
        let r = result(json!({"n": 5}), 0.0);
        let p = Predicate::field("n")
            .gt(1)
            .and(Predicate::field("n").lt(10))
            .or(Predicate::Literal(false));
        assert!(p.evaluate(&r));
        assert!(!p.clone().negate().evaluate(&r));
    }

    #[test]
    fn test_display_round_trips_through_parser() {
        let p = Predicate::field("entity_count")
            .gt(10)
            .and(Predicate::field("confidence").ge(0.5).or(Predicate::field("kind").eq("memo")));
        let text = p.to_string();
        let reparsed = Predicate::parse(&text).expect("reparse");
        assert_eq!(reparsed, p);
    }
}
