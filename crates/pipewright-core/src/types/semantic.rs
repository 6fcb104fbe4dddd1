//! Semantic type definitions
//!
//! A SemanticType is a base data kind (FILE, TEXT, ...) with an optional
//! domain tag. Tools declare the types they accept and produce; the planner
//! and DAG builder connect tools whose types are compatible.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Closed set of base data kinds flowing between tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BaseType {
    File,
    Text,
    Entities,
    Relationships,
    Graph,
    Table,
    Vector,
}

impl BaseType {
    pub const ALL: [BaseType; 7] = [
        BaseType::File,
        BaseType::Text,
        BaseType::Entities,
        BaseType::Relationships,
        BaseType::Graph,
        BaseType::Table,
        BaseType::Vector,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BaseType::File => "FILE",
            BaseType::Text => "TEXT",
            BaseType::Entities => "ENTITIES",
            BaseType::Relationships => "RELATIONSHIPS",
            BaseType::Graph => "GRAPH",
            BaseType::Table => "TABLE",
            BaseType::Vector => "VECTOR",
        }
    }
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a type name
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeParseError {
    #[error("unknown base type: {0}")]
    UnknownBase(String),

    #[error("empty domain tag in type: {0}")]
    EmptyDomain(String),
}

impl FromStr for BaseType {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        BaseType::ALL
            .iter()
            .copied()
            .find(|base| base.as_str() == upper)
            .ok_or_else(|| TypeParseError::UnknownBase(s.to_string()))
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
struct TypeKey {
    base: BaseType,
    domain: Option<String>,
}

/// A base type plus an optional domain tag.
///
/// Cheap to clone. Equality compares values; `same_instance` tells whether two
/// handles came from the same interned registration.
#[derive(Clone)]
pub struct SemanticType {
    key: Arc<TypeKey>,
}

impl SemanticType {
    /// Create an un-interned type. Prefer [`TypeRegistry::register_type`].
    pub fn new(base: BaseType, domain: Option<&str>) -> Self {
        Self {
            key: Arc::new(TypeKey {
                base,
                domain: domain.map(str::to_string),
            }),
        }
    }

    /// Type without a domain tag (wildcard domain)
    pub fn of(base: BaseType) -> Self {
        Self::new(base, None)
    }

    pub fn base(&self) -> BaseType {
        self.key.base
    }

    pub fn domain(&self) -> Option<&str> {
        self.key.domain.as_deref()
    }

    /// Whether a value of this (output) type may feed the given input type
    pub fn feeds(&self, input: &SemanticType) -> bool {
        is_compatible(self, input)
    }

    pub fn same_instance(a: &SemanticType, b: &SemanticType) -> bool {
        Arc::ptr_eq(&a.key, &b.key)
    }
}

/// True iff base types are equal and the domains are equal or either is unset.
pub fn is_compatible(output_type: &SemanticType, input_type: &SemanticType) -> bool {
    if output_type.base() != input_type.base() {
        return false;
    }
    match (output_type.domain(), input_type.domain()) {
        (Some(out), Some(inp)) => out == inp,
        _ => true,
    }
}

impl PartialEq for SemanticType {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for SemanticType {}

impl std::hash::Hash for SemanticType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for SemanticType {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SemanticType {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.base(), self.domain()).cmp(&(other.base(), other.domain()))
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.domain() {
            Some(domain) => write!(f, "{}:{}", self.base(), domain),
            None => write!(f, "{}", self.base()),
        }
    }
}

impl fmt::Debug for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SemanticType({})", self)
    }
}

impl FromStr for SemanticType {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((base, domain)) => {
                let domain = domain.trim();
                if domain.is_empty() {
                    return Err(TypeParseError::EmptyDomain(s.to_string()));
                }
                Ok(Self::new(base.parse()?, Some(domain)))
            }
            None => Ok(Self::of(s.parse()?)),
        }
    }
}

impl Serialize for SemanticType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SemanticType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Interning registry for semantic types.
///
/// Built once at startup and then shared read-only.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<TypeKey, SemanticType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or return the interned type for `(base, domain)`.
    pub fn register_type(&mut self, base: BaseType, domain: Option<&str>) -> SemanticType {
        let key = TypeKey {
            base,
            domain: domain.map(str::to_string),
        };
        self.types
            .entry(key.clone())
            .or_insert_with(|| SemanticType { key: Arc::new(key) })
            .clone()
    }

    /// Look up an interned type without registering it
    pub fn get(&self, base: BaseType, domain: Option<&str>) -> Option<SemanticType> {
        let key = TypeKey {
            base,
            domain: domain.map(str::to_string),
        };
        self.types.get(&key).cloned()
    }

    pub fn is_compatible(&self, output_type: &SemanticType, input_type: &SemanticType) -> bool {
        is_compatible(output_type, input_type)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_type_is_interned() {
        let mut registry = TypeRegistry::new();
        let a = registry.register_type(BaseType::Text, Some("business_document"));
        let b = registry.register_type(BaseType::Text, Some("business_document"));
        assert_eq!(a, b);
        assert!(SemanticType::same_instance(&a, &b));
        assert_eq!(registry.len(), 1);

        let c = registry.register_type(BaseType::Text, None);
        assert!(!SemanticType::same_instance(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_compatibility_treats_unset_domain_as_wildcard() {
        let text = SemanticType::of(BaseType::Text);
        let legal = SemanticType::new(BaseType::Text, Some("legal"));
        let business = SemanticType::new(BaseType::Text, Some("business_document"));
        let graph = SemanticType::of(BaseType::Graph);

        assert!(is_compatible(&text, &legal));
        assert!(is_compatible(&legal, &text));
        assert!(is_compatible(&legal, &legal));
        assert!(!is_compatible(&legal, &business));
        assert!(!is_compatible(&text, &graph));
    }

    #[test]
    fn test_parse_and_display() {
        let parsed: SemanticType = "text:legal".parse().expect("parse");
        assert_eq!(parsed.base(), BaseType::Text);
        assert_eq!(parsed.domain(), Some("legal"));
        assert_eq!(parsed.to_string(), "TEXT:legal");

        assert_eq!(
            "blob".parse::<SemanticType>(),
            Err(TypeParseError::UnknownBase("blob".to_string()))
        );
        assert!("GRAPH:".parse::<SemanticType>().is_err());
    }

    #[test]
    fn test_serde_uses_display_form() {
        let ty = SemanticType::new(BaseType::Entities, Some("finance"));
        let json = serde_json::to_string(&ty).expect("serialize");
        assert_eq!(json, "\"ENTITIES:finance\"");
        let back: SemanticType = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, ty);
    }
}
