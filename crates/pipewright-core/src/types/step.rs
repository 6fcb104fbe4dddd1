//! Step type definitions
//!
//! ExecutionStep is a single scheduled invocation of a tool inside a DAG.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::predicate::Predicate;

/// Strongly-typed Step ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for StepId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&StepId> for StepId {
    fn from(value: &StepId) -> Self {
        value.clone()
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for StepId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<&str> for StepId {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// A single scheduled tool invocation in the execution DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Unique identifier within the DAG
    pub id: StepId,
    /// Id of the tool this step invokes
    pub tool: String,
    /// Predecessor steps; all must succeed before this step is eligible
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Optional guard evaluated against predecessor results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Predicate>,
    /// Context map handed to the tool
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Any failure of a critical step aborts the run
    #[serde(default)]
    pub critical: bool,
}

impl ExecutionStep {
    pub fn new(id: impl Into<StepId>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            depends_on: Vec::new(),
            guard: None,
            params: Map::new(),
            critical: false,
        }
    }

    pub fn with_depends_on(mut self, deps: Vec<StepId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn after(mut self, dep: impl Into<StepId>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn with_guard(mut self, guard: Predicate) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn is_root(&self) -> bool {
        self.depends_on.is_empty()
    }
}
