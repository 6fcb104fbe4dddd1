//! Tool abstraction module
//!
//! This module defines the Tool trait and related types:
//! - Tool: the contract every external processing capability implements
//! - ToolDescriptor: static metadata (types, uncertainty policy, resources)
//! - ToolContext: execution context with cancellation
//! - StepExecutionError: what a tool raises when it cannot produce a result

mod context;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use context::ToolContext;
// Re-export CancellationToken for convenience
pub use tokio_util::sync::CancellationToken;

use crate::types::{is_compatible, SemanticType, StepResult};

/// Errors raised by a tool invocation.
///
/// The executor converts every variant into a failed StepResult with
/// uncertainty 1.0; none of them escape to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepExecutionError {
    #[error("tool failed: {0}")]
    Failed(String),

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error("tool panicked: {0}")]
    Panicked(String),

    #[error("step cancelled before completion")]
    Cancelled,

    #[error("tool '{0}' is not registered")]
    UnknownTool(String),
}

impl StepExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Tool trait - the core abstraction for processing units
///
/// Tools are black boxes to the executor. They receive the upstream value and
/// a context map, and report an output with a self-assessed uncertainty.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Execute the tool
    async fn execute(&self, input: Value, ctx: ToolContext)
        -> Result<StepResult, StepExecutionError>;
}

/// How a tool's uncertainty contribution is determined
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum UncertaintyPolicy {
    /// Always contributes the declared value on success
    Fixed(f64),
    /// Contributes whatever the tool reports
    #[default]
    Computed,
    /// Contributes exactly 0.0 on success
    Deterministic,
}

impl UncertaintyPolicy {
    /// Uncertainty recorded for a successful invocation given the reported value
    pub fn apply(&self, reported: f64) -> f64 {
        match self {
            UncertaintyPolicy::Fixed(value) => *value,
            UncertaintyPolicy::Computed => reported,
            UncertaintyPolicy::Deterministic => 0.0,
        }
    }
}

/// Resource profile used to bound concurrent execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    #[default]
    CpuIntensive,
    IoIntensive,
    MemoryIntensive,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 3] = [
        ResourceClass::CpuIntensive,
        ResourceClass::IoIntensive,
        ResourceClass::MemoryIntensive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::CpuIntensive => "cpu_intensive",
            ResourceClass::IoIntensive => "io_intensive",
            ResourceClass::MemoryIntensive => "memory_intensive",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static metadata for a registered tool plus the executable unit
#[derive(Clone)]
pub struct ToolDescriptor {
    /// Unique tool id
    pub id: String,
    /// Human-readable description
    pub description: String,
    /// Accepted input types, in order
    pub inputs: Vec<SemanticType>,
    /// Produced output types
    pub outputs: Vec<SemanticType>,
    /// Declared uncertainty contribution
    pub uncertainty_policy: UncertaintyPolicy,
    /// Planner tie-break cost, lower is better
    pub cost: f64,
    /// Weight under the weighted-average law
    pub weight: f64,
    /// Concurrency class
    pub resource_class: ResourceClass,
    /// Any failure aborts the run
    pub critical: bool,
    /// Tool to retry with when this one fails or is not confident enough
    pub fallback: Option<String>,
    /// Tool to insert ahead of this one when its confidence is too low
    pub preprocessor: Option<String>,
    /// The executable unit
    pub tool: Arc<dyn Tool>,
}

impl ToolDescriptor {
    pub fn new(id: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            uncertainty_policy: UncertaintyPolicy::default(),
            cost: 1.0,
            weight: 1.0,
            resource_class: ResourceClass::default(),
            critical: false,
            fallback: None,
            preprocessor: None,
            tool,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<SemanticType>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<SemanticType>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_uncertainty_policy(mut self, policy: UncertaintyPolicy) -> Self {
        self.uncertainty_policy = policy;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_resource_class(mut self, class: ResourceClass) -> Self {
        self.resource_class = class;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_fallback(mut self, tool_id: impl Into<String>) -> Self {
        self.fallback = Some(tool_id.into());
        self
    }

    pub fn with_preprocessor(mut self, tool_id: impl Into<String>) -> Self {
        self.preprocessor = Some(tool_id.into());
        self
    }

    /// Whether any output of this tool may feed the given type
    pub fn produces(&self, target: &SemanticType) -> bool {
        self.outputs.iter().any(|out| is_compatible(out, target))
    }

    /// Whether any input of this tool accepts the given type
    pub fn consumes(&self, source: &SemanticType) -> bool {
        self.inputs.iter().any(|inp| is_compatible(source, inp))
    }

    /// Whether every declared input is satisfied by some available type
    pub fn accepts_all(&self, available: &[SemanticType]) -> bool {
        !self.inputs.is_empty()
            && self
                .inputs
                .iter()
                .all(|inp| available.iter().any(|ty| is_compatible(ty, inp)))
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("uncertainty_policy", &self.uncertainty_policy)
            .field("cost", &self.cost)
            .field("resource_class", &self.resource_class)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}
