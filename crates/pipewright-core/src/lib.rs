//! # Pipewright Core
//!
//! Typed tool composition and adaptive DAG execution with uncertainty
//! propagation.
//!
//! This crate contains:
//! - Semantic types, tool contract and tool registry
//! - Chain planner (type-directed breadth-first search)
//! - DAG builder, decision points and the safe predicate language
//! - Adaptive executor with per-resource-class concurrency
//! - Uncertainty propagation and trace export
//!
//! This crate does NOT care about:
//! - Where configuration comes from
//! - What the tools actually do
//! - How results are reported downstream

pub mod builder;
pub mod executor;
pub mod options;
pub mod planner;
pub mod predicate;
pub mod registry;
pub mod tool;
pub mod trace;
pub mod types;
pub mod uncertainty;

#[cfg(test)]
mod testing;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::builder::{BuildError, DagBuilder, DecisionRule};
    pub use crate::executor::{
        AdaptationContext, AdaptationDecision, AdaptationPolicy, AdaptationTrigger, Alternate,
        DagNode, DecisionPoint, DependentTypes, ExecutionDag, ExecutionProgressEvent,
        ExecutionProgressReporter, Executor, NodeState, ResourcePool, StepTypes,
        ThresholdAdaptationPolicy,
    };
    pub use crate::options::{ExecutionOptions, ResourceLimits};
    pub use crate::planner::{Chain, ChainPlanner, PlanError};
    pub use crate::predicate::{Predicate, PredicateError};
    pub use crate::registry::{RegistryError, ToolRegistry};
    pub use crate::tool::{
        CancellationToken, ResourceClass, StepExecutionError, Tool, ToolContext, ToolDescriptor,
        UncertaintyPolicy,
    };
    pub use crate::trace::{
        AdaptationEvent, AdaptationStrategy, ExecutionResult, RunStatus, TraceEntry, TraceRecord,
    };
    pub use crate::types::{
        is_compatible, BaseType, ExecutionStep, SemanticType, StepId, StepResult, TypeRegistry,
    };
    pub use crate::uncertainty::{
        combine, InvalidUncertaintyError, UncertaintyLaw, UncertaintyLawKind,
        UncertaintyPropagator,
    };
}

// Re-export key types at crate root
pub use builder::{BuildError, DagBuilder, DecisionRule};
pub use executor::{ExecutionDag, ExecutionProgressEvent, ExecutionProgressReporter, Executor};
pub use options::ExecutionOptions;
pub use planner::{Chain, ChainPlanner, PlanError};
pub use predicate::Predicate;
pub use registry::{RegistryError, ToolRegistry};
pub use tool::{StepExecutionError, Tool, ToolContext, ToolDescriptor};
pub use trace::{ExecutionResult, RunStatus};
pub use types::{BaseType, SemanticType, StepId, StepResult};
pub use uncertainty::{combine, UncertaintyLawKind};
