//! Core type definitions for pipewright
//!
//! This module contains the fundamental types used throughout the engine:
//! - SemanticType: typed data kinds connecting tools
//! - ExecutionStep: a scheduled tool invocation with dependencies
//! - StepResult: the outcome of one step with its uncertainty

mod result;
mod semantic;
mod step;

pub use result::StepResult;
pub use semantic::{is_compatible, BaseType, SemanticType, TypeParseError, TypeRegistry};
pub use step::{ExecutionStep, StepId};
