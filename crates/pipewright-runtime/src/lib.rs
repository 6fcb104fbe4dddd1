//! # Pipewright Runtime
//!
//! Engine facade over the core crate.
//!
//! This crate provides:
//! - `Engine::plan_and_execute`, the single externally callable entry point
//! - Config bootstrap (config → execution options and decision rules)
//! - Process-wide tracing initialisation

pub mod bootstrap;
mod engine;
mod error;

pub use bootstrap::{decision_rules, engine_options, init_tracing_if_needed};
pub use engine::Engine;
pub use error::EngineError;

// Re-export core types for convenience
pub use pipewright_core::prelude::*;
