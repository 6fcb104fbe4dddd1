use pipewright_config::ConfigError;
use pipewright_core::predicate::PredicateError;
use pipewright_core::{BuildError, PlanError, RegistryError};

/// Structural errors surfaced by the engine.
///
/// Step failures are not errors here: they are reported through the run
/// status and trace of an `Ok` result.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("planner error: {0}")]
    Plan(#[from] PlanError),
    #[error("build error: {0}")]
    Build(#[from] BuildError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("predicate error: {0}")]
    Predicate(#[from] PredicateError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}
