//! # Pipewright Config
//!
//! Single-file configuration for pipewright.
//! One `pipewright.yaml` configures chain planning, the adaptive executor,
//! per-class resource limits, the uncertainty law, decision rules and
//! observability settings.

mod loader;

pub use loader::{load_config, parse_config, validate_config, ConfigError, ConfigManager};
pub use pipewright_core::uncertainty::UncertaintyLawKind;

use serde::Deserialize;

/// Top-level configuration schema for pipewright.
#[derive(Debug, Clone, Deserialize)]
pub struct PipewrightConfig {
    /// Config schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    /// Required: the per-step timeout has no implicit default.
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub uncertainty: UncertaintyConfig,
    #[serde(default)]
    pub decisions: Vec<DecisionSpec>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_env(),
        }
    }
}

fn default_app_name() -> String {
    "pipewright".to_string()
}

fn default_env() -> String {
    "development".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    /// Chain search bound.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Candidate chains kept after ranking.
    #[serde(default = "default_max_chains")]
    pub max_chains: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_chains: default_max_chains(),
        }
    }
}

fn default_max_depth() -> usize {
    pipewright_core::options::DEFAULT_MAX_DEPTH
}

fn default_max_chains() -> usize {
    pipewright_core::options::DEFAULT_MAX_CHAINS
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub per_step_timeout_ms: u64,
    /// Overall run budget; absent means no run deadline.
    #[serde(default)]
    pub run_deadline_ms: Option<u64>,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_quality_threshold() -> f64 {
    pipewright_core::options::DEFAULT_QUALITY_THRESHOLD
}

fn default_max_retries() -> u32 {
    pipewright_core::options::DEFAULT_MAX_RETRIES
}

fn default_retry_base_delay_ms() -> u64 {
    pipewright_core::options::DEFAULT_RETRY_BASE_DELAY.as_millis() as u64
}

fn default_retry_max_delay_ms() -> u64 {
    pipewright_core::options::DEFAULT_RETRY_MAX_DELAY.as_millis() as u64
}

/// Per-resource-class concurrency ceilings; absent entries use the
/// core-count based defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default)]
    pub cpu_intensive: Option<usize>,
    #[serde(default)]
    pub io_intensive: Option<usize>,
    #[serde(default)]
    pub memory_intensive: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UncertaintyConfig {
    #[serde(default)]
    pub law: UncertaintyLawKind,
}

/// Decision rule: when `when` holds at the fork step, run chain `take`.
#[derive(Debug, Clone, Deserialize)]
pub struct DecisionSpec {
    #[serde(default)]
    pub label: Option<String>,
    /// Predicate expression, e.g. `output.entity_count < 3`.
    pub when: String,
    /// Index of the candidate chain to switch to; 0 is the primary chain.
    pub take: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub traces_enabled: bool,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            traces_enabled: false,
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
