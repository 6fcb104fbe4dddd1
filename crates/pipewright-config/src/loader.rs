//! Configuration loading, validation and explicit reload.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pipewright_core::Predicate;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::PipewrightConfig;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load and validate configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<PipewrightConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from YAML text.
pub fn parse_config(content: &str) -> Result<PipewrightConfig, ConfigError> {
    let config: PipewrightConfig = serde_yaml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &PipewrightConfig) -> Result<(), ConfigError> {
    if config.version == 0 {
        return Err(ConfigError::Invalid(
            "version must be greater than 0".to_string(),
        ));
    }

    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }

    if config.planner.max_depth == 0 {
        return Err(ConfigError::Invalid(
            "planner.max_depth must be > 0".to_string(),
        ));
    }

    if config.planner.max_chains == 0 {
        return Err(ConfigError::Invalid(
            "planner.max_chains must be > 0".to_string(),
        ));
    }

    validate_executor(config)?;
    validate_resources(config)?;
    validate_decisions(config)?;

    Ok(())
}

fn validate_executor(config: &PipewrightConfig) -> Result<(), ConfigError> {
    let executor = &config.executor;
    if executor.per_step_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "executor.per_step_timeout_ms must be > 0".to_string(),
        ));
    }
    if executor.run_deadline_ms == Some(0) {
        return Err(ConfigError::Invalid(
            "executor.run_deadline_ms must be > 0 when set".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&executor.quality_threshold) {
        return Err(ConfigError::Invalid(format!(
            "executor.quality_threshold must be within [0, 1], got {}",
            executor.quality_threshold
        )));
    }
    if executor.retry_max_delay_ms < executor.retry_base_delay_ms {
        return Err(ConfigError::Invalid(
            "executor.retry_max_delay_ms must be >= executor.retry_base_delay_ms".to_string(),
        ));
    }
    Ok(())
}

fn validate_resources(config: &PipewrightConfig) -> Result<(), ConfigError> {
    let limits = [
        ("cpu_intensive", config.resources.cpu_intensive),
        ("io_intensive", config.resources.io_intensive),
        ("memory_intensive", config.resources.memory_intensive),
    ];
    for (name, limit) in limits {
        if limit == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "resources.{} must be > 0",
                name
            )));
        }
    }
    Ok(())
}

fn validate_decisions(config: &PipewrightConfig) -> Result<(), ConfigError> {
    for (idx, decision) in config.decisions.iter().enumerate() {
        if decision.take == 0 {
            return Err(ConfigError::Invalid(format!(
                "decisions[{}].take must reference an alternative chain (>= 1)",
                idx
            )));
        }
        if decision.take >= config.planner.max_chains {
            return Err(ConfigError::Invalid(format!(
                "decisions[{}].take {} exceeds planner.max_chains {}",
                idx, decision.take, config.planner.max_chains
            )));
        }
        if let Err(err) = Predicate::parse(&decision.when) {
            return Err(ConfigError::Invalid(format!(
                "decisions[{}].when: {}",
                idx, err
            )));
        }
    }
    Ok(())
}

/// Holds the current configuration; reloads replace it atomically.
pub struct ConfigManager {
    path: PathBuf,
    config: Arc<RwLock<PipewrightConfig>>,
}

impl ConfigManager {
    /// Load the file once and keep it as the current config.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = load_config(&path)?;
        Ok(Self {
            path,
            config: Arc::new(RwLock::new(config)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared handle to the current config.
    pub fn config(&self) -> Arc<RwLock<PipewrightConfig>> {
        self.config.clone()
    }

    /// Snapshot of the current config.
    pub async fn current(&self) -> PipewrightConfig {
        self.config.read().await.clone()
    }

    /// Re-read the file. An invalid file leaves the current config in place.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        match load_config(&self.path) {
            Ok(config) => {
                let mut current = self.config.write().await;
                *current = config;
                tracing::info!(path = %self.path.display(), "config reloaded");
                Ok(())
            }
            Err(err) => {
                tracing::error!(path = %self.path.display(), "failed to reload config: {}", err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UncertaintyLawKind;
    use std::io::Write;

    const FULL: &str = r#"
version: 1
app:
  name: docs-to-graph
planner:
  max_depth: 4
  max_chains: 3
executor:
  per_step_timeout_ms: 1500
  run_deadline_ms: 60000
  quality_threshold: 0.7
  max_retries: 3
resources:
  memory_intensive: 1
  io_intensive: 8
uncertainty:
  law: weighted-average
decisions:
  - label: sparse extraction
    when: "output.entity_count < 3"
    take: 1
observability:
  log_level: debug
"#;

    fn minimal() -> PipewrightConfig {
        parse_config("executor:\n  per_step_timeout_ms: 100\n").expect("minimal config")
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse_config(FULL).expect("valid config");
        assert_eq!(config.app.name, "docs-to-graph");
        assert_eq!(config.planner.max_depth, 4);
        assert_eq!(config.executor.per_step_timeout_ms, 1500);
        assert_eq!(config.executor.run_deadline_ms, Some(60_000));
        assert_eq!(config.executor.max_retries, 3);
        assert_eq!(config.resources.memory_intensive, Some(1));
        assert_eq!(config.resources.cpu_intensive, None);
        assert_eq!(config.uncertainty.law, UncertaintyLawKind::WeightedAverage);
        assert_eq!(config.decisions.len(), 1);
        assert_eq!(config.decisions[0].take, 1);
        assert_eq!(config.observability.log_level, "debug");
    }

    #[test]
    fn test_defaults_apply() {
        let config = minimal();
        assert_eq!(config.version, 1);
        assert_eq!(config.app.name, "pipewright");
        assert_eq!(config.executor.max_retries, 2);
        assert_eq!(config.executor.quality_threshold, 0.5);
        assert_eq!(config.uncertainty.law, UncertaintyLawKind::Multiplicative);
        assert!(config.decisions.is_empty());
    }

    #[test]
    fn test_per_step_timeout_is_required() {
        assert!(matches!(
            parse_config("planner:\n  max_depth: 3\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            parse_config("executor:\n  max_retries: 1\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = minimal();
        config.executor.quality_threshold = 1.5;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));

        let mut config = minimal();
        config.executor.per_step_timeout_ms = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));

        let mut config = minimal();
        config.resources.memory_intensive = Some(0);
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));

        let mut config = minimal();
        config.version = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_decisions() {
        let err = parse_config(
            "executor:\n  per_step_timeout_ms: 100\ndecisions:\n  - when: \"output.count >\"\n    take: 1\n",
        )
        .expect_err("unparsable predicate");
        assert!(err.to_string().contains("decisions[0].when"));

        assert!(matches!(
            parse_config(
                "executor:\n  per_step_timeout_ms: 100\ndecisions:\n  - when: \"success\"\n    take: 0\n"
            ),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_manager_reload_keeps_last_good_config() {
        tokio_test::block_on(async {
            let mut file = tempfile::NamedTempFile::new().expect("temp file");
            write!(file, "executor:\n  per_step_timeout_ms: 100\n").expect("write");

            let manager = ConfigManager::open(file.path()).expect("open");
            assert_eq!(manager.current().await.executor.per_step_timeout_ms, 100);

            std::fs::write(file.path(), "executor:\n  per_step_timeout_ms: 250\n").expect("write");
            manager.reload().await.expect("reload");
            assert_eq!(manager.current().await.executor.per_step_timeout_ms, 250);

            std::fs::write(file.path(), "executor:\n  per_step_timeout_ms: 0\n").expect("write");
            assert!(manager.reload().await.is_err());
            assert_eq!(manager.current().await.executor.per_step_timeout_ms, 250);
        });
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        assert!(matches!(
            load_config(&dir.path().join("absent.yaml")),
            Err(ConfigError::Io(_))
        ));
    }
}
