//! Config → engine wiring and process-wide tracing setup.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use pipewright_config::{ObservabilityConfig, PipewrightConfig};
use pipewright_core::options::{ExecutionOptions, ResourceLimits};
use pipewright_core::tool::ResourceClass;
use pipewright_core::{DecisionRule, Predicate};

use crate::error::EngineError;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Execution options described by `config`
pub fn engine_options(config: &PipewrightConfig) -> ExecutionOptions {
    let executor = &config.executor;
    let mut limits = ResourceLimits::default();
    let overrides = [
        (ResourceClass::CpuIntensive, config.resources.cpu_intensive),
        (ResourceClass::IoIntensive, config.resources.io_intensive),
        (ResourceClass::MemoryIntensive, config.resources.memory_intensive),
    ];
    for (class, limit) in overrides {
        if let Some(limit) = limit {
            limits = limits.with_limit(class, limit);
        }
    }

    let mut options = ExecutionOptions::new(Duration::from_millis(executor.per_step_timeout_ms))
        .with_max_depth(config.planner.max_depth)
        .with_max_chains(config.planner.max_chains)
        .with_resource_limits(limits)
        .with_quality_threshold(executor.quality_threshold)
        .with_max_retries(executor.max_retries)
        .with_uncertainty_law(config.uncertainty.law)
        .with_retry_backoff(
            Duration::from_millis(executor.retry_base_delay_ms),
            Duration::from_millis(executor.retry_max_delay_ms),
        );
    if let Some(deadline_ms) = executor.run_deadline_ms {
        options = options.with_run_deadline(Duration::from_millis(deadline_ms));
    }
    options
}

/// Decision rules described by `config`, in declaration order
pub fn decision_rules(config: &PipewrightConfig) -> Result<Vec<DecisionRule>, EngineError> {
    config
        .decisions
        .iter()
        .map(|decision| {
            let predicate = Predicate::parse(&decision.when)?;
            let rule = DecisionRule::new(predicate, decision.take);
            Ok(match &decision.label {
                Some(label) => rule.with_label(label.clone()),
                None => rule,
            })
        })
        .collect()
}

/// Install the global fmt subscriber once per process.
///
/// `RUST_LOG` wins over `observability.log_level`.
pub fn init_tracing_if_needed(observability: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let file_writer = observability
            .log_file
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .and_then(create_log_writer);
        let fallback_level = match observability.log_level.trim().to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        };

        let make_filter = || {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        };
        let span_events = if observability.traces_enabled {
            tracing_subscriber::fmt::format::FmtSpan::NEW
                | tracing_subscriber::fmt::format::FmtSpan::CLOSE
        } else {
            tracing_subscriber::fmt::format::FmtSpan::NONE
        };

        let has_file = file_writer.is_some();
        match file_writer {
            Some(writer) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(make_filter())
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_span_events(span_events)
                    .try_init();
            }
            None => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(make_filter())
                    .with_target(true)
                    .with_span_events(span_events)
                    .try_init();
            }
        }

        tracing::info!(
            log_level = %observability.log_level,
            traces_enabled = observability.traces_enabled,
            log_file = if has_file {
                observability.log_file.as_deref().unwrap_or("(stdout)")
            } else {
                "(stdout)"
            },
            "tracing initialized"
        );
    });
}

fn create_log_writer(path: &str) -> Option<SharedFileMakeWriter> {
    use std::fs::{create_dir_all, OpenOptions};
    use std::path::Path;

    let file_path = Path::new(path);
    if let Some(parent) = file_path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = create_dir_all(parent) {
                eprintln!(
                    "failed to create log directory '{}': {}",
                    parent.display(),
                    err
                );
                return None;
            }
        }
    }
    match OpenOptions::new().create(true).append(true).open(file_path) {
        Ok(file) => Some(SharedFileMakeWriter {
            file: Arc::new(std::sync::Mutex::new(file)),
        }),
        Err(err) => {
            eprintln!("failed to open log file '{}': {}", file_path.display(), err);
            None
        }
    }
}

#[derive(Clone)]
struct SharedFileMakeWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

struct SharedFileWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedFileMakeWriter {
    type Writer = SharedFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileWriter {
            file: self.file.clone(),
        }
    }
}

impl std::io::Write for SharedFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "log file lock poisoned"))?;
        file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "log file lock poisoned"))?;
        file.flush()
    }
}
