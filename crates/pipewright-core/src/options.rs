//! Execution options
//!
//! [`ExecutionOptions`] has no `Default`; the per-step timeout is always
//! chosen by the caller.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tool::ResourceClass;
use crate::uncertainty::UncertaintyLawKind;

pub const DEFAULT_MAX_DEPTH: usize = 6;
pub const DEFAULT_MAX_CHAINS: usize = 8;
pub const DEFAULT_QUALITY_THRESHOLD: f64 = 0.5;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Concurrency ceiling per resource class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_intensive: usize,
    pub io_intensive: usize,
    pub memory_intensive: usize,
}

impl ResourceLimits {
    /// Same ceiling for every class
    pub fn uniform(limit: usize) -> Self {
        Self {
            cpu_intensive: limit,
            io_intensive: limit,
            memory_intensive: limit,
        }
    }

    pub fn limit(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::CpuIntensive => self.cpu_intensive,
            ResourceClass::IoIntensive => self.io_intensive,
            ResourceClass::MemoryIntensive => self.memory_intensive,
        }
    }

    pub fn with_limit(mut self, class: ResourceClass, limit: usize) -> Self {
        match class {
            ResourceClass::CpuIntensive => self.cpu_intensive = limit,
            ResourceClass::IoIntensive => self.io_intensive = limit,
            ResourceClass::MemoryIntensive => self.memory_intensive = limit,
        }
        self
    }
}

impl Default for ResourceLimits {
    /// CPU-bound work gets one slot per core, I/O twice that, memory-heavy work one.
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            cpu_intensive: cores,
            io_intensive: cores.saturating_mul(2),
            memory_intensive: 1,
        }
    }
}

/// Knobs for one `plan_and_execute` call
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOptions {
    /// Chain search bound
    pub max_depth: usize,
    /// Maximum number of candidate chains kept by the planner
    pub max_chains: usize,
    pub resource_limits: ResourceLimits,
    pub per_step_timeout: Duration,
    /// Overall run budget; `None` means only per-step timeouts apply
    pub run_deadline: Option<Duration>,
    /// Minimum acceptable step confidence (1 - uncertainty)
    pub quality_threshold: f64,
    /// Adaptation attempts allowed per step id
    pub max_retries: u32,
    pub uncertainty_law: UncertaintyLawKind,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl ExecutionOptions {
    pub fn new(per_step_timeout: Duration) -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_chains: DEFAULT_MAX_CHAINS,
            resource_limits: ResourceLimits::default(),
            per_step_timeout,
            run_deadline: None,
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
            uncertainty_law: UncertaintyLawKind::default(),
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_chains(mut self, max_chains: usize) -> Self {
        self.max_chains = max_chains;
        self
    }

    /// Apply the same ceiling to every resource class
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.resource_limits = ResourceLimits::uniform(limit);
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn with_run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline = Some(deadline);
        self
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_uncertainty_law(mut self, law: UncertaintyLawKind) -> Self {
        self.uncertainty_law = law;
        self
    }

    /// Configure backoff between adaptation attempts.
    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max.max(base);
        self
    }
}
