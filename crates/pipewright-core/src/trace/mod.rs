//! Execution result and trace
//!
//! The trace lists every accepted step result in the order results became
//! available. Discarded attempts (a failed try that was later adapted) are not
//! trace entries; they live in the adaptation history instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{StepId, StepResult};
use crate::uncertainty::UncertaintyLawKind;

/// Run state machine: `Pending -> Running -> {Completed, Failed, Aborted}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted
        )
    }
}

/// Fixed set of runtime plan modifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdaptationStrategy {
    RetryWithFallback,
    InsertPreprocessing,
    ParameterAdjustment,
    ApproachPivot,
    GracefulDegradation,
}

impl AdaptationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdaptationStrategy::RetryWithFallback => "retry-with-fallback",
            AdaptationStrategy::InsertPreprocessing => "insert-preprocessing",
            AdaptationStrategy::ParameterAdjustment => "parameter-adjustment",
            AdaptationStrategy::ApproachPivot => "approach-pivot",
            AdaptationStrategy::GracefulDegradation => "graceful-degradation",
        }
    }
}

/// Record of one runtime plan modification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationEvent {
    /// Step the adaptation was applied to; `None` for run-level events
    pub step_id: Option<StepId>,
    pub strategy: AdaptationStrategy,
    pub reason: String,
    pub steps_added: Vec<StepId>,
    pub steps_removed: Vec<StepId>,
    pub at: DateTime<Utc>,
}

impl AdaptationEvent {
    pub fn new(
        step_id: Option<StepId>,
        strategy: AdaptationStrategy,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            step_id,
            strategy,
            reason: reason.into(),
            steps_added: Vec::new(),
            steps_removed: Vec::new(),
            at: Utc::now(),
        }
    }

    pub fn with_steps_added(mut self, steps: Vec<StepId>) -> Self {
        self.steps_added = steps;
        self
    }

    pub fn with_steps_removed(mut self, steps: Vec<StepId>) -> Self {
        self.steps_removed = steps;
        self
    }

    pub fn references(&self, step_id: &StepId) -> bool {
        self.step_id.as_ref() == Some(step_id)
    }
}

/// One accepted step result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub step_id: StepId,
    pub tool_id: String,
    pub result: StepResult,
    /// Attempt that produced this result, starting at 1
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Final outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: String,
    pub status: RunStatus,
    pub output: Value,
    pub trace: Vec<TraceEntry>,
    pub combined_uncertainty: f64,
    pub uncertainty_law: UncertaintyLawKind,
    pub adaptations: Vec<AdaptationEvent>,
    pub pruned_steps: Vec<StepId>,
    /// Why the run did not complete
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn entries_for(&self, step_id: &StepId) -> Vec<&TraceEntry> {
        self.trace.iter().filter(|e| &e.step_id == step_id).collect()
    }

    pub fn adaptations_for(&self, step_id: &StepId) -> Vec<&AdaptationEvent> {
        self.adaptations
            .iter()
            .filter(|e| e.references(step_id))
            .collect()
    }

    /// Combined confidence, the complement of combined uncertainty
    pub fn confidence(&self) -> f64 {
        1.0 - self.combined_uncertainty
    }

    /// Flatten into the audit record
    pub fn to_record(&self) -> TraceRecord {
        TraceRecord {
            run_id: self.run_id.clone(),
            status: self.status,
            combined_uncertainty: self.combined_uncertainty,
            uncertainty_law: self.uncertainty_law,
            steps: self
                .trace
                .iter()
                .map(|entry| StepRecord {
                    step_id: entry.step_id.clone(),
                    tool_id: entry.tool_id.clone(),
                    uncertainty: entry.result.uncertainty,
                    rationale: entry.result.rationale.clone(),
                    success: entry.result.success,
                })
                .collect(),
            adaptation_events: self
                .adaptations
                .iter()
                .map(|event| AdaptationRecord {
                    step_id: event.step_id.clone(),
                    strategy: event.strategy,
                    reason: event.reason.clone(),
                    steps_added: event.steps_added.clone(),
                    steps_removed: event.steps_removed.clone(),
                })
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_record())
    }
}

/// Audit/provenance record consumed by downstream reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub run_id: String,
    pub status: RunStatus,
    pub combined_uncertainty: f64,
    pub uncertainty_law: UncertaintyLawKind,
    pub steps: Vec<StepRecord>,
    pub adaptation_events: Vec<AdaptationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: StepId,
    pub tool_id: String,
    pub uncertainty: f64,
    pub rationale: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub strategy: AdaptationStrategy,
    pub reason: String,
    pub steps_added: Vec<StepId>,
    pub steps_removed: Vec<StepId>,
}
