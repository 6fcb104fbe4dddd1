//! Executor module
//!
//! The Executor is responsible for:
//! - DAG-based topological scheduling
//! - Parallel execution of eligible steps, bounded per resource class
//! - Quality checks and adaptation after every step
//! - Uncertainty propagation over the accepted trace

mod adaptation;
mod dag;
mod resources;

pub use adaptation::{
    AdaptationContext, AdaptationDecision, AdaptationPolicy, AdaptationTrigger, DependentTypes,
    NoAdaptationPolicy, StepTypes, ThresholdAdaptationPolicy,
};
pub use dag::{Alternate, DagNode, DecisionPoint, ExecutionDag, NodeState};
pub use resources::ResourcePool;

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::options::ExecutionOptions;
use crate::registry::ToolRegistry;
use crate::tool::{ResourceClass, StepExecutionError, Tool, ToolContext, ToolDescriptor};
use crate::trace::{AdaptationEvent, AdaptationStrategy, ExecutionResult, RunStatus, TraceEntry};
use crate::types::{ExecutionStep, SemanticType, StepId, StepResult};
use crate::uncertainty::{Contribution, UncertaintyPropagator};

const MAX_LOG_TEXT_CHARS: usize = 2_000;
const MAX_LOG_JSON_CHARS: usize = 8_000;
const DEADLINE_REASON: &str = "graceful-degradation: resource exhaustion";

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", char_count));
    preview
}

fn truncate_json_for_log(value: &Value, max_chars: usize) -> String {
    truncate_for_log(&value.to_string(), max_chars)
}

/// Realtime execution progress event.
#[derive(Debug, Clone)]
pub struct ExecutionProgressEvent {
    pub run_id: String,
    pub step_id: Option<StepId>,
    pub tool: Option<String>,
    /// Phase label, e.g. step_started/step_completed/run_completed.
    pub phase: String,
    /// Optional human-readable message.
    pub message: Option<String>,
    /// Extra structured metadata.
    pub metadata: Value,
}

impl ExecutionProgressEvent {
    pub fn new(
        run_id: impl Into<String>,
        step_id: Option<StepId>,
        tool: Option<String>,
        phase: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step_id,
            tool,
            phase: phase.into(),
            message: None,
            metadata: Value::Null,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Sink interface for execution progress reporting.
#[async_trait]
pub trait ExecutionProgressReporter: Send + Sync {
    async fn report(&self, event: ExecutionProgressEvent) -> Result<(), String>;
}

/// Why the loop stopped dispatching
#[derive(Debug)]
enum Halt {
    Failed(String),
    Aborted(String),
    Deadline,
}

/// What the adaptation hook did with a step
enum AdaptOutcome {
    /// The step was reset, re-tooled or replaced; drop the result
    Rerun,
    /// Keep the result (graceful degradation)
    Accept,
    /// Nothing applied
    Declined,
}

/// Everything a spawned step needs; owns its data so it can outlive the loop borrow
struct StepJob {
    run_id: String,
    step_id: StepId,
    tool_id: String,
    tool: Option<Arc<dyn Tool>>,
    class: ResourceClass,
    input: Value,
    params: Map<String, Value>,
    attempt: u32,
    delay: Duration,
    step_timeout: Duration,
    pool: ResourcePool,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<Completion>,
}

/// A finished tool invocation, published back to the loop
struct Completion {
    step_id: StepId,
    tool_id: String,
    attempt: u32,
    outcome: Result<StepResult, StepExecutionError>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

/// State owned by the single orchestrating loop of one run
struct RunState {
    run_id: String,
    dag: ExecutionDag,
    initial_input: Value,
    results: HashMap<StepId, StepResult>,
    trace: Vec<TraceEntry>,
    adaptations: Vec<AdaptationEvent>,
    history: HashMap<StepId, Vec<AdaptationStrategy>>,
    retry_delays: HashMap<StepId, Duration>,
    confidence_floor: f64,
    halt: Option<Halt>,
    in_flight: usize,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<Completion>,
}

/// The executor - orchestrates adaptive DAG execution
pub struct Executor {
    registry: Arc<ToolRegistry>,
    options: ExecutionOptions,
    policy: Arc<dyn AdaptationPolicy>,
    propagator: UncertaintyPropagator,
    pool: ResourcePool,
    progress_reporter: Option<Arc<dyn ExecutionProgressReporter>>,
}

impl Executor {
    pub fn new(registry: Arc<ToolRegistry>, options: ExecutionOptions) -> Self {
        let propagator = UncertaintyPropagator::new(options.uncertainty_law);
        let pool = ResourcePool::new(options.resource_limits);
        Self {
            registry,
            options,
            policy: Arc::new(ThresholdAdaptationPolicy::new()),
            propagator,
            pool,
            progress_reporter: None,
        }
    }

    /// Replace the default threshold policy
    pub fn with_policy(mut self, policy: Arc<dyn AdaptationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Attach a realtime execution progress reporter.
    pub fn with_progress_reporter(mut self, reporter: Arc<dyn ExecutionProgressReporter>) -> Self {
        self.progress_reporter = Some(reporter);
        self
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Run `dag` to completion.
    ///
    /// Step-level problems never surface as `Err`: they are absorbed by the
    /// adaptation loop or reflected in the returned status, alongside the
    /// partial trace.
    pub async fn execute(&self, dag: ExecutionDag, initial_input: Value) -> ExecutionResult {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut run = RunState {
            run_id: uuid::Uuid::new_v4().to_string(),
            dag,
            initial_input,
            results: HashMap::new(),
            trace: Vec::new(),
            adaptations: Vec::new(),
            history: HashMap::new(),
            retry_delays: HashMap::new(),
            confidence_floor: self.options.quality_threshold,
            halt: None,
            in_flight: 0,
            token: CancellationToken::new(),
            tx,
        };
        let deadline = self.options.run_deadline.map(|d| Instant::now() + d);

        tracing::info!(
            run_id = %run.run_id,
            steps = run.dag.len(),
            uncertainty_law = %self.options.uncertainty_law,
            "run started"
        );
        self.report(
            ExecutionProgressEvent::new(run.run_id.clone(), None, None, "run_started")
                .with_metadata(serde_json::json!({
                    "steps": run.dag.len(),
                    "quality_threshold": self.options.quality_threshold,
                    "max_retries": self.options.max_retries,
                })),
        )
        .await;

        loop {
            if let Some(at) = deadline {
                if run.halt.is_none() && Instant::now() >= at {
                    self.halt_on_deadline(&mut run);
                }
            }
            if run.halt.is_none() {
                self.dispatch_ready(&mut run).await;
            }
            if run.in_flight == 0 {
                break;
            }

            let deadline_armed = deadline.is_some() && run.halt.is_none();
            tokio::select! {
                completion = rx.recv() => {
                    if let Some(completion) = completion {
                        run.in_flight = run.in_flight.saturating_sub(1);
                        self.handle_completion(&mut run, completion).await;
                    }
                }
                _ = wait_for_deadline(deadline), if deadline_armed => {
                    self.halt_on_deadline(&mut run);
                }
            }
        }

        self.finish(run).await
    }

    fn halt_on_deadline(&self, run: &mut RunState) {
        tracing::warn!(
            run_id = %run.run_id,
            in_flight = run.in_flight,
            "run deadline expired, dispatch stopped"
        );
        run.halt = Some(Halt::Deadline);
        run.token.cancel();
    }

    /// Spawn every eligible step; steps whose guard fails are pruned instead
    async fn dispatch_ready(&self, run: &mut RunState) {
        for step_id in run.dag.update_ready_nodes() {
            let Some(step) = run.dag.node(&step_id).map(|node| node.step.clone()) else {
                continue;
            };

            if !self.guard_holds(run, &step) {
                let pruned = run.dag.prune(&step_id);
                tracing::info!(
                    run_id = %run.run_id,
                    step_id = %step_id,
                    pruned = ?pruned,
                    "step guard is false, branch pruned"
                );
                self.report(
                    ExecutionProgressEvent::new(
                        run.run_id.clone(),
                        Some(step_id.clone()),
                        Some(step.tool.clone()),
                        "branch_pruned",
                    )
                    .with_metadata(serde_json::json!({ "pruned": pruned })),
                )
                .await;
                continue;
            }

            run.dag.mark_running(&step_id);
            let attempt = run.dag.node(&step_id).map(|n| n.attempts).unwrap_or(1);
            let input = step_input(run, &step);
            let descriptor = self.registry.get(&step.tool);
            let class = descriptor.map(|d| d.resource_class).unwrap_or_default();
            let delay = run.retry_delays.remove(&step_id).unwrap_or_default();

            tracing::info!(
                run_id = %run.run_id,
                step_id = %step_id,
                tool = %step.tool,
                attempt = attempt,
                resource_class = %class,
                "step execution started"
            );
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(
                    run_id = %run.run_id,
                    step_id = %step_id,
                    input = %truncate_json_for_log(&input, MAX_LOG_JSON_CHARS),
                    "step input"
                );
            }
            self.report(
                ExecutionProgressEvent::new(
                    run.run_id.clone(),
                    Some(step_id.clone()),
                    Some(step.tool.clone()),
                    "step_started",
                )
                .with_metadata(serde_json::json!({
                    "attempt": attempt,
                    "resource_class": class.as_str(),
                    "retry_in_ms": delay.as_millis() as u64,
                })),
            )
            .await;

            let job = StepJob {
                run_id: run.run_id.clone(),
                step_id: step_id.clone(),
                tool_id: step.tool.clone(),
                tool: descriptor.map(|d| Arc::clone(&d.tool)),
                class,
                input,
                params: step.params.clone(),
                attempt,
                delay,
                step_timeout: self.options.per_step_timeout,
                pool: self.pool.clone(),
                token: run.token.child_token(),
                tx: run.tx.clone(),
            };
            tokio::spawn(run_step(job));
            run.in_flight += 1;
        }
    }

    /// A step guard must hold for every predecessor result; roots are
    /// checked against the initial input
    fn guard_holds(&self, run: &RunState, step: &ExecutionStep) -> bool {
        let Some(guard) = &step.guard else {
            return true;
        };
        if step.depends_on.is_empty() {
            return guard.evaluate(&StepResult::deterministic(run.initial_input.clone()));
        }
        step.depends_on.iter().all(|dep| {
            run.results
                .get(dep)
                .map(|result| guard.evaluate(result))
                .unwrap_or(false)
        })
    }

    async fn handle_completion(&self, run: &mut RunState, completion: Completion) {
        let Some(step) = run
            .dag
            .node(&completion.step_id)
            .map(|node| node.step.clone())
        else {
            return;
        };
        let descriptor = self.registry.get(&completion.tool_id);
        let result = self.normalize_result(&completion.step_id, descriptor, &completion.outcome);

        if !result.success {
            self.handle_failure(run, &step, descriptor, &completion, result)
                .await;
            return;
        }

        if run.halt.is_none() && result.confidence() < run.confidence_floor {
            tracing::info!(
                run_id = %run.run_id,
                step_id = %step.id,
                tool = %completion.tool_id,
                confidence = result.confidence(),
                floor = run.confidence_floor,
                "step confidence below floor"
            );
            match self
                .adapt(run, &step, descriptor, &result, AdaptationTrigger::LowConfidence)
                .await
            {
                AdaptOutcome::Rerun => return,
                AdaptOutcome::Accept | AdaptOutcome::Declined => {}
            }
        }

        self.accept(run, &step, completion, result).await;
    }

    async fn handle_failure(
        &self,
        run: &mut RunState,
        step: &ExecutionStep,
        descriptor: Option<&ToolDescriptor>,
        completion: &Completion,
        result: StepResult,
    ) {
        run.dag.mark_failed(&step.id);
        tracing::warn!(
            run_id = %run.run_id,
            step_id = %step.id,
            tool = %completion.tool_id,
            attempt = completion.attempt,
            error = %truncate_for_log(&result.rationale, MAX_LOG_TEXT_CHARS),
            "step execution failed"
        );
        self.report(
            ExecutionProgressEvent::new(
                run.run_id.clone(),
                Some(step.id.clone()),
                Some(completion.tool_id.clone()),
                "step_failed",
            )
            .with_message(result.rationale.clone())
            .with_metadata(serde_json::json!({ "attempt": completion.attempt })),
        )
        .await;

        if run.halt.is_some() {
            return;
        }

        let critical = step.critical || descriptor.map(|d| d.critical).unwrap_or(false);
        if critical {
            tracing::error!(
                run_id = %run.run_id,
                step_id = %step.id,
                "critical step failed, aborting run"
            );
            run.halt = Some(Halt::Aborted(format!(
                "critical step '{}' failed: {}",
                step.id, result.rationale
            )));
            run.token.cancel();
            return;
        }

        match self
            .adapt(run, step, descriptor, &result, AdaptationTrigger::Failure)
            .await
        {
            AdaptOutcome::Rerun => {}
            AdaptOutcome::Accept | AdaptOutcome::Declined => {
                run.halt = Some(Halt::Failed(format!(
                    "step '{}' failed: {}",
                    step.id, result.rationale
                )));
            }
        }
    }

    /// Ask the policy for a strategy and apply it to the DAG
    async fn adapt(
        &self,
        run: &mut RunState,
        step: &ExecutionStep,
        descriptor: Option<&ToolDescriptor>,
        result: &StepResult,
        trigger: AdaptationTrigger,
    ) -> AdaptOutcome {
        let history = run.history.get(&step.id).cloned().unwrap_or_default();
        let used = history.len() as u32;
        if used >= self.options.max_retries {
            tracing::warn!(
                run_id = %run.run_id,
                step_id = %step.id,
                attempts = used,
                max_retries = self.options.max_retries,
                "adaptation budget exhausted"
            );
            return AdaptOutcome::Declined;
        }

        let types = self.step_types(&run.dag, step);
        let decision = {
            let ctx = AdaptationContext {
                step,
                descriptor,
                result,
                trigger,
                history: &history,
                max_retries: self.options.max_retries,
                confidence_floor: run.confidence_floor,
                pivot_available: run.dag.has_alternate_at(&step.id),
                registry: &self.registry,
                types: &types,
            };
            self.policy.decide(&ctx)
        };

        let cause = match trigger {
            AdaptationTrigger::Failure => format!("tool '{}' failed: {}", step.tool, result.rationale),
            AdaptationTrigger::LowConfidence => format!(
                "confidence {:.3} below floor {:.3}",
                result.confidence(),
                run.confidence_floor
            ),
        };
        let backoff = self.compute_retry_backoff(used);

        let (event, outcome) = match decision {
            AdaptationDecision::UseFallback(tool) => {
                let fits = self
                    .registry
                    .get(&tool)
                    .is_some_and(|fallback| types.fits_in_place(fallback));
                if !fits {
                    tracing::warn!(
                        run_id = %run.run_id,
                        step_id = %step.id,
                        tool = %tool,
                        "fallback tool is unknown or type-incompatible"
                    );
                    return AdaptOutcome::Declined;
                }
                if let Some(node) = run.dag.node_mut(&step.id) {
                    node.step.tool = tool.clone();
                }
                run.dag.reset_pending(&step.id);
                run.retry_delays.insert(step.id.clone(), backoff);
                (
                    AdaptationEvent::new(
                        Some(step.id.clone()),
                        AdaptationStrategy::RetryWithFallback,
                        format!("{}; retrying with fallback tool '{}'", cause, tool),
                    ),
                    AdaptOutcome::Rerun,
                )
            }
            AdaptationDecision::InsertPreprocessing(tool) => {
                let fits = match (self.registry.get(&tool), descriptor) {
                    (Some(pre), Some(target)) => types.fits_ahead(pre, target),
                    _ => false,
                };
                if !fits {
                    tracing::warn!(
                        run_id = %run.run_id,
                        step_id = %step.id,
                        tool = %tool,
                        "preprocessing tool is unknown or type-incompatible"
                    );
                    return AdaptOutcome::Declined;
                }
                let pre_id = StepId::new(format!("{}.pre{}", step.id, used + 1));
                let pre = ExecutionStep::new(pre_id.clone(), tool.clone());
                if let Err(err) = run.dag.insert_before(&step.id, pre) {
                    tracing::warn!(
                        run_id = %run.run_id,
                        step_id = %step.id,
                        error = %err,
                        "failed to insert preprocessing step"
                    );
                    return AdaptOutcome::Declined;
                }
                run.dag.reset_pending(&step.id);
                (
                    AdaptationEvent::new(
                        Some(step.id.clone()),
                        AdaptationStrategy::InsertPreprocessing,
                        format!("{}; inserting preprocessing tool '{}'", cause, tool),
                    )
                    .with_steps_added(vec![pre_id]),
                    AdaptOutcome::Rerun,
                )
            }
            AdaptationDecision::AdjustParameters(params) => {
                let keys: Vec<String> = params.keys().cloned().collect();
                if let Some(node) = run.dag.node_mut(&step.id) {
                    node.step.params.extend(params);
                }
                run.dag.reset_pending(&step.id);
                run.retry_delays.insert(step.id.clone(), backoff);
                (
                    AdaptationEvent::new(
                        Some(step.id.clone()),
                        AdaptationStrategy::ParameterAdjustment,
                        format!("{}; retrying with adjusted parameters {:?}", cause, keys),
                    ),
                    AdaptOutcome::Rerun,
                )
            }
            AdaptationDecision::Pivot => match run.dag.pivot(&step.id) {
                Some((added, removed)) => (
                    AdaptationEvent::new(
                        Some(step.id.clone()),
                        AdaptationStrategy::ApproachPivot,
                        format!("{}; switching to alternate chain", cause),
                    )
                    .with_steps_added(added)
                    .with_steps_removed(removed),
                    AdaptOutcome::Rerun,
                ),
                None => return AdaptOutcome::Declined,
            },
            AdaptationDecision::Degrade => {
                if trigger != AdaptationTrigger::LowConfidence {
                    return AdaptOutcome::Declined;
                }
                let previous = run.confidence_floor;
                run.confidence_floor = result.confidence();
                (
                    AdaptationEvent::new(
                        Some(step.id.clone()),
                        AdaptationStrategy::GracefulDegradation,
                        format!(
                            "{}; accepting result and lowering confidence floor from {:.3} to {:.3}",
                            cause, previous, run.confidence_floor
                        ),
                    ),
                    AdaptOutcome::Accept,
                )
            }
            AdaptationDecision::GiveUp => return AdaptOutcome::Declined,
        };

        tracing::info!(
            run_id = %run.run_id,
            step_id = %step.id,
            strategy = %event.strategy.as_str(),
            attempt = used + 1,
            reason = %truncate_for_log(&event.reason, MAX_LOG_TEXT_CHARS),
            "adaptation applied"
        );
        self.report(
            ExecutionProgressEvent::new(
                run.run_id.clone(),
                Some(step.id.clone()),
                Some(step.tool.clone()),
                "adaptation_applied",
            )
            .with_message(event.reason.clone())
            .with_metadata(serde_json::json!({
                "strategy": event.strategy.as_str(),
                "attempt": used + 1,
                "max_retries": self.options.max_retries,
                "steps_added": event.steps_added,
                "steps_removed": event.steps_removed,
            })),
        )
        .await;

        run.history
            .entry(step.id.clone())
            .or_default()
            .push(event.strategy);
        run.adaptations.push(event);
        outcome
    }

    /// Types around `step` as currently wired; pruned dependents are ignored
    fn step_types(&self, dag: &ExecutionDag, step: &ExecutionStep) -> StepTypes {
        let outputs_of = |id: &StepId| -> Vec<SemanticType> {
            dag.node(id)
                .and_then(|node| self.registry.get(&node.step.tool))
                .map(|tool| tool.outputs.clone())
                .unwrap_or_default()
        };
        let Some(node) = dag.node(&step.id) else {
            return StepTypes::default();
        };

        let available = if node.step.depends_on.is_empty() {
            match dag.start_type() {
                Some(start) => vec![start.clone()],
                None => self
                    .registry
                    .get(&step.tool)
                    .map(|tool| tool.inputs.clone())
                    .unwrap_or_default(),
            }
        } else {
            node.step.depends_on.iter().flat_map(&outputs_of).collect()
        };
        let dependents = node
            .dependents
            .iter()
            .filter_map(|id| dag.node(id))
            .filter(|dependent| dependent.state != NodeState::Pruned)
            .filter_map(|dependent| {
                let tool = self.registry.get(&dependent.step.tool)?;
                Some(DependentTypes {
                    required: tool.inputs.clone(),
                    provided: dependent
                        .step
                        .depends_on
                        .iter()
                        .filter(|id| **id != step.id)
                        .flat_map(&outputs_of)
                        .collect(),
                })
            })
            .collect();
        StepTypes {
            available,
            dependents,
        }
    }

    /// Record an accepted result, then resolve decisions guarded by the step
    async fn accept(
        &self,
        run: &mut RunState,
        step: &ExecutionStep,
        completion: Completion,
        result: StepResult,
    ) {
        run.dag.mark_completed(&step.id);
        tracing::info!(
            run_id = %run.run_id,
            step_id = %step.id,
            tool = %completion.tool_id,
            uncertainty = result.uncertainty,
            "step execution completed"
        );
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                run_id = %run.run_id,
                step_id = %step.id,
                output = %truncate_json_for_log(&result.output, MAX_LOG_JSON_CHARS),
                rationale = %truncate_for_log(&result.rationale, MAX_LOG_TEXT_CHARS),
                "step output"
            );
        }
        self.report(
            ExecutionProgressEvent::new(
                run.run_id.clone(),
                Some(step.id.clone()),
                Some(completion.tool_id.clone()),
                "step_completed",
            )
            .with_metadata(serde_json::json!({
                "attempt": completion.attempt,
                "uncertainty": result.uncertainty,
            })),
        )
        .await;

        run.results.insert(step.id.clone(), result.clone());
        run.trace.push(TraceEntry {
            step_id: step.id.clone(),
            tool_id: completion.tool_id,
            result: result.clone(),
            attempt: completion.attempt,
            started_at: completion.started_at,
            finished_at: completion.finished_at,
        });

        self.resolve_decisions(run, step, &result).await;
    }

    /// Decisions sharing a guard form one ordered choice: the first whose
    /// predicate holds selects its true branch and every other branch is
    /// pruned. When none holds only the false branches survive.
    async fn resolve_decisions(
        &self,
        run: &mut RunState,
        step: &ExecutionStep,
        result: &StepResult,
    ) {
        let decisions: Vec<DecisionPoint> = run
            .dag
            .decisions_for(&step.id)
            .into_iter()
            .filter(|decision| {
                decision
                    .on_true
                    .iter()
                    .chain(&decision.on_false)
                    .any(|id| run.dag.state(id) != Some(NodeState::Pruned))
            })
            .collect();
        if decisions.is_empty() {
            return;
        }

        let winner = decisions.iter().find(|d| d.predicate.evaluate(result));
        let keep: HashSet<&StepId> = match winner {
            Some(decision) => decision.on_true.iter().collect(),
            None => decisions.iter().flat_map(|d| d.on_false.iter()).collect(),
        };
        let mut pruned = Vec::new();
        for decision in &decisions {
            for id in decision.on_true.iter().chain(&decision.on_false) {
                if !keep.contains(id) {
                    pruned.extend(run.dag.prune(id));
                }
            }
        }

        let selected = winner.map(|d| d.label.clone());
        tracing::info!(
            run_id = %run.run_id,
            step_id = %step.id,
            decisions = decisions.len(),
            selected = ?selected,
            pruned = ?pruned,
            "decision evaluated"
        );
        if !pruned.is_empty() {
            self.report(
                ExecutionProgressEvent::new(
                    run.run_id.clone(),
                    Some(step.id.clone()),
                    None,
                    "branch_pruned",
                )
                .with_message(selected.clone().unwrap_or_default())
                .with_metadata(serde_json::json!({
                    "taken": winner.is_some(),
                    "selected": selected,
                    "pruned": pruned,
                })),
            )
            .await;
        }
    }

    /// Apply the tool's uncertainty policy and sanitise; failures carry 1.0
    fn normalize_result(
        &self,
        step_id: &StepId,
        descriptor: Option<&ToolDescriptor>,
        outcome: &Result<StepResult, StepExecutionError>,
    ) -> StepResult {
        match outcome {
            Ok(result) if result.success => {
                let reported = descriptor
                    .map(|d| d.uncertainty_policy.apply(result.uncertainty))
                    .unwrap_or(result.uncertainty);
                let (uncertainty, violation) = self.propagator.sanitize(step_id, reported);
                let mut result = result.clone();
                result.uncertainty = uncertainty;
                if let Some(violation) = violation {
                    result.rationale = if result.rationale.is_empty() {
                        violation.to_string()
                    } else {
                        format!("{}; {}", result.rationale, violation)
                    };
                }
                result
            }
            Ok(result) => {
                let rationale = if result.rationale.is_empty() {
                    "tool reported failure".to_string()
                } else {
                    result.rationale.clone()
                };
                StepResult::failure(rationale)
            }
            Err(err) => StepResult::failure(err.to_string()),
        }
    }

    async fn finish(&self, mut run: RunState) -> ExecutionResult {
        let (status, error) = match run.halt.take() {
            Some(Halt::Aborted(message)) => (RunStatus::Aborted, Some(message)),
            Some(Halt::Failed(message)) => (RunStatus::Failed, Some(message)),
            Some(Halt::Deadline) if run.trace.is_empty() => (
                RunStatus::Aborted,
                Some("run deadline expired before any step completed".to_string()),
            ),
            Some(Halt::Deadline) => {
                let unfinished: Vec<StepId> = run
                    .dag
                    .nodes()
                    .filter(|n| !matches!(n.state, NodeState::Completed | NodeState::Pruned))
                    .map(|n| n.step.id.clone())
                    .collect();
                run.adaptations.push(
                    AdaptationEvent::new(
                        None,
                        AdaptationStrategy::GracefulDegradation,
                        DEADLINE_REASON,
                    )
                    .with_steps_removed(unfinished),
                );
                (RunStatus::Failed, Some("run deadline expired".to_string()))
            }
            None if run.dag.is_completed() => (RunStatus::Completed, None),
            None => {
                let stuck: Vec<String> = run
                    .dag
                    .nodes()
                    .filter(|n| !matches!(n.state, NodeState::Completed | NodeState::Pruned))
                    .map(|n| n.step.id.to_string())
                    .collect();
                (
                    RunStatus::Failed,
                    Some(format!("steps never ran: {}", stuck.join(", "))),
                )
            }
        };

        let contributions: Vec<Contribution> = run
            .trace
            .iter()
            .map(|entry| {
                let weight = self
                    .registry
                    .get(&entry.tool_id)
                    .map(|d| d.weight)
                    .unwrap_or(1.0);
                Contribution::weighted(entry.result.uncertainty, weight)
            })
            .collect();
        let combined_uncertainty = self.propagator.combine(&contributions);

        let terminals = run.dag.completed_terminals();
        let output = match terminals.as_slice() {
            [] => Value::Null,
            [single] => run
                .results
                .get(single)
                .map(|r| r.output.clone())
                .unwrap_or(Value::Null),
            many => Value::Object(
                many.iter()
                    .filter_map(|id| {
                        run.results
                            .get(id)
                            .map(|r| (id.to_string(), r.output.clone()))
                    })
                    .collect(),
            ),
        };

        let phase = match status {
            RunStatus::Completed => "run_completed",
            RunStatus::Aborted => "run_aborted",
            _ => "run_failed",
        };
        match &error {
            None => tracing::info!(
                run_id = %run.run_id,
                steps = run.trace.len(),
                adaptations = run.adaptations.len(),
                combined_uncertainty = combined_uncertainty,
                "run completed"
            ),
            Some(message) => tracing::error!(
                run_id = %run.run_id,
                status = %status.as_str(),
                steps = run.trace.len(),
                error = %truncate_for_log(message, MAX_LOG_TEXT_CHARS),
                "run did not complete"
            ),
        }
        let mut event = ExecutionProgressEvent::new(run.run_id.clone(), None, None, phase)
            .with_metadata(serde_json::json!({
                "status": status.as_str(),
                "steps": run.trace.len(),
                "adaptations": run.adaptations.len(),
                "combined_uncertainty": combined_uncertainty,
            }));
        if let Some(message) = &error {
            event = event.with_message(message.clone());
        }
        self.report(event).await;

        ExecutionResult {
            run_id: run.run_id,
            status,
            output,
            trace: run.trace,
            combined_uncertainty,
            uncertainty_law: self.options.uncertainty_law,
            adaptations: run.adaptations,
            pruned_steps: run.dag.pruned_nodes(),
            error,
        }
    }

    fn compute_retry_backoff(&self, retries_used: u32) -> Duration {
        let base_ms = self.options.retry_base_delay.as_millis();
        if base_ms == 0 {
            return Duration::from_millis(0);
        }
        let max_ms = self.options.retry_max_delay.as_millis().max(base_ms);
        let shift = retries_used.min(20);
        let multiplier = 1u128 << shift;
        let backoff_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        let millis = u64::try_from(backoff_ms).unwrap_or(u64::MAX);
        Duration::from_millis(millis)
    }

    async fn report(&self, event: ExecutionProgressEvent) {
        report_progress(self.progress_reporter.as_ref(), event).await;
    }
}

/// Initial input for roots, the predecessor's output for one predecessor,
/// an object keyed by predecessor id otherwise
fn step_input(run: &RunState, step: &ExecutionStep) -> Value {
    match step.depends_on.as_slice() {
        [] => run.initial_input.clone(),
        [dep] => run
            .results
            .get(dep)
            .map(|r| r.output.clone())
            .unwrap_or(Value::Null),
        deps => Value::Object(
            deps.iter()
                .map(|dep| {
                    let output = run
                        .results
                        .get(dep)
                        .map(|r| r.output.clone())
                        .unwrap_or(Value::Null);
                    (dep.to_string(), output)
                })
                .collect(),
        ),
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Body of a spawned step: backoff, resource slot, tool call under timeout
async fn run_step(job: StepJob) {
    let StepJob {
        run_id,
        step_id,
        tool_id,
        tool,
        class,
        input,
        params,
        attempt,
        delay,
        step_timeout,
        pool,
        token,
        tx,
    } = job;

    let outcome = async {
        if !delay.is_zero() {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = token.cancelled() => return (Err(StepExecutionError::Cancelled), Utc::now()),
            }
        }
        let Some(tool) = tool else {
            return (Err(StepExecutionError::UnknownTool(tool_id.clone())), Utc::now());
        };
        let _permit = tokio::select! {
            permit = pool.acquire(class) => match permit {
                Ok(permit) => permit,
                Err(_) => return (Err(StepExecutionError::Cancelled), Utc::now()),
            },
            _ = token.cancelled() => return (Err(StepExecutionError::Cancelled), Utc::now()),
        };

        let started_at = Utc::now();
        let ctx = ToolContext::new(run_id, step_id.clone(), attempt, params)
            .with_cancellation_token(token);
        let call = AssertUnwindSafe(tool.execute(input, ctx)).catch_unwind();
        let outcome = match timeout(step_timeout, call).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => Err(StepExecutionError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(StepExecutionError::Timeout(step_timeout)),
        };
        (outcome, started_at)
    };
    let (outcome, started_at) = outcome.await;

    let completion = Completion {
        step_id,
        tool_id,
        attempt,
        outcome,
        started_at,
        finished_at: Utc::now(),
    };
    if tx.send(completion).is_err() {
        tracing::debug!("run loop gone, dropping step completion");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn report_progress(
    reporter: Option<&Arc<dyn ExecutionProgressReporter>>,
    event: ExecutionProgressEvent,
) {
    if let Some(reporter) = reporter {
        if let Err(err) = reporter.report(event).await {
            tracing::warn!("failed to report execution progress: {}", err);
        }
    }
}
