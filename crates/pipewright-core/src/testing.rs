//! Test tools shared by the unit tests of this crate

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::executor::{ExecutionProgressEvent, ExecutionProgressReporter};
use crate::tool::{StepExecutionError, Tool, ToolContext, ToolDescriptor};
use crate::types::{BaseType, SemanticType, StepResult};

pub fn descriptor(
    id: &str,
    tool: Arc<dyn Tool>,
    inputs: &[BaseType],
    outputs: &[BaseType],
) -> ToolDescriptor {
    ToolDescriptor::new(id, tool)
        .with_inputs(inputs.iter().map(|b| SemanticType::of(*b)).collect())
        .with_outputs(outputs.iter().map(|b| SemanticType::of(*b)).collect())
}

/// Always returns the same result
pub struct StaticTool {
    result: StepResult,
    pub calls: Arc<AtomicUsize>,
}

impl StaticTool {
    pub fn new(result: StepResult) -> Self {
        Self {
            result,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_uncertainty(output: Value, uncertainty: f64) -> Self {
        Self::new(StepResult::success(output, uncertainty, "static"))
    }
}

#[async_trait]
impl Tool for StaticTool {
    async fn execute(
        &self,
        _input: Value,
        _ctx: ToolContext,
    ) -> Result<StepResult, StepExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

/// Echoes its input and records the context params it saw
pub struct EchoTool {
    pub seen_params: Arc<Mutex<Vec<serde_json::Map<String, Value>>>>,
    uncertainty: f64,
}

impl EchoTool {
    pub fn new(uncertainty: f64) -> Self {
        Self {
            seen_params: Arc::new(Mutex::new(Vec::new())),
            uncertainty,
        }
    }
}

#[async_trait]
impl Tool for EchoTool {
    async fn execute(&self, input: Value, ctx: ToolContext) -> Result<StepResult, StepExecutionError> {
        if let Ok(mut seen) = self.seen_params.lock() {
            seen.push(ctx.params.clone());
        }
        Ok(StepResult::success(input, self.uncertainty, "echo"))
    }
}

/// Replays a scripted sequence of outcomes, repeating the last one
pub struct SequenceTool {
    outcomes: Mutex<VecDeque<Result<StepResult, StepExecutionError>>>,
    last: Mutex<Option<Result<StepResult, StepExecutionError>>>,
    pub calls: Arc<AtomicUsize>,
}

impl SequenceTool {
    pub fn new(outcomes: Vec<Result<StepResult, StepExecutionError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            last: Mutex::new(None),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Tool for SequenceTool {
    async fn execute(
        &self,
        _input: Value,
        _ctx: ToolContext,
    ) -> Result<StepResult, StepExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.outcomes.lock().expect("outcomes lock").pop_front();
        let mut last = self.last.lock().expect("last lock");
        match next {
            Some(outcome) => {
                *last = Some(outcome.clone());
                outcome
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(StepExecutionError::failed("no scripted outcome"))),
        }
    }
}

/// Always raises
pub struct FailingTool {
    message: String,
    pub calls: Arc<AtomicUsize>,
}

impl FailingTool {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Tool for FailingTool {
    async fn execute(
        &self,
        _input: Value,
        _ctx: ToolContext,
    ) -> Result<StepResult, StepExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StepExecutionError::failed(self.message.clone()))
    }
}

/// Sleeps and records peak concurrency across all clones sharing the counters
pub struct SlowTool {
    delay: Duration,
    pub active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl SlowTool {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Tool for SlowTool {
    async fn execute(
        &self,
        _input: Value,
        ctx: ToolContext,
    ) -> Result<StepResult, StepExecutionError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = ctx.cancelled() => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                return Err(StepExecutionError::Cancelled);
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(StepResult::deterministic(Value::String(ctx.step_id.to_string())))
    }
}

/// Panics on every call
pub struct PanickingTool;

#[async_trait]
impl Tool for PanickingTool {
    async fn execute(
        &self,
        _input: Value,
        _ctx: ToolContext,
    ) -> Result<StepResult, StepExecutionError> {
        panic!("tool exploded");
    }
}

pub struct CollectProgressReporter {
    pub events: Arc<RwLock<Vec<ExecutionProgressEvent>>>,
}

impl CollectProgressReporter {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

#[async_trait]
impl ExecutionProgressReporter for CollectProgressReporter {
    async fn report(&self, event: ExecutionProgressEvent) -> Result<(), String> {
        self.events.write().await.push(event);
        Ok(())
    }
}
