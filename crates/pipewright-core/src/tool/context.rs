//! ToolContext type definition

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::types::StepId;

/// Execution context handed to a tool invocation
///
/// Provides access to:
/// - Run and step identification
/// - The context map (step params plus adaptation adjustments)
/// - CancellationToken for cooperative cancellation
#[derive(Clone)]
pub struct ToolContext {
    /// Run ID
    pub run_id: String,
    /// Step ID (logical ID)
    pub step_id: StepId,
    /// Attempt number, starting at 1; grows with each adaptation of the step
    pub attempt: u32,
    /// Context map
    pub params: Map<String, Value>,
    /// Cancellation token for cooperative cancellation
    /// Tools should check this between sub-operations and stop if cancelled
    pub cancellation_token: CancellationToken,
}

impl ToolContext {
    pub fn new(
        run_id: impl Into<String>,
        step_id: impl Into<StepId>,
        attempt: u32,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step_id: step_id.into(),
            attempt,
            params,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Get a context value by key
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Check if the run has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Get a future that completes when cancellation is requested
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("run_id", &self.run_id)
            .field("step_id", &self.step_id)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}
