//! StepResult type definition

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of executing one step
///
/// `uncertainty` is in the closed interval [0, 1]; the executor sanitises
/// whatever a tool reports before the result is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Output value handed to successor steps
    #[serde(default)]
    pub output: Value,
    /// Self-reported uncertainty
    pub uncertainty: f64,
    /// Free-text explanation of the uncertainty or failure
    #[serde(default)]
    pub rationale: String,
    /// Whether the step succeeded
    pub success: bool,
}

impl StepResult {
    /// Successful result with an explicit uncertainty
    pub fn success(output: Value, uncertainty: f64, rationale: impl Into<String>) -> Self {
        Self {
            output,
            uncertainty,
            rationale: rationale.into(),
            success: true,
        }
    }

    /// Successful result of a deterministic computation (uncertainty exactly 0)
    pub fn deterministic(output: Value) -> Self {
        Self {
            output,
            uncertainty: 0.0,
            rationale: "deterministic".to_string(),
            success: true,
        }
    }

    /// Failed result; uncertainty is forced to 1.0
    pub fn failure(rationale: impl Into<String>) -> Self {
        Self {
            output: Value::Null,
            uncertainty: 1.0,
            rationale: rationale.into(),
            success: false,
        }
    }

    /// Confidence is the complement of uncertainty
    pub fn confidence(&self) -> f64 {
        1.0 - self.uncertainty
    }
}
