//! Uncertainty propagation
//!
//! Every executed step contributes a scalar uncertainty in [0, 1]. A
//! [`UncertaintyLaw`] folds the contributions of all executed (non-pruned)
//! steps into one pipeline-level figure. The default law compounds
//! independent contributions multiplicatively:
//!
//! ```text
//! combined = 1 - Π(1 - uᵢ)
//! ```
//!
//! so two independent 10% uncertainties combine to 19%, not 10%.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::StepId;

/// A tool reported an uncertainty outside [0, 1]
#[derive(Debug, Clone, Error, PartialEq)]
#[error("step '{step_id}' reported uncertainty {value} outside [0, 1]; clamped to {clamped}")]
pub struct InvalidUncertaintyError {
    pub step_id: StepId,
    pub value: f64,
    pub clamped: f64,
}

/// One step's input to a law
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contribution {
    pub uncertainty: f64,
    /// Only the weighted-average law looks at this
    pub weight: f64,
}

impl Contribution {
    pub fn new(uncertainty: f64) -> Self {
        Self {
            uncertainty,
            weight: 1.0,
        }
    }

    pub fn weighted(uncertainty: f64, weight: f64) -> Self {
        Self {
            uncertainty,
            weight,
        }
    }
}

/// Composition law for per-step uncertainties
pub trait UncertaintyLaw: Send + Sync {
    fn name(&self) -> &'static str;

    /// Combine contributions into a value in [0, 1]; empty input is 0.0
    fn combine(&self, contributions: &[Contribution]) -> f64;
}

/// `1 - Π(1 - uᵢ)`
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiplicativeLaw;

impl UncertaintyLaw for MultiplicativeLaw {
    fn name(&self) -> &'static str {
        "multiplicative"
    }

    fn combine(&self, contributions: &[Contribution]) -> f64 {
        let retained: f64 = contributions
            .iter()
            .map(|c| 1.0 - c.uncertainty)
            .product();
        clamp_unit(1.0 - retained)
    }
}

/// Largest single contribution
#[derive(Debug, Clone, Copy, Default)]
pub struct MaximumLaw;

impl UncertaintyLaw for MaximumLaw {
    fn name(&self) -> &'static str {
        "maximum"
    }

    fn combine(&self, contributions: &[Contribution]) -> f64 {
        contributions
            .iter()
            .map(|c| c.uncertainty)
            .fold(0.0, f64::max)
    }
}

/// Weight-averaged contributions; non-positive weights are ignored
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedAverageLaw;

impl UncertaintyLaw for WeightedAverageLaw {
    fn name(&self) -> &'static str {
        "weighted_average"
    }

    fn combine(&self, contributions: &[Contribution]) -> f64 {
        let (sum, total) = contributions
            .iter()
            .filter(|c| c.weight > 0.0 && c.weight.is_finite())
            .fold((0.0, 0.0), |(sum, total), c| {
                (sum + c.uncertainty * c.weight, total + c.weight)
            });
        if total == 0.0 {
            return 0.0;
        }
        clamp_unit(sum / total)
    }
}

/// Named selector for the built-in laws
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncertaintyLawKind {
    #[default]
    Multiplicative,
    Maximum,
    #[serde(alias = "weighted-average")]
    WeightedAverage,
}

impl UncertaintyLawKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UncertaintyLawKind::Multiplicative => "multiplicative",
            UncertaintyLawKind::Maximum => "maximum",
            UncertaintyLawKind::WeightedAverage => "weighted_average",
        }
    }

    pub fn law(&self) -> Arc<dyn UncertaintyLaw> {
        match self {
            UncertaintyLawKind::Multiplicative => Arc::new(MultiplicativeLaw),
            UncertaintyLawKind::Maximum => Arc::new(MaximumLaw),
            UncertaintyLawKind::WeightedAverage => Arc::new(WeightedAverageLaw),
        }
    }
}

impl fmt::Display for UncertaintyLawKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UncertaintyLawKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "multiplicative" => Ok(UncertaintyLawKind::Multiplicative),
            "maximum" | "max" => Ok(UncertaintyLawKind::Maximum),
            "weighted_average" => Ok(UncertaintyLawKind::WeightedAverage),
            other => Err(format!("unknown uncertainty law: {}", other)),
        }
    }
}

/// Sanitises reported values and combines them with the configured law
#[derive(Clone)]
pub struct UncertaintyPropagator {
    law: Arc<dyn UncertaintyLaw>,
}

impl UncertaintyPropagator {
    pub fn new(kind: UncertaintyLawKind) -> Self {
        Self { law: kind.law() }
    }

    pub fn with_law(law: Arc<dyn UncertaintyLaw>) -> Self {
        Self { law }
    }

    pub fn law_name(&self) -> &'static str {
        self.law.name()
    }

    /// Clamp a reported value into [0, 1]. NaN is treated as total uncertainty.
    ///
    /// Returns the usable value plus the violation when one occurred; the
    /// caller appends the violation to the step rationale.
    pub fn sanitize(
        &self,
        step_id: &StepId,
        value: f64,
    ) -> (f64, Option<InvalidUncertaintyError>) {
        if (0.0..=1.0).contains(&value) {
            return (value, None);
        }
        let clamped = if value.is_nan() {
            1.0
        } else {
            value.clamp(0.0, 1.0)
        };
        tracing::warn!(
            step_id = %step_id,
            reported = value,
            clamped = clamped,
            "tool reported uncertainty outside [0, 1]"
        );
        (
            clamped,
            Some(InvalidUncertaintyError {
                step_id: step_id.clone(),
                value,
                clamped,
            }),
        )
    }

    pub fn combine(&self, contributions: &[Contribution]) -> f64 {
        self.law.combine(contributions)
    }
}

impl Default for UncertaintyPropagator {
    fn default() -> Self {
        Self::new(UncertaintyLawKind::default())
    }
}

impl fmt::Debug for UncertaintyPropagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UncertaintyPropagator")
            .field("law", &self.law.name())
            .finish()
    }
}

/// Multiplicative combination of plain values
pub fn combine(uncertainties: &[f64]) -> f64 {
    let contributions: Vec<Contribution> =
        uncertainties.iter().copied().map(Contribution::new).collect();
    MultiplicativeLaw.combine(&contributions)
}

fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}
