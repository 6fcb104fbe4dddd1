//! Adaptation policy
//!
//! After every step the executor checks the outcome. A failure or a
//! low-confidence success is handed to an [`AdaptationPolicy`], which picks
//! one strategy from a fixed set. The executor enforces the per-step attempt
//! budget itself, so a policy cannot loop forever.

use serde_json::{Map, Value};

use crate::registry::ToolRegistry;
use crate::tool::ToolDescriptor;
use crate::trace::AdaptationStrategy;
use crate::types::{ExecutionStep, SemanticType, StepResult};

/// Why the executor is asking for an adaptation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptationTrigger {
    /// The step failed (tool raised, timed out or panicked)
    Failure,
    /// The step succeeded but its confidence is below the floor
    LowConfidence,
}

/// Types wired around a step, used to vet replacement and inserted tools
#[derive(Debug, Clone, Default)]
pub struct StepTypes {
    /// Outputs of the step's predecessors, or the start type for a root
    pub available: Vec<SemanticType>,
    pub dependents: Vec<DependentTypes>,
}

/// Inputs a downstream step needs, and what its other predecessors supply
#[derive(Debug, Clone, Default)]
pub struct DependentTypes {
    pub required: Vec<SemanticType>,
    pub provided: Vec<SemanticType>,
}

impl StepTypes {
    /// `candidate` can replace the step's tool without breaking either side
    pub fn fits_in_place(&self, candidate: &ToolDescriptor) -> bool {
        candidate.accepts_all(&self.available)
            && self.dependents.iter().all(|dependent| {
                dependent.required.iter().all(|input| {
                    dependent
                        .provided
                        .iter()
                        .chain(&candidate.outputs)
                        .any(|output| output.feeds(input))
                })
            })
    }

    /// `candidate` can run between the step's predecessors and `target`
    pub fn fits_ahead(&self, candidate: &ToolDescriptor, target: &ToolDescriptor) -> bool {
        candidate.accepts_all(&self.available) && target.accepts_all(&candidate.outputs)
    }
}

/// Everything a policy may look at
pub struct AdaptationContext<'a> {
    pub step: &'a ExecutionStep,
    /// Descriptor of the tool that produced `result`
    pub descriptor: Option<&'a ToolDescriptor>,
    pub result: &'a StepResult,
    pub trigger: AdaptationTrigger,
    /// Strategies already applied to this step, oldest first
    pub history: &'a [AdaptationStrategy],
    pub max_retries: u32,
    pub confidence_floor: f64,
    /// An alternate chain diverges at this step
    pub pivot_available: bool,
    pub registry: &'a ToolRegistry,
    pub types: &'a StepTypes,
}

impl AdaptationContext<'_> {
    pub fn attempts_used(&self) -> u32 {
        self.history.len() as u32
    }

    pub fn has_used(&self, strategy: AdaptationStrategy) -> bool {
        self.history.contains(&strategy)
    }

    /// Registered, type-compatible fallback for the current tool, if it was
    /// not already used
    pub fn fallback(&self) -> Option<&str> {
        if self.has_used(AdaptationStrategy::RetryWithFallback) {
            return None;
        }
        self.descriptor
            .and_then(|d| d.fallback.as_deref())
            .filter(|id| *id != self.step.tool)
            .filter(|id| {
                self.registry
                    .get(id)
                    .is_some_and(|fallback| self.types.fits_in_place(fallback))
            })
    }

    /// Registered preprocessor whose outputs the current tool accepts, if
    /// not inserted already
    pub fn preprocessor(&self) -> Option<&str> {
        if self.has_used(AdaptationStrategy::InsertPreprocessing) {
            return None;
        }
        let target = self.descriptor?;
        target.preprocessor.as_deref().filter(|id| {
            self.registry
                .get(id)
                .is_some_and(|pre| self.types.fits_ahead(pre, target))
        })
    }
}

/// What to do about a step
#[derive(Debug, Clone, PartialEq)]
pub enum AdaptationDecision {
    /// Re-run the step with another tool
    UseFallback(String),
    /// Run another tool ahead of the step, then re-run it
    InsertPreprocessing(String),
    /// Re-run the step with extra context parameters
    AdjustParameters(Map<String, Value>),
    /// Switch to a precomputed alternate chain
    Pivot,
    /// Accept the result and lower the confidence floor
    Degrade,
    /// No adaptation: failures fail the run, low-confidence results are kept
    GiveUp,
}

impl AdaptationDecision {
    pub fn strategy(&self) -> Option<AdaptationStrategy> {
        match self {
            AdaptationDecision::UseFallback(_) => Some(AdaptationStrategy::RetryWithFallback),
            AdaptationDecision::InsertPreprocessing(_) => {
                Some(AdaptationStrategy::InsertPreprocessing)
            }
            AdaptationDecision::AdjustParameters(_) => Some(AdaptationStrategy::ParameterAdjustment),
            AdaptationDecision::Pivot => Some(AdaptationStrategy::ApproachPivot),
            AdaptationDecision::Degrade => Some(AdaptationStrategy::GracefulDegradation),
            AdaptationDecision::GiveUp => None,
        }
    }
}

/// Strategy selection seam
///
/// Implementations may be rule tables, thresholds or an external reasoning
/// component; the executor's invariants hold for any of them.
pub trait AdaptationPolicy: Send + Sync {
    fn decide(&self, ctx: &AdaptationContext<'_>) -> AdaptationDecision;
}

/// Default threshold-driven policy
///
/// Failure: fallback tool (once), then pivot, then parameter adjustment.
/// Low confidence: preprocessing (once), fallback (once), pivot, then
/// graceful degradation.
#[derive(Debug, Clone, Default)]
pub struct ThresholdAdaptationPolicy {
    adjustments: Map<String, Value>,
}

impl ThresholdAdaptationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra parameters merged into the step context on a parameter-adjustment retry
    pub fn with_parameter_adjustments(mut self, adjustments: Map<String, Value>) -> Self {
        self.adjustments = adjustments;
        self
    }

    fn adjustments_for(&self, ctx: &AdaptationContext<'_>) -> Map<String, Value> {
        let mut params = self.adjustments.clone();
        params.insert(
            "adaptation_attempt".to_string(),
            Value::from(ctx.attempts_used() + 1),
        );
        params
    }
}

impl AdaptationPolicy for ThresholdAdaptationPolicy {
    fn decide(&self, ctx: &AdaptationContext<'_>) -> AdaptationDecision {
        match ctx.trigger {
            AdaptationTrigger::Failure => {
                if let Some(fallback) = ctx.fallback() {
                    AdaptationDecision::UseFallback(fallback.to_string())
                } else if ctx.pivot_available {
                    AdaptationDecision::Pivot
                } else {
                    AdaptationDecision::AdjustParameters(self.adjustments_for(ctx))
                }
            }
            AdaptationTrigger::LowConfidence => {
                if let Some(preprocessor) = ctx.preprocessor() {
                    AdaptationDecision::InsertPreprocessing(preprocessor.to_string())
                } else if let Some(fallback) = ctx.fallback() {
                    AdaptationDecision::UseFallback(fallback.to_string())
                } else if ctx.pivot_available {
                    AdaptationDecision::Pivot
                } else {
                    AdaptationDecision::Degrade
                }
            }
        }
    }
}

/// Policy that never adapts
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAdaptationPolicy;

impl AdaptationPolicy for NoAdaptationPolicy {
    fn decide(&self, _ctx: &AdaptationContext<'_>) -> AdaptationDecision {
        AdaptationDecision::GiveUp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{descriptor, StaticTool};
    use crate::types::BaseType;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> ToolRegistry {
        let noop = Arc::new(StaticTool::new(StepResult::deterministic(json!(null))));
        let mut registry = ToolRegistry::new();
        registry
            .register(
                descriptor("extractor", noop.clone(), &[BaseType::Text], &[BaseType::Entities])
                    .with_fallback("backup_extractor")
                    .with_preprocessor("cleanup"),
            )
            .expect("register");
        registry
            .register(descriptor(
                "backup_extractor",
                noop.clone(),
                &[BaseType::Text],
                &[BaseType::Entities],
            ))
            .expect("register");
        registry
            .register(descriptor("cleanup", noop, &[BaseType::Text], &[BaseType::Text]))
            .expect("register");
        registry
    }

    /// TEXT in, one ENTITIES consumer downstream
    fn text_step_types() -> StepTypes {
        StepTypes {
            available: vec![SemanticType::of(BaseType::Text)],
            dependents: vec![DependentTypes {
                required: vec![SemanticType::of(BaseType::Entities)],
                provided: Vec::new(),
            }],
        }
    }

    fn decide(
        registry: &ToolRegistry,
        trigger: AdaptationTrigger,
        history: &[AdaptationStrategy],
        pivot_available: bool,
    ) -> AdaptationDecision {
        decide_with_types(registry, trigger, history, pivot_available, &text_step_types())
    }

    fn decide_with_types(
        registry: &ToolRegistry,
        trigger: AdaptationTrigger,
        history: &[AdaptationStrategy],
        pivot_available: bool,
        types: &StepTypes,
    ) -> AdaptationDecision {
        let step = ExecutionStep::new("s2", "extractor");
        let result = StepResult::failure("boom");
        let ctx = AdaptationContext {
            step: &step,
            descriptor: registry.get("extractor"),
            result: &result,
            trigger,
            history,
            max_retries: 5,
            confidence_floor: 0.5,
            pivot_available,
            registry,
            types,
        };
        ThresholdAdaptationPolicy::new().decide(&ctx)
    }

    #[test]
    fn test_failure_escalation() {
        let registry = registry();
        assert_eq!(
            decide(&registry, AdaptationTrigger::Failure, &[], true),
            AdaptationDecision::UseFallback("backup_extractor".to_string())
        );
        assert_eq!(
            decide(
                &registry,
                AdaptationTrigger::Failure,
                &[AdaptationStrategy::RetryWithFallback],
                true
            ),
            AdaptationDecision::Pivot
        );
        match decide(
            &registry,
            AdaptationTrigger::Failure,
            &[AdaptationStrategy::RetryWithFallback],
            false,
        ) {
            AdaptationDecision::AdjustParameters(params) => {
                assert_eq!(params.get("adaptation_attempt"), Some(&json!(2)));
            }
            other => panic!("expected parameter adjustment, got {:?}", other),
        }
    }

    #[test]
    fn test_low_confidence_escalation() {
        let registry = registry();
        assert_eq!(
            decide(&registry, AdaptationTrigger::LowConfidence, &[], false),
            AdaptationDecision::InsertPreprocessing("cleanup".to_string())
        );
        assert_eq!(
            decide(
                &registry,
                AdaptationTrigger::LowConfidence,
                &[AdaptationStrategy::InsertPreprocessing],
                false
            ),
            AdaptationDecision::UseFallback("backup_extractor".to_string())
        );
        assert_eq!(
            decide(
                &registry,
                AdaptationTrigger::LowConfidence,
                &[
                    AdaptationStrategy::InsertPreprocessing,
                    AdaptationStrategy::RetryWithFallback
                ],
                false
            ),
            AdaptationDecision::Degrade
        );
    }

    #[test]
    fn test_unregistered_fallback_is_ignored() {
        let noop = Arc::new(StaticTool::new(StepResult::deterministic(json!(null))));
        let mut registry = ToolRegistry::new();
        registry
            .register(
                descriptor("extractor", noop, &[BaseType::Text], &[BaseType::Entities])
                    .with_fallback("missing"),
            )
            .expect("register");
        assert!(matches!(
            decide(&registry, AdaptationTrigger::Failure, &[], false),
            AdaptationDecision::AdjustParameters(_)
        ));
        assert_eq!(
            AdaptationDecision::Degrade.strategy(),
            Some(AdaptationStrategy::GracefulDegradation)
        );
        assert_eq!(AdaptationDecision::GiveUp.strategy(), None);
    }

    #[test]
    fn test_incompatible_fallback_is_skipped() {
        let noop = Arc::new(StaticTool::new(StepResult::deterministic(json!(null))));
        let mut registry = ToolRegistry::new();
        registry
            .register(
                descriptor("extractor", noop.clone(), &[BaseType::Text], &[BaseType::Entities])
                    .with_fallback("vectorize"),
            )
            .expect("register");
        registry
            .register(descriptor(
                "vectorize",
                noop,
                &[BaseType::Table],
                &[BaseType::Vector],
            ))
            .expect("register");

        assert!(matches!(
            decide(&registry, AdaptationTrigger::Failure, &[], false),
            AdaptationDecision::AdjustParameters(_)
        ));
        assert_eq!(
            decide(&registry, AdaptationTrigger::LowConfidence, &[], false),
            AdaptationDecision::Degrade
        );
    }

    #[test]
    fn test_fallback_must_satisfy_dependents() {
        let registry = registry();
        let mut types = text_step_types();
        types.dependents.push(DependentTypes {
            required: vec![
                SemanticType::of(BaseType::Entities),
                SemanticType::of(BaseType::Relationships),
            ],
            provided: Vec::new(),
        });
        // backup_extractor yields ENTITIES only
        assert!(matches!(
            decide_with_types(&registry, AdaptationTrigger::Failure, &[], false, &types),
            AdaptationDecision::AdjustParameters(_)
        ));

        types.dependents[1].provided = vec![SemanticType::of(BaseType::Relationships)];
        assert_eq!(
            decide_with_types(&registry, AdaptationTrigger::Failure, &[], false, &types),
            AdaptationDecision::UseFallback("backup_extractor".to_string())
        );
    }

    #[test]
    fn test_preprocessor_must_feed_the_step() {
        let noop = Arc::new(StaticTool::new(StepResult::deterministic(json!(null))));
        let mut registry = ToolRegistry::new();
        registry
            .register(
                descriptor("extractor", noop.clone(), &[BaseType::Text], &[BaseType::Entities])
                    .with_preprocessor("to_table"),
            )
            .expect("register");
        registry
            .register(descriptor("to_table", noop, &[BaseType::Text], &[BaseType::Table]))
            .expect("register");

        assert_eq!(
            decide(&registry, AdaptationTrigger::LowConfidence, &[], false),
            AdaptationDecision::Degrade
        );

        // cleanup feeds the extractor but cannot read what arrives
        let file_in = StepTypes {
            available: vec![SemanticType::of(BaseType::File)],
            dependents: Vec::new(),
        };
        assert_eq!(
            decide_with_types(&self::registry(), AdaptationTrigger::LowConfidence, &[], false, &file_in),
            AdaptationDecision::Degrade
        );
    }
}
