//! Execution DAG builder
//!
//! Turns planner chains into an [`ExecutionDag`]:
//! - chain 0 is the primary strategy and becomes a linear run of steps
//!   `s1, s2, ...`
//! - each [`DecisionRule`] grafts an alternative chain onto the primary at the
//!   point where the two diverge, behind a decision point on the last shared
//!   step
//! - chains no rule refers to are kept as precomputed alternates that the
//!   executor may pivot to at runtime
//!
//! Every step is checked against the registry: the tool must exist and its
//! inputs must be satisfied by its predecessors (or the start type).

use std::collections::HashMap;

use thiserror::Error;

use crate::executor::{Alternate, DecisionPoint, ExecutionDag};
use crate::planner::Chain;
use crate::predicate::Predicate;
use crate::registry::ToolRegistry;
use crate::types::{ExecutionStep, SemanticType, StepId};

/// Structural plan errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("plan has no steps")]
    Empty,

    #[error("duplicate step id: {0}")]
    DuplicateStep(StepId),

    #[error("step '{step}' depends on undefined step '{dependency}'")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("plan contains a cycle involving step: {0}")]
    CyclicPlan(StepId),

    #[error("expected exactly one root step, found {found}")]
    RootCount { found: usize },

    #[error("step '{step}' uses unknown tool '{tool}'")]
    UnknownTool { step: StepId, tool: String },

    #[error("step '{step}' is not type-compatible with its inputs: {reason}")]
    IncompatibleStep { step: StepId, reason: String },

    #[error("invalid decision point: {0}")]
    InvalidDecision(String),
}

/// Declarative branching rule
///
/// When `predicate` holds for the last step the primary chain shares with
/// chain `alternative`, the alternative's remaining steps run instead of the
/// primary's. Rules forking at the same step are tried in order and only the
/// first that holds is taken.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRule {
    pub label: String,
    pub predicate: Predicate,
    /// Index into the chain list; 0 is the primary chain and is not allowed
    pub alternative: usize,
}

impl DecisionRule {
    pub fn new(predicate: Predicate, alternative: usize) -> Self {
        Self {
            label: format!("take chain {}", alternative),
            predicate,
            alternative,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

fn primary_step_id(position: usize) -> StepId {
    StepId::from(format!("s{}", position + 1))
}

fn chain_step_id(chain: usize, position: usize) -> StepId {
    StepId::from(format!("c{}s{}", chain, position + 1))
}

fn common_prefix(a: &[String], b: &[String]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Chain → DAG builder bound to a tool registry
pub struct DagBuilder<'a> {
    registry: &'a ToolRegistry,
}

impl<'a> DagBuilder<'a> {
    pub fn new(registry: &'a ToolRegistry) -> Self {
        Self { registry }
    }

    /// Build a DAG from a single linear chain
    pub fn build_linear(
        &self,
        start: &SemanticType,
        chain: &Chain,
    ) -> Result<ExecutionDag, BuildError> {
        self.build(start, std::slice::from_ref(chain), &[])
    }

    /// Build a DAG from candidate chains and decision rules
    pub fn build(
        &self,
        start: &SemanticType,
        chains: &[Chain],
        rules: &[DecisionRule],
    ) -> Result<ExecutionDag, BuildError> {
        let primary = chains.first().ok_or(BuildError::Empty)?;
        if primary.is_empty() {
            return Err(BuildError::Empty);
        }
        for (idx, chain) in chains.iter().enumerate() {
            self.validate_chain(start, chain, idx)?;
        }

        let mut steps: Vec<ExecutionStep> = Vec::with_capacity(primary.len());
        for (pos, tool) in primary.tools.iter().enumerate() {
            let mut step = ExecutionStep::new(primary_step_id(pos), tool.clone());
            if pos > 0 {
                step = step.after(primary_step_id(pos - 1));
            }
            steps.push(step);
        }

        let mut decisions = Vec::with_capacity(rules.len());
        let mut branches: HashMap<usize, Vec<StepId>> = HashMap::new();
        for rule in rules {
            let alt_idx = rule.alternative;
            if alt_idx == 0 || alt_idx >= chains.len() {
                return Err(BuildError::InvalidDecision(format!(
                    "rule '{}' refers to chain {} but only chains 1..{} are alternatives",
                    rule.label,
                    alt_idx,
                    chains.len()
                )));
            }
            let alt = &chains[alt_idx];
            let shared = common_prefix(&primary.tools, &alt.tools);
            if shared == 0 {
                return Err(BuildError::InvalidDecision(format!(
                    "rule '{}': chain {} shares no step with the primary chain",
                    rule.label, alt_idx
                )));
            }
            if shared == primary.len() && shared == alt.len() {
                return Err(BuildError::InvalidDecision(format!(
                    "rule '{}': chain {} is identical to the primary chain",
                    rule.label, alt_idx
                )));
            }

            let branch = match branches.get(&alt_idx) {
                Some(ids) => ids.clone(),
                None => {
                    let mut ids = Vec::new();
                    for pos in shared..alt.len() {
                        let id = chain_step_id(alt_idx, pos);
                        let dep = if pos == shared {
                            primary_step_id(shared - 1)
                        } else {
                            chain_step_id(alt_idx, pos - 1)
                        };
                        steps.push(ExecutionStep::new(id.clone(), alt.tools[pos].clone()).after(dep));
                        ids.push(id);
                    }
                    branches.insert(alt_idx, ids.clone());
                    ids
                }
            };

            let primary_suffix: Vec<StepId> = (shared..primary.len()).map(primary_step_id).collect();
            decisions.push(
                DecisionPoint::new(primary_step_id(shared - 1), rule.predicate.clone())
                    .with_label(rule.label.clone())
                    .with_on_true(branch)
                    .with_on_false(primary_suffix),
            );
        }

        let mut dag = ExecutionDag::new(steps, decisions)?.with_start_type(start.clone());

        for (alt_idx, alt) in chains.iter().enumerate().skip(1) {
            if branches.contains_key(&alt_idx) {
                continue;
            }
            let shared = common_prefix(&primary.tools, &alt.tools);
            if shared >= primary.len() || shared >= alt.len() {
                continue;
            }
            let fork = (shared > 0).then(|| primary_step_id(shared - 1));
            let mut alt_steps = Vec::new();
            for pos in shared..alt.len() {
                let mut step = ExecutionStep::new(chain_step_id(alt_idx, pos), alt.tools[pos].clone());
                if pos > shared {
                    step = step.after(chain_step_id(alt_idx, pos - 1));
                } else if let Some(fork) = &fork {
                    step = step.after(fork.clone());
                }
                alt_steps.push(step);
            }
            dag.add_alternate(Alternate {
                label: format!("chain {}", alt_idx),
                fork,
                replaces: (shared..primary.len()).map(primary_step_id).collect(),
                steps: alt_steps,
            })?;
        }

        self.validate_types(start, &dag)?;

        tracing::debug!(
            steps = dag.len(),
            decisions = dag.decisions().len(),
            alternates = dag.alternates().len(),
            "execution dag built"
        );
        Ok(dag)
    }

    fn validate_chain(
        &self,
        start: &SemanticType,
        chain: &Chain,
        chain_idx: usize,
    ) -> Result<(), BuildError> {
        let mut available = vec![start.clone()];
        for (pos, tool_id) in chain.tools.iter().enumerate() {
            let step = if chain_idx == 0 {
                primary_step_id(pos)
            } else {
                chain_step_id(chain_idx, pos)
            };
            let tool = self
                .registry
                .get(tool_id)
                .ok_or_else(|| BuildError::UnknownTool {
                    step: step.clone(),
                    tool: tool_id.clone(),
                })?;
            if !tool.accepts_all(&available) {
                return Err(BuildError::IncompatibleStep {
                    step,
                    reason: format!(
                        "tool '{}' needs {} but receives {}",
                        tool_id,
                        format_types(&tool.inputs),
                        format_types(&available)
                    ),
                });
            }
            available = tool.outputs.clone();
        }
        Ok(())
    }

    /// Check every step of an arbitrary DAG against the registry.
    ///
    /// A step's inputs must each be satisfied by the union of its
    /// predecessors' outputs; root steps are checked against `start`.
    pub fn validate_types(&self, start: &SemanticType, dag: &ExecutionDag) -> Result<(), BuildError> {
        for node in dag.nodes() {
            let step = &node.step;
            let tool = self
                .registry
                .get(&step.tool)
                .ok_or_else(|| BuildError::UnknownTool {
                    step: step.id.clone(),
                    tool: step.tool.clone(),
                })?;
            let available: Vec<SemanticType> = if step.depends_on.is_empty() {
                vec![start.clone()]
            } else {
                step.depends_on
                    .iter()
                    .filter_map(|dep| dag.node(dep))
                    .filter_map(|dep| self.registry.get(&dep.step.tool))
                    .flat_map(|dep_tool| dep_tool.outputs.iter().cloned())
                    .collect()
            };
            if !tool.accepts_all(&available) {
                return Err(BuildError::IncompatibleStep {
                    step: step.id.clone(),
                    reason: format!(
                        "tool '{}' needs {} but receives {}",
                        step.tool,
                        format_types(&tool.inputs),
                        format_types(&available)
                    ),
                });
            }
        }
        Ok(())
    }
}

fn format_types(types: &[SemanticType]) -> String {
    let names: Vec<String> = types.iter().map(ToString::to_string).collect();
    format!("[{}]", names.join(", "))
}
