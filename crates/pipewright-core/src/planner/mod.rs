//! Chain planner
//!
//! Finds ordered tool sequences that turn a start type into a goal type.
//!
//! The search is a layered breadth-first walk. A search state is the bundle
//! of types produced by the last tool in the chain (initially just the start
//! type) together with its depth. A tool applies to a state when every one of
//! its inputs is satisfied by some type in the bundle. Each `(bundle, depth)`
//! state is expanded at most once, but every edge into it is remembered so
//! that all chains reaching the goal can be enumerated afterwards. Type cycles
//! (e.g. a TEXT→TEXT cleanup pass) are fine: depth strictly grows, and the
//! walk stops at `max_depth`.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use crate::registry::ToolRegistry;
use crate::types::{is_compatible, SemanticType};

/// Upper bound on enumerated paths before ranking
const MAX_ENUMERATED_CHAINS: usize = 1024;

/// Planner errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("no chain from {start} to {goal} within depth {max_depth}")]
    NoChainFound {
        start: SemanticType,
        goal: SemanticType,
        max_depth: usize,
    },
}

/// An ordered tool-id list whose type signatures connect end to end
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chain {
    pub tools: Vec<String>,
    /// Sum of declared tool costs
    pub cost: f64,
    /// Types produced by the last tool
    pub produces: Vec<SemanticType>,
}

impl Chain {
    /// Chain with no cost or type information attached
    pub fn new(tools: Vec<String>) -> Self {
        Self {
            tools,
            cost: 0.0,
            produces: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Debug)]
struct SearchNode {
    bundle: Vec<SemanticType>,
    depth: usize,
    /// (parent node index, tool id) for every edge into this node
    parents: Vec<(usize, String)>,
}

/// Breadth-first chain planner
#[derive(Debug, Clone)]
pub struct ChainPlanner {
    max_results: usize,
}

impl Default for ChainPlanner {
    fn default() -> Self {
        Self::new(crate::options::DEFAULT_MAX_CHAINS)
    }
}

impl ChainPlanner {
    pub fn new(max_results: usize) -> Self {
        Self {
            max_results: max_results.max(1),
        }
    }

    pub fn max_results(&self) -> usize {
        self.max_results
    }

    /// Find chains from `start` to `goal`, shortest first, then cheapest.
    pub fn plan(
        &self,
        registry: &ToolRegistry,
        start: &SemanticType,
        goal: &SemanticType,
        max_depth: usize,
    ) -> Result<Vec<Chain>, PlanError> {
        let mut nodes = vec![SearchNode {
            bundle: vec![start.clone()],
            depth: 0,
            parents: Vec::new(),
        }];
        let mut index: HashMap<(Vec<SemanticType>, usize), usize> = HashMap::new();
        index.insert((vec![start.clone()], 0), 0);

        let mut frontier = vec![0usize];
        let mut goal_nodes = Vec::new();

        for depth in 0..max_depth {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for &node_idx in &frontier {
                let bundle = nodes[node_idx].bundle.clone();
                for tool in registry.tools() {
                    if tool.outputs.is_empty() || !tool.accepts_all(&bundle) {
                        continue;
                    }
                    let produced = normalize_bundle(&tool.outputs);
                    let key = (produced, depth + 1);
                    let child = match index.get(&key) {
                        Some(&existing) => existing,
                        None => {
                            let child = nodes.len();
                            let reaches_goal = key.0.iter().any(|ty| is_compatible(ty, goal));
                            nodes.push(SearchNode {
                                bundle: key.0.clone(),
                                depth: depth + 1,
                                parents: Vec::new(),
                            });
                            index.insert(key, child);
                            // Goal states end a chain; they are not expanded
                            if reaches_goal {
                                goal_nodes.push(child);
                            } else {
                                next.push(child);
                            }
                            child
                        }
                    };
                    nodes[child].parents.push((node_idx, tool.id.clone()));
                }
            }
            frontier = next;
        }

        let mut paths = Vec::new();
        for &goal_idx in &goal_nodes {
            let mut suffix = Vec::new();
            collect_paths(&nodes, goal_idx, &mut suffix, &mut paths);
        }

        let mut chains: Vec<Chain> = paths
            .into_iter()
            .filter(|tools| !tools.is_empty())
            .map(|tools| {
                let cost = tools
                    .iter()
                    .filter_map(|id| registry.get(id))
                    .map(|t| t.cost)
                    .sum();
                let produces = tools
                    .last()
                    .and_then(|id| registry.get(id))
                    .map(|t| normalize_bundle(&t.outputs))
                    .unwrap_or_default();
                Chain {
                    tools,
                    cost,
                    produces,
                }
            })
            .collect();

        chains.sort_by(|a, b| {
            a.len()
                .cmp(&b.len())
                .then_with(|| a.cost.total_cmp(&b.cost))
                .then_with(|| a.tools.cmp(&b.tools))
        });
        chains.dedup_by(|a, b| a.tools == b.tools);
        chains.truncate(self.max_results);

        if chains.is_empty() {
            tracing::debug!(
                start = %start,
                goal = %goal,
                max_depth = max_depth,
                explored = nodes.len(),
                "no chain found"
            );
            return Err(PlanError::NoChainFound {
                start: start.clone(),
                goal: goal.clone(),
                max_depth,
            });
        }

        tracing::debug!(
            start = %start,
            goal = %goal,
            chains = chains.len(),
            best = ?chains[0].tools,
            "chains planned"
        );
        Ok(chains)
    }
}

fn normalize_bundle(types: &[SemanticType]) -> Vec<SemanticType> {
    let mut bundle = types.to_vec();
    bundle.sort();
    bundle.dedup();
    bundle
}

fn collect_paths(
    nodes: &[SearchNode],
    idx: usize,
    suffix: &mut Vec<String>,
    out: &mut Vec<Vec<String>>,
) {
    if out.len() >= MAX_ENUMERATED_CHAINS {
        return;
    }
    let node = &nodes[idx];
    if node.depth == 0 {
        out.push(suffix.iter().rev().cloned().collect());
        return;
    }
    for (parent, tool) in &node.parents {
        suffix.push(tool.clone());
        collect_paths(nodes, *parent, suffix, out);
        suffix.pop();
    }
}

/// Whether every adjacent pair in `tools` connects: each input of tool
/// *i+1* is satisfied by an output of tool *i*, and the first tool accepts
/// `start`.
pub fn chain_is_valid(registry: &ToolRegistry, start: &SemanticType, tools: &[String]) -> bool {
    let mut available = vec![start.clone()];
    for id in tools {
        let Some(tool) = registry.get(id) else {
            return false;
        };
        if !tool.accepts_all(&available) {
            return false;
        }
        available = tool.outputs.clone();
    }
    !tools.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{descriptor, StaticTool};
    use crate::tool::ToolDescriptor;
    use crate::types::{BaseType, StepResult};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;
    use std::sync::Arc;

    fn noop() -> Arc<StaticTool> {
        Arc::new(StaticTool::new(StepResult::deterministic(json!(null))))
    }

    fn ty(base: BaseType) -> SemanticType {
        SemanticType::of(base)
    }

    fn document_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register(descriptor("loader", noop(), &[BaseType::File], &[BaseType::Text]))
            .expect("register");
        registry
            .register(descriptor(
                "extractor",
                noop(),
                &[BaseType::Text],
                &[BaseType::Entities, BaseType::Relationships],
            ))
            .expect("register");
        registry
            .register(descriptor(
                "persister",
                noop(),
                &[BaseType::Entities, BaseType::Relationships],
                &[BaseType::Graph],
            ))
            .expect("register");
        registry
    }

    #[test]
    fn test_plan_finds_document_pipeline() {
        let registry = document_registry();
        let chains = ChainPlanner::default()
            .plan(&registry, &ty(BaseType::File), &ty(BaseType::Graph), 5)
            .expect("plan");
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].tools, vec!["loader", "extractor", "persister"]);
        assert_eq!(chains[0].cost, 3.0);
        assert_eq!(chains[0].produces, vec![ty(BaseType::Graph)]);
    }

    #[test]
    fn test_plan_respects_max_depth() {
        let registry = document_registry();
        let err = ChainPlanner::default()
            .plan(&registry, &ty(BaseType::File), &ty(BaseType::Graph), 2)
            .expect_err("too shallow");
        assert!(matches!(err, PlanError::NoChainFound { max_depth: 2, .. }));
    }

    #[test]
    fn test_plan_ranks_by_length_then_cost() {
        let mut registry = document_registry();
        registry
            .register(descriptor("cleanup", noop(), &[BaseType::Text], &[BaseType::Text]))
            .expect("register");
        registry
            .register(
                descriptor(
                    "cheap_persister",
                    noop(),
                    &[BaseType::Entities, BaseType::Relationships],
                    &[BaseType::Graph],
                )
                .with_cost(0.5),
            )
            .expect("register");

        let chains = ChainPlanner::new(10)
            .plan(&registry, &ty(BaseType::File), &ty(BaseType::Graph), 4)
            .expect("plan");
        let ids: Vec<Vec<&str>> = chains
            .iter()
            .map(|c| c.tools.iter().map(String::as_str).collect())
            .collect();
        assert_eq!(
            ids,
            vec![
                vec!["loader", "extractor", "cheap_persister"],
                vec!["loader", "extractor", "persister"],
                vec!["loader", "cleanup", "extractor", "cheap_persister"],
                vec!["loader", "cleanup", "extractor", "persister"],
            ]
        );

        let capped = ChainPlanner::new(1)
            .plan(&registry, &ty(BaseType::File), &ty(BaseType::Graph), 4)
            .expect("plan");
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn test_plan_terminates_on_type_cycles() {
        let mut registry = ToolRegistry::new();
        registry
            .register(descriptor("cleanup", noop(), &[BaseType::Text], &[BaseType::Text]))
            .expect("register");
        registry
            .register(descriptor("rewrite", noop(), &[BaseType::Text], &[BaseType::Text]))
            .expect("register");
        let err = ChainPlanner::default()
            .plan(&registry, &ty(BaseType::Text), &ty(BaseType::Graph), 12)
            .expect_err("no graph producer");
        assert!(matches!(err, PlanError::NoChainFound { .. }));

        // Goal equal to the start still needs at least one tool
        let chains = ChainPlanner::new(5)
            .plan(&registry, &ty(BaseType::Text), &ty(BaseType::Text), 3)
            .expect("plan");
        assert!(chains.iter().all(|c| c.len() == 1));
        assert_eq!(chains.len(), 2);
    }

    #[test]
    fn test_plan_honours_domain_tags() {
        let mut registry = ToolRegistry::new();
        let legal = SemanticType::new(BaseType::Text, Some("legal"));
        let medical = SemanticType::new(BaseType::Text, Some("medical"));
        registry
            .register(
                ToolDescriptor::new("legal_extractor", noop())
                    .with_inputs(vec![legal.clone()])
                    .with_outputs(vec![ty(BaseType::Entities)]),
            )
            .expect("register");

        assert!(ChainPlanner::default()
            .plan(&registry, &legal, &ty(BaseType::Entities), 3)
            .is_ok());
        assert!(ChainPlanner::default()
            .plan(&registry, &medical, &ty(BaseType::Entities), 3)
            .is_err());
    }

    #[test]
    fn test_random_registries_only_yield_valid_chains() {
        let mut rng = StdRng::seed_from_u64(42);
        for round in 0..100 {
            let mut registry = ToolRegistry::new();
            let tool_count = rng.gen_range(1..10);
            for i in 0..tool_count {
                let input = BaseType::ALL[rng.gen_range(0..BaseType::ALL.len())];
                let output_count = rng.gen_range(1..3);
                let outputs: Vec<BaseType> = (0..output_count)
                    .map(|_| BaseType::ALL[rng.gen_range(0..BaseType::ALL.len())])
                    .collect();
                registry
                    .register(descriptor(&format!("t{}", i), noop(), &[input], &outputs))
                    .expect("register");
            }

            let start = ty(BaseType::ALL[rng.gen_range(0..BaseType::ALL.len())]);
            let goal = ty(BaseType::ALL[rng.gen_range(0..BaseType::ALL.len())]);
            if let Ok(chains) = ChainPlanner::new(20).plan(&registry, &start, &goal, 5) {
                for chain in &chains {
                    assert!(
                        chain_is_valid(&registry, &start, &chain.tools),
                        "round {}: invalid chain {:?}",
                        round,
                        chain.tools
                    );
                    assert!(chain.len() <= 5);
                    assert!(chain.produces.iter().any(|t| is_compatible(t, &goal)));
                }
                for pair in chains.windows(2) {
                    assert!(pair[0].len() <= pair[1].len());
                }
            }
        }
    }
}
