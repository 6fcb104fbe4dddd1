//! Engine facade - wires planner + builder + executor into one call

use std::sync::Arc;

use serde_json::Value;

use pipewright_config::PipewrightConfig;
use pipewright_core::executor::AdaptationPolicy;
use pipewright_core::options::ExecutionOptions;
use pipewright_core::{
    ChainPlanner, DagBuilder, DecisionRule, ExecutionProgressReporter, ExecutionResult, Executor,
    SemanticType, ToolRegistry,
};

use crate::bootstrap::decision_rules;
use crate::error::EngineError;

/// Single entry point for planning and running tool chains
pub struct Engine {
    registry: Arc<ToolRegistry>,
    planner: Option<ChainPlanner>,
    policy: Option<Arc<dyn AdaptationPolicy>>,
    rules: Vec<DecisionRule>,
    progress_reporter: Option<Arc<dyn ExecutionProgressReporter>>,
}

impl Engine {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            planner: None,
            policy: None,
            rules: Vec::new(),
            progress_reporter: None,
        }
    }

    /// Engine with the decision rules declared in `config`
    pub fn from_config(
        registry: Arc<ToolRegistry>,
        config: &PipewrightConfig,
    ) -> Result<Self, EngineError> {
        Ok(Self::new(registry).with_decision_rules(decision_rules(config)?))
    }

    /// Fixed planner; by default one is sized from `ExecutionOptions::max_chains`
    pub fn with_planner(mut self, planner: ChainPlanner) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn AdaptationPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_decision_rules(mut self, rules: Vec<DecisionRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_progress_reporter(mut self, reporter: Arc<dyn ExecutionProgressReporter>) -> Self {
        self.progress_reporter = Some(reporter);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Plan chains from `start` to `goal`, build the DAG and execute it.
    ///
    /// Structural problems (no chain, bad rule wiring) are `Err`; a run that
    /// fails or aborts is still `Ok` and carries its partial trace.
    pub async fn plan_and_execute(
        &self,
        initial_input: Value,
        start: &SemanticType,
        goal: &SemanticType,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, EngineError> {
        let planner = self
            .planner
            .clone()
            .unwrap_or_else(|| ChainPlanner::new(options.max_chains));
        let chains = planner.plan(&self.registry, start, goal, options.max_depth)?;
        tracing::info!(
            start = %start,
            goal = %goal,
            chains = chains.len(),
            primary = ?chains.first().map(|c| c.tools.clone()),
            "chains planned"
        );

        let rules: Vec<DecisionRule> = self
            .rules
            .iter()
            .filter(|rule| {
                let usable = rule.alternative < chains.len();
                if !usable {
                    tracing::warn!(
                        rule = %rule.label,
                        alternative = rule.alternative,
                        chains = chains.len(),
                        "decision rule references a chain the planner did not find, skipped"
                    );
                }
                usable
            })
            .cloned()
            .collect();
        let dag = DagBuilder::new(&self.registry).build(start, &chains, &rules)?;

        let mut executor = Executor::new(Arc::clone(&self.registry), options.clone());
        if let Some(policy) = &self.policy {
            executor = executor.with_policy(Arc::clone(policy));
        }
        if let Some(reporter) = &self.progress_reporter {
            executor = executor.with_progress_reporter(Arc::clone(reporter));
        }
        Ok(executor.execute(dag, initial_input).await)
    }
}
