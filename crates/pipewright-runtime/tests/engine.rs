use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use pipewright_config::parse_config;
use pipewright_runtime::{
    engine_options, BaseType, Engine, EngineError, ExecutionOptions, ExecutionProgressEvent,
    ExecutionProgressReporter, PlanError, RunStatus, SemanticType, StepExecutionError, StepId,
    StepResult, Tool, ToolContext, ToolDescriptor, ToolRegistry,
};

struct FixedTool {
    output: Value,
    uncertainty: f64,
    calls: Arc<AtomicUsize>,
}

impl FixedTool {
    fn new(output: Value, uncertainty: f64) -> Self {
        Self {
            output,
            uncertainty,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Tool for FixedTool {
    async fn execute(
        &self,
        _input: Value,
        _ctx: ToolContext,
    ) -> Result<StepResult, StepExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(StepResult::success(self.output.clone(), self.uncertainty, "fixed"))
    }
}

#[derive(Default)]
struct PhaseCollector {
    phases: Mutex<Vec<String>>,
}

#[async_trait]
impl ExecutionProgressReporter for PhaseCollector {
    async fn report(&self, event: ExecutionProgressEvent) -> Result<(), String> {
        self.phases
            .lock()
            .map_err(|_| "phase lock poisoned".to_string())?
            .push(event.phase);
        Ok(())
    }
}

fn descriptor(id: &str, tool: Arc<dyn Tool>, input: BaseType, output: BaseType) -> ToolDescriptor {
    ToolDescriptor::new(id, tool)
        .with_inputs(vec![SemanticType::of(input)])
        .with_outputs(vec![SemanticType::of(output)])
}

/// FILE -> TEXT -> GRAPH with two graph builders
fn registry(full: FixedTool) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry
        .register(descriptor(
            "read_file",
            Arc::new(FixedTool::new(json!({"entity_count": 2}), 0.05)),
            BaseType::File,
            BaseType::Text,
        ))
        .expect("register");
    registry
        .register(
            descriptor("graph_full", Arc::new(full), BaseType::Text, BaseType::Graph)
                .with_cost(1.0),
        )
        .expect("register");
    registry
        .register(
            descriptor(
                "graph_sparse",
                Arc::new(FixedTool::new(json!({"graph": "sparse"}), 0.2)),
                BaseType::Text,
                BaseType::Graph,
            )
            .with_cost(3.0),
        )
        .expect("register");
    Arc::new(registry)
}

fn options() -> ExecutionOptions {
    ExecutionOptions::new(Duration::from_secs(5))
        .with_retry_backoff(Duration::ZERO, Duration::ZERO)
}

#[test]
fn test_plan_and_execute_runs_primary_chain() {
    tokio_test::block_on(async {
        let reporter = Arc::new(PhaseCollector::default());
        let engine = Engine::new(registry(FixedTool::new(json!({"graph": "full"}), 0.1)))
            .with_progress_reporter(reporter.clone());

        let result = engine
            .plan_and_execute(
                json!({"path": "notes.txt"}),
                &SemanticType::of(BaseType::File),
                &SemanticType::of(BaseType::Graph),
                &options(),
            )
            .await
            .expect("run");

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, json!({"graph": "full"}));
        // 1 - 0.95 * 0.9
        assert!((result.combined_uncertainty - 0.145).abs() < 1e-9);

        let phases = reporter.phases.lock().expect("phases").clone();
        assert_eq!(phases.last().map(String::as_str), Some("run_completed"));
    });
}

#[test]
fn test_unreachable_goal_is_a_plan_error() {
    tokio_test::block_on(async {
        let engine = Engine::new(registry(FixedTool::new(json!({}), 0.1)));
        let err = engine
            .plan_and_execute(
                json!({}),
                &SemanticType::of(BaseType::File),
                &SemanticType::of(BaseType::Vector),
                &options(),
            )
            .await
            .expect_err("no chain reaches VECTOR");
        assert!(matches!(err, EngineError::Plan(PlanError::NoChainFound { .. })));
    });
}

#[test]
fn test_config_driven_run_takes_declared_branch() {
    tokio_test::block_on(async {
        let config = parse_config(
            r#"
executor:
  per_step_timeout_ms: 2000
  retry_base_delay_ms: 0
  retry_max_delay_ms: 0
decisions:
  - label: sparse input
    when: "output.entity_count < 3"
    take: 1
"#,
        )
        .expect("config");

        let full = FixedTool::new(json!({"graph": "full"}), 0.1);
        let full_calls = Arc::clone(&full.calls);
        let engine = Engine::from_config(registry(full), &config).expect("engine");

        let result = engine
            .plan_and_execute(
                json!({"path": "notes.txt"}),
                &SemanticType::of(BaseType::File),
                &SemanticType::of(BaseType::Graph),
                &engine_options(&config),
            )
            .await
            .expect("run");

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(full_calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.output, json!({"graph": "sparse"}));
        assert!(result.pruned_steps.contains(&StepId::from("s2")));
    });
}

#[test]
fn test_rules_for_missing_chains_are_skipped() {
    tokio_test::block_on(async {
        let config = parse_config(
            r#"
planner:
  max_chains: 4
executor:
  per_step_timeout_ms: 2000
decisions:
  - when: "success"
    take: 3
"#,
        )
        .expect("config");

        let registry = registry(FixedTool::new(json!({"graph": "full"}), 0.1));
        let engine = Engine::from_config(registry, &config).expect("engine");
        let result = engine
            .plan_and_execute(
                json!({}),
                &SemanticType::of(BaseType::File),
                &SemanticType::of(BaseType::Graph),
                &engine_options(&config),
            )
            .await
            .expect("run");

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, json!({"graph": "full"}));
        assert!(result.pruned_steps.is_empty());
    });
}
