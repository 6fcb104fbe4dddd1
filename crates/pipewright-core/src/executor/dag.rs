//! Execution DAG
//!
//! Steps, dependency edges, decision points and precomputed alternates for a
//! single run. The DAG is owned by exactly one executor loop; steps running
//! in parallel never touch it directly.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;

use crate::builder::BuildError;
use crate::predicate::Predicate;
use crate::types::{ExecutionStep, SemanticType, StepId};

/// Node state in the execution DAG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Not yet ready to execute
    Pending,
    /// Ready to execute (all dependencies completed)
    Ready,
    /// Currently executing
    Running,
    /// Execution completed successfully
    Completed,
    /// Execution failed
    Failed,
    /// Permanently ineligible for this run (untaken branch, false guard)
    Pruned,
}

/// A node in the execution DAG
#[derive(Debug, Clone)]
pub struct DagNode {
    /// The step definition
    pub step: ExecutionStep,
    /// Current state
    pub state: NodeState,
    /// Steps that depend on this node (reverse dependencies)
    pub dependents: Vec<StepId>,
    /// Number of times the step has been dispatched
    pub attempts: u32,
}

impl DagNode {
    pub fn new(step: ExecutionStep) -> Self {
        Self {
            step,
            state: NodeState::Pending,
            dependents: Vec::new(),
            attempts: 0,
        }
    }

    /// Check if all dependencies are completed
    pub fn dependencies_satisfied(&self, nodes: &HashMap<StepId, DagNode>) -> bool {
        self.step.depends_on.iter().all(|dep_id| {
            nodes
                .get(dep_id)
                .map(|n| n.state == NodeState::Completed)
                .unwrap_or(false)
        })
    }
}

/// Branch selection evaluated once its guard step has completed.
///
/// Points sharing a guard are resolved together, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionPoint {
    pub label: String,
    /// Step whose result the predicate is evaluated against
    pub guard: StepId,
    pub predicate: Predicate,
    /// Steps that run when the predicate holds
    pub on_true: Vec<StepId>,
    /// Steps that run otherwise; empty means "skip"
    pub on_false: Vec<StepId>,
}

impl DecisionPoint {
    pub fn new(guard: impl Into<StepId>, predicate: Predicate) -> Self {
        Self {
            label: String::new(),
            guard: guard.into(),
            predicate,
            on_true: Vec::new(),
            on_false: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_on_true(mut self, steps: Vec<StepId>) -> Self {
        self.on_true = steps;
        self
    }

    pub fn with_on_false(mut self, steps: Vec<StepId>) -> Self {
        self.on_false = steps;
        self
    }
}

/// Precomputed alternative strategy that can replace part of the plan
#[derive(Debug, Clone, PartialEq)]
pub struct Alternate {
    pub label: String,
    /// Completed step the alternate continues from; `None` means it starts
    /// from the initial input
    pub fork: Option<StepId>,
    /// Steps it replaces, in order; the first is where it diverges
    pub replaces: Vec<StepId>,
    pub steps: Vec<ExecutionStep>,
}

impl Alternate {
    pub fn step_ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }
}

/// Execution DAG - supports runtime modification by the adaptive executor
#[derive(Debug, Clone)]
pub struct ExecutionDag {
    nodes: HashMap<StepId, DagNode>,
    /// Topological order, extended as steps are inserted
    order: Vec<StepId>,
    decisions: Vec<DecisionPoint>,
    alternates: Vec<Alternate>,
    /// Type the root steps receive, when known
    start_type: Option<SemanticType>,
}

impl ExecutionDag {
    /// Build a single-root DAG
    pub fn new(steps: Vec<ExecutionStep>, decisions: Vec<DecisionPoint>) -> Result<Self, BuildError> {
        Self::build(steps, decisions, false)
    }

    /// Build a DAG that may have several roots (independent inputs)
    pub fn multi_root(
        steps: Vec<ExecutionStep>,
        decisions: Vec<DecisionPoint>,
    ) -> Result<Self, BuildError> {
        Self::build(steps, decisions, true)
    }

    fn build(
        steps: Vec<ExecutionStep>,
        decisions: Vec<DecisionPoint>,
        multi_root: bool,
    ) -> Result<Self, BuildError> {
        if steps.is_empty() {
            return Err(BuildError::Empty);
        }

        let mut nodes: HashMap<StepId, DagNode> = HashMap::with_capacity(steps.len());
        let mut input_order = Vec::with_capacity(steps.len());
        for step in steps {
            if nodes.contains_key(&step.id) {
                return Err(BuildError::DuplicateStep(step.id));
            }
            input_order.push(step.id.clone());
            nodes.insert(step.id.clone(), DagNode::new(step));
        }

        // Reverse dependencies, in input order
        for id in &input_order {
            let deps = nodes[id].step.depends_on.clone();
            for dep in deps {
                match nodes.get_mut(&dep) {
                    Some(dep_node) => dep_node.dependents.push(id.clone()),
                    None => {
                        return Err(BuildError::UnknownDependency {
                            step: id.clone(),
                            dependency: dep,
                        })
                    }
                }
            }
        }

        for decision in &decisions {
            validate_decision(&nodes, decision)?;
        }

        let order = topological_order(&nodes, &input_order, &decisions)?;

        let roots = input_order
            .iter()
            .filter(|id| nodes[*id].step.is_root())
            .count();
        if !multi_root && roots != 1 {
            return Err(BuildError::RootCount { found: roots });
        }

        Ok(Self {
            nodes,
            order,
            decisions,
            alternates: Vec::new(),
            start_type: None,
        })
    }

    /// Register a precomputed alternate (pivot target)
    pub fn add_alternate(&mut self, alternate: Alternate) -> Result<(), BuildError> {
        if let Some(fork) = &alternate.fork {
            if !self.nodes.contains_key(fork) {
                return Err(BuildError::InvalidDecision(format!(
                    "alternate '{}' forks from unknown step '{}'",
                    alternate.label, fork
                )));
            }
        }
        if alternate.replaces.is_empty() || alternate.steps.is_empty() {
            return Err(BuildError::InvalidDecision(format!(
                "alternate '{}' must replace and add at least one step",
                alternate.label
            )));
        }
        for id in &alternate.replaces {
            if !self.nodes.contains_key(id) {
                return Err(BuildError::InvalidDecision(format!(
                    "alternate '{}' replaces unknown step '{}'",
                    alternate.label, id
                )));
            }
        }
        let mut ids = HashSet::new();
        for step in &alternate.steps {
            if self.nodes.contains_key(&step.id) || !ids.insert(step.id.clone()) {
                return Err(BuildError::DuplicateStep(step.id.clone()));
            }
        }
        self.alternates.push(alternate);
        Ok(())
    }

    pub fn with_start_type(mut self, start: SemanticType) -> Self {
        self.start_type = Some(start);
        self
    }

    pub fn start_type(&self) -> Option<&SemanticType> {
        self.start_type.as_ref()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get a node by ID
    pub fn node(&self, id: &StepId) -> Option<&DagNode> {
        self.nodes.get(id)
    }

    pub(crate) fn node_mut(&mut self, id: &StepId) -> Option<&mut DagNode> {
        self.nodes.get_mut(id)
    }

    pub fn state(&self, id: &StepId) -> Option<NodeState> {
        self.nodes.get(id).map(|n| n.state)
    }

    /// Nodes in topological order
    pub fn nodes(&self) -> impl Iterator<Item = &DagNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn step_ids(&self) -> Vec<StepId> {
        self.order.clone()
    }

    pub fn roots(&self) -> Vec<StepId> {
        self.nodes()
            .filter(|n| n.step.is_root())
            .map(|n| n.step.id.clone())
            .collect()
    }

    pub fn decisions(&self) -> &[DecisionPoint] {
        &self.decisions
    }

    pub fn alternates(&self) -> &[Alternate] {
        &self.alternates
    }

    /// Decision points guarded by `step_id`, in declaration order
    pub fn decisions_for(&self, step_id: &StepId) -> Vec<DecisionPoint> {
        self.decisions
            .iter()
            .filter(|d| &d.guard == step_id)
            .cloned()
            .collect()
    }

    /// Pending nodes whose dependencies all completed, marked Ready.
    ///
    /// A branch step additionally waits until every decision selecting it has
    /// been resolved, whether or not it depends on the guard.
    pub fn update_ready_nodes(&mut self) -> Vec<StepId> {
        let ready: Vec<StepId> = self
            .order
            .iter()
            .filter(|id| {
                self.nodes
                    .get(*id)
                    .map(|node| {
                        matches!(node.state, NodeState::Pending | NodeState::Ready)
                            && node.dependencies_satisfied(&self.nodes)
                            && self.guards_resolved(id)
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for id in &ready {
            if let Some(node) = self.nodes.get_mut(id) {
                node.state = NodeState::Ready;
            }
        }
        ready
    }

    fn guards_resolved(&self, id: &StepId) -> bool {
        self.decisions
            .iter()
            .filter(|d| d.on_true.contains(id) || d.on_false.contains(id))
            .all(|d| self.state(&d.guard) == Some(NodeState::Completed))
    }

    pub fn mark_running(&mut self, id: &StepId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.state = NodeState::Running;
            node.attempts += 1;
        }
    }

    pub fn mark_completed(&mut self, id: &StepId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.state = NodeState::Completed;
        }
    }

    pub fn mark_failed(&mut self, id: &StepId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.state = NodeState::Failed;
        }
    }

    /// Put a step back in the queue for another attempt
    pub fn reset_pending(&mut self, id: &StepId) {
        if let Some(node) = self.nodes.get_mut(id) {
            if node.state != NodeState::Pruned {
                node.state = NodeState::Pending;
            }
        }
    }

    /// Prune a step and, transitively, every dependent that can no longer run.
    ///
    /// Pruning a decision guard also prunes both of its branches. Completed
    /// and running steps are never pruned. Returns the newly pruned ids in
    /// topological order.
    pub fn prune(&mut self, id: &StepId) -> Vec<StepId> {
        let mut pruned = HashSet::new();
        let mut queue = VecDeque::from([id.clone()]);
        while let Some(current) = queue.pop_front() {
            let Some(node) = self.nodes.get_mut(&current) else {
                continue;
            };
            if !matches!(
                node.state,
                NodeState::Pending | NodeState::Ready | NodeState::Failed
            ) {
                continue;
            }
            node.state = NodeState::Pruned;
            queue.extend(node.dependents.iter().cloned());
            for decision in self.decisions.iter().filter(|d| d.guard == current) {
                queue.extend(decision.on_true.iter().chain(&decision.on_false).cloned());
            }
            pruned.insert(current);
        }
        self.order
            .iter()
            .filter(|id| pruned.contains(*id))
            .cloned()
            .collect()
    }

    /// Insert `step` directly ahead of `target`.
    ///
    /// The new step takes over the target's dependencies and guard, joins any
    /// decision branch the target belongs to, and becomes the target's only
    /// dependency.
    pub fn insert_before(
        &mut self,
        target: &StepId,
        mut step: ExecutionStep,
    ) -> Result<(), BuildError> {
        if self.nodes.contains_key(&step.id) {
            return Err(BuildError::DuplicateStep(step.id));
        }
        let target_node = self
            .nodes
            .get_mut(target)
            .ok_or_else(|| BuildError::UnknownDependency {
                step: step.id.clone(),
                dependency: target.clone(),
            })?;

        let deps = std::mem::replace(&mut target_node.step.depends_on, vec![step.id.clone()]);
        step.guard = target_node.step.guard.take();
        step.depends_on = deps.clone();

        for dep in &deps {
            if let Some(dep_node) = self.nodes.get_mut(dep) {
                for dependent in dep_node.dependents.iter_mut() {
                    if dependent == target {
                        *dependent = step.id.clone();
                    }
                }
            }
        }

        for decision in &mut self.decisions {
            if decision.on_true.contains(target) {
                decision.on_true.push(step.id.clone());
            }
            if decision.on_false.contains(target) {
                decision.on_false.push(step.id.clone());
            }
        }

        let id = step.id.clone();
        let mut node = DagNode::new(step);
        node.dependents.push(target.clone());
        self.nodes.insert(id.clone(), node);
        let position = self
            .order
            .iter()
            .position(|existing| existing == target)
            .unwrap_or(self.order.len());
        self.order.insert(position, id);
        Ok(())
    }

    pub fn has_alternate_at(&self, step_id: &StepId) -> bool {
        self.alternates
            .iter()
            .any(|alt| alt.replaces.first() == Some(step_id))
    }

    /// Replace the plan from `step_id` onwards with the first alternate that
    /// diverges there.
    ///
    /// Replaced steps are pruned for the rest of the run; the alternate is
    /// consumed. Returns `(added, removed)` step ids, or `None` when no
    /// alternate starts at `step_id` or its fork has not completed.
    pub fn pivot(&mut self, step_id: &StepId) -> Option<(Vec<StepId>, Vec<StepId>)> {
        let position = self
            .alternates
            .iter()
            .position(|alt| alt.replaces.first() == Some(step_id))?;
        if let Some(fork) = &self.alternates[position].fork {
            if self.state(fork) != Some(NodeState::Completed) {
                return None;
            }
        }
        let alternate = self.alternates.remove(position);

        // The diverging step may be mid-adaptation (running or failed)
        if let Some(node) = self.nodes.get_mut(step_id) {
            if matches!(node.state, NodeState::Running | NodeState::Failed) {
                node.state = NodeState::Pending;
            }
        }
        let mut removed = Vec::new();
        for id in &alternate.replaces {
            for pruned in self.prune(id) {
                if !removed.contains(&pruned) {
                    removed.push(pruned);
                }
            }
        }

        let added = alternate.step_ids();
        for step in alternate.steps {
            for dep in &step.depends_on {
                if let Some(dep_node) = self.nodes.get_mut(dep) {
                    dep_node.dependents.push(step.id.clone());
                }
            }
            self.order.push(step.id.clone());
            self.nodes.insert(step.id.clone(), DagNode::new(step));
        }
        // Other alternates hanging off removed steps can no longer apply
        self.alternates
            .retain(|alt| alt.fork.as_ref().map_or(true, |fork| !removed.contains(fork)));

        Some((added, removed))
    }

    /// All non-pruned nodes completed
    pub fn is_completed(&self) -> bool {
        self.nodes
            .values()
            .all(|n| matches!(n.state, NodeState::Completed | NodeState::Pruned))
    }

    pub fn pruned_nodes(&self) -> Vec<StepId> {
        self.nodes()
            .filter(|n| n.state == NodeState::Pruned)
            .map(|n| n.step.id.clone())
            .collect()
    }

    /// Completed steps none of whose dependents will ever run
    pub fn completed_terminals(&self) -> Vec<StepId> {
        self.nodes()
            .filter(|n| n.state == NodeState::Completed)
            .filter(|n| {
                n.dependents.iter().all(|dep| {
                    self.nodes
                        .get(dep)
                        .map(|d| d.state == NodeState::Pruned)
                        .unwrap_or(true)
                })
            })
            .map(|n| n.step.id.clone())
            .collect()
    }
}

fn validate_decision(
    nodes: &HashMap<StepId, DagNode>,
    decision: &DecisionPoint,
) -> Result<(), BuildError> {
    if !nodes.contains_key(&decision.guard) {
        return Err(BuildError::InvalidDecision(format!(
            "guard step '{}' does not exist",
            decision.guard
        )));
    }
    if decision.on_true.is_empty() && decision.on_false.is_empty() {
        return Err(BuildError::InvalidDecision(format!(
            "decision on '{}' selects between two empty branches",
            decision.guard
        )));
    }
    for id in decision.on_true.iter().chain(&decision.on_false) {
        if !nodes.contains_key(id) {
            return Err(BuildError::InvalidDecision(format!(
                "decision on '{}' references unknown step '{}'",
                decision.guard, id
            )));
        }
        if id == &decision.guard {
            return Err(BuildError::InvalidDecision(format!(
                "step '{}' guards a branch containing itself",
                id
            )));
        }
    }
    if let Some(shared) = decision
        .on_true
        .iter()
        .find(|id| decision.on_false.contains(id))
    {
        return Err(BuildError::InvalidDecision(format!(
            "step '{}' is in both branches of the decision on '{}'",
            shared, decision.guard
        )));
    }
    Ok(())
}

/// Kahn's algorithm over dependency edges plus guard→branch edges
fn topological_order(
    nodes: &HashMap<StepId, DagNode>,
    input_order: &[StepId],
    decisions: &[DecisionPoint],
) -> Result<Vec<StepId>, BuildError> {
    let mut successors: HashMap<&StepId, Vec<&StepId>> = HashMap::new();
    let mut in_degree: HashMap<&StepId, usize> = input_order.iter().map(|id| (id, 0)).collect();

    for id in input_order {
        for dep in &nodes[id].step.depends_on {
            successors.entry(dep).or_default().push(id);
            *in_degree.entry(id).or_default() += 1;
        }
    }
    for decision in decisions {
        for branch in decision.on_true.iter().chain(&decision.on_false) {
            successors.entry(&decision.guard).or_default().push(branch);
            *in_degree.entry(branch).or_default() += 1;
        }
    }

    let mut queue: VecDeque<&StepId> = input_order
        .iter()
        .filter(|id| in_degree.get(id).copied().unwrap_or(0) == 0)
        .collect();
    let mut order = Vec::with_capacity(input_order.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.clone());
        if let Some(next) = successors.get(id) {
            for succ in next {
                if let Some(degree) = in_degree.get_mut(succ) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*succ);
                    }
                }
            }
        }
    }

    if order.len() < input_order.len() {
        let stuck = input_order
            .iter()
            .filter(|id| in_degree.get(id).copied().unwrap_or(0) > 0)
            .min()
            .cloned()
            .unwrap_or_default();
        return Err(BuildError::CyclicPlan(stuck));
    }
    Ok(order)
}
