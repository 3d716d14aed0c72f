//! Planning: strategy, capacity and the execution plan.
//!
//! The `TaskScheduler` turns a validated `DependencyGraph` into an
//! `ExecutionPlan`: phases of independent tasks, the effective concurrency
//! strategy, per-role capacity, critical path and slack. It also answers the
//! "where does this plan hurt" questions (bottlenecks and suggestions).
//!
//! The plan is the engine's state object. Task statuses live in the plan's
//! graph and are mutated only by the engine's coordinating loop.

use crate::core::{CriticalPath, DependencyGraph, Role, Task, TaskId, TaskSpec, TaskStatus};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// How much of the plan may run at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One task running system-wide.
    Sequential,
    /// Up to the declared capacity of each role.
    #[default]
    Parallel,
    /// Parallel, but each phase must be completed or waived before the next.
    Review,
    /// Parallel when the widest phase exceeds the available agents.
    Auto,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Sequential => "sequential",
            Strategy::Parallel => "parallel",
            Strategy::Review => "review",
            Strategy::Auto => "auto",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(Strategy::Sequential),
            "parallel" => Ok(Strategy::Parallel),
            "review" => Ok(Strategy::Review),
            "auto" => Ok(Strategy::Auto),
            other => Err(Error::Validation(format!("unknown strategy: {}", other))),
        }
    }
}

/// Per-role ceiling on concurrently busy agents.
///
/// Roles that are not listed get one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentCapacity(BTreeMap<Role, usize>);

impl AgentCapacity {
    pub const DEFAULT_PER_ROLE: usize = 1;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, role: Role, agents: usize) -> Self {
        self.0.insert(role, agents);
        self
    }

    pub fn set(&mut self, role: Role, agents: usize) {
        self.0.insert(role, agents);
    }

    /// Capacity of a role, defaulting to one agent.
    pub fn get(&self, role: &Role) -> usize {
        self.0.get(role).copied().unwrap_or(Self::DEFAULT_PER_ROLE)
    }

    /// Capacity only if the role was listed explicitly.
    pub fn explicit(&self, role: &Role) -> Option<usize> {
        self.0.get(role).copied()
    }

    /// Resolve the capacity for every given role, defaults included.
    pub fn for_roles<'a>(&self, roles: impl IntoIterator<Item = &'a Role>) -> Self {
        Self(roles.into_iter().map(|r| (r.clone(), self.get(r))).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Role, &usize)> {
        self.0.iter()
    }

    /// Sum of the capacities of the given roles.
    pub fn total_for<'a>(&self, roles: impl IntoIterator<Item = &'a Role>) -> usize {
        roles.into_iter().map(|r| self.get(r)).sum()
    }
}

/// Input for building a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    /// Requested strategy; the scheduler's default applies when absent.
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl PlanRequest {
    pub fn new(strategy: Strategy, tasks: Vec<TaskSpec>) -> Self {
        Self {
            strategy: Some(strategy),
            tasks,
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load a request from disk. `.json` files are JSON, anything else TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_toml_str(&contents),
        }
    }
}

/// Counts behind the progress fraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Terminal tasks over total, failed and skipped included.
    pub fraction: f64,
}

impl Progress {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

/// A task whose delay delays the whole plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub task: TaskId,
    pub role: Role,
    /// Number of tasks directly waiting on this one.
    pub dependents: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    /// One more agent of a role shortens the estimate.
    AddCapacity,
    /// The plan is mostly a chain.
    IncreaseParallelism,
    /// A phase holds many tasks of one role.
    AgentScaling,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub role: Option<Role>,
    pub description: String,
}

/// The engine's view of a plan: structure, analysis and live task state.
pub struct ExecutionPlan {
    pub session_id: String,
    /// Strategy as requested.
    pub strategy: Strategy,
    /// Strategy in force; never `Auto`.
    pub effective_strategy: Strategy,
    pub phases: Vec<Vec<TaskId>>,
    /// Capacity of every role that has tasks.
    pub capacity: AgentCapacity,
    pub critical_path: CriticalPath,
    pub slack: BTreeMap<TaskId, u64>,
    /// Simulated makespan in duration units.
    pub estimated_duration: u64,
    pub created_at: DateTime<Utc>,
    graph: DependencyGraph,
    phase_index: HashMap<TaskId, usize>,
    waived: BTreeSet<TaskId>,
}

impl ExecutionPlan {
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.graph.get_task(id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.graph.get_task_mut(id)
    }

    /// All tasks, sorted by id.
    pub fn tasks(&self) -> Vec<&Task> {
        self.graph.all_tasks()
    }

    pub fn task_count(&self) -> usize {
        self.graph.task_count()
    }

    pub fn phase_of(&self, id: &TaskId) -> Option<usize> {
        self.phase_index.get(id).copied()
    }

    pub fn slack_of(&self, id: &TaskId) -> u64 {
        self.slack.get(id).copied().unwrap_or(0)
    }

    /// Record that a failed task no longer blocks its review gate.
    pub fn waive(&mut self, id: &TaskId) {
        self.waived.insert(id.clone());
    }

    pub fn is_waived(&self, id: &TaskId) -> bool {
        self.waived.contains(id)
    }

    fn task_satisfies_gate(&self, id: &TaskId) -> bool {
        match self.task(id).map(|t| &t.status) {
            Some(TaskStatus::Completed) | Some(TaskStatus::Skipped { .. }) => true,
            Some(TaskStatus::Failed { .. }) => self.is_waived(id),
            _ => false,
        }
    }

    /// Highest phase whose tasks may be dispatched.
    ///
    /// Without review gates every phase is open. Under `Review` the first
    /// phase that is not completed (or waived) is the last open one.
    pub fn unlocked_phase(&self) -> usize {
        if self.effective_strategy != Strategy::Review {
            return self.phases.len();
        }
        self.phases
            .iter()
            .position(|phase| !phase.iter().all(|id| self.task_satisfies_gate(id)))
            .unwrap_or(self.phases.len())
    }

    /// Tasks that may be dispatched now, most urgent first.
    ///
    /// Pending or Ready tasks whose prerequisites are all completed and whose
    /// phase is unlocked, ordered by slack then id. Recomputed from scratch
    /// on every call.
    pub fn ready_set(&self) -> Vec<TaskId> {
        let unlocked = self.unlocked_phase();
        let mut ready: Vec<TaskId> = self
            .graph
            .ready_tasks()
            .into_iter()
            .filter(|id| self.phase_of(id).map_or(false, |p| p <= unlocked))
            .collect();
        ready.sort_by(|a, b| (self.slack_of(a), a).cmp(&(self.slack_of(b), b)));
        ready
    }

    /// Failed tasks that were not waived.
    pub fn unwaived_failures(&self) -> Vec<TaskId> {
        self.graph
            .all_tasks()
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed { .. }) && !self.is_waived(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.graph.all_tasks().iter().all(|t| t.is_finished())
    }

    pub fn progress(&self) -> Progress {
        let mut progress = Progress {
            total: self.task_count(),
            ..Default::default()
        };
        for task in self.graph.all_tasks() {
            match task.status {
                TaskStatus::Completed => progress.completed += 1,
                TaskStatus::Failed { .. } => progress.failed += 1,
                TaskStatus::Skipped { .. } => progress.skipped += 1,
                _ => {}
            }
        }
        progress.fraction = if progress.total == 0 {
            1.0
        } else {
            progress.finished() as f64 / progress.total as f64
        };
        progress
    }

    /// Index of the first phase with unfinished tasks, or the phase count
    /// once everything is terminal.
    pub fn current_phase(&self) -> usize {
        self.phases
            .iter()
            .position(|phase| {
                phase
                    .iter()
                    .any(|id| self.task(id).map_or(false, |t| !t.is_finished()))
            })
            .unwrap_or(self.phases.len())
    }

    /// `(average phase width - 1) / (tasks - 1)`: 0 for a chain, 1 when
    /// everything fits in one phase.
    pub fn parallelization_factor(&self) -> f64 {
        let total = self.task_count();
        if total <= 1 || self.phases.is_empty() {
            return 0.0;
        }
        let average_width = total as f64 / self.phases.len() as f64;
        (average_width - 1.0) / (total as f64 - 1.0)
    }
}

impl fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("session_id", &self.session_id)
            .field("strategy", &self.strategy)
            .field("effective_strategy", &self.effective_strategy)
            .field("phases", &self.phases)
            .field("estimated_duration", &self.estimated_duration)
            .finish()
    }
}

/// Serializable summary of a plan and its analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAnalysis {
    pub session_id: String,
    pub strategy: Strategy,
    pub effective_strategy: Strategy,
    pub capacity: AgentCapacity,
    pub phases: Vec<Vec<TaskId>>,
    pub critical_path: CriticalPath,
    pub slack: BTreeMap<TaskId, u64>,
    pub estimated_duration: u64,
    pub parallelization_factor: f64,
    pub bottlenecks: Vec<Bottleneck>,
    pub suggestions: Vec<Suggestion>,
}

/// Builds execution plans from task graphs.
#[derive(Debug, Clone, Default)]
pub struct TaskScheduler {
    capacity: AgentCapacity,
    default_strategy: Strategy,
}

impl TaskScheduler {
    pub fn new(capacity: AgentCapacity, default_strategy: Strategy) -> Self {
        Self {
            capacity,
            default_strategy,
        }
    }

    pub fn capacity(&self) -> &AgentCapacity {
        &self.capacity
    }

    /// Build, validate and plan the tasks of a request.
    pub fn build_plan(&self, request: PlanRequest, session_id: &str) -> Result<ExecutionPlan> {
        let strategy = request.strategy.unwrap_or(self.default_strategy);
        let graph = DependencyGraph::from_tasks(request.tasks.into_iter().map(TaskSpec::into_task))?;
        self.plan(graph, strategy, session_id)
    }

    /// Plan an existing graph.
    ///
    /// # Errors
    /// Structural errors (`UnknownDependency`, `CyclicDependency`,
    /// `NoCapacityForRole`) are reported before anything can run.
    pub fn plan(
        &self,
        graph: DependencyGraph,
        strategy: Strategy,
        session_id: &str,
    ) -> Result<ExecutionPlan> {
        graph.validate()?;

        let roles = involved_roles(&graph);
        for role in &roles {
            if self.capacity.explicit(role) == Some(0) {
                return Err(Error::NoCapacityForRole(role.clone()));
            }
        }

        let phases = graph.compute_phases()?;
        let effective_strategy = self.resolve_strategy(&graph, strategy)?;
        let capacity = self.capacity.for_roles(&roles);
        let critical_path = graph.critical_path()?;
        let slack = graph.slacks()?;
        let estimated_duration =
            simulate_makespan(&graph, &capacity, effective_strategy == Strategy::Sequential, &slack);

        let phase_index = phases
            .iter()
            .enumerate()
            .flat_map(|(i, phase)| phase.iter().map(move |id| (id.clone(), i)))
            .collect();

        tracing::debug!(
            session = session_id,
            %strategy,
            effective = %effective_strategy,
            phases = phases.len(),
            critical = critical_path.length,
            "plan built"
        );

        Ok(ExecutionPlan {
            session_id: session_id.to_string(),
            strategy,
            effective_strategy,
            phases,
            capacity,
            critical_path,
            slack,
            estimated_duration,
            created_at: Utc::now(),
            graph,
            phase_index,
            waived: BTreeSet::new(),
        })
    }

    /// Resolve `Auto` against the graph's shape; other strategies pass through.
    pub fn resolve_strategy(&self, graph: &DependencyGraph, strategy: Strategy) -> Result<Strategy> {
        if strategy != Strategy::Auto {
            return Ok(strategy);
        }
        let width = graph.max_phase_width()?;
        let roles = involved_roles(graph);
        let available = self.capacity.total_for(&roles);
        Ok(if width > available {
            Strategy::Parallel
        } else {
            Strategy::Sequential
        })
    }

    /// Zero-slack tasks, most depended-upon first.
    pub fn analyze_bottlenecks(&self, plan: &ExecutionPlan) -> Vec<Bottleneck> {
        let mut bottlenecks: Vec<Bottleneck> = plan
            .tasks()
            .into_iter()
            .filter(|t| plan.slack_of(&t.id) == 0)
            .map(|t| Bottleneck {
                task: t.id.clone(),
                role: t.role.clone(),
                dependents: plan.graph().get_dependents(&t.id).len(),
            })
            .collect();
        bottlenecks.sort_by(|a, b| b.dependents.cmp(&a.dependents).then_with(|| a.task.cmp(&b.task)));
        bottlenecks
    }

    /// Hints for shortening the plan.
    pub fn suggest_optimizations(&self, plan: &ExecutionPlan) -> Vec<Suggestion> {
        let mut suggestions = Vec::new();
        let sequential = plan.effective_strategy == Strategy::Sequential;

        for (role, agents) in plan.capacity.iter() {
            let boosted = plan.capacity.clone().with(role.clone(), agents + 1);
            let estimate = simulate_makespan(plan.graph(), &boosted, sequential, &plan.slack);
            if estimate < plan.estimated_duration {
                suggestions.push(Suggestion {
                    kind: SuggestionKind::AddCapacity,
                    role: Some(role.clone()),
                    description: format!(
                        "Adding a {} agent reduces the estimated duration from {} to {}",
                        role, plan.estimated_duration, estimate
                    ),
                });
            }
        }

        let total = plan.task_count();
        if total > 1 && plan.phases.len() * 2 > total {
            suggestions.push(Suggestion {
                kind: SuggestionKind::IncreaseParallelism,
                role: None,
                description: "Consider breaking down dependencies to increase parallelism".to_string(),
            });
        }

        for (i, phase) in plan.phases.iter().enumerate() {
            let mut per_role: BTreeMap<&Role, usize> = BTreeMap::new();
            for task in phase.iter().filter_map(|id| plan.task(id)) {
                *per_role.entry(&task.role).or_default() += 1;
            }
            for (role, count) in per_role {
                if count > 2 {
                    suggestions.push(Suggestion {
                        kind: SuggestionKind::AgentScaling,
                        role: Some(role.clone()),
                        description: format!(
                            "Consider adding more {} agents for phase {} ({} tasks)",
                            role, i, count
                        ),
                    });
                }
            }
        }

        suggestions
    }

    pub fn analyze(&self, plan: &ExecutionPlan) -> PlanAnalysis {
        PlanAnalysis {
            session_id: plan.session_id.clone(),
            strategy: plan.strategy,
            effective_strategy: plan.effective_strategy,
            capacity: plan.capacity.clone(),
            phases: plan.phases.clone(),
            critical_path: plan.critical_path.clone(),
            slack: plan.slack.clone(),
            estimated_duration: plan.estimated_duration,
            parallelization_factor: plan.parallelization_factor(),
            bottlenecks: self.analyze_bottlenecks(plan),
            suggestions: self.suggest_optimizations(plan),
        }
    }
}

fn involved_roles(graph: &DependencyGraph) -> BTreeSet<Role> {
    graph.all_tasks().into_iter().map(|t| t.role.clone()).collect()
}

/// Greedy list scheduling of the graph under the given capacity.
///
/// Ready tasks start in (slack, id) order whenever an agent of their role is
/// free; `sequential` adds a global limit of one running task. Returns the
/// finishing time of the last task.
fn simulate_makespan(
    graph: &DependencyGraph,
    capacity: &AgentCapacity,
    sequential: bool,
    slack: &BTreeMap<TaskId, u64>,
) -> u64 {
    let Ok(order) = graph.topological_order() else {
        return 0;
    };

    let mut done: HashSet<TaskId> = HashSet::new();
    let mut started: HashSet<TaskId> = HashSet::new();
    let mut running: Vec<(u64, TaskId)> = Vec::new();
    let mut busy: HashMap<Role, usize> = HashMap::new();
    let mut now = 0;

    loop {
        let mut ready: Vec<&TaskId> = order
            .iter()
            .filter(|id| {
                !started.contains(*id) && graph.get_dependencies(id).iter().all(|d| done.contains(d))
            })
            .collect();
        ready.sort_by_key(|id| (slack.get(*id).copied().unwrap_or(0), (*id).clone()));

        for id in ready {
            if sequential && !running.is_empty() {
                break;
            }
            let Some(task) = graph.get_task(id) else {
                continue;
            };
            let in_use = busy.entry(task.role.clone()).or_default();
            if *in_use >= capacity.get(&task.role) {
                continue;
            }
            *in_use += 1;
            started.insert(id.clone());
            running.push((now + task.weight(), id.clone()));
        }

        let Some(next) = running.iter().map(|(finish, _)| *finish).min() else {
            break;
        };
        now = next;

        let (finished, still_running): (Vec<_>, Vec<_>) =
            running.into_iter().partition(|(finish, _)| *finish == now);
        running = still_running;
        for (_, id) in finished {
            if let Some(task) = graph.get_task(&id) {
                if let Some(in_use) = busy.get_mut(&task.role) {
                    *in_use = in_use.saturating_sub(1);
                }
            }
            done.insert(id);
        }
    }

    now
}
