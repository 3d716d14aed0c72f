//! Task dependency graph.
//!
//! `DependencyGraph` stores tasks as nodes of a petgraph `DiGraph` with an
//! edge from every prerequisite to the task that needs it. On top of the
//! structure it answers the planning questions: is there a cycle, what are
//! the phases of mutually independent tasks, which chain is critical, and
//! how much slack does each task have.
//!
//! Unknown dependencies are tolerated while tasks are being added (tasks may
//! be declared in any order) and surfaced by [`DependencyGraph::validate`].

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// The longest dependency chain of a graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalPath {
    /// Tasks on the chain, from source to sink.
    pub tasks: Vec<TaskId>,
    /// Sum of the durations along the chain.
    pub length: u64,
}

/// Serializable snapshot of the graph for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSummary {
    pub tasks: Vec<TaskId>,
    pub dependencies: BTreeMap<TaskId, Vec<TaskId>>,
    pub cycle: Option<Vec<TaskId>>,
    pub critical_path: Option<CriticalPath>,
}

/// Longest-path tables shared by the critical path and slack computations.
struct LongestPaths {
    /// Tasks in phase order.
    order: Vec<TaskId>,
    /// Longest path ending at (and including) each task.
    to: HashMap<TaskId, u64>,
    /// Longest path starting at (and including) each task.
    from: HashMap<TaskId, u64>,
}

/// The task dependency graph.
pub struct DependencyGraph {
    /// The underlying directed graph; edges point from prerequisite to dependent.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Edges whose prerequisite has not been registered yet, as (dependency, task).
    dangling: Vec<(TaskId, TaskId)>,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            dangling: Vec::new(),
        }
    }

    /// Build a graph from tasks using each task's declared dependencies.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Result<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.insert(task)?;
        }
        Ok(graph)
    }

    /// Register a task with the given prerequisites.
    ///
    /// The prerequisites replace `task.dependencies`. Edges to tasks that are
    /// not registered yet are connected once those tasks arrive.
    ///
    /// # Errors
    /// Returns `DuplicateTask` if a task with the same id already exists.
    pub fn add_task(&mut self, mut task: Task, dependencies: &[TaskId]) -> Result<NodeIndex> {
        task.dependencies = dependencies.to_vec();
        self.insert(task)
    }

    /// Register a task using its own `dependencies` list.
    pub fn insert(&mut self, mut task: Task) -> Result<NodeIndex> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }

        let mut seen = BTreeSet::new();
        task.dependencies.retain(|dep| seen.insert(dep.clone()));

        let id = task.id.clone();
        let deps = task.dependencies.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id.clone(), index);

        for dep in deps {
            match self.task_index.get(&dep) {
                Some(&dep_index) => {
                    self.graph.add_edge(dep_index, index, ());
                }
                None => self.dangling.push((dep, id.clone())),
            }
        }

        // Connect tasks that were waiting for this one.
        let (resolved, still_dangling): (Vec<_>, Vec<_>) = std::mem::take(&mut self.dangling)
            .into_iter()
            .partition(|(dep, _)| dep == &id);
        self.dangling = still_dangling;
        for (_, dependent) in resolved {
            if let Some(&dependent_index) = self.task_index.get(&dependent) {
                self.graph.add_edge(index, dependent_index, ());
            }
        }

        Ok(index)
    }

    /// Remove a task and every edge touching it.
    ///
    /// Dependents forget the removed prerequisite.
    pub fn remove_task(&mut self, id: &TaskId) -> Option<Task> {
        let index = self.task_index.remove(id)?;
        let removed = self.graph.remove_node(index)?;

        // remove_node moves the last node into the freed slot.
        if let Some(moved) = self.graph.node_weight(index) {
            self.task_index.insert(moved.id.clone(), index);
        }

        for task in self.graph.node_weights_mut() {
            task.dependencies.retain(|dep| dep != id);
        }
        self.dangling.retain(|(_, dependent)| dependent != id);

        Some(removed)
    }

    /// Check that every declared prerequisite exists and there is no cycle.
    ///
    /// # Errors
    /// `UnknownDependency` for the first dangling edge (by task id), then
    /// `CyclicDependency` with the cycle found.
    pub fn validate(&self) -> Result<()> {
        if let Some((dependency, task)) = self
            .dangling
            .iter()
            .min_by(|a, b| (&a.1, &a.0).cmp(&(&b.1, &b.0)))
        {
            return Err(Error::UnknownDependency {
                task: task.clone(),
                dependency: dependency.clone(),
            });
        }
        if let Some(cycle) = self.detect_cycles() {
            return Err(Error::CyclicDependency { cycle });
        }
        Ok(())
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph.node_weight_mut(index)
        } else {
            None
        }
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of connected dependencies (edges).
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check if the graph contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Check if `to` directly depends on `from`.
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&from_idx), Some(&to_idx)) => self.graph.find_edge(from_idx, to_idx).is_some(),
            _ => false,
        }
    }

    /// All task ids, sorted.
    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.task_index.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All tasks, sorted by id.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.graph.node_weights().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(index, direction)
            .filter_map(|n| self.graph.node_weight(n))
            .map(|t| t.id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn reachable(&self, id: &TaskId, direction: Direction) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut to_visit = self.neighbors(id, direction);
        while let Some(next) = to_visit.pop() {
            if seen.insert(next.clone()) {
                to_visit.extend(self.neighbors(&next, direction));
            }
        }
        seen
    }

    /// Direct prerequisites of a task, sorted.
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Transitive prerequisites of a task.
    pub fn get_all_dependencies(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.reachable(id, Direction::Incoming)
    }

    /// Tasks that directly depend on this task, sorted.
    pub fn get_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Tasks that transitively depend on this task.
    pub fn get_all_dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.reachable(id, Direction::Outgoing)
    }

    /// Tasks that can be dispatched right now.
    ///
    /// A task qualifies when it is Pending or Ready and every prerequisite is
    /// Completed. Failed or skipped prerequisites never satisfy a dependent.
    /// The result is recomputed from scratch on every call and sorted by id.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = self
            .graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if !task.can_start() {
                    return None;
                }
                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| {
                        self.graph
                            .node_weight(dep)
                            .map(|d| d.status == TaskStatus::Completed)
                            .unwrap_or(false)
                    });
                deps_satisfied.then(|| task.id.clone())
            })
            .collect();
        ready.sort();
        ready
    }

    // ========== Structural analysis ==========

    /// Find a dependency cycle.
    ///
    /// Depth-first traversal along prerequisite → dependent edges with an
    /// explicit frame stack, so chain length is bounded by the heap rather
    /// than the thread stack. Roots and successors are visited in id order,
    /// so edges a→b→c→a yield `[a, b, c, a]`.
    pub fn detect_cycles(&self) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            OnStack,
            Done,
        }

        let mut marks: HashMap<TaskId, Mark> = HashMap::new();
        // (task, its dependents, index of the next dependent to visit)
        let mut frames: Vec<(TaskId, Vec<TaskId>, usize)> = Vec::new();

        for root in self.task_ids() {
            if marks.contains_key(&root) {
                continue;
            }
            marks.insert(root.clone(), Mark::OnStack);
            let dependents = self.get_dependents(&root);
            frames.push((root, dependents, 0));

            while let Some((id, dependents, cursor)) = frames.last_mut() {
                let Some(next) = dependents.get(*cursor).cloned() else {
                    marks.insert(id.clone(), Mark::Done);
                    frames.pop();
                    continue;
                };
                *cursor += 1;

                match marks.get(&next).copied() {
                    Some(Mark::OnStack) => {
                        let start = frames.iter().position(|(f, _, _)| f == &next)?;
                        let mut cycle: Vec<TaskId> =
                            frames[start..].iter().map(|(f, _, _)| f.clone()).collect();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next.clone(), Mark::OnStack);
                        let dependents = self.get_dependents(&next);
                        frames.push((next, dependents, 0));
                    }
                }
            }
        }
        None
    }

    /// Partition the tasks into phases of mutually independent tasks.
    ///
    /// Kahn's algorithm: each phase is every task whose unassigned in-degree
    /// is zero. Every task's prerequisites lie in strictly earlier phases.
    /// Phases are sorted by task id.
    ///
    /// # Errors
    /// `CyclicDependency` if the graph is not acyclic.
    pub fn compute_phases(&self) -> Result<Vec<Vec<TaskId>>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|index| {
                let degree = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count();
                (index, degree)
            })
            .collect();

        let mut phases = Vec::new();
        let mut assigned = 0;

        while assigned < self.graph.node_count() {
            let mut phase: Vec<NodeIndex> = in_degree
                .iter()
                .filter(|(_, &degree)| degree == 0)
                .map(|(&index, _)| index)
                .collect();

            if phase.is_empty() {
                let cycle = self.detect_cycles().unwrap_or_default();
                return Err(Error::CyclicDependency { cycle });
            }

            for index in &phase {
                in_degree.remove(index);
                for successor in self.graph.neighbors_directed(*index, Direction::Outgoing) {
                    if let Some(degree) = in_degree.get_mut(&successor) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }
            assigned += phase.len();

            phase.sort_by(|a, b| self.graph[*a].id.cmp(&self.graph[*b].id));
            phases.push(phase.into_iter().map(|i| self.graph[i].id.clone()).collect());
        }

        Ok(phases)
    }

    /// Tasks in an order where each comes after all of its prerequisites.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        Ok(self.compute_phases()?.into_iter().flatten().collect())
    }

    /// Width of the widest phase.
    pub fn max_phase_width(&self) -> Result<usize> {
        Ok(self
            .compute_phases()?
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(0))
    }

    fn longest_paths(&self) -> Result<LongestPaths> {
        let order = self.topological_order()?;
        let weight = |id: &TaskId| self.get_task(id).map(Task::weight).unwrap_or(1);

        let mut to: HashMap<TaskId, u64> = HashMap::new();
        for id in &order {
            let best = self
                .get_dependencies(id)
                .iter()
                .filter_map(|dep| to.get(dep).copied())
                .max()
                .unwrap_or(0);
            to.insert(id.clone(), weight(id) + best);
        }

        let mut from: HashMap<TaskId, u64> = HashMap::new();
        for id in order.iter().rev() {
            let best = self
                .get_dependents(id)
                .iter()
                .filter_map(|dep| from.get(dep).copied())
                .max()
                .unwrap_or(0);
            from.insert(id.clone(), weight(id) + best);
        }

        Ok(LongestPaths { order, to, from })
    }

    /// Longest chain through the graph, weighting each task by its duration.
    ///
    /// Ties are broken towards the smaller task id, so the result is stable
    /// for a given graph. Used for reporting, never for dispatch decisions.
    pub fn critical_path(&self) -> Result<CriticalPath> {
        let paths = self.longest_paths()?;

        let mut end: Option<(&TaskId, u64)> = None;
        let mut sorted = paths.order.clone();
        sorted.sort();
        for id in &sorted {
            let length = paths.to[id];
            if end.map_or(true, |(_, best)| length > best) {
                end = Some((id, length));
            }
        }
        let Some((end, length)) = end else {
            return Ok(CriticalPath::default());
        };

        let mut tasks = vec![end.clone()];
        let mut current = end.clone();
        loop {
            let mut best: Option<(TaskId, u64)> = None;
            for dep in self.get_dependencies(&current) {
                let length = paths.to[&dep];
                if best.as_ref().map_or(true, |(_, b)| length > *b) {
                    best = Some((dep, length));
                }
            }
            match best {
                Some((dep, _)) => {
                    tasks.push(dep.clone());
                    current = dep;
                }
                None => break,
            }
        }
        tasks.reverse();

        Ok(CriticalPath { tasks, length })
    }

    /// How far the task can slip without lengthening the critical path.
    ///
    /// Zero means the task lies on a critical path.
    pub fn slack(&self, id: &TaskId) -> Result<u64> {
        self.slacks()?
            .remove(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    /// Slack of every task.
    pub fn slacks(&self) -> Result<BTreeMap<TaskId, u64>> {
        let paths = self.longest_paths()?;
        let critical = paths.to.values().copied().max().unwrap_or(0);
        Ok(paths
            .order
            .iter()
            .map(|id| {
                let weight = self.get_task(id).map(Task::weight).unwrap_or(1);
                let through = paths.to[id] + paths.from[id] - weight;
                (id.clone(), critical - through)
            })
            .collect())
    }

    /// Snapshot of the structure for reporting.
    pub fn summary(&self) -> GraphSummary {
        GraphSummary {
            tasks: self.task_ids(),
            dependencies: self
                .task_ids()
                .into_iter()
                .map(|id| {
                    let deps = self
                        .get_task(&id)
                        .map(|t| t.dependencies.clone())
                        .unwrap_or_default();
                    (id, deps)
                })
                .collect(),
            cycle: self.detect_cycles(),
            critical_path: self.critical_path().ok(),
        }
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("dangling", &self.dangling.len())
            .finish()
    }
}
