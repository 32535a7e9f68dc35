//! Validated task graph for a single run.
//!
//! [`Plan`] stores tasks in a petgraph `DiGraph` with an edge from every
//! dependency to its dependent. Node indices follow declaration order, and
//! every ordering the plan hands out (waves, ready sets, skip cascades) is
//! sorted by node index so that repeated runs see identical orderings.

use crate::core::task::{SkipReason, Task, TaskId, TaskSpec, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// A plan as produced by the decomposition step, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanSpec {
    /// The request the plan was decomposed from.
    #[serde(default)]
    pub prompt: String,
    /// Tasks in declaration order.
    pub tasks: Vec<TaskSpec>,
}

impl PlanSpec {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }
}

/// An immutable-shape, acyclic task graph with per-task lifecycle state.
///
/// Construction through [`Plan::build`] rejects empty or duplicate ids,
/// unknown dependencies and cycles, so a `Plan` value always stratifies.
pub struct Plan {
    prompt: String,
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl Plan {
    /// Validate a list of task declarations into a plan.
    ///
    /// # Errors
    /// - [`Error::EmptyTaskId`] / [`Error::DuplicateTask`] for malformed ids
    /// - [`Error::UnknownDependency`] when a dependency names no task
    /// - [`Error::Cycle`] when the dependencies are not acyclic; the error
    ///   names a member of the cycle
    pub fn build(tasks: Vec<TaskSpec>) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut task_index = HashMap::with_capacity(tasks.len());

        for spec in tasks {
            if spec.id.is_empty() {
                return Err(Error::EmptyTaskId);
            }
            if task_index.contains_key(&spec.id) {
                return Err(Error::DuplicateTask(spec.id));
            }
            let id = spec.id.clone();
            let index = graph.add_node(Task::new(spec));
            task_index.insert(id, index);
        }

        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let spec = &graph[index].spec;
            for dep in &spec.dependencies {
                let dep_index =
                    *task_index
                        .get(dep)
                        .ok_or_else(|| Error::UnknownDependency {
                            task: spec.id.clone(),
                            dependency: dep.clone(),
                        })?;
                if dep_index == index {
                    return Err(Error::Cycle {
                        task: spec.id.clone(),
                    });
                }
                edges.push((dep_index, index));
            }
        }
        for (from, to) in edges {
            // update_edge keeps repeated dependency entries from inflating in-degrees
            graph.update_edge(from, to, ());
        }

        let plan = Self {
            prompt: String::new(),
            graph,
            task_index,
        };

        let peeled: usize = plan.levels().iter().map(Vec::len).sum();
        if peeled < plan.graph.node_count() {
            return Err(Error::Cycle {
                task: plan.cycle_member(),
            });
        }

        Ok(plan)
    }

    /// Validate a [`PlanSpec`], keeping its prompt.
    pub fn from_spec(spec: PlanSpec) -> Result<Self> {
        let mut plan = Self::build(spec.tasks)?;
        plan.prompt = spec.prompt;
        Ok(plan)
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index.get(id).map(|&index| &self.graph[index])
    }

    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    /// All tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Direct predecessors of a task, in declaration order.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of a task, in declaration order.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Every task reachable downstream of `id`, in declaration order.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(index) = stack.pop() {
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        let mut found: Vec<NodeIndex> = seen.into_iter().collect();
        found.sort();
        found.into_iter().map(|i| self.graph[i].id().clone()).collect()
    }

    /// Stratify the plan into waves.
    ///
    /// Wave `i` holds exactly the tasks whose predecessors all sit in
    /// waves `< i`; within a wave tasks keep declaration order.
    pub fn stratify(&self) -> Vec<Vec<TaskId>> {
        self.levels()
            .into_iter()
            .map(|wave| {
                wave.into_iter()
                    .map(|index| self.graph[index].id().clone())
                    .collect()
            })
            .collect()
    }

    /// Tasks not yet dispatched whose predecessors have all succeeded,
    /// in declaration order.
    pub fn ready_set(&self) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter(|&index| {
                matches!(
                    self.graph[index].status,
                    TaskStatus::Pending | TaskStatus::Ready
                ) && self.predecessors_succeeded(index)
            })
            .map(|index| self.graph[index].id().clone())
            .collect()
    }

    /// Move every pending task whose predecessors all succeeded to `ready`.
    ///
    /// Returns the ids that changed state, in declaration order.
    pub fn promote_ready(&mut self) -> Vec<TaskId> {
        let promotable: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&index| {
                self.graph[index].status == TaskStatus::Pending
                    && self.predecessors_succeeded(index)
            })
            .collect();

        promotable
            .into_iter()
            .map(|index| {
                let task = &mut self.graph[index];
                task.mark_ready();
                task.id().clone()
            })
            .collect()
    }

    /// Skip every not-yet-dispatched task downstream of a failed task.
    ///
    /// Returns the ids that were skipped, in declaration order.
    pub fn skip_downstream(&mut self, failed: &TaskId) -> Vec<TaskId> {
        let reason = SkipReason::DependencyFailed {
            task: failed.clone(),
        };
        self.transitive_dependents(failed)
            .into_iter()
            .filter(|id| {
                self.get_task_mut(id)
                    .map(|task| task.skip(reason.clone()))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Skip every pending or ready task.
    ///
    /// Returns the ids that were skipped, in declaration order.
    pub fn skip_unstarted(&mut self, reason: SkipReason) -> Vec<TaskId> {
        self.graph
            .node_weights_mut()
            .filter_map(|task| task.skip(reason.clone()).then(|| task.id().clone()))
            .collect()
    }

    /// Number of tasks in the given state (ignoring failure/skip detail).
    pub fn count_with_label(&self, label: &str) -> usize {
        self.tasks().filter(|t| t.status.label() == label).count()
    }

    /// Number of tasks not yet in a terminal state.
    pub fn unfinished_count(&self) -> usize {
        self.tasks().filter(|t| !t.is_terminal()).count()
    }

    /// Check if every task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.unfinished_count() == 0
    }

    /// Consume the plan, yielding its tasks in declaration order.
    pub fn into_tasks(self) -> Vec<Task> {
        let (nodes, _) = self.graph.into_nodes_edges();
        nodes.into_iter().map(|node| node.weight).collect()
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(index, direction).collect();
        found.sort();
        found.into_iter().map(|i| self.graph[i].id().clone()).collect()
    }

    fn predecessors_succeeded(&self, index: NodeIndex) -> bool {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .all(|dep| self.graph[dep].status == TaskStatus::Succeeded)
    }

    /// Kahn's algorithm: peel zero in-degree nodes level by level.
    ///
    /// On a cyclic graph the returned levels cover fewer nodes than the
    /// graph holds.
    fn levels(&self) -> Vec<Vec<NodeIndex>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|index| {
                self.graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count()
            })
            .collect();

        let mut current: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|index| in_degree[index.index()] == 0)
            .collect();
        let mut levels = Vec::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &index in &current {
                for succ in self.graph.neighbors_directed(index, Direction::Outgoing) {
                    let degree = &mut in_degree[succ.index()];
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(succ);
                    }
                }
            }
            next.sort();
            levels.push(std::mem::replace(&mut current, next));
        }

        levels
    }

    /// First member (by declaration order) of a non-trivial strongly
    /// connected component.
    fn cycle_member(&self) -> TaskId {
        tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .filter_map(|component| component.into_iter().min())
            .min()
            .map(|index| self.graph[index].id().clone())
            .unwrap_or_else(|| TaskId::from("unknown"))
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
