//! Task dependency graph.
//!
//! The graph is the sole owner of dependency state. Nodes are tasks, edges
//! point from a dependency to the task that waits on it. Every status change
//! goes through one of the `mark_*` methods, which reject illegal steps with
//! `Error::InvalidTransition` instead of coercing them.

use crate::core::task::{Progress, Task, TaskError, TaskId, TaskStatus, Usage};
use crate::core::worker::WorkerId;
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// The task dependency graph.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<Task>", into = "Vec<Task>")]
pub struct TaskGraph {
    /// The underlying directed graph. Node indices follow insertion order.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a graph from a task list and validate it.
    ///
    /// # Errors
    /// Returns `Error::Validation` on duplicate ids, unknown dependencies or
    /// a dependency cycle.
    pub fn load(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = Self::new();
        graph.add_tasks(tasks)?;
        graph.validate()?;
        Ok(graph)
    }

    /// Add a single task.
    ///
    /// Edges are created for dependencies already in the graph and for
    /// existing tasks that depend on the new one, so tasks may be added in
    /// any order.
    ///
    /// # Errors
    /// Returns `Error::Validation` if a task with the same id exists.
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::Validation(format!("duplicate task id: {}", task.id)));
        }

        let id = task.id.clone();
        let deps: Vec<TaskId> = task.dependencies.iter().cloned().collect();
        let index = self.graph.add_node(task);
        self.task_index.insert(id.clone(), index);

        for dep in deps {
            if let Some(&dep_index) = self.task_index.get(&dep) {
                self.graph.add_edge(dep_index, index, ());
            }
        }

        let waiting: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&i| i != index && self.graph[i].dependencies.contains(&id))
            .collect();
        for dependent in waiting {
            self.graph.add_edge(index, dependent, ());
        }

        Ok(())
    }

    /// Add a batch of tasks. Nothing is inserted if any id collides.
    pub fn add_tasks(&mut self, tasks: Vec<Task>) -> Result<()> {
        let mut seen = HashSet::new();
        for task in &tasks {
            if self.task_index.contains_key(&task.id) || !seen.insert(task.id.clone()) {
                return Err(Error::Validation(format!("duplicate task id: {}", task.id)));
            }
        }
        for task in tasks {
            self.add_task(task)?;
        }
        Ok(())
    }

    /// Reject unknown dependency ids, cycles and ids that would share a
    /// workspace.
    pub fn validate(&self) -> Result<()> {
        let mut slugs: HashMap<String, &TaskId> = HashMap::new();
        for task in self.graph.node_weights() {
            if let Some(other) = slugs.insert(task.id.slug(), &task.id) {
                return Err(Error::Validation(format!(
                    "task ids {} and {} map to the same workspace name {}",
                    other,
                    task.id,
                    task.id.slug()
                )));
            }
        }
        for task in self.graph.node_weights() {
            for dep in &task.dependencies {
                if !self.task_index.contains_key(dep) {
                    return Err(Error::Validation(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
            }
        }
        if self.has_cycle() {
            return Err(Error::Validation(
                "task dependencies contain a cycle".to_string(),
            ));
        }
        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        let index = *self
            .task_index
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        self.graph
            .node_weight_mut(index)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Tasks that list `id` as a dependency.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => {
                let mut found: Vec<NodeIndex> = self
                    .graph
                    .neighbors_directed(index, Direction::Outgoing)
                    .collect();
                found.sort();
                found.into_iter().map(|i| &self.graph[i]).collect()
            }
            None => Vec::new(),
        }
    }

    fn dependencies_completed(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.get_task(dep)
                .map(|t| t.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    // ========== Scheduling Queries ==========

    /// All waiting tasks whose every dependency is completed.
    ///
    /// Pure read; results come back in insertion order. A task whose
    /// dependency is unknown or sits on a cycle is never returned.
    pub fn get_ready_tasks(&self) -> Vec<&Task> {
        self.graph
            .node_weights()
            .filter(|task| task.is_waiting() && self.dependencies_completed(task))
            .collect()
    }

    /// Flip eligible pending tasks to `ready` so status output reflects them.
    pub fn promote_ready(&mut self) -> Vec<TaskId> {
        let ids: Vec<TaskId> = self
            .get_ready_tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.id.clone())
            .collect();
        for id in &ids {
            if let Ok(task) = self.task_mut(id) {
                task.status = TaskStatus::Ready;
            }
        }
        ids
    }

    /// Number of pending dependents that become ready once `id` completes.
    pub fn unlock_count(&self, id: &TaskId) -> usize {
        self.dependents(id)
            .into_iter()
            .filter(|dependent| {
                dependent.is_waiting()
                    && dependent.dependencies.iter().all(|dep| {
                        dep == id
                            || self
                                .get_task(dep)
                                .map(|t| t.status == TaskStatus::Completed)
                                .unwrap_or(false)
                    })
            })
            .count()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.graph
            .node_weights()
            .filter(|t| t.status == status)
            .count()
    }

    /// True once no task is pending, ready or running.
    pub fn is_settled(&self) -> bool {
        self.graph.node_weights().all(|t| t.is_finished())
    }

    pub fn running_tasks(&self) -> Vec<&Task> {
        self.graph
            .node_weights()
            .filter(|t| t.status == TaskStatus::Running)
            .collect()
    }

    /// First dependency of `id` that can no longer complete.
    pub fn blocked_by_failure(&self, id: &TaskId) -> Option<TaskId> {
        let task = self.get_task(id)?;
        task.dependencies
            .iter()
            .find(|dep| {
                self.get_task(dep)
                    .map(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled))
                    .unwrap_or(true)
            })
            .cloned()
    }

    // ========== Transitions ==========

    /// Bind a waiting task to a worker.
    ///
    /// Returns the new assignment generation.
    ///
    /// # Errors
    /// `Error::InvalidTransition` if the task isn't pending/ready or a
    /// dependency is not completed.
    pub fn mark_running(&mut self, id: &TaskId, worker: WorkerId) -> Result<u32> {
        let deps_done = {
            let task = self
                .get_task(id)
                .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
            self.dependencies_completed(task)
        };
        let task = self.task_mut(id)?;
        if !deps_done {
            return Err(Error::InvalidTransition {
                task: id.clone(),
                from: format!("{} (dependencies incomplete)", task.status),
                to: TaskStatus::Running.to_string(),
            });
        }
        task.start(worker)?;
        Ok(task.generation())
    }

    pub fn mark_completed(&mut self, id: &TaskId) -> Result<()> {
        self.task_mut(id)?.complete()
    }

    pub fn mark_failed(&mut self, id: &TaskId, error: TaskError) -> Result<()> {
        self.task_mut(id)?.fail(error)
    }

    /// Return a running task to pending (its worker vanished).
    pub fn requeue(&mut self, id: &TaskId) -> Result<()> {
        self.task_mut(id)?.requeue()
    }

    pub fn mark_cancelled(&mut self, id: &TaskId, reason: TaskError) -> Result<()> {
        self.task_mut(id)?.cancel(reason)
    }

    pub fn record_progress(&mut self, id: &TaskId, progress: Progress) -> Result<()> {
        self.task_mut(id)?.progress = Some(progress);
        Ok(())
    }

    pub fn record_output(&mut self, id: &TaskId, output: String, usage: Usage) -> Result<()> {
        let task = self.task_mut(id)?;
        task.output = Some(output);
        task.usage = Some(usage);
        Ok(())
    }

    // ========== Ordering ==========

    /// Detect a dependency cycle with a depth-first search that tracks the
    /// current recursion stack.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        self.graph
            .node_indices()
            .any(|start| self.visit(start, &mut visited, &mut on_stack))
    }

    fn visit(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        on_stack: &mut HashSet<NodeIndex>,
    ) -> bool {
        if on_stack.contains(&node) {
            return true;
        }
        if !visited.insert(node) {
            return false;
        }
        on_stack.insert(node);
        for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
            if self.visit(next, visited, on_stack) {
                return true;
            }
        }
        on_stack.remove(&node);
        false
    }

    /// Tasks ordered so every task comes after all of its dependencies.
    ///
    /// # Errors
    /// Returns `Error::Validation` if the graph contains a cycle.
    pub fn topological_sort(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::Validation(format!("cycle detected at task: {}", id))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}

impl From<TaskGraph> for Vec<Task> {
    fn from(graph: TaskGraph) -> Self {
        let (nodes, _) = graph.graph.into_nodes_edges();
        nodes.into_iter().map(|n| n.weight).collect()
    }
}

impl TryFrom<Vec<Task>> for TaskGraph {
    type Error = Error;

    fn try_from(tasks: Vec<Task>) -> Result<Self> {
        TaskGraph::load(tasks)
    }
}
