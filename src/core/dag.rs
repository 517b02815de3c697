//! Task graph for dependency management.
//!
//! `TaskGraph` stores tasks as nodes of a petgraph `DiGraph` with an edge from
//! each dependency to its dependent. It is a pure state container: readiness,
//! status transitions and failure cascades live here, I/O does not.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::GraphError;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Aggregate outcome of a batch once the graph reaches a fixed point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// `completed / total`, or 0.0 for an empty batch.
    pub success_rate: f64,
    pub failed_tasks: Vec<FailedTask>,
    /// Tasks still pending because the run was cancelled.
    #[serde(default)]
    pub unfinished: usize,
    #[serde(default)]
    pub cancelled: bool,
}

impl BatchSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// A terminally failed task in the summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTask {
    pub id: TaskId,
    pub error: String,
    pub attempts: u32,
}

/// The task dependency graph.
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Validate and insert a batch of tasks.
    ///
    /// Every dependency must name a task in the batch or a task already in
    /// the graph that has completed. Cycles are
    /// found by DFS and reported with their path. Validation happens before
    /// any mutation, so a rejected batch leaves the graph untouched.
    pub fn add_tasks(&mut self, tasks: Vec<Task>) -> std::result::Result<(), GraphError> {
        let mut batch_ids: HashSet<&TaskId> = HashSet::new();
        for task in &tasks {
            if self.task_index.contains_key(&task.id) || !batch_ids.insert(&task.id) {
                return Err(GraphError::DuplicateTask(task.id.to_string()));
            }
        }

        for task in &tasks {
            for dep in &task.dependencies {
                if batch_ids.contains(dep) {
                    continue;
                }
                let completed_in_graph = self
                    .get_task(dep)
                    .map(|t| t.status == TaskStatus::Completed)
                    .unwrap_or(false);
                if !completed_in_graph {
                    return Err(GraphError::MissingDependency {
                        task: task.id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
            }
        }

        if let Some(path) = find_cycle(&tasks) {
            return Err(GraphError::Cycle { path });
        }

        let edges: Vec<(TaskId, TaskId)> = tasks
            .iter()
            .flat_map(|t| t.dependencies.iter().map(|d| (d.clone(), t.id.clone())))
            .collect();

        for mut task in tasks {
            task.status = TaskStatus::Pending;
            let id = task.id.clone();
            let index = self.graph.add_node(task);
            self.task_index.insert(id, index);
        }

        for (from, to) in edges {
            if let (Some(&a), Some(&b)) = (self.task_index.get(&from), self.task_index.get(&to)) {
                self.graph.update_edge(a, b, ());
            }
        }

        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    fn get_task_mut(&mut self, id: &TaskId) -> std::result::Result<&mut Task, GraphError> {
        let index = *self
            .task_index
            .get(id)
            .ok_or_else(|| GraphError::UnknownTask(id.to_string()))?;
        self.graph
            .node_weight_mut(index)
            .ok_or_else(|| GraphError::UnknownTask(id.to_string()))
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    // ========== Scheduling Operations ==========

    /// Pending tasks whose dependencies have all completed.
    ///
    /// Ordered by priority (lower first), ties broken by insertion order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let mut ready: Vec<(NodeIndex, &Task)> = self
            .graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if task.status != TaskStatus::Pending {
                    return None;
                }
                let deps_done = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| {
                        self.graph
                            .node_weight(dep)
                            .map(|d| d.status == TaskStatus::Completed)
                            .unwrap_or(false)
                    });
                deps_done.then_some((index, task))
            })
            .collect();

        ready.sort_by_key(|(index, task)| (task.priority, index.index()));
        ready.into_iter().map(|(_, task)| task).collect()
    }

    pub fn mark_running(
        &mut self,
        id: &TaskId,
        worker_id: crate::orchestration::AgentId,
    ) -> std::result::Result<(), GraphError> {
        let ready = self.ready_tasks().iter().any(|t| &t.id == id);
        let task = self.get_task_mut(id)?;
        if !ready {
            return Err(invalid(task, "running"));
        }
        task.start(worker_id);
        Ok(())
    }

    /// Record the isolation branch a task runs on.
    pub fn set_branch_name(
        &mut self,
        id: &TaskId,
        branch: &str,
    ) -> std::result::Result<(), GraphError> {
        self.get_task_mut(id)?.branch_name = Some(branch.to_string());
        Ok(())
    }

    pub fn mark_completed(
        &mut self,
        id: &TaskId,
        files_changed: Vec<String>,
    ) -> std::result::Result<(), GraphError> {
        let task = self.get_task_mut(id)?;
        if task.status != TaskStatus::Running {
            return Err(invalid(task, "completed"));
        }
        task.complete(files_changed);
        Ok(())
    }

    /// Return a running task to the queue after a retryable failure.
    pub fn requeue(&mut self, id: &TaskId) -> std::result::Result<u32, GraphError> {
        let task = self.get_task_mut(id)?;
        if task.status != TaskStatus::Running {
            return Err(invalid(task, "pending"));
        }
        task.requeue();
        Ok(task.attempts)
    }

    /// Fail a task permanently and skip everything downstream of it.
    ///
    /// Accepts running tasks and pending tasks rejected before dispatch.
    /// Returns the ids of the tasks that were skipped as a consequence.
    pub fn mark_failed(
        &mut self,
        id: &TaskId,
        error: &str,
    ) -> std::result::Result<Vec<TaskId>, GraphError> {
        {
            let task = self.get_task_mut(id)?;
            if task.is_finished() {
                return Err(invalid(task, "failed"));
            }
            task.attempts += 1;
            task.fail(error);
        }

        let mut skipped = Vec::new();
        let mut queue: VecDeque<(NodeIndex, TaskId)> = VecDeque::new();
        if let Some(&start) = self.task_index.get(id) {
            queue.push_back((start, id.clone()));
        }

        while let Some((index, cause)) = queue.pop_front() {
            let dependents: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .collect();
            for dep_index in dependents {
                if let Some(task) = self.graph.node_weight_mut(dep_index) {
                    if task.status == TaskStatus::Pending {
                        task.skip(&format!("dependency '{}' did not complete", cause));
                        skipped.push(task.id.clone());
                        queue.push_back((dep_index, task.id.clone()));
                    }
                }
            }
        }

        Ok(skipped)
    }

    pub fn count_status(&self, name: &str) -> usize {
        self.graph
            .node_weights()
            .filter(|t| t.status.name() == name)
            .count()
    }

    pub fn running_count(&self) -> usize {
        self.count_status("running")
    }

    pub fn pending_count(&self) -> usize {
        self.count_status("pending")
    }

    pub fn summary(&self) -> BatchSummary {
        let total = self.task_count();
        let completed = self.count_status("completed");
        let skipped = self.count_status("skipped");
        let failed_tasks: Vec<FailedTask> = self
            .graph
            .node_weights()
            .filter_map(|t| match &t.status {
                TaskStatus::Failed { error } => Some(FailedTask {
                    id: t.id.clone(),
                    error: error.clone(),
                    attempts: t.attempts,
                }),
                _ => None,
            })
            .collect();
        let success_rate = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64
        };

        BatchSummary {
            total,
            completed,
            failed: failed_tasks.len(),
            skipped,
            success_rate,
            failed_tasks,
            unfinished: self.pending_count() + self.running_count(),
            cancelled: false,
        }
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
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

fn invalid(task: &Task, to: &str) -> GraphError {
    GraphError::InvalidTransition {
        task: task.id.to_string(),
        from: task.status.name().to_string(),
        to: to.to_string(),
    }
}

/// Depth-first search over the batch's dependency edges.
///
/// Returns the first cycle found as a path that starts and ends on the same id.
fn find_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let deps: HashMap<&str, Vec<&str>> = tasks
        .iter()
        .map(|t| {
            (
                t.id.as_str(),
                t.dependencies.iter().map(|d| d.as_str()).collect(),
            )
        })
        .collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for root in tasks.iter().map(|t| t.id.as_str()) {
        if marks.contains_key(root) {
            continue;
        }
        // Explicit stack of (node, next child index) keeps deep chains off the call stack.
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        marks.insert(root, Mark::Visiting);

        while let Some((node, child)) = stack.last().copied() {
            let children = deps.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if child >= children.len() {
                marks.insert(node, Mark::Done);
                stack.pop();
                continue;
            }
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            let next = children[child];
            if !deps.contains_key(next) {
                continue;
            }
            match marks.get(next) {
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|(n, _)| n.to_string()).collect();
                    path.push(next.to_string());
                    return Some(path);
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(next, Mark::Visiting);
                    stack.push((next, 0));
                }
            }
        }
    }

    None
}
