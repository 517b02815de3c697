//! Task data model for the task graph.
//!
//! Tasks are the units of work handed to agents. Each task tracks its
//! status, attempt count, worker assignment, isolation branch and results.

use crate::orchestration::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Priority given to tasks that do not specify one. Lower runs first.
pub const DEFAULT_PRIORITY: i64 = 100;

/// Caller-assigned identifier, unique within a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Implement,
    Fix,
    Test,
    Refactor,
    Review,
    Document,
    Research,
    #[serde(other)]
    Other,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::Implement => "implement",
            TaskType::Fix => "fix",
            TaskType::Test => "test",
            TaskType::Refactor => "refactor",
            TaskType::Review => "review",
            TaskType::Document => "document",
            TaskType::Research => "research",
            TaskType::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Task status in its lifecycle.
///
/// `Pending -> Running -> {Completed | Failed | Skipped}`. A retried task goes
/// from `Running` back to `Pending`; the terminal states are never left.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed {
        error: String,
    },
    /// A dependency failed, so this task never ran.
    Skipped {
        reason: String,
    },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Skipped { .. }
        )
    }

    /// Short state name without the payload.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Skipped { .. } => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// What an agent reports back after executing a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn succeeded(duration_ms: u64, files_changed: Vec<String>) -> Self {
        Self {
            success: true,
            duration_ms,
            files_changed,
            error: None,
        }
    }

    pub fn failed(duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            duration_ms,
            files_changed: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// A single task in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub description: String,
    /// File or path hints for the agent.
    pub scope: Vec<String>,
    pub dependencies: Vec<TaskId>,
    /// Lower values are scheduled first among ready tasks.
    pub priority: i64,
    /// Per-task execution timeout; the pool default applies when unset.
    pub timeout: Option<Duration>,
    /// Retry budget; unset means the coordinator default.
    pub max_retries: Option<u32>,
    /// Agents eligible to bid for this task. Empty means any pool worker.
    pub candidates: Vec<AgentId>,
    pub status: TaskStatus,
    /// Number of failed attempts so far.
    pub attempts: u32,
    pub worker_id: Option<AgentId>,
    pub branch_name: Option<String>,
    pub files_changed: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, description: &str) -> Self {
        Self {
            id: id.into(),
            task_type: TaskType::default(),
            description: description.to_string(),
            scope: Vec::new(),
            dependencies: Vec::new(),
            priority: DEFAULT_PRIORITY,
            timeout: None,
            max_retries: None,
            candidates: Vec::new(),
            status: TaskStatus::Pending,
            attempts: 0,
            worker_id: None,
            branch_name: None,
            files_changed: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scope<I, S>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = scope.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_candidates<I, A>(mut self, candidates: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<AgentId>,
    {
        self.candidates = candidates.into_iter().map(Into::into).collect();
        self
    }

    /// Check the task is well formed before it is handed to an agent.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.id.as_str().trim().is_empty() {
            return Err("task id is empty".to_string());
        }
        if self.description.trim().is_empty() {
            return Err(format!("task '{}' has an empty description", self.id));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(format!("task '{}' has a zero timeout", self.id));
        }
        Ok(())
    }

    /// Prompt handed to the agent: description plus scope hints.
    pub fn prompt(&self) -> String {
        let mut prompt = format!("[{}] {}", self.task_type, self.description);
        if !self.scope.is_empty() {
            prompt.push_str("\n\nScope: ");
            prompt.push_str(&self.scope.join(", "));
        }
        prompt
    }

    pub fn start(&mut self, worker_id: AgentId) {
        self.status = TaskStatus::Running;
        self.worker_id = Some(worker_id);
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, files_changed: Vec<String>) {
        self.status = TaskStatus::Completed;
        self.files_changed = files_changed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: &str) {
        self.status = TaskStatus::Skipped {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Put a failed attempt back in the queue.
    pub fn requeue(&mut self) {
        self.status = TaskStatus::Pending;
        self.attempts += 1;
        self.worker_id = None;
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
