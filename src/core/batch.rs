//! Task batch file format.
//!
//! A batch is either an object with an optional `session` block and a `tasks`
//! array, or a bare array of tasks.

use crate::core::task::{Task, TaskId, TaskType, DEFAULT_PRIORITY};
use crate::orchestration::AgentId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Run options carried by a batch file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub concurrency: Option<usize>,
    /// Default per-task timeout in milliseconds.
    pub timeout: Option<u64>,
    /// Base branch that task branches are cut from.
    pub branch: Option<String>,
}

/// `scope` may be written as one string or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scope {
    One(String),
    Many(Vec<String>),
}

impl Scope {
    fn into_vec(self) -> Vec<String> {
        match self {
            Scope::One(s) => vec![s],
            Scope::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    pub description: String,
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    /// Milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub candidates: Vec<String>,
}

impl From<TaskSpec> for Task {
    fn from(spec: TaskSpec) -> Self {
        let mut task = Task::new(TaskId::new(spec.id), &spec.description)
            .with_type(spec.task_type)
            .with_priority(spec.priority.unwrap_or(DEFAULT_PRIORITY))
            .with_dependencies(spec.dependencies)
            .with_candidates(spec.candidates.into_iter().map(AgentId::from));
        if let Some(scope) = spec.scope {
            task = task.with_scope(scope.into_vec());
        }
        if let Some(ms) = spec.timeout {
            task = task.with_timeout(Duration::from_millis(ms));
        }
        if let Some(retries) = spec.retries {
            task = task.with_max_retries(retries);
        }
        task
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum BatchFile {
    Full {
        #[serde(default)]
        session: Option<SessionOptions>,
        tasks: Vec<TaskSpec>,
    },
    Bare(Vec<TaskSpec>),
}

/// A parsed batch ready for submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskBatch {
    pub session: SessionOptions,
    pub tasks: Vec<TaskSpec>,
}

impl TaskBatch {
    pub fn parse(content: &str) -> Result<Self> {
        let file: BatchFile = serde_json::from_str(content)?;
        Ok(match file {
            BatchFile::Full { session, tasks } => Self {
                session: session.unwrap_or_default(),
                tasks,
            },
            BatchFile::Bare(tasks) => Self {
                session: SessionOptions::default(),
                tasks,
            },
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Validation(format!("cannot read task file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// A one-task batch built from a CLI description.
    pub fn single(description: &str, scope: Option<String>) -> Self {
        Self {
            session: SessionOptions::default(),
            tasks: vec![TaskSpec {
                id: "task-1".to_string(),
                task_type: TaskType::default(),
                description: description.to_string(),
                scope: scope.map(Scope::One),
                dependencies: Vec::new(),
                priority: None,
                timeout: None,
                retries: None,
                candidates: Vec::new(),
            }],
        }
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks.into_iter().map(Task::from).collect()
    }
}
