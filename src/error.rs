use thiserror::Error;

/// Errors raised while building or mutating the task graph.
///
/// Any of these rejects the whole batch submission before a single task runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Dependency cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Task '{task}' depends on unknown or incomplete task '{dependency}'")]
    MissingDependency { task: String, dependency: String },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Task not found in graph: {0}")]
    UnknownTask(String),

    #[error("Invalid transition for task '{task}' from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Metric provider '{source_name}' failed for '{metric}': {reason}")]
    ScalingProvider {
        source_name: String,
        metric: String,
        reason: String,
    },

    #[error("Audit persistence failed: {0}")]
    Persistence(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Branch already in use by a running task: {0}")]
    BranchInUse(String),

    #[error("Agent pool is full (max: {max})")]
    AgentPoolFull { max: usize },

    #[error("Agent not found: {id}")]
    AgentNotFound { id: crate::orchestration::AgentId },
}

impl Error {
    /// Whether a failure of this kind should be retried under the task's retry budget.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Validation(_) | Error::Graph(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
