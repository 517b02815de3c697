//! Agent execution boundary.

use crate::core::task::{Task, TaskResult};
use crate::orchestration::AgentId;
use crate::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Everything an executor needs to know about one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub worker_id: AgentId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Isolation branch reserved for this task.
    pub branch: String,
    /// Worktree checked out on `branch`, when git isolation is enabled.
    pub workdir: Option<PathBuf>,
    /// Cancelled when the attempt times out or the run is aborted.
    pub cancel: CancellationToken,
}

/// Runs a single task attempt.
///
/// An `Err` or a `TaskResult` with `success == false` are both retryable
/// failures. Implementations should watch `ctx.cancel` and return promptly
/// once it fires; the coordinator aborts the attempt regardless.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<TaskResult>;
}
