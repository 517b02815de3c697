//! Coordinator for parallel task execution.
//!
//! The `Coordinator` drains a `TaskGraph`: it dispatches ready tasks to
//! workers up to the concurrency limit, applies per-task timeouts and the
//! retry policy, isolates each task on its own branch, and emits lifecycle
//! events. Executions and bid rounds run concurrently in `JoinSet`s, but
//! every graph and registry mutation happens here in the run loop, one
//! result at a time.

use crate::config::{
    Config, DEFAULT_BRANCH_PREFIX, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS,
};
use crate::core::dag::{BatchSummary, TaskGraph};
use crate::core::task::{Task, TaskId, TaskResult};
use crate::error::{Error, GraphError, Result};
use crate::orchestration::context::CoordinatorContext;
use crate::orchestration::events::SwarmEvent;
use crate::orchestration::executor::{ExecutionContext, TaskExecutor};
use crate::orchestration::negotiation::NegotiationEngine;
use crate::orchestration::pool::WORKER_ROLE;
use crate::orchestration::workspace::{branch_name, Workspace};
use crate::orchestration::AgentId;
use crate::{hlog, hlog_debug, hlog_error, hlog_warn};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Run-wide defaults. Per-task settings take precedence.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorOptions {
    /// Maximum simultaneously running executions.
    pub concurrency: usize,
    pub default_timeout: Duration,
    pub default_max_retries: u32,
    pub branch_prefix: String,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            default_max_retries: DEFAULT_MAX_RETRIES,
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
        }
    }
}

impl CoordinatorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.effective_concurrency(),
            default_timeout: config.effective_timeout(),
            default_max_retries: config.effective_max_retries(),
            branch_prefix: config.effective_branch_prefix().to_string(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }
}

/// What an execution job reports back to the run loop.
struct Completion {
    task_id: TaskId,
    worker_id: AgentId,
    branch: String,
    outcome: Result<TaskResult>,
}

/// A finished bid round.
struct Negotiated {
    task_id: TaskId,
    winner: Result<AgentId>,
}

/// Whatever the run loop woke up for.
enum Next {
    Finished(std::result::Result<Completion, JoinError>),
    Negotiated(std::result::Result<Negotiated, JoinError>),
    Cancelled,
}

/// Why a ready task was not dispatched this round.
enum Dispatch {
    Started,
    /// Failed before execution; no slot used.
    Rejected,
    /// Waiting on its bid round.
    Negotiating,
    /// Left pending until a slot or branch frees up.
    Deferred,
}

pub struct Coordinator {
    ctx: CoordinatorContext,
    graph: TaskGraph,
    executor: Arc<dyn TaskExecutor>,
    options: CoordinatorOptions,
    negotiator: Option<Arc<NegotiationEngine>>,
    workspace: Option<Arc<Workspace>>,
    cancel: CancellationToken,
    /// Branches held by in-flight executions.
    active_branches: HashSet<String>,
    /// Bid round outcome per task; `None` means fall back to a pool worker.
    winners: HashMap<TaskId, Option<AgentId>>,
    negotiating: HashSet<TaskId>,
    peak_concurrency: usize,
}

impl Coordinator {
    pub fn new(
        ctx: CoordinatorContext,
        executor: Arc<dyn TaskExecutor>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            ctx,
            graph: TaskGraph::new(),
            executor,
            options,
            negotiator: None,
            workspace: None,
            cancel: CancellationToken::new(),
            active_branches: HashSet::new(),
            winners: HashMap::new(),
            negotiating: HashSet::new(),
            peak_concurrency: 0,
        }
    }

    /// Resolve tasks that name candidate agents through bidding.
    pub fn with_negotiator(mut self, negotiator: Arc<NegotiationEngine>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Check each task's branch out as a git worktree.
    pub fn with_workspace(mut self, workspace: Arc<Workspace>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Stop dispatching once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Add a batch to the graph.
    ///
    /// # Errors
    ///
    /// `Error::Graph` for duplicate ids, unknown dependencies or cycles. The
    /// whole batch is rejected and nothing is dispatched.
    pub fn submit(&mut self, tasks: Vec<Task>) -> Result<()> {
        let count = tasks.len();
        self.graph.add_tasks(tasks).map_err(|e| {
            hlog_error!("Batch rejected: {}", e);
            Error::Graph(e)
        })?;
        hlog_debug!("Coordinator::submit accepted {} task(s)", count);
        Ok(())
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Most executions observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_concurrency
    }

    pub fn context(&self) -> &CoordinatorContext {
        &self.ctx
    }

    /// Drain the graph and return the batch summary.
    ///
    /// After cancellation no new task starts and open bid rounds are
    /// abandoned. Executions already running are left to finish or hit their
    /// own timeout; whatever is still pending is reported as `unfinished`.
    pub async fn run(&mut self) -> Result<BatchSummary> {
        if self.graph.is_empty() {
            hlog_debug!("Coordinator::run with no tasks");
            return Ok(self.graph.summary());
        }
        hlog!(
            "Run started: {} task(s), concurrency {}",
            self.graph.task_count(),
            self.options.concurrency
        );

        self.ctx
            .pool
            .write()
            .await
            .reserve_workers(self.options.concurrency);

        let cancel = self.cancel.clone();
        let mut in_flight: JoinSet<Completion> = JoinSet::new();
        let mut negotiations: JoinSet<Negotiated> = JoinSet::new();
        loop {
            if cancel.is_cancelled() {
                negotiations.abort_all();
            } else {
                self.fill_slots(&mut in_flight, &mut negotiations).await?;
            }
            self.peak_concurrency = self.peak_concurrency.max(in_flight.len());
            if in_flight.is_empty() && negotiations.is_empty() {
                break;
            }

            let next = tokio::select! {
                Some(joined) = in_flight.join_next() => Next::Finished(joined),
                Some(joined) = negotiations.join_next() => Next::Negotiated(joined),
                _ = cancel.cancelled(), if !cancel.is_cancelled() => Next::Cancelled,
                else => break,
            };
            match next {
                Next::Finished(Ok(completion)) => self.handle_completion(completion).await?,
                Next::Finished(Err(e)) => hlog_error!("Execution job lost: {}", e),
                Next::Negotiated(Ok(negotiated)) => self.record_negotiation(negotiated),
                Next::Negotiated(Err(e)) => {
                    if !e.is_cancelled() {
                        hlog_error!("Negotiation job lost: {}", e);
                    }
                    if negotiations.is_empty() {
                        for task_id in self.negotiating.drain() {
                            self.winners.insert(task_id, None);
                        }
                    }
                }
                Next::Cancelled => {
                    hlog!("Run cancelled, waiting on {} execution(s)", in_flight.len());
                }
            }
        }

        let mut summary = self.graph.summary();
        summary.cancelled = self.cancel.is_cancelled();
        hlog!(
            "Run finished: {}/{} completed, {} failed, {} skipped{}",
            summary.completed,
            summary.total,
            summary.failed,
            summary.skipped,
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        Ok(summary)
    }

    async fn fill_slots(
        &mut self,
        in_flight: &mut JoinSet<Completion>,
        negotiations: &mut JoinSet<Negotiated>,
    ) -> Result<()> {
        let ready: Vec<TaskId> = self.graph.ready_tasks().iter().map(|t| t.id.clone()).collect();
        for task_id in ready {
            if in_flight.len() >= self.options.concurrency || self.cancel.is_cancelled() {
                break;
            }
            match self.dispatch(&task_id, in_flight, negotiations).await? {
                Dispatch::Started => {
                    self.peak_concurrency = self.peak_concurrency.max(in_flight.len());
                }
                Dispatch::Rejected | Dispatch::Negotiating => {}
                Dispatch::Deferred => {
                    hlog_debug!("Deferring task {}", task_id);
                }
            }
        }
        Ok(())
    }

    fn reserve_branch(&mut self, branch: &str) -> Result<()> {
        if !self.active_branches.insert(branch.to_string()) {
            return Err(Error::BranchInUse(branch.to_string()));
        }
        Ok(())
    }

    async fn dispatch(
        &mut self,
        task_id: &TaskId,
        in_flight: &mut JoinSet<Completion>,
        negotiations: &mut JoinSet<Negotiated>,
    ) -> Result<Dispatch> {
        let task = match self.graph.get_task(task_id) {
            Some(task) => task.clone(),
            None => return Ok(Dispatch::Deferred),
        };

        if let Err(reason) = task.validate() {
            hlog_warn!("Task {} failed validation: {}", task_id, reason);
            self.fail_permanently(task_id, &Error::Validation(reason).to_string())?;
            return Ok(Dispatch::Rejected);
        }

        if !task.candidates.is_empty() && !self.winners.contains_key(task_id) {
            if let Some(negotiator) = &self.negotiator {
                if self.negotiating.insert(task_id.clone()) {
                    negotiations.spawn(negotiate(Arc::clone(negotiator), &task));
                }
                return Ok(Dispatch::Negotiating);
            }
        }

        let branch = branch_name(&self.options.branch_prefix, task_id);
        if let Err(e) = self.reserve_branch(&branch) {
            hlog_debug!("{}", e);
            return Ok(Dispatch::Deferred);
        }

        let worker_id = match self.assign_worker(&task).await {
            Ok(worker_id) => worker_id,
            Err(e) => {
                self.active_branches.remove(&branch);
                if in_flight.is_empty() {
                    // Worker slots are reserved, so only a registry error lands
                    // here; with nothing in flight no release will fix it.
                    self.fail_permanently(task_id, &e.to_string())?;
                    return Ok(Dispatch::Rejected);
                }
                hlog_debug!("No worker for {} yet: {}", task_id, e);
                return Ok(Dispatch::Deferred);
            }
        };

        self.graph.mark_running(task_id, worker_id.clone())?;
        self.graph.set_branch_name(task_id, &branch)?;
        let attempt = task.attempts + 1;
        self.ctx.events.emit(SwarmEvent::TaskStarted {
            task_id: task_id.clone(),
            worker_id: worker_id.clone(),
            attempt,
        });

        let timeout = task.timeout.unwrap_or(self.options.default_timeout);
        let exec_ctx = ExecutionContext {
            worker_id: worker_id.clone(),
            attempt,
            branch: branch.clone(),
            workdir: None,
            // Independent of the run token: only the attempt timeout fires it.
            cancel: CancellationToken::new(),
        };
        in_flight.spawn(run_attempt(
            Arc::clone(&self.executor),
            self.workspace.clone(),
            task,
            exec_ctx,
            timeout,
        ));
        Ok(Dispatch::Started)
    }

    /// Pick the worker for a task: the negotiation winner when the task
    /// names candidates, otherwise an idle pool worker.
    async fn assign_worker(&self, task: &Task) -> Result<AgentId> {
        let coordinator_id = &self.ctx.coordinator_id;
        let chosen = match self.winners.get(&task.id) {
            Some(winner) => winner.clone(),
            None if self.negotiator.is_none() => task.candidates.first().cloned(),
            None => None,
        };

        let mut pool = self.ctx.pool.write().await;
        if let Some(agent_id) = chosen {
            match pool.claim(&agent_id, WORKER_ROLE, coordinator_id) {
                Ok(()) => return Ok(agent_id),
                Err(e) => hlog_warn!(
                    "Cannot claim {} for {}, using a pool worker: {}",
                    agent_id,
                    task.id,
                    e
                ),
            }
        }
        pool.acquire(WORKER_ROLE, coordinator_id, self.ctx.tenant.clone())
    }

    fn record_negotiation(&mut self, negotiated: Negotiated) {
        let Negotiated { task_id, winner } = negotiated;
        self.negotiating.remove(&task_id);
        let winner = match winner {
            Ok(agent_id) => {
                hlog_debug!("Task {} goes to {}", task_id, agent_id);
                Some(agent_id)
            }
            Err(e) => {
                hlog_warn!("Negotiation for {} failed, using a pool worker: {}", task_id, e);
                None
            }
        };
        self.winners.insert(task_id, winner);
    }

    fn fail_permanently(&mut self, task_id: &TaskId, error: &str) -> Result<()> {
        let skipped = self.graph.mark_failed(task_id, error)?;
        self.ctx.events.emit(SwarmEvent::TaskFailed {
            task_id: task_id.clone(),
            error: error.to_string(),
        });
        hlog_warn!("Task {} failed: {}", task_id, error);
        if !skipped.is_empty() {
            let names: Vec<&str> = skipped.iter().map(TaskId::as_str).collect();
            hlog_warn!("Skipping dependents of {}: {}", task_id, names.join(", "));
        }
        Ok(())
    }

    async fn handle_completion(&mut self, completion: Completion) -> Result<()> {
        let Completion {
            task_id,
            worker_id,
            branch,
            outcome,
        } = completion;
        self.active_branches.remove(&branch);
        self.ctx.pool.write().await.release(&worker_id);

        let failure = match outcome {
            Ok(result) if result.success => {
                self.graph
                    .mark_completed(&task_id, result.files_changed.clone())?;
                hlog!(
                    "Task {} completed in {}ms on {}",
                    task_id,
                    result.duration_ms,
                    branch
                );
                self.ctx.events.emit(SwarmEvent::TaskCompleted {
                    task_id,
                    worker_id,
                    result,
                });
                return Ok(());
            }
            Ok(result) => Error::Execution(
                result
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            ),
            Err(e) => e,
        };

        let (failed_attempts, max_retries) = match self.graph.get_task(&task_id) {
            Some(task) => (
                task.attempts,
                task.max_retries.unwrap_or(self.options.default_max_retries),
            ),
            None => return Err(GraphError::UnknownTask(task_id.to_string()).into()),
        };

        if failure.is_retryable() && failed_attempts < max_retries {
            let retry = self.graph.requeue(&task_id)?;
            hlog_warn!(
                "Task {} failed ({}), retry {}/{}",
                task_id,
                failure,
                retry,
                max_retries
            );
            self.ctx.events.emit(SwarmEvent::TaskRetry {
                task_id,
                attempt: retry,
                error: failure.to_string(),
            });
        } else {
            self.fail_permanently(&task_id, &failure.to_string())?;
        }
        Ok(())
    }
}

/// One bid round, run off the loop so it never holds up dispatching.
fn negotiate(
    negotiator: Arc<NegotiationEngine>,
    task: &Task,
) -> impl Future<Output = Negotiated> + Send + 'static {
    let task_id = task.id.clone();
    let candidates = task.candidates.clone();
    let description = task.description.clone();
    async move {
        let winner = negotiator
            .negotiate_for(Some(&task_id), &candidates, &description)
            .await
            .map(|outcome| outcome.winner_id);
        Negotiated { task_id, winner }
    }
}

/// One execution attempt: prepare the worktree, run under the timeout, and
/// clean up. Never panics; every problem becomes the outcome.
async fn run_attempt(
    executor: Arc<dyn TaskExecutor>,
    workspace: Option<Arc<Workspace>>,
    task: Task,
    mut ctx: ExecutionContext,
    timeout: Duration,
) -> Completion {
    let task_id = task.id.clone();
    let worker_id = ctx.worker_id.clone();
    let branch = ctx.branch.clone();

    let workdir: Option<PathBuf> = match &workspace {
        Some(ws) => match ws.prepare(&branch).await {
            Ok(path) => Some(path),
            Err(e) => {
                return Completion {
                    task_id,
                    worker_id,
                    branch,
                    outcome: Err(Error::Execution(format!("workspace setup failed: {}", e))),
                }
            }
        },
        None => None,
    };
    ctx.workdir = workdir.clone();

    let started = Instant::now();
    let cancel = ctx.cancel.clone();
    let mut handle = tokio::spawn(async move { executor.execute(&task, &ctx).await });

    let outcome = match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(result)) => result.map(|mut r| {
            if r.duration_ms == 0 {
                r.duration_ms = started.elapsed().as_millis() as u64;
            }
            r
        }),
        Ok(Err(join_err)) => Err(Error::TaskJoin(join_err.to_string())),
        Err(_) => {
            cancel.cancel();
            handle.abort();
            Err(Error::Timeout(timeout))
        }
    };

    if let (Some(ws), Some(path)) = (&workspace, &workdir) {
        if let Err(e) = ws.release(path).await {
            hlog_warn!("Failed to remove worktree {}: {}", path.display(), e);
        }
    }

    Completion {
        task_id,
        worker_id,
        branch,
        outcome,
    }
}
