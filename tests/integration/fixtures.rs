//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Scripted executors and bidders with controllable failures and delays
//! - Collecting the event stream of a run

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use git2::{Repository, Signature};
use tempfile::TempDir;
use tokio::sync::mpsc;

use hive::core::{Task, TaskResult};
use hive::git::GitOps;
use hive::orchestration::{
    AgentId, BidSource, Coordinator, CoordinatorContext, CoordinatorOptions, EventSink,
    ExecutionContext, MemoryAuditLog, RawBid, SwarmEvent, TaskExecutor,
};
use hive::{Error, Result};

/// A test repository with a temporary directory and an initial commit.
pub struct TestRepo {
    /// Keeps the directory alive for the test.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
    /// Separate directory for task worktrees.
    pub worktrees: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let worktrees = TempDir::new().expect("Failed to create worktree directory");
        let path = temp_dir.path().to_path_buf();

        let repo = Repository::init(&path).expect("Failed to init git");
        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");

        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test User", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();

        Self {
            temp_dir,
            path,
            worktrees,
        }
    }

    pub fn repo(&self) -> Repository {
        Repository::open(&self.path).unwrap()
    }

    /// Whether `file` exists in the tip commit of `branch`.
    pub fn branch_has_file(&self, branch: &str, file: &str) -> bool {
        let repo = self.repo();
        let Ok(reference) = repo.find_branch(branch, git2::BranchType::Local) else {
            return false;
        };
        let tree = reference.get().peel_to_tree().unwrap();
        tree.get_path(Path::new(file)).is_ok()
    }
}

/// How a scripted task behaves.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Attempts that fail before one succeeds. `u32::MAX` never succeeds.
    pub failures: u32,
    pub delay: Duration,
    /// Report failure through `TaskResult` instead of an `Err`.
    pub soft_failure: bool,
}

/// Executor driven by per-task scripts.
///
/// Records start order, per-task attempt counts, the worker each attempt ran
/// on, and the highest number of attempts running at once. When the attempt
/// has a worktree it writes `<task-id>.txt` there and commits it.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    attempts: Mutex<HashMap<String, u32>>,
    order: Mutex<Vec<String>>,
    workers: Mutex<Vec<(String, AgentId)>>,
    workdirs: Mutex<Vec<PathBuf>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, task_id: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(task_id.to_string(), script);
    }

    pub fn fail_times(&self, task_id: &str, failures: u32) {
        self.script(
            task_id,
            Script {
                failures,
                ..Default::default()
            },
        );
    }

    pub fn always_fail(&self, task_id: &str) {
        self.fail_times(task_id, u32::MAX);
    }

    pub fn delay(&self, task_id: &str, delay: Duration) {
        self.script(
            task_id,
            Script {
                delay,
                ..Default::default()
            },
        );
    }

    pub fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    pub fn attempts(&self, task_id: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn workers(&self) -> Vec<(String, AgentId)> {
        self.workers.lock().unwrap().clone()
    }

    pub fn workdirs(&self) -> Vec<PathBuf> {
        self.workdirs.lock().unwrap().clone()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<TaskResult> {
        let id = task.id.to_string();
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.order.lock().unwrap().push(id.clone());
        self.workers
            .lock()
            .unwrap()
            .push((id.clone(), ctx.worker_id.clone()));

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        if !script.delay.is_zero() {
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(script.delay) => false,
                _ = ctx.cancel.cancelled() => true,
            };
            if interrupted {
                self.running.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Execution(format!("{} was cancelled", id)));
            }
        }

        let outcome = if attempt <= script.failures {
            if script.soft_failure {
                Ok(TaskResult::failed(1, format!("{} attempt {} failed", id, attempt)))
            } else {
                Err(Error::Execution(format!("{} attempt {} failed", id, attempt)))
            }
        } else {
            match &ctx.workdir {
                Some(workdir) => {
                    self.workdirs.lock().unwrap().push(workdir.clone());
                    commit_task_file(task, workdir)
                }
                None => Ok(TaskResult::succeeded(1, vec![format!("{}.txt", id)])),
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

fn commit_task_file(task: &Task, workdir: &Path) -> Result<TaskResult> {
    std::fs::write(
        workdir.join(format!("{}.txt", task.id)),
        format!("{}\n", task.description),
    )?;
    let git = GitOps::new(workdir)?;
    let files = git.changed_files(workdir)?;
    git.commit_all(workdir, &format!("{}: {}", task.id, task.description))?;
    Ok(TaskResult::succeeded(1, files))
}

/// Bid source answering from a fixed table.
#[derive(Default)]
pub struct ScriptedBidSource {
    bids: HashMap<String, RawBid>,
    errors: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    pub requests: AtomicUsize,
}

impl ScriptedBidSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bid(mut self, agent: &str, cost: f64, quality: f64) -> Self {
        self.bids
            .insert(agent.to_string(), RawBid::new(cost, quality, "scripted"));
        self
    }

    pub fn raw(mut self, agent: &str, bid: RawBid) -> Self {
        self.bids.insert(agent.to_string(), bid);
        self
    }

    pub fn error(mut self, agent: &str, message: &str) -> Self {
        self.errors.insert(agent.to_string(), message.to_string());
        self
    }

    pub fn slow(mut self, agent: &str, delay: Duration) -> Self {
        self.delays.insert(agent.to_string(), delay);
        self
    }
}

#[async_trait]
impl BidSource for ScriptedBidSource {
    async fn request_bid(&self, agent_id: &AgentId, _task_description: &str) -> Result<RawBid> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(agent_id.as_str()) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(message) = self.errors.get(agent_id.as_str()) {
            return Err(Error::Negotiation(message.clone()));
        }
        self.bids
            .get(agent_id.as_str())
            .cloned()
            .ok_or_else(|| Error::Negotiation(format!("{} has no bid", agent_id)))
    }
}

/// A coordinator over an in-memory audit log, with its event stream.
pub struct Harness {
    pub coordinator: Coordinator,
    pub ctx: CoordinatorContext,
    pub audit: Arc<MemoryAuditLog>,
    pub events: mpsc::UnboundedReceiver<SwarmEvent>,
}

impl Harness {
    pub fn new(executor: Arc<ScriptedExecutor>, options: CoordinatorOptions) -> Self {
        let (sink, events) = EventSink::channel();
        let (ctx, audit) = CoordinatorContext::in_memory(sink);
        let coordinator = Coordinator::new(ctx.clone(), executor, options);
        Self {
            coordinator,
            ctx,
            audit,
            events,
        }
    }

    /// Events emitted so far.
    pub fn drain(&mut self) -> Vec<SwarmEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Options with no retries and a short timeout, for fast failure tests.
pub fn quick_options(concurrency: usize) -> CoordinatorOptions {
    CoordinatorOptions::default()
        .with_concurrency(concurrency)
        .with_max_retries(0)
        .with_timeout(Duration::from_secs(5))
}

/// Position of the first event matching `pred`.
pub fn position<F>(events: &[SwarmEvent], pred: F) -> Option<usize>
where
    F: Fn(&SwarmEvent) -> bool,
{
    events.iter().position(pred)
}

pub fn started(events: &[SwarmEvent], task: &str) -> Option<usize> {
    position(events, |e| {
        matches!(e, SwarmEvent::TaskStarted { task_id, .. } if task_id.as_str() == task)
    })
}

pub fn completed(events: &[SwarmEvent], task: &str) -> Option<usize> {
    position(events, |e| {
        matches!(e, SwarmEvent::TaskCompleted { task_id, .. } if task_id.as_str() == task)
    })
}

pub fn failed(events: &[SwarmEvent], task: &str) -> Option<usize> {
    position(events, |e| {
        matches!(e, SwarmEvent::TaskFailed { task_id, .. } if task_id.as_str() == task)
    })
}
