//! Task executor and bid source backed by an agent CLI.
//!
//! The agent is run headless (`-p <prompt> --output-format json`) in the
//! task's worktree. Its JSON envelope says whether the run succeeded; the
//! changed files are read from git afterwards and committed to the task
//! branch.

use crate::agent::AgentCommand;
use crate::core::task::{Task, TaskResult};
use crate::error::{Error, Result};
use crate::git::GitOps;
use crate::orchestration::executor::{ExecutionContext, TaskExecutor};
use crate::orchestration::negotiation::{BidSource, RawBid};
use crate::orchestration::AgentId;
use crate::util::blocking;
use crate::{hlog_debug, hlog_trace};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Instant;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

static JSON_OBJECT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{[^{}]*\}").unwrap());

/// Parsed result envelope from a headless agent run.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub success: bool,
    /// Result text on success, error message otherwise.
    pub text: String,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawAgentResponse {
    subtype: Option<String>,
    result: Option<String>,
    #[serde(default)]
    is_error: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    duration_ms: Option<u64>,
}

impl AgentResponse {
    pub fn parse(json_str: &str) -> Result<Self> {
        let raw: RawAgentResponse = serde_json::from_str(json_str.trim())?;
        let failed = raw.is_error.unwrap_or(false)
            || matches!(raw.subtype.as_deref(), Some(s) if s.starts_with("error"))
            || (raw.error.is_some() && raw.result.is_none());
        let text = if failed {
            raw.error
                .or(raw.result)
                .unwrap_or_else(|| "agent reported an error".to_string())
        } else {
            raw.result.unwrap_or_default()
        };
        Ok(Self {
            success: !failed,
            text,
            duration_ms: raw.duration_ms,
        })
    }
}

/// Run the agent once and collect its response.
///
/// The child is killed if `cancel` fires first.
pub async fn run_headless(
    agent: &AgentCommand,
    prompt: &str,
    cwd: &Path,
    cancel: &CancellationToken,
) -> Result<AgentResponse> {
    hlog_debug!("run_headless binary={} cwd={}", agent.binary(), cwd.display());
    let mut command = Command::new(agent.binary());
    command
        .args(agent.headless_args(prompt))
        .current_dir(cwd)
        .kill_on_drop(true);
    let child = command.output();

    let output = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(Error::Execution("agent run cancelled".to_string()));
        }
        output = child => output?,
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    hlog_trace!("agent stdout: {}", stdout);

    if let Ok(response) = AgentResponse::parse(&stdout) {
        return Ok(response);
    }

    let success = output.status.success();
    let text = match (success, stderr.trim()) {
        (true, _) => stdout.trim().to_string(),
        (false, "") => format!("agent exited with code {}", output.status.code().unwrap_or(-1)),
        (false, err) => err.to_string(),
    };
    Ok(AgentResponse {
        success,
        text,
        duration_ms: None,
    })
}

/// Executes tasks by running the agent CLI in the task worktree.
pub struct CommandExecutor {
    agent: AgentCommand,
    /// Working directory when git isolation is off.
    default_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(agent: AgentCommand, default_dir: &Path) -> Self {
        Self {
            agent,
            default_dir: default_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<TaskResult> {
        let started = Instant::now();
        let cwd = ctx.workdir.clone().unwrap_or_else(|| self.default_dir.clone());
        let response = run_headless(&self.agent, &task.prompt(), &cwd, &ctx.cancel).await?;
        let elapsed = started.elapsed().as_millis() as u64;

        if !response.success {
            return Ok(TaskResult::failed(elapsed, response.text));
        }

        let files_changed = match ctx.workdir.clone() {
            Some(workdir) => {
                let message = format!("{}: {}", task.id, task.description);
                blocking(move || {
                    let git = GitOps::new(&workdir)?;
                    let files = git.changed_files(&workdir)?;
                    if !files.is_empty() {
                        git.commit_all(&workdir, &message)?;
                    }
                    Ok(files)
                })
                .await?
            }
            None => Vec::new(),
        };

        Ok(TaskResult::succeeded(
            response.duration_ms.unwrap_or(elapsed),
            files_changed,
        ))
    }
}

/// Pull a bid out of free-form agent text.
///
/// The first `{...}` object carrying both `cost` and `quality` wins.
pub fn extract_bid(text: &str) -> Option<RawBid> {
    if let Ok(bid) = serde_json::from_str::<RawBid>(text.trim()) {
        if bid.cost.is_some() && bid.quality.is_some() {
            return Some(bid);
        }
    }
    JSON_OBJECT_RE
        .find_iter(text)
        .filter_map(|m| serde_json::from_str::<RawBid>(m.as_str()).ok())
        .find(|bid| bid.cost.is_some() && bid.quality.is_some())
}

/// Asks each candidate, through the agent CLI, to price a task.
pub struct CommandBidSource {
    agent: AgentCommand,
    cwd: PathBuf,
}

impl CommandBidSource {
    pub fn new(agent: AgentCommand, cwd: &Path) -> Self {
        Self {
            agent,
            cwd: cwd.to_path_buf(),
        }
    }

    fn bid_prompt(agent_id: &AgentId, task_description: &str) -> String {
        format!(
            "You are agent '{}'. Estimate this task before doing any work.\n\n\
             Task: {}\n\n\
             Reply with only a JSON object: {{\"cost\": <number >= 0>, \
             \"quality\": <0-100>, \"rationale\": \"<one sentence>\"}}",
            agent_id, task_description
        )
    }
}

#[async_trait]
impl BidSource for CommandBidSource {
    async fn request_bid(&self, agent_id: &AgentId, task_description: &str) -> Result<RawBid> {
        let prompt = Self::bid_prompt(agent_id, task_description);
        let response =
            run_headless(&self.agent, &prompt, &self.cwd, &CancellationToken::new()).await?;
        if !response.success {
            return Err(Error::Negotiation(format!(
                "{} could not bid: {}",
                agent_id, response.text
            )));
        }
        extract_bid(&response.text)
            .ok_or_else(|| Error::Negotiation(format!("{} returned no bid", agent_id)))
    }
}
