//! Typed lifecycle events for a coordinator run.
//!
//! Events are delivered over an unbounded tokio channel so emitting never
//! blocks the scheduler. All task events are emitted from the coordinator's
//! single update path, which gives per-task causal order: `TaskStarted`
//! precedes the `TaskCompleted`, `TaskFailed` or `TaskRetry` of that attempt.

use crate::core::task::{TaskId, TaskResult};
use crate::orchestration::AgentId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Direction of a scaling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    ScaleUp,
    ScaleDown,
}

impl std::fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScaleDirection::ScaleUp => write!(f, "scale_up"),
            ScaleDirection::ScaleDown => write!(f, "scale_down"),
        }
    }
}

impl std::str::FromStr for ScaleDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scale_up" | "up" => Ok(ScaleDirection::ScaleUp),
            "scale_down" | "down" => Ok(ScaleDirection::ScaleDown),
            other => Err(format!("unknown scaling action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SwarmEvent {
    TaskStarted {
        task_id: TaskId,
        worker_id: AgentId,
        /// 1-based attempt number.
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: AgentId,
        result: TaskResult,
    },
    /// Terminal failure, after retries are exhausted or validation failed.
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskRetry {
        task_id: TaskId,
        /// Retry number, starting at 1 for the first retry.
        attempt: u32,
        error: String,
    },
    AgentSpawned {
        agent_id: AgentId,
        role: String,
        parent_id: Option<AgentId>,
    },
    AgentTerminated {
        agent_id: AgentId,
    },
    NegotiationResolved {
        task_id: Option<TaskId>,
        winner_id: AgentId,
        score: f64,
        candidates: Vec<AgentId>,
    },
    ScalingActionTaken {
        swarm_type: String,
        direction: ScaleDirection,
        requested: usize,
        applied: usize,
        manual: bool,
    },
}

impl SwarmEvent {
    /// Task this event concerns, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            SwarmEvent::TaskStarted { task_id, .. }
            | SwarmEvent::TaskCompleted { task_id, .. }
            | SwarmEvent::TaskFailed { task_id, .. }
            | SwarmEvent::TaskRetry { task_id, .. } => Some(task_id),
            SwarmEvent::NegotiationResolved { task_id, .. } => task_id.as_ref(),
            _ => None,
        }
    }

    /// Short `component:action` name, as used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            SwarmEvent::TaskStarted { .. } => "task:start",
            SwarmEvent::TaskCompleted { .. } => "task:complete",
            SwarmEvent::TaskFailed { .. } => "task:fail",
            SwarmEvent::TaskRetry { .. } => "task:retry",
            SwarmEvent::AgentSpawned { .. } => "agent:spawn",
            SwarmEvent::AgentTerminated { .. } => "agent:terminate",
            SwarmEvent::NegotiationResolved { .. } => "negotiation:resolved",
            SwarmEvent::ScalingActionTaken { .. } => "scaling:action",
        }
    }
}

impl std::fmt::Display for SwarmEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwarmEvent::TaskStarted {
                task_id,
                worker_id,
                attempt,
            } => write!(f, "{} {} on {} (attempt {})", self.name(), task_id, worker_id, attempt),
            SwarmEvent::TaskCompleted {
                task_id, result, ..
            } => write!(
                f,
                "{} {} in {}ms, {} file(s) changed",
                self.name(),
                task_id,
                result.duration_ms,
                result.files_changed.len()
            ),
            SwarmEvent::TaskFailed { task_id, error } => {
                write!(f, "{} {}: {}", self.name(), task_id, error)
            }
            SwarmEvent::TaskRetry {
                task_id,
                attempt,
                error,
            } => write!(f, "{} {} retry {} after: {}", self.name(), task_id, attempt, error),
            SwarmEvent::AgentSpawned { agent_id, role, .. } => {
                write!(f, "{} {} ({})", self.name(), agent_id, role)
            }
            SwarmEvent::AgentTerminated { agent_id } => write!(f, "{} {}", self.name(), agent_id),
            SwarmEvent::NegotiationResolved {
                winner_id, score, ..
            } => write!(f, "{} winner {} score {}", self.name(), winner_id, score),
            SwarmEvent::ScalingActionTaken {
                swarm_type,
                direction,
                requested,
                applied,
                ..
            } => write!(
                f,
                "{} {} {} {}/{}",
                self.name(),
                direction,
                swarm_type,
                applied,
                requested
            ),
        }
    }
}

/// Cloneable, non-blocking event emitter.
///
/// A sink without a receiver drops events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SwarmEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SwarmEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SwarmEvent) {
        crate::hlog_debug!("event {}", event);
        if let Some(tx) = &self.tx {
            // A dropped receiver just means nobody is listening.
            let _ = tx.send(event);
        }
    }
}
