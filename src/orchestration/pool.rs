//! Agent registry for the swarm.
//!
//! The `AgentPool` owns every live agent record, enforces the capacity limit,
//! and emits spawn/terminate events. Registration order is preserved so that
//! listings (and therefore scale-down selection) are deterministic.

use crate::error::{Error, Result};
use crate::orchestration::events::{EventSink, SwarmEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role given to agents the coordinator spawns for plain task execution.
pub const WORKER_ROLE: &str = "worker";

/// Unique identifier for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Generate a fresh id of the form `agent-1a2b3c4d`.
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("agent-{}", &uuid[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Agent lifecycle: `Idle <-> Busy`, then `Terminated` for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    /// Free-text specialization, also the swarm type for scaling.
    pub role: String,
    pub parent_id: Option<AgentId>,
    pub tenant: Option<String>,
    pub status: AgentStatus,
    /// Standing instruction the agent was spawned with.
    pub assignment: Option<String>,
    pub spawned_at: DateTime<Utc>,
}

impl Agent {
    pub fn is_active(&self) -> bool {
        self.status != AgentStatus::Terminated
    }
}

/// Parameters for spawning an agent.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub id: Option<AgentId>,
    pub role: String,
    pub parent_id: Option<AgentId>,
    pub tenant: Option<String>,
    pub assignment: Option<String>,
}

impl SpawnRequest {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<AgentId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_parent(mut self, parent: AgentId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn with_tenant(mut self, tenant: Option<String>) -> Self {
        self.tenant = tenant;
        self
    }

    pub fn with_assignment(mut self, assignment: impl Into<String>) -> Self {
        self.assignment = Some(assignment.into());
        self
    }
}

/// Registry of agents.
///
/// Terminated agents stay in the registry so their history can be inspected;
/// they do not count against capacity.
///
/// Capacity held back with [`reserve_workers`](Self::reserve_workers) can
/// only be taken by `WORKER_ROLE` agents, so scaled swarms never starve the
/// coordinator of execution slots.
pub struct AgentPool {
    agents: Vec<Agent>,
    max_agents: usize,
    worker_reserve: usize,
    events: EventSink,
}

impl AgentPool {
    pub fn new(max_agents: usize, events: EventSink) -> Self {
        Self {
            agents: Vec::new(),
            max_agents,
            worker_reserve: 0,
            events,
        }
    }

    /// Register a new idle agent.
    ///
    /// # Errors
    ///
    /// `AgentPoolFull` when the active count is at capacity, `Validation`
    /// when an explicit id is already live.
    pub fn spawn(&mut self, request: SpawnRequest) -> Result<AgentId> {
        if !self.has_capacity_for(&request.role) {
            return Err(Error::AgentPoolFull {
                max: self.max_agents,
            });
        }

        let id = request.id.unwrap_or_default();
        if self.get(&id).map(Agent::is_active).unwrap_or(false) {
            return Err(Error::Validation(format!("agent '{}' already exists", id)));
        }

        let agent = Agent {
            id: id.clone(),
            role: request.role,
            parent_id: request.parent_id,
            tenant: request.tenant,
            status: AgentStatus::Idle,
            assignment: request.assignment,
            spawned_at: Utc::now(),
        };
        crate::hlog_debug!("AgentPool::spawn id={} role={}", agent.id, agent.role);

        self.events.emit(SwarmEvent::AgentSpawned {
            agent_id: id.clone(),
            role: agent.role.clone(),
            parent_id: agent.parent_id.clone(),
        });
        // A re-used id replaces the terminated record in place.
        match self.agents.iter_mut().find(|a| a.id == id) {
            Some(slot) => *slot = agent,
            None => self.agents.push(agent),
        }
        Ok(id)
    }

    pub fn terminate(&mut self, id: &AgentId) -> Result<()> {
        let agent = self
            .agents
            .iter_mut()
            .find(|a| &a.id == id && a.is_active())
            .ok_or_else(|| Error::AgentNotFound { id: id.clone() })?;
        agent.status = AgentStatus::Terminated;
        crate::hlog_debug!("AgentPool::terminate id={}", id);

        self.events.emit(SwarmEvent::AgentTerminated {
            agent_id: id.clone(),
        });
        Ok(())
    }

    pub fn get(&self, id: &AgentId) -> Option<&Agent> {
        self.agents.iter().find(|a| &a.id == id)
    }

    /// Take an idle agent of `role` or spawn one under `parent`.
    pub fn acquire(
        &mut self,
        role: &str,
        parent: &AgentId,
        tenant: Option<String>,
    ) -> Result<AgentId> {
        let idle = self
            .agents
            .iter_mut()
            .find(|a| a.role == role && a.status == AgentStatus::Idle);
        let id = match idle {
            Some(agent) => agent.id.clone(),
            None => self.spawn(
                SpawnRequest::new(role)
                    .with_parent(parent.clone())
                    .with_tenant(tenant),
            )?,
        };
        self.mark_busy(&id)?;
        Ok(id)
    }

    /// Claim a specific agent, registering it first if it is unknown.
    ///
    /// Used for negotiated winners, which may run more than one task at once.
    pub fn claim(&mut self, id: &AgentId, role: &str, parent: &AgentId) -> Result<()> {
        if !self.get(id).map(Agent::is_active).unwrap_or(false) {
            self.spawn(
                SpawnRequest::new(role)
                    .with_id(id.clone())
                    .with_parent(parent.clone()),
            )?;
        }
        self.mark_busy(id)
    }

    fn mark_busy(&mut self, id: &AgentId) -> Result<()> {
        let agent = self
            .agents
            .iter_mut()
            .find(|a| &a.id == id && a.is_active())
            .ok_or_else(|| Error::AgentNotFound { id: id.clone() })?;
        agent.status = AgentStatus::Busy;
        Ok(())
    }

    /// Return a busy agent to idle. Terminated agents stay terminated.
    pub fn release(&mut self, id: &AgentId) {
        if let Some(agent) = self.agents.iter_mut().find(|a| &a.id == id) {
            if agent.status == AgentStatus::Busy {
                agent.status = AgentStatus::Idle;
            }
        }
    }

    /// Active agents of `role`, oldest first.
    pub fn active_by_role(&self, role: &str) -> Vec<&Agent> {
        self.agents
            .iter()
            .filter(|a| a.role == role && a.is_active())
            .collect()
    }

    /// All agents, including terminated ones, in spawn order.
    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn active_count(&self) -> usize {
        self.agents.iter().filter(|a| a.is_active()).count()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_agents
    }

    /// Hold `count` slots for coordinator workers.
    ///
    /// Workers below the reserve are admitted even when other swarms have
    /// already filled the pool.
    pub fn reserve_workers(&mut self, count: usize) {
        crate::hlog_debug!("AgentPool::reserve_workers count={}", count);
        self.worker_reserve = count;
    }

    fn has_capacity_for(&self, role: &str) -> bool {
        let workers = self.active_by_role(WORKER_ROLE).len();
        if role == WORKER_ROLE {
            return workers < self.worker_reserve || self.has_capacity();
        }
        let held = self.worker_reserve.saturating_sub(workers);
        self.active_count() + held < self.max_agents
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents
    }
}

impl std::fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPool")
            .field("agents", &self.agents.len())
            .field("active", &self.active_count())
            .field("max_agents", &self.max_agents)
            .finish()
    }
}
