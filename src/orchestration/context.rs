//! Per-run shared state handed to every component.

use crate::config::{Config, DEFAULT_MAX_AGENTS};
use crate::orchestration::audit::{AuditLog, AuditSink, MemoryAuditLog};
use crate::orchestration::events::EventSink;
use crate::orchestration::pool::AgentPool;
use crate::orchestration::AgentId;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared handles for one coordinator (or one tenant).
///
/// Cloning is cheap and every clone sees the same agent registry, audit sink
/// and event channel. Nothing is stored in process-wide statics, so several
/// contexts can coexist in one process.
#[derive(Clone, Debug)]
pub struct CoordinatorContext {
    pub pool: Arc<RwLock<AgentPool>>,
    pub audit: AuditSink,
    pub events: EventSink,
    /// Parent id recorded on every agent this coordinator spawns.
    pub coordinator_id: AgentId,
    pub tenant: Option<String>,
}

impl CoordinatorContext {
    pub fn new(max_agents: usize, audit: Arc<dyn AuditLog>, events: EventSink) -> Self {
        Self {
            pool: Arc::new(RwLock::new(AgentPool::new(max_agents, events.clone()))),
            audit: AuditSink::new(audit),
            events,
            coordinator_id: AgentId::from("coordinator"),
            tenant: None,
        }
    }

    pub fn from_config(config: &Config, audit: Arc<dyn AuditLog>, events: EventSink) -> Self {
        Self::new(config.effective_max_agents(), audit, events).with_tenant(config.tenant.clone())
    }

    /// Context backed by an in-memory audit log, returned alongside it.
    pub fn in_memory(events: EventSink) -> (Self, Arc<MemoryAuditLog>) {
        let store = Arc::new(MemoryAuditLog::new());
        (Self::new(DEFAULT_MAX_AGENTS, store.clone(), events), store)
    }

    pub fn with_tenant(mut self, tenant: Option<String>) -> Self {
        self.tenant = tenant;
        self
    }
}
