//! Orchestration layer for the hive swarm.
//!
//! The coordinator run loop, the agent registry it draws workers from,
//! negotiation between candidate agents, rule-driven scaling, and the event
//! and audit plumbing they all report through.

pub mod audit;
pub mod command;
pub mod context;
pub mod events;
pub mod executor;
pub mod negotiation;
pub mod pool;
pub mod scaling;
pub mod scheduler;
pub mod workspace;

pub use audit::{AuditLog, AuditRecord, AuditSink, JsonlAuditLog, MemoryAuditLog};
pub use command::{CommandBidSource, CommandExecutor};
pub use context::CoordinatorContext;
pub use events::{EventSink, ScaleDirection, SwarmEvent};
pub use executor::{ExecutionContext, TaskExecutor};
pub use negotiation::{Bid, BidSource, NegotiationEngine, NegotiationOutcome, RawBid};
pub use pool::{Agent, AgentId, AgentPool, AgentStatus, SpawnRequest, WORKER_ROLE};
pub use scaling::{
    EnvMetrics, MetricProvider, MetricRegistry, Operator, RuleFile, RuleSource, ScalingAction,
    ScalingEngine, ScalingReport, ScalingRule, StaticMetrics, StaticRules, Trigger,
};
pub use scheduler::{Coordinator, CoordinatorOptions};
pub use workspace::Workspace;
