//! Rule-driven elastic scaling of the agent population.
//!
//! A rule pairs a metric trigger (`source.metric >= 15`) with an action
//! (`scale_up support 2`). `evaluate_rules` checks every rule once and applies
//! the actions whose trigger holds. Manual `scale_swarm` calls go through the
//! same execution and audit path, tagged `manual` instead of `rule`.

use crate::error::{Error, Result};
use crate::orchestration::audit::AuditRecord;
use crate::orchestration::context::CoordinatorContext;
use crate::orchestration::events::{ScaleDirection, SwarmEvent};
use crate::orchestration::pool::SpawnRequest;
use crate::orchestration::AgentId;
use crate::{hlog, hlog_debug, hlog_warn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Assignment given to scaled-up agents when the rule names none.
pub const DEFAULT_SCALE_TASK: &str = "Stand by for incoming work";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
}

impl Operator {
    pub fn evaluate(self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Gte => value >= threshold,
            Operator::Lte => value <= threshold,
            Operator::Gt => value > threshold,
            Operator::Lt => value < threshold,
            Operator::Eq => value == threshold,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Gte => ">=",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Eq => "==",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub source: String,
    pub metric: String,
    pub operator: Operator,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingAction {
    pub swarm_type: String,
    #[serde(rename = "type")]
    pub direction: ScaleDirection,
    pub count: usize,
    #[serde(default)]
    pub task: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingRule {
    #[serde(default)]
    pub name: Option<String>,
    pub trigger: Trigger,
    pub action: ScalingAction,
}

impl ScalingRule {
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            format!(
                "{}.{} {} {}",
                self.trigger.source,
                self.trigger.metric,
                self.trigger.operator.as_str(),
                self.trigger.threshold
            )
        })
    }
}

// ========== Metric providers ==========

/// Reads one numeric signal from an external system.
#[async_trait]
pub trait MetricProvider: Send + Sync {
    async fn get_metric(&self, source: &str, metric: &str) -> Result<f64>;
}

fn provider_error(source: &str, metric: &str, reason: impl Into<String>) -> Error {
    Error::ScalingProvider {
        source_name: source.to_string(),
        metric: metric.to_string(),
        reason: reason.into(),
    }
}

/// Fixed values, keyed by `(source, metric)`.
#[derive(Debug, Clone, Default)]
pub struct StaticMetrics {
    values: HashMap<(String, String), f64>,
}

impl StaticMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: &str, metric: &str, value: f64) -> Self {
        self.values
            .insert((source.to_string(), metric.to_string()), value);
        self
    }
}

#[async_trait]
impl MetricProvider for StaticMetrics {
    async fn get_metric(&self, source: &str, metric: &str) -> Result<f64> {
        self.values
            .get(&(source.to_string(), metric.to_string()))
            .copied()
            .ok_or_else(|| provider_error(source, metric, "no value configured"))
    }
}

/// Reads `HIVE_METRIC_<SOURCE>_<METRIC>` from the environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvMetrics;

impl EnvMetrics {
    pub fn var_name(source: &str, metric: &str) -> String {
        let upper = |s: &str| -> String {
            s.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect()
        };
        format!("HIVE_METRIC_{}_{}", upper(source), upper(metric))
    }
}

#[async_trait]
impl MetricProvider for EnvMetrics {
    async fn get_metric(&self, source: &str, metric: &str) -> Result<f64> {
        let name = Self::var_name(source, metric);
        let raw = std::env::var(&name)
            .map_err(|_| provider_error(source, metric, format!("{} is not set", name)))?;
        raw.trim()
            .parse::<f64>()
            .map_err(|e| provider_error(source, metric, format!("{}={:?}: {}", name, raw, e)))
    }
}

/// Routes each source name to its provider, resolved once at construction.
#[derive(Default, Clone)]
pub struct MetricRegistry {
    providers: HashMap<String, Arc<dyn MetricProvider>>,
    fallback: Option<Arc<dyn MetricProvider>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, source: &str, provider: Arc<dyn MetricProvider>) -> Self {
        self.providers.insert(source.to_string(), provider);
        self
    }

    /// Provider for sources with no registration.
    pub fn with_default(mut self, provider: Arc<dyn MetricProvider>) -> Self {
        self.fallback = Some(provider);
        self
    }
}

#[async_trait]
impl MetricProvider for MetricRegistry {
    async fn get_metric(&self, source: &str, metric: &str) -> Result<f64> {
        let provider = self
            .providers
            .get(source)
            .or(self.fallback.as_ref())
            .ok_or_else(|| provider_error(source, metric, "no provider registered"))?;
        provider.get_metric(source, metric).await
    }
}

// ========== Rule sources ==========

#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn load_rules(&self) -> Result<Vec<ScalingRule>>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticRules(pub Vec<ScalingRule>);

#[async_trait]
impl RuleSource for StaticRules {
    async fn load_rules(&self) -> Result<Vec<ScalingRule>> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuleFileContent {
    Table {
        #[serde(default)]
        rules: Vec<ScalingRule>,
    },
    List(Vec<ScalingRule>),
}

/// Rules read from disk on every evaluation, so edits apply on the next cycle.
///
/// `.json` files are parsed as JSON, anything else as TOML.
#[derive(Debug, Clone)]
pub struct RuleFile {
    path: PathBuf,
}

impl RuleFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parse(path: &Path, content: &str) -> Result<Vec<ScalingRule>> {
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let parsed: RuleFileContent = if is_json {
            serde_json::from_str(content)?
        } else {
            toml::from_str(content)?
        };
        Ok(match parsed {
            RuleFileContent::Table { rules } => rules,
            RuleFileContent::List(rules) => rules,
        })
    }
}

#[async_trait]
impl RuleSource for RuleFile {
    async fn load_rules(&self) -> Result<Vec<ScalingRule>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Self::parse(&self.path, &content)
    }
}

// ========== Engine ==========

/// What triggered a scaling action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum ScalingOrigin {
    Rule { rule: ScalingRule, value: f64 },
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub swarm_type: String,
    pub direction: ScaleDirection,
    pub requested: usize,
    /// Agents actually spawned or terminated.
    pub applied: usize,
    pub agent_ids: Vec<AgentId>,
    /// One line per spawn or termination attempt.
    pub results: Vec<String>,
    pub origin: ScalingOrigin,
}

impl ActionSummary {
    pub fn is_manual(&self) -> bool {
        self.origin == ScalingOrigin::Manual
    }

    pub fn describe(&self) -> String {
        let verb = match self.direction {
            ScaleDirection::ScaleUp => "spawned",
            ScaleDirection::ScaleDown => "terminated",
        };
        let why = match &self.origin {
            ScalingOrigin::Rule { rule, value } => {
                format!("rule '{}' (value {})", rule.label(), value)
            }
            ScalingOrigin::Manual => "manual request".to_string(),
        };
        format!(
            "{} {} of {} requested '{}' agent(s) via {}",
            verb, self.applied, self.requested, self.swarm_type, why
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRule {
    pub rule: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingReport {
    pub evaluated: usize,
    pub actions: Vec<ActionSummary>,
    pub skipped: Vec<SkippedRule>,
}

impl ScalingReport {
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} rule(s) evaluated, {} action(s) taken, {} skipped",
            self.evaluated,
            self.actions.len(),
            self.skipped.len()
        );
        for action in &self.actions {
            out.push_str("\n  ");
            out.push_str(&action.describe());
        }
        for skipped in &self.skipped {
            out.push_str(&format!("\n  skipped '{}': {}", skipped.rule, skipped.reason));
        }
        out
    }
}

pub struct ScalingEngine {
    ctx: CoordinatorContext,
    rules: Arc<dyn RuleSource>,
    metrics: Arc<dyn MetricProvider>,
    /// Used when a provider fails; `None` skips the rule instead.
    metric_fallback: Option<f64>,
}

impl ScalingEngine {
    pub fn new(
        ctx: CoordinatorContext,
        rules: Arc<dyn RuleSource>,
        metrics: Arc<dyn MetricProvider>,
    ) -> Self {
        Self {
            ctx,
            rules,
            metrics,
            metric_fallback: None,
        }
    }

    pub fn with_metric_fallback(mut self, fallback: Option<f64>) -> Self {
        self.metric_fallback = fallback;
        self
    }

    /// Evaluate every rule once.
    ///
    /// A failing metric provider affects only its own rule. Loading the rule
    /// set is the only failure that aborts the cycle.
    pub async fn evaluate_rules(&self) -> Result<ScalingReport> {
        let rules = self.rules.load_rules().await?;
        hlog_debug!("ScalingEngine::evaluate_rules rules={}", rules.len());

        let mut report = ScalingReport {
            evaluated: rules.len(),
            ..Default::default()
        };

        for rule in rules {
            let trigger = &rule.trigger;
            let value = match self.metrics.get_metric(&trigger.source, &trigger.metric).await {
                Ok(value) => value,
                Err(e) => match self.metric_fallback {
                    Some(fallback) => {
                        hlog_warn!(
                            "Metric lookup failed for rule '{}', using fallback {}: {}",
                            rule.label(),
                            fallback,
                            e
                        );
                        fallback
                    }
                    None => {
                        hlog_warn!("Skipping rule '{}': {}", rule.label(), e);
                        report.skipped.push(SkippedRule {
                            rule: rule.label(),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                },
            };

            if !trigger.operator.evaluate(value, trigger.threshold) {
                hlog_debug!(
                    "Rule '{}' not triggered: {} {} {} is false",
                    rule.label(),
                    value,
                    trigger.operator.as_str(),
                    trigger.threshold
                );
                continue;
            }

            let action = rule.action.clone();
            let summary = self
                .execute(&action, ScalingOrigin::Rule { rule, value })
                .await;
            report.actions.push(summary);
        }

        Ok(report)
    }

    /// Scale a swarm on demand.
    pub async fn scale_swarm(
        &self,
        swarm_type: &str,
        direction: ScaleDirection,
        count: usize,
        task: Option<String>,
    ) -> ActionSummary {
        let action = ScalingAction {
            swarm_type: swarm_type.to_string(),
            direction,
            count,
            task,
        };
        self.execute(&action, ScalingOrigin::Manual).await
    }

    async fn execute(&self, action: &ScalingAction, origin: ScalingOrigin) -> ActionSummary {
        let mut agent_ids = Vec::new();
        let mut results = Vec::new();

        {
            let mut pool = self.ctx.pool.write().await;
            match action.direction {
                ScaleDirection::ScaleUp => {
                    let task = action.task.as_deref().unwrap_or(DEFAULT_SCALE_TASK);
                    for _ in 0..action.count {
                        let request = SpawnRequest::new(action.swarm_type.clone())
                            .with_parent(self.ctx.coordinator_id.clone())
                            .with_tenant(self.ctx.tenant.clone())
                            .with_assignment(task);
                        match pool.spawn(request) {
                            Ok(id) => {
                                results.push(format!("spawned {} ({}): {}", id, action.swarm_type, task));
                                agent_ids.push(id);
                            }
                            Err(e) => {
                                hlog_warn!("Scale-up of '{}' stopped: {}", action.swarm_type, e);
                                results.push(format!("spawn failed: {}", e));
                            }
                        }
                    }
                }
                ScaleDirection::ScaleDown => {
                    let victims: Vec<AgentId> = pool
                        .active_by_role(&action.swarm_type)
                        .into_iter()
                        .take(action.count)
                        .map(|a| a.id.clone())
                        .collect();
                    for id in victims {
                        match pool.terminate(&id) {
                            Ok(()) => {
                                results.push(format!("terminated {}", id));
                                agent_ids.push(id);
                            }
                            Err(e) => results.push(format!("terminate {} failed: {}", id, e)),
                        }
                    }
                }
            }
        }

        let summary = ActionSummary {
            swarm_type: action.swarm_type.clone(),
            direction: action.direction,
            requested: action.count,
            applied: agent_ids.len(),
            agent_ids,
            results,
            origin,
        };
        self.persist(&summary);
        summary
    }

    fn persist(&self, summary: &ActionSummary) {
        let description = summary.describe();
        hlog!("Scaling: {}", description);

        let trigger_tag = if summary.is_manual() { "manual" } else { "rule" };
        self.ctx.audit.record(
            AuditRecord::new("scaling_action", description, json!(summary))
                .with_tags(["scaling", trigger_tag])
                .with_tenant(self.ctx.tenant.clone()),
        );

        self.ctx.events.emit(SwarmEvent::ScalingActionTaken {
            swarm_type: summary.swarm_type.clone(),
            direction: summary.direction,
            requested: summary.requested,
            applied: summary.applied,
            manual: summary.is_manual(),
        });
    }

    /// Evaluate rules every `interval` until `cancel` fires.
    ///
    /// Returns the number of completed cycles. A cycle that fails to load its
    /// rules is logged and does not stop the loop.
    pub async fn run_every(&self, interval: Duration, cancel: CancellationToken) -> usize {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut cycles = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.evaluate_rules().await {
                        Ok(report) => hlog_debug!("Scaling cycle {}: {}", cycles + 1, report.summary()),
                        Err(e) => hlog_warn!("Scaling cycle {} failed: {}", cycles + 1, e),
                    }
                    cycles += 1;
                }
            }
        }
        cycles
    }
}
