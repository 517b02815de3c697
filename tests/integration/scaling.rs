//! Rule-driven and manual scaling against the shared agent registry.

use std::sync::Arc;
use std::time::Duration;

use hive::orchestration::{
    AuditLog, CoordinatorContext, EventSink, JsonlAuditLog, MemoryAuditLog, MetricRegistry,
    RuleFile, ScaleDirection, ScalingEngine, StaticMetrics, SwarmEvent,
};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

const SUPPORT_RULE: &str = r#"
[[rules]]
name = "support backlog"

[rules.trigger]
source = "linear"
metric = "open_issues"
operator = ">="
threshold = 15

[rules.action]
swarm_type = "support"
type = "scale_up"
count = 2
task = "triage new issues"
"#;

fn write_rules(dir: &TempDir, content: &str) -> RuleFile {
    let path = dir.path().join("rules.toml");
    std::fs::write(&path, content).unwrap();
    RuleFile::new(path)
}

fn engine(ctx: &CoordinatorContext, rules: RuleFile, open_issues: f64) -> ScalingEngine {
    let metrics = StaticMetrics::new().with("linear", "open_issues", open_issues);
    ScalingEngine::new(ctx.clone(), Arc::new(rules), Arc::new(metrics))
}

#[tokio::test]
async fn test_threshold_met_scales_up_once() {
    let dir = TempDir::new().unwrap();
    let (events, mut rx) = EventSink::channel();
    let (ctx, audit) = CoordinatorContext::in_memory(events);

    let report = engine(&ctx, write_rules(&dir, SUPPORT_RULE), 20.0)
        .evaluate_rules()
        .await
        .unwrap();

    assert_eq!(report.evaluated, 1);
    assert_eq!(report.actions.len(), 1);
    assert_eq!(report.actions[0].applied, 2);
    assert!(report.skipped.is_empty());

    let pool = ctx.pool.read().await;
    let support = pool.active_by_role("support");
    assert_eq!(support.len(), 2);
    assert!(support
        .iter()
        .all(|a| a.assignment.as_deref() == Some("triage new issues")));
    assert!(support
        .iter()
        .all(|a| a.parent_id.as_ref() == Some(&ctx.coordinator_id)));
    drop(pool);

    ctx.audit.flush().await;
    let records = audit.records_of_kind("scaling_action");
    assert_eq!(records.len(), 1);
    assert!(records[0].has_tag("scaling"));
    assert!(records[0].has_tag("rule"));

    let mut scaling_events = 0;
    while let Ok(event) = rx.try_recv() {
        if let SwarmEvent::ScalingActionTaken {
            manual, applied, ..
        } = event
        {
            assert!(!manual);
            assert_eq!(applied, 2);
            scaling_events += 1;
        }
    }
    assert_eq!(scaling_events, 1);
}

#[tokio::test]
async fn test_threshold_not_met_does_nothing() {
    let dir = TempDir::new().unwrap();
    let (ctx, audit) = CoordinatorContext::in_memory(EventSink::disabled());

    let report = assert_ok!(
        engine(&ctx, write_rules(&dir, SUPPORT_RULE), 10.0)
            .evaluate_rules()
            .await
    );

    assert_eq!(report.evaluated, 1);
    assert!(report.actions.is_empty());
    assert_eq!(ctx.pool.read().await.active_count(), 0);
    ctx.audit.flush().await;
    assert!(audit.records().is_empty());
}

#[tokio::test]
async fn test_rule_file_changes_apply_next_cycle() {
    let dir = TempDir::new().unwrap();
    let (ctx, _audit) = CoordinatorContext::in_memory(EventSink::disabled());
    let engine = engine(&ctx, write_rules(&dir, SUPPORT_RULE), 20.0);

    engine.evaluate_rules().await.unwrap();
    assert_eq!(ctx.pool.read().await.active_by_role("support").len(), 2);

    write_rules(&dir, &SUPPORT_RULE.replace("scale_up", "scale_down"));
    let report = engine.evaluate_rules().await.unwrap();
    assert_eq!(report.actions[0].direction, ScaleDirection::ScaleDown);
    assert_eq!(ctx.pool.read().await.active_by_role("support").len(), 0);
}

#[tokio::test]
async fn test_broken_rule_file_fails_the_cycle() {
    let dir = TempDir::new().unwrap();
    let (ctx, _audit) = CoordinatorContext::in_memory(EventSink::disabled());
    let engine = engine(&ctx, write_rules(&dir, "[[rules]]\nname = 3"), 20.0);
    assert_err!(engine.evaluate_rules().await);
}

#[tokio::test]
async fn test_missing_metric_skips_rule_without_fallback() {
    let dir = TempDir::new().unwrap();
    let (ctx, _audit) = CoordinatorContext::in_memory(EventSink::disabled());
    let rules = write_rules(&dir, SUPPORT_RULE);

    let engine = ScalingEngine::new(
        ctx.clone(),
        Arc::new(rules.clone()),
        Arc::new(MetricRegistry::new()),
    );
    let report = engine.evaluate_rules().await.unwrap();
    assert!(report.actions.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].rule, "support backlog");

    let engine = ScalingEngine::new(ctx.clone(), Arc::new(rules), Arc::new(MetricRegistry::new()))
        .with_metric_fallback(Some(100.0));
    let report = engine.evaluate_rules().await.unwrap();
    assert_eq!(report.actions.len(), 1);
    assert!(report.skipped.is_empty());
}

#[tokio::test]
async fn test_manual_scaling_clamps_and_tags() {
    let dir = TempDir::new().unwrap();
    let (ctx, audit) = CoordinatorContext::in_memory(EventSink::disabled());
    let engine = engine(&ctx, write_rules(&dir, ""), 0.0);

    let up = engine
        .scale_swarm("review", ScaleDirection::ScaleUp, 3, None)
        .await;
    assert_eq!(up.applied, 3);
    assert!(up.is_manual());

    let down = engine
        .scale_swarm("review", ScaleDirection::ScaleDown, 10, None)
        .await;
    assert_eq!(down.requested, 10);
    assert_eq!(down.applied, 3);
    assert_eq!(down.agent_ids, up.agent_ids);

    let none_left = engine
        .scale_swarm("review", ScaleDirection::ScaleDown, 1, None)
        .await;
    assert_eq!(none_left.applied, 0);

    ctx.audit.flush().await;
    let records = audit.records_of_kind("scaling_action");
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.has_tag("manual")));
}

#[tokio::test]
async fn test_scale_up_stops_at_capacity() {
    let dir = TempDir::new().unwrap();
    let (events, _rx) = EventSink::channel();
    let audit = Arc::new(MemoryAuditLog::new());
    let ctx = CoordinatorContext::new(2, audit, events);
    let engine = engine(&ctx, write_rules(&dir, ""), 0.0);

    let summary = engine
        .scale_swarm("support", ScaleDirection::ScaleUp, 5, Some("triage".into()))
        .await;
    assert_eq!(summary.requested, 5);
    assert_eq!(summary.applied, 2);
    assert_eq!(summary.results.len(), 5);
}

#[tokio::test]
async fn test_periodic_evaluation_until_cancelled() {
    let dir = TempDir::new().unwrap();
    let (ctx, _audit) = CoordinatorContext::in_memory(EventSink::disabled());
    let engine = engine(&ctx, write_rules(&dir, SUPPORT_RULE), 20.0);

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        stop.cancel();
    });

    let cycles = engine.run_every(Duration::from_millis(20), cancel).await;
    assert!(cycles >= 2);
    assert_eq!(
        ctx.pool.read().await.active_by_role("support").len(),
        2 * cycles
    );
}

#[tokio::test]
async fn test_actions_land_in_jsonl_log() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(JsonlAuditLog::new(dir.path().join("audit/audit.jsonl")));
    let ctx = CoordinatorContext::new(8, log.clone(), EventSink::disabled())
        .with_tenant(Some("acme".into()));
    let engine = engine(&ctx, write_rules(&dir, SUPPORT_RULE), 15.0);

    engine.evaluate_rules().await.unwrap();
    ctx.audit.flush().await;
    engine
        .scale_swarm("support", ScaleDirection::ScaleDown, 1, None)
        .await;
    ctx.audit.flush().await;

    let records = log.read_all().await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records[0].has_tag("rule"));
    assert!(records[1].has_tag("manual"));
    assert!(records.iter().all(|r| r.tenant.as_deref() == Some("acme")));
    assert!(ctx.audit.diagnostics().try_recv().is_err());

    // Writes through the trait object as well.
    let dyn_log: Arc<dyn AuditLog> = log.clone();
    dyn_log.log_event(&records[0]).await.unwrap();
    assert_eq!(log.read_all().await.unwrap().len(), 3);
}
