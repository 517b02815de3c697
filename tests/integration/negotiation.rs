//! Bidding between candidate agents, standalone and inside a run.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hive::core::Task;
use hive::orchestration::{
    AgentId, AgentStatus, CoordinatorContext, EventSink, NegotiationEngine, RawBid, SwarmEvent,
};
use hive::Error;
use tokio_test::{assert_err, assert_ok};

use crate::fixtures::{quick_options, Harness, ScriptedBidSource, ScriptedExecutor};

fn ids(names: &[&str]) -> Vec<AgentId> {
    names.iter().map(|n| AgentId::from(*n)).collect()
}

#[tokio::test]
async fn test_higher_score_wins() {
    let (ctx, audit) = CoordinatorContext::in_memory(EventSink::disabled());
    let source = ScriptedBidSource::new()
        .bid("agent-a", 10.0, 55.0)
        .bid("agent-b", 80.0, 95.0);
    let engine = NegotiationEngine::new(ctx.clone(), Arc::new(source), Duration::from_secs(1));

    let outcome = engine
        .negotiate(&ids(&["agent-a", "agent-b"]), "refactor the parser")
        .await
        .unwrap();

    // a: 55 - 5 = 50, b: 95 - 40 = 55
    assert_eq!(outcome.winner_id.as_str(), "agent-b");
    assert_eq!(outcome.winning_bid.score(), 55.0);
    assert_eq!(outcome.all_bids.len(), 2);

    ctx.audit.flush().await;
    let records = audit.records_of_kind("negotiation");
    assert_eq!(records.len(), 1);
    assert!(records[0].has_tag("negotiation"));
    assert!(records[0].summary.contains("agent-b won"));
}

#[tokio::test]
async fn test_tie_goes_to_first_candidate() {
    let (ctx, _audit) = CoordinatorContext::in_memory(EventSink::disabled());
    let source = ScriptedBidSource::new()
        .bid("first", 20.0, 60.0)
        .bid("second", 20.0, 60.0);
    let engine = NegotiationEngine::new(ctx, Arc::new(source), Duration::from_secs(1));

    let outcome = assert_ok!(engine.negotiate(&ids(&["first", "second"]), "tie").await);
    assert_eq!(outcome.winner_id.as_str(), "first");
}

#[tokio::test]
async fn test_bad_and_slow_bids_are_disqualified() {
    let (ctx, _audit) = CoordinatorContext::in_memory(EventSink::disabled());
    let source = ScriptedBidSource::new()
        .raw(
            "greedy",
            RawBid {
                cost: Some(-1.0),
                quality: Some(100.0),
                rationale: None,
            },
        )
        .bid("sleepy", 0.0, 100.0)
        .slow("sleepy", Duration::from_secs(5))
        .error("broken", "crashed")
        .bid("steady", 30.0, 70.0);
    let engine = NegotiationEngine::new(ctx, Arc::new(source), Duration::from_millis(50));

    let outcome = engine
        .negotiate(&ids(&["greedy", "sleepy", "broken", "steady"]), "work")
        .await
        .unwrap();
    assert_eq!(outcome.winner_id.as_str(), "steady");
    let disqualified: Vec<&str> = outcome
        .all_bids
        .iter()
        .filter(|b| b.is_disqualified())
        .map(|b| b.agent_id.as_str())
        .collect();
    assert_eq!(disqualified, vec!["greedy", "sleepy", "broken"]);
}

#[tokio::test]
async fn test_all_disqualified_is_an_error() {
    let (ctx, audit) = CoordinatorContext::in_memory(EventSink::disabled());
    let source = ScriptedBidSource::new().error("a", "no").error("b", "no");
    let engine = NegotiationEngine::new(ctx.clone(), Arc::new(source), Duration::from_secs(1));

    let err = assert_err!(engine.negotiate(&ids(&["a", "b"]), "work").await);
    assert!(matches!(err, Error::Negotiation(_)));

    let err = assert_err!(engine.negotiate(&[], "work").await);
    assert!(matches!(err, Error::Negotiation(_)));

    ctx.audit.flush().await;
    assert!(audit.records_of_kind("negotiation").is_empty());
}

#[tokio::test]
async fn test_coordinator_runs_task_on_winner() {
    let executor = ScriptedExecutor::new();
    let mut h = Harness::new(executor.clone(), quick_options(2));
    let source = Arc::new(
        ScriptedBidSource::new()
            .bid("agent-a", 10.0, 55.0)
            .bid("agent-b", 80.0, 95.0),
    );
    let engine = NegotiationEngine::new(h.ctx.clone(), source.clone(), Duration::from_secs(1));
    h.coordinator = h.coordinator.with_negotiator(Arc::new(engine));
    h.coordinator
        .submit(vec![
            Task::new("bid", "contested").with_candidates(["agent-a", "agent-b"]),
            Task::new("plain", "no candidates"),
        ])
        .unwrap();

    let summary = h.coordinator.run().await.unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(source.requests.load(Ordering::SeqCst), 2);

    let workers = executor.workers();
    let bid_worker = workers.iter().find(|(t, _)| t == "bid").unwrap();
    assert_eq!(bid_worker.1.as_str(), "agent-b");

    let events = h.drain();
    let resolved = events
        .iter()
        .find_map(|e| match e {
            SwarmEvent::NegotiationResolved {
                task_id, winner_id, ..
            } => Some((task_id.clone(), winner_id.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(resolved.0.unwrap().as_str(), "bid");
    assert_eq!(resolved.1.as_str(), "agent-b");

    let pool = h.ctx.pool.read().await;
    let winner = pool.get(&AgentId::from("agent-b")).unwrap();
    assert_eq!(winner.status, AgentStatus::Idle);
}

#[tokio::test]
async fn test_coordinator_falls_back_when_negotiation_fails() {
    let executor = ScriptedExecutor::new();
    let mut h = Harness::new(executor.clone(), quick_options(1));
    let source = ScriptedBidSource::new().error("x", "down").error("y", "down");
    let engine = NegotiationEngine::new(h.ctx.clone(), Arc::new(source), Duration::from_secs(1));
    h.coordinator = h.coordinator.with_negotiator(Arc::new(engine));
    h.coordinator
        .submit(vec![Task::new("t", "work").with_candidates(["x", "y"])])
        .unwrap();

    let summary = h.coordinator.run().await.unwrap();
    assert_eq!(summary.completed, 1);
    let (_, worker) = &executor.workers()[0];
    assert_ne!(worker.as_str(), "x");
    assert_ne!(worker.as_str(), "y");
}
