//! Competitive bidding between candidate agents.
//!
//! Each candidate is asked for a `{cost, quality, rationale}` bid. Bids are
//! gathered concurrently and scored as `quality - cost / 2`; the strictly
//! highest score wins and ties go to the earliest candidate in the list.
//! A bid that errors, times out or is out of range is replaced by
//! `{cost: inf, quality: 0}` and cannot win.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::orchestration::audit::AuditRecord;
use crate::orchestration::context::CoordinatorContext;
use crate::orchestration::events::SwarmEvent;
use crate::orchestration::AgentId;
use crate::{hlog, hlog_debug, hlog_warn};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Bid as reported by an agent, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBid {
    pub cost: Option<f64>,
    pub quality: Option<f64>,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl RawBid {
    pub fn new(cost: f64, quality: f64, rationale: &str) -> Self {
        Self {
            cost: Some(cost),
            quality: Some(quality),
            rationale: Some(rationale.to_string()),
        }
    }
}

/// Asks one agent what it would charge for a task.
#[async_trait]
pub trait BidSource: Send + Sync {
    async fn request_bid(&self, agent_id: &AgentId, task_description: &str) -> Result<RawBid>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub agent_id: AgentId,
    pub cost: f64,
    pub quality: f64,
    pub rationale: String,
    /// Why the bid was replaced with the disqualifying default, if it was.
    pub disqualified: Option<String>,
}

impl Bid {
    fn validated(agent_id: AgentId, raw: RawBid) -> Self {
        let rationale = raw.rationale.unwrap_or_default();
        match (raw.cost, raw.quality) {
            (Some(cost), Some(quality))
                if cost.is_finite()
                    && cost >= 0.0
                    && quality.is_finite()
                    && (0.0..=100.0).contains(&quality) =>
            {
                Self {
                    agent_id,
                    cost,
                    quality,
                    rationale,
                    disqualified: None,
                }
            }
            (cost, quality) => Self::disqualified(
                agent_id,
                format!("malformed bid: cost={:?} quality={:?}", cost, quality),
            ),
        }
    }

    fn disqualified(agent_id: AgentId, reason: String) -> Self {
        Self {
            agent_id,
            cost: f64::INFINITY,
            quality: 0.0,
            rationale: String::new(),
            disqualified: Some(reason),
        }
    }

    /// `quality - cost / 2`, unrounded.
    pub fn score(&self) -> f64 {
        self.quality - self.cost / 2.0
    }

    pub fn is_disqualified(&self) -> bool {
        self.disqualified.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationOutcome {
    pub winner_id: AgentId,
    pub winning_bid: Bid,
    /// Every bid in candidate order, disqualified ones included.
    pub all_bids: Vec<Bid>,
}

/// Pick the winner: strictly highest score, earliest candidate on ties.
pub fn select_winner(bids: &[Bid]) -> Option<&Bid> {
    let mut best: Option<&Bid> = None;
    for bid in bids.iter().filter(|b| !b.is_disqualified()) {
        match best {
            Some(current) if bid.score() <= current.score() => {}
            _ => best = Some(bid),
        }
    }
    best
}

pub struct NegotiationEngine {
    ctx: CoordinatorContext,
    source: Arc<dyn BidSource>,
    bid_timeout: Duration,
}

impl NegotiationEngine {
    pub fn new(ctx: CoordinatorContext, source: Arc<dyn BidSource>, bid_timeout: Duration) -> Self {
        Self {
            ctx,
            source,
            bid_timeout,
        }
    }

    pub async fn negotiate(
        &self,
        candidates: &[AgentId],
        task_description: &str,
    ) -> Result<NegotiationOutcome> {
        self.negotiate_for(None, candidates, task_description).await
    }

    /// Run one bidding round, optionally on behalf of a graph task.
    ///
    /// # Errors
    ///
    /// `Negotiation` when there are no candidates or every bid was
    /// disqualified. Individual bad bids are not errors.
    pub async fn negotiate_for(
        &self,
        task_id: Option<&TaskId>,
        candidates: &[AgentId],
        task_description: &str,
    ) -> Result<NegotiationOutcome> {
        if candidates.is_empty() {
            return Err(Error::Negotiation("no candidates to negotiate with".into()));
        }
        hlog_debug!(
            "Negotiating among {} candidate(s) for {:?}",
            candidates.len(),
            task_id
        );

        let requests = candidates.iter().map(|agent_id| async move {
            let bid = tokio::time::timeout(
                self.bid_timeout,
                self.source.request_bid(agent_id, task_description),
            )
            .await;
            match bid {
                Ok(Ok(raw)) => Bid::validated(agent_id.clone(), raw),
                Ok(Err(e)) => Bid::disqualified(agent_id.clone(), e.to_string()),
                Err(_) => Bid::disqualified(
                    agent_id.clone(),
                    format!("no bid within {:?}", self.bid_timeout),
                ),
            }
        });
        let all_bids: Vec<Bid> = join_all(requests).await;

        for bid in all_bids.iter().filter(|b| b.is_disqualified()) {
            hlog_warn!(
                "Bid from {} disqualified: {}",
                bid.agent_id,
                bid.disqualified.as_deref().unwrap_or_default()
            );
        }

        let winning_bid = select_winner(&all_bids).cloned().ok_or_else(|| {
            Error::Negotiation(format!(
                "all {} candidate bid(s) were disqualified",
                all_bids.len()
            ))
        })?;

        let outcome = NegotiationOutcome {
            winner_id: winning_bid.agent_id.clone(),
            winning_bid,
            all_bids,
        };
        self.persist(task_id, candidates, task_description, &outcome);
        Ok(outcome)
    }

    fn persist(
        &self,
        task_id: Option<&TaskId>,
        candidates: &[AgentId],
        task_description: &str,
        outcome: &NegotiationOutcome,
    ) {
        let names: Vec<&str> = candidates.iter().map(AgentId::as_str).collect();
        let summary = format!(
            "Negotiation among {}: {} won with quality {} (score {})",
            names.join(", "),
            outcome.winner_id,
            outcome.winning_bid.quality,
            outcome.winning_bid.score()
        );
        hlog!("{}", summary);

        self.ctx.audit.record(
            AuditRecord::new(
                "negotiation",
                summary,
                json!({
                    "task_id": task_id,
                    "task": task_description,
                    "candidates": candidates,
                    "winner_id": outcome.winner_id,
                    "winning_bid": outcome.winning_bid,
                    "all_bids": outcome.all_bids,
                }),
            )
            .with_tags(["negotiation"])
            .with_tenant(self.ctx.tenant.clone()),
        );

        self.ctx.events.emit(SwarmEvent::NegotiationResolved {
            task_id: task_id.cloned(),
            winner_id: outcome.winner_id.clone(),
            score: outcome.winning_bid.score(),
            candidates: candidates.to_vec(),
        });
    }
}
