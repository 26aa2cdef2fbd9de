//! Multi-reviewer consensus for the review gate.
//!
//! Three reviewers (QA, security, architecture) each produce an
//! approval and a score in [0, 1]. The aggregator applies the rules:
//! any score below 0.5 goes to human review; unanimous approval with an
//! average of at least 0.8 auto-approves; anything else is rejected.
//! A reviewer is anything implementing [`Reviewer`]; there is no base
//! class to inherit from.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Average score required for auto-approval.
pub const APPROVAL_THRESHOLD: f64 = 0.8;
/// Any single score below this forces human review.
pub const HUMAN_REVIEW_THRESHOLD: f64 = 0.5;

/// One reviewer's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub reviewer: String,
    pub approved: bool,
    /// Clamped to [0, 1] at construction.
    pub score: f64,
    pub feedback: String,
}

impl ReviewOutcome {
    pub fn new(
        reviewer: impl Into<String>,
        approved: bool,
        score: f64,
        feedback: impl Into<String>,
    ) -> Self {
        Self {
            reviewer: reviewer.into(),
            approved,
            score: score.clamp(0.0, 1.0),
            feedback: feedback.into(),
        }
    }
}

/// What the review panel agreed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusDecision {
    Approved,
    Rejected,
    HumanReview,
}

/// Aggregated consensus over all reviews.
#[derive(Debug, Clone, Serialize)]
pub struct Consensus {
    pub decision: ConsensusDecision,
    pub average_score: f64,
    pub reason: String,
    pub combined_feedback: String,
}

/// Where the workflow goes after consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusRoute {
    Merge,
    EscalateHuman,
    Failed,
}

/// The material a reviewer evaluates.
#[derive(Debug, Clone, Default)]
pub struct ReviewInput {
    pub story_id: String,
    pub code: String,
    pub files: Vec<String>,
    pub acceptance_criteria: Vec<String>,
}

/// A review capability. Implemented by LLM-backed reviewers in
/// production and by closures or fixtures in tests.
#[async_trait]
pub trait Reviewer: Send + Sync {
    /// The reviewer's identity (qa, security, architecture).
    fn name(&self) -> &str;

    async fn review(&self, input: &ReviewInput) -> Result<ReviewOutcome>;
}

/// Aggregate reviewer verdicts into a consensus.
pub fn aggregate(reviews: &[ReviewOutcome]) -> Consensus {
    if reviews.is_empty() {
        return Consensus {
            decision: ConsensusDecision::Rejected,
            average_score: 0.0,
            reason: "No reviews available".to_owned(),
            combined_feedback: String::new(),
        };
    }

    let all_approved = reviews.iter().all(|r| r.approved);
    let average_score = reviews.iter().map(|r| r.score).sum::<f64>() / reviews.len() as f64;
    let any_low_score = reviews.iter().any(|r| r.score < HUMAN_REVIEW_THRESHOLD);

    let combined_feedback = reviews
        .iter()
        .filter(|r| !r.feedback.is_empty())
        .map(|r| r.feedback.as_str())
        .collect::<Vec<_>>()
        .join("; ");

    if any_low_score {
        return Consensus {
            decision: ConsensusDecision::HumanReview,
            average_score,
            reason: format!("Low reviewer score detected (below {HUMAN_REVIEW_THRESHOLD})"),
            combined_feedback,
        };
    }

    if all_approved && average_score >= APPROVAL_THRESHOLD {
        return Consensus {
            decision: ConsensusDecision::Approved,
            average_score,
            reason: format!("All reviewers approved with average score {average_score:.2}"),
            combined_feedback,
        };
    }

    if !all_approved {
        let rejected_by: Vec<&str> = reviews
            .iter()
            .filter(|r| !r.approved)
            .map(|r| r.reviewer.as_str())
            .collect();
        return Consensus {
            decision: ConsensusDecision::Rejected,
            average_score,
            reason: format!("Rejected by: {}", rejected_by.join(", ")),
            combined_feedback,
        };
    }

    Consensus {
        decision: ConsensusDecision::Rejected,
        average_score,
        reason: format!(
            "Average score {average_score:.2} below threshold {APPROVAL_THRESHOLD}"
        ),
        combined_feedback,
    }
}

/// Map a consensus decision onto the next workflow node.
pub fn consensus_router(decision: ConsensusDecision) -> ConsensusRoute {
    match decision {
        ConsensusDecision::Approved => ConsensusRoute::Merge,
        ConsensusDecision::HumanReview => ConsensusRoute::EscalateHuman,
        ConsensusDecision::Rejected => ConsensusRoute::Failed,
    }
}

/// Run a panel of reviewers and aggregate their verdicts.
///
/// A reviewer error becomes a zero-score rejection from that reviewer
/// (which forces human review) rather than aborting the panel.
pub async fn run_panel(reviewers: &[Box<dyn Reviewer>], input: &ReviewInput) -> Consensus {
    let mut outcomes = Vec::with_capacity(reviewers.len());
    for reviewer in reviewers {
        match reviewer.review(input).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                tracing::warn!(
                    reviewer = reviewer.name(),
                    error = %e,
                    "reviewer failed, recording zero-score rejection"
                );
                outcomes.push(ReviewOutcome::new(
                    reviewer.name(),
                    false,
                    0.0,
                    format!("reviewer error: {e}"),
                ));
            }
        }
    }
    aggregate(&outcomes)
}
