//! Cyclic dev-fix retry routing with exponential backoff.
//!
//! After QA runs, the router decides where the workflow goes next:
//! approval, another dev-fix cycle, human escalation, or failure. The
//! cycle (qa, dev_fix, safety re-check, qa) is modelled as an explicit
//! router over state rather than control flow, so a checkpoint can
//! resume at any node boundary.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::safety::SAFETY_ESCALATION_THRESHOLD;

/// Default backoff base in seconds.
pub const BASE_BACKOFF_SECONDS: f64 = 1.0;
/// Backoff multiplier per attempt.
pub const BACKOFF_MULTIPLIER: f64 = 2.0;
/// Backoff cap in seconds.
pub const MAX_BACKOFF_SECONDS: f64 = 300.0;
/// Jitter fraction applied when jitter is enabled.
pub const JITTER_FACTOR: f64 = 0.1;

/// Retry tracking state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryState {
    pub count: i32,
    pub max_retries: i32,
    pub last_error: String,
    pub backoff_seconds: f64,
}

impl RetryState {
    /// Fresh state with the canonical default budget of three retries.
    pub fn new(max_retries: i32) -> Self {
        Self {
            count: 0,
            max_retries,
            last_error: String::new(),
            backoff_seconds: 0.0,
        }
    }

    /// Record a failed attempt and compute the next backoff.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.count += 1;
        self.last_error = error.into();
        self.backoff_seconds = calculate_backoff(self.count, false);
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Compute exponential backoff for a retry attempt.
///
/// `min(base * multiplier^count, cap)`, with optional symmetric jitter
/// of up to 10% to avoid thundering herds.
pub fn calculate_backoff(retry_count: i32, jitter: bool) -> f64 {
    let backoff = BASE_BACKOFF_SECONDS * BACKOFF_MULTIPLIER.powi(retry_count);
    let mut backoff = backoff.min(MAX_BACKOFF_SECONDS);

    if jitter {
        let jitter_range = backoff * JITTER_FACTOR;
        let offset = rand::rng().random_range(-jitter_range..=jitter_range);
        backoff = (backoff + offset).max(0.0);
    }

    backoff
}

/// Backoff as a [`Duration`] for sleep calls.
pub fn backoff_duration(retry_count: i32, jitter: bool) -> Duration {
    Duration::from_secs_f64(calculate_backoff(retry_count, jitter))
}

/// Whether another retry is allowed.
pub fn should_retry(retry_count: i32, max_retries: i32) -> bool {
    retry_count < max_retries
}

/// Where the workflow goes after a QA pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryRoute {
    /// QA passed: proceed to CTO approval.
    CtoApproval,
    /// QA failed with retries remaining: another dev-fix cycle.
    DevFix,
    /// Safety violation or retries exhausted: hand to a human.
    EscalateHuman,
    /// Unrecoverable: short-circuit to failed.
    Failed,
}

/// Inputs to the retry router.
#[derive(Debug, Clone)]
pub struct QaRouteState {
    pub qa_passed: bool,
    pub retry: RetryState,
    pub constitutional_score: f64,
    pub unrecoverable: bool,
}

impl Default for QaRouteState {
    fn default() -> Self {
        Self {
            qa_passed: false,
            retry: RetryState::default(),
            constitutional_score: 1.0,
            unrecoverable: false,
        }
    }
}

/// Route after QA validation.
///
/// Order matters: a QA pass always proceeds; a safety violation
/// escalates before any retry accounting; unrecoverable errors fail;
/// exhausted retries escalate; otherwise another dev-fix cycle runs.
pub fn qa_retry_router(state: &QaRouteState) -> RetryRoute {
    if state.qa_passed {
        return RetryRoute::CtoApproval;
    }

    if state.constitutional_score < SAFETY_ESCALATION_THRESHOLD {
        return RetryRoute::EscalateHuman;
    }

    if state.unrecoverable {
        return RetryRoute::Failed;
    }

    if state.retry.count >= state.retry.max_retries {
        return RetryRoute::EscalateHuman;
    }

    RetryRoute::DevFix
}

/// Human-readable reason for an escalation.
pub fn escalation_reason(state: &QaRouteState) -> String {
    if state.constitutional_score < SAFETY_ESCALATION_THRESHOLD {
        return format!(
            "Safety violation: constitutional score {:.2} below threshold {SAFETY_ESCALATION_THRESHOLD}",
            state.constitutional_score
        );
    }

    if state.retry.count >= state.retry.max_retries {
        let last_error = if state.retry.last_error.is_empty() {
            "Unknown error"
        } else {
            &state.retry.last_error
        };
        return format!(
            "Max retries ({}) exceeded. Last error: {last_error}",
            state.retry.max_retries
        );
    }

    "Unknown escalation reason".to_owned()
}
