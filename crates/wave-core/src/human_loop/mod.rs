//! Human-in-the-loop interrupt and resume.
//!
//! When a workflow escalates, it pauses with an escalation context for
//! the reviewer, emits an escalation event, and waits. A validated
//! [`HumanDecision`] resumes it: approval returns the workflow to
//! running, rejection cancels it. A workflow can only be resumed while
//! it is paused and flagged as needing a human.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::RetryState;

/// Workflow pause/run status used by the interrupt flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Paused,
    Cancelled,
}

/// The slice of workflow state the interrupt flow reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptState {
    pub run_id: String,
    pub status: WorkflowStatus,
    pub needs_human: bool,
    pub human_approved: Option<bool>,
    pub human_feedback: String,
    pub escalation_context: Option<EscalationContext>,
    /// Set when a resume attempt carried an invalid decision.
    pub resume_error: Option<String>,
}

impl InterruptState {
    pub fn running(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: WorkflowStatus::Running,
            needs_human: false,
            human_approved: None,
            human_feedback: String::new(),
            escalation_context: None,
            resume_error: None,
        }
    }
}

/// Everything a human reviewer needs to decide an escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationContext {
    pub run_id: String,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    pub qa_feedback: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: String,
    pub constitutional_score: f64,
    pub safety_violations: Vec<String>,
    pub task: String,
    pub current_agent: String,
}

/// Inputs gathered into an escalation context.
#[derive(Debug, Clone, Default)]
pub struct EscalationInputs {
    pub qa_feedback: Option<String>,
    pub retry: Option<RetryState>,
    pub constitutional_score: Option<f64>,
    pub safety_violations: Vec<String>,
    pub task: String,
    pub current_agent: String,
}

/// A reviewer's decision on an escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanDecision {
    pub approved: bool,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
}

impl HumanDecision {
    pub fn new(approved: bool, feedback: impl Into<String>) -> Self {
        Self {
            approved,
            feedback: feedback.into(),
            decided_by: None,
            decided_at: Some(Utc::now()),
        }
    }
}

/// Build the escalation context shown to the reviewer.
pub fn build_escalation_context(
    run_id: &str,
    reason: &str,
    inputs: &EscalationInputs,
) -> EscalationContext {
    let (retry_count, max_retries, last_error) = match &inputs.retry {
        Some(retry) => (retry.count, retry.max_retries, retry.last_error.clone()),
        None => (0, 0, String::new()),
    };

    EscalationContext {
        run_id: run_id.to_owned(),
        reason: reason.to_owned(),
        requested_at: Utc::now(),
        qa_feedback: inputs.qa_feedback.clone(),
        retry_count,
        max_retries,
        last_error,
        constitutional_score: inputs.constitutional_score.unwrap_or(1.0),
        safety_violations: inputs.safety_violations.clone(),
        task: inputs.task.clone(),
        current_agent: inputs.current_agent.clone(),
    }
}

/// Pause a workflow pending human review.
pub fn interrupt(state: &mut InterruptState, context: EscalationContext) {
    tracing::warn!(
        run_id = %state.run_id,
        reason = %context.reason,
        "workflow escalated to human"
    );
    state.status = WorkflowStatus::Paused;
    state.needs_human = true;
    state.escalation_context = Some(context);
    state.resume_error = None;
}

/// Whether a workflow is eligible for resume.
pub fn can_resume(state: &InterruptState) -> bool {
    state.status == WorkflowStatus::Paused && state.needs_human
}

/// The pending escalation, when one exists.
pub fn pending_escalation(state: &InterruptState) -> Option<&EscalationContext> {
    if !can_resume(state) {
        return None;
    }
    state.escalation_context.as_ref()
}

/// Validate a decision before applying it.
///
/// Returns the list of problems; empty means valid.
pub fn validate_decision(decision: &serde_json::Value) -> Vec<String> {
    let mut errors = Vec::new();

    match decision.get("approved") {
        None => errors.push("Missing required field: approved".to_owned()),
        Some(value) if !value.is_boolean() => {
            errors.push("Field 'approved' must be a boolean".to_owned());
        }
        Some(_) => {}
    }

    if let Some(feedback) = decision.get("feedback") {
        if !feedback.is_string() {
            errors.push("Field 'feedback' must be a string".to_owned());
        }
    }

    errors
}

/// Resume a paused workflow with a human decision.
///
/// An invalid decision leaves the workflow paused with a resume error.
/// Approval returns the workflow to running; rejection cancels it.
pub fn resume_workflow(state: &mut InterruptState, decision: &serde_json::Value) -> bool {
    if !can_resume(state) {
        state.resume_error = Some("workflow is not paused for human review".to_owned());
        return false;
    }

    let errors = validate_decision(decision);
    if !errors.is_empty() {
        state.resume_error = Some(format!("Invalid decision: {}", errors.join("; ")));
        return false;
    }

    // Validation guarantees the shape.
    let parsed: HumanDecision = match serde_json::from_value(decision.clone()) {
        Ok(parsed) => parsed,
        Err(e) => {
            state.resume_error = Some(format!("Invalid decision: {e}"));
            return false;
        }
    };

    state.human_approved = Some(parsed.approved);
    state.human_feedback = parsed.feedback;
    state.needs_human = false;
    state.resume_error = None;
    state.status = if parsed.approved {
        WorkflowStatus::Running
    } else {
        WorkflowStatus::Cancelled
    };

    tracing::info!(
        run_id = %state.run_id,
        approved = parsed.approved,
        "workflow resumed from human decision"
    );
    true
}
