//! Story execution engine.
//!
//! Drives one story through the status state machine and the gate
//! sequence, writing a checkpoint at every transition. A state change
//! and its checkpoint are committed in one database transaction, so
//! recovery never observes one without the other.
//!
//! The allowed status graph:
//!
//! ```text
//! pending     -> in_progress
//! in_progress -> review | complete | failed | cancelled
//! review      -> in_progress | complete | failed
//! failed      -> in_progress   (recovery only)
//! complete, cancelled: terminal
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use wave_db::models::{Checkpoint, CheckpointType, StoryExecution, StoryStatus};
use wave_db::queries::checkpoints::{self as checkpoint_db, NewCheckpoint};
use wave_db::queries::stories::{self as story_db, NewStoryExecution, StoryArtifacts};

use crate::gate::GateSchedule;

/// Default retry budget per story before escalation.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Context for starting a story execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub session_id: Uuid,
    pub story_id: String,
    pub title: String,
    pub domain: String,
    pub agent: String,
    pub priority: i32,
    pub story_points: i32,
    pub acceptance_criteria_total: i32,
}

/// Outcome of running one gate's work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcome {
    /// Gate index within the engine's schedule.
    pub gate: usize,
    pub status: GateOutcomeStatus,
    pub acceptance_criteria_passed: i32,
    pub acceptance_criteria_total: i32,
    pub error: Option<String>,
}

/// Whether the gate's work passed or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcomeStatus {
    Passed,
    Failed,
}

/// What the engine did with a gate outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateAdvance {
    /// Gate passed; `current_gate` advanced to the contained index.
    Advanced { next_gate: usize },
    /// The terminal gate passed; the story is complete.
    Completed,
    /// Gate failed but retries remain; the story stays in progress.
    Retrying { retry_count: i32 },
    /// Gate failed with retries exhausted; the story is failed.
    Failed { error: String },
}

/// Snapshot of a story's execution state.
#[derive(Debug, Clone)]
pub struct CurrentState {
    pub execution_id: Uuid,
    pub status: StoryStatus,
    pub current_gate: i32,
    pub acceptance_criteria_passed: i32,
    pub acceptance_criteria_total: i32,
    pub retry_count: i32,
    pub latest_checkpoint: Option<Checkpoint>,
}

/// The story execution engine.
pub struct StoryEngine {
    pool: PgPool,
    schedule: GateSchedule,
    max_retries: i32,
}

impl StoryEngine {
    pub fn new(pool: PgPool, schedule: GateSchedule) -> Self {
        Self {
            pool,
            schedule,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Override the retry budget (canonical default is 3).
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn schedule(&self) -> GateSchedule {
        self.schedule
    }

    /// Check whether a status transition is an edge in the state graph.
    pub fn is_valid_transition(from: StoryStatus, to: StoryStatus) -> bool {
        matches!(
            (from, to),
            (StoryStatus::Pending, StoryStatus::InProgress)
                | (StoryStatus::InProgress, StoryStatus::Review)
                | (StoryStatus::InProgress, StoryStatus::Complete)
                | (StoryStatus::InProgress, StoryStatus::Failed)
                | (StoryStatus::InProgress, StoryStatus::Cancelled)
                | (StoryStatus::Review, StoryStatus::InProgress)
                | (StoryStatus::Review, StoryStatus::Complete)
                | (StoryStatus::Review, StoryStatus::Failed)
                | (StoryStatus::Failed, StoryStatus::InProgress)
        )
    }

    /// Create a story execution and start it.
    ///
    /// Inserts the row (a duplicate `(session, story_id)` fails), moves
    /// it to `in_progress` at gate 0, and writes the `story_start`
    /// checkpoint, all in one transaction.
    pub async fn start_execution(&self, ctx: &ExecutionContext) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;

        let story = story_db::insert_story(
            &mut *tx,
            &NewStoryExecution {
                session_id: ctx.session_id,
                story_id: ctx.story_id.clone(),
                title: ctx.title.clone(),
                domain: ctx.domain.clone(),
                agent: ctx.agent.clone(),
                priority: ctx.priority,
                story_points: ctx.story_points,
                acceptance_criteria_total: ctx.acceptance_criteria_total,
            },
        )
        .await
        .with_context(|| format!("failed to create execution for story {}", ctx.story_id))?;

        let rows = story_db::transition_story_status(
            &mut *tx,
            story.id,
            StoryStatus::Pending,
            StoryStatus::InProgress,
        )
        .await?;
        if rows == 0 {
            bail!("freshly inserted story {} was not pending", story.id);
        }

        checkpoint_db::insert_checkpoint(
            &mut *tx,
            &NewCheckpoint {
                session_id: ctx.session_id,
                parent_checkpoint_id: None,
                checkpoint_type: CheckpointType::StoryStart,
                checkpoint_name: format!("{} started", ctx.story_id),
                state: serde_json::json!({
                    "story_id": ctx.story_id,
                    "domain": ctx.domain,
                    "agent": ctx.agent,
                    "current_gate": 0,
                }),
                story_id: Some(ctx.story_id.clone()),
                gate: None,
                agent_id: Some(ctx.agent.clone()),
            },
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            execution_id = %story.id,
            story_id = %ctx.story_id,
            domain = %ctx.domain,
            "story execution started"
        );
        Ok(story.id)
    }

    /// Transition a story's status, validating against the state graph.
    ///
    /// Records the transition reason in meta_data and writes a `manual`
    /// checkpoint named after the new status.
    pub async fn transition_state(
        &self,
        execution_id: Uuid,
        new_status: StoryStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let story = self.require_story(execution_id).await?;

        if !Self::is_valid_transition(story.status, new_status) {
            bail!(
                "invalid state transition: {} -> {} for story {}",
                story.status,
                new_status,
                story.story_id
            );
        }

        let mut tx = self.pool.begin().await?;

        let rows =
            story_db::transition_story_status(&mut *tx, execution_id, story.status, new_status)
                .await?;
        if rows == 0 {
            bail!(
                "optimistic lock failed: story {} no longer has status {}",
                story.story_id,
                story.status
            );
        }

        if let Some(reason) = reason {
            story_db::merge_meta_data(
                &mut *tx,
                execution_id,
                &serde_json::json!({"last_transition_reason": reason}),
            )
            .await?;
        }

        checkpoint_db::insert_checkpoint(
            &mut *tx,
            &NewCheckpoint {
                session_id: story.session_id,
                parent_checkpoint_id: None,
                checkpoint_type: CheckpointType::Manual,
                checkpoint_name: format!("{} -> {new_status}", story.story_id),
                state: serde_json::json!({
                    "story_id": story.story_id,
                    "from": story.status,
                    "to": new_status,
                    "reason": reason,
                    "current_gate": story.current_gate,
                }),
                story_id: Some(story.story_id.clone()),
                gate: None,
                agent_id: Some(story.agent.clone()),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Apply a gate outcome to a story.
    ///
    /// Passed: writes a `gate` checkpoint carrying the outcome, advances
    /// `current_gate`, and completes the story when the terminal gate
    /// passes. Failed: increments the retry counter; below the retry
    /// budget the story stays `in_progress`, at the budget it fails with
    /// `"{gate} failed: {error}"`.
    pub async fn execute_gate(
        &self,
        execution_id: Uuid,
        outcome: &GateOutcome,
    ) -> Result<GateAdvance> {
        let story = self.require_story(execution_id).await?;

        if story.status != StoryStatus::InProgress {
            bail!(
                "cannot execute gate for story {} in status {}",
                story.story_id,
                story.status
            );
        }

        let gate = self
            .schedule
            .at(outcome.gate)
            .with_context(|| format!("gate index {} out of schedule", outcome.gate))?;

        if outcome.gate != story.current_gate as usize {
            bail!(
                "gate {} executed out of order for story {}: current gate is {}",
                outcome.gate,
                story.story_id,
                story.current_gate
            );
        }

        match outcome.status {
            GateOutcomeStatus::Passed => {
                let next_gate = outcome.gate + 1;
                let completed = outcome.gate == self.schedule.terminal_index();

                let mut tx = self.pool.begin().await?;

                checkpoint_db::insert_checkpoint(
                    &mut *tx,
                    &NewCheckpoint {
                        session_id: story.session_id,
                        parent_checkpoint_id: None,
                        checkpoint_type: CheckpointType::Gate,
                        checkpoint_name: format!("{} passed {}", story.story_id, gate.name()),
                        state: serde_json::to_value(outcome)?,
                        story_id: Some(story.story_id.clone()),
                        gate: Some(self.schedule.tag(outcome.gate)),
                        agent_id: Some(story.agent.clone()),
                    },
                )
                .await?;

                story_db::set_current_gate(
                    &mut *tx,
                    execution_id,
                    i32::try_from(next_gate).unwrap_or(i32::MAX),
                    outcome.acceptance_criteria_passed,
                    outcome.acceptance_criteria_total,
                )
                .await?;

                if completed {
                    let rows = story_db::transition_story_status(
                        &mut *tx,
                        execution_id,
                        StoryStatus::InProgress,
                        StoryStatus::Complete,
                    )
                    .await?;
                    if rows == 0 {
                        bail!(
                            "optimistic lock failed completing story {}",
                            story.story_id
                        );
                    }
                }

                tx.commit().await?;

                tracing::info!(
                    story_id = %story.story_id,
                    gate = %gate,
                    next_gate = next_gate,
                    "gate passed"
                );

                if completed {
                    Ok(GateAdvance::Completed)
                } else {
                    Ok(GateAdvance::Advanced { next_gate })
                }
            }
            GateOutcomeStatus::Failed => {
                let error = outcome.error.as_deref().unwrap_or("unknown error");
                let retry_count = story_db::increment_retry(&self.pool, execution_id).await?;

                if retry_count < self.max_retries {
                    tracing::warn!(
                        story_id = %story.story_id,
                        gate = %gate,
                        retry_count = retry_count,
                        "gate failed, retrying"
                    );
                    return Ok(GateAdvance::Retrying { retry_count });
                }

                let message = format!("{gate} failed: {error}");
                let mut tx = self.pool.begin().await?;

                let rows = story_db::transition_story_status(
                    &mut *tx,
                    execution_id,
                    StoryStatus::InProgress,
                    StoryStatus::Failed,
                )
                .await?;
                if rows == 0 {
                    bail!("optimistic lock failed failing story {}", story.story_id);
                }
                story_db::set_error_message(&mut *tx, execution_id, &message).await?;

                checkpoint_db::insert_checkpoint(
                    &mut *tx,
                    &NewCheckpoint {
                        session_id: story.session_id,
                        parent_checkpoint_id: None,
                        checkpoint_type: CheckpointType::Error,
                        checkpoint_name: message.clone(),
                        state: serde_json::to_value(outcome)?,
                        story_id: Some(story.story_id.clone()),
                        gate: Some(self.schedule.tag(outcome.gate)),
                        agent_id: Some(story.agent.clone()),
                    },
                )
                .await?;

                tx.commit().await?;

                tracing::error!(
                    story_id = %story.story_id,
                    gate = %gate,
                    retry_count = retry_count,
                    "gate failed, retries exhausted"
                );
                Ok(GateAdvance::Failed { error: message })
            }
        }
    }

    /// Mark a story complete and store its artifacts.
    pub async fn complete_execution(
        &self,
        execution_id: Uuid,
        artifacts: &StoryArtifacts,
    ) -> Result<()> {
        let story = self.require_story(execution_id).await?;

        if !Self::is_valid_transition(story.status, StoryStatus::Complete)
            && story.status != StoryStatus::Complete
        {
            bail!(
                "cannot complete story {} from status {}",
                story.story_id,
                story.status
            );
        }

        let mut tx = self.pool.begin().await?;

        story_db::record_artifacts(&mut *tx, execution_id, artifacts).await?;
        if story.status != StoryStatus::Complete {
            let rows = story_db::transition_story_status(
                &mut *tx,
                execution_id,
                story.status,
                StoryStatus::Complete,
            )
            .await?;
            if rows == 0 {
                bail!(
                    "optimistic lock failed completing story {}",
                    story.story_id
                );
            }
        }

        checkpoint_db::insert_checkpoint(
            &mut *tx,
            &NewCheckpoint {
                session_id: story.session_id,
                parent_checkpoint_id: None,
                checkpoint_type: CheckpointType::StoryComplete,
                checkpoint_name: format!("{} complete", story.story_id),
                state: serde_json::json!({
                    "story_id": story.story_id,
                    "branch_name": artifacts.branch_name,
                    "commit_sha": artifacts.commit_sha,
                    "pr_url": artifacts.pr_url,
                    "tests_passing": artifacts.tests_passing,
                    "coverage_achieved": artifacts.coverage_achieved,
                    "files_created": artifacts.files_created,
                    "files_modified": artifacts.files_modified,
                }),
                story_id: Some(story.story_id.clone()),
                gate: None,
                agent_id: Some(story.agent.clone()),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Mark a story failed with an error message.
    pub async fn fail_execution(&self, execution_id: Uuid, error: &str) -> Result<()> {
        let story = self.require_story(execution_id).await?;

        if !Self::is_valid_transition(story.status, StoryStatus::Failed) {
            bail!(
                "cannot fail story {} from status {}",
                story.story_id,
                story.status
            );
        }

        let mut tx = self.pool.begin().await?;

        let rows = story_db::transition_story_status(
            &mut *tx,
            execution_id,
            story.status,
            StoryStatus::Failed,
        )
        .await?;
        if rows == 0 {
            bail!("optimistic lock failed failing story {}", story.story_id);
        }
        story_db::set_error_message(&mut *tx, execution_id, error).await?;

        checkpoint_db::insert_checkpoint(
            &mut *tx,
            &NewCheckpoint {
                session_id: story.session_id,
                parent_checkpoint_id: None,
                checkpoint_type: CheckpointType::Error,
                checkpoint_name: format!("{} failed", story.story_id),
                state: serde_json::json!({
                    "story_id": story.story_id,
                    "error": error,
                    "current_gate": story.current_gate,
                }),
                story_id: Some(story.story_id.clone()),
                gate: None,
                agent_id: Some(story.agent.clone()),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Current status, gate, AC counters, and latest checkpoint.
    pub async fn get_current_state(&self, execution_id: Uuid) -> Result<CurrentState> {
        let story = self.require_story(execution_id).await?;
        let latest_checkpoint =
            checkpoint_db::latest_by_story(&self.pool, story.session_id, &story.story_id).await?;

        Ok(CurrentState {
            execution_id,
            status: story.status,
            current_gate: story.current_gate,
            acceptance_criteria_passed: story.acceptance_criteria_passed,
            acceptance_criteria_total: story.acceptance_criteria_total,
            retry_count: story.retry_count,
            latest_checkpoint,
        })
    }

    async fn require_story(&self, execution_id: Uuid) -> Result<StoryExecution> {
        story_db::get_story(&self.pool, execution_id)
            .await?
            .with_context(|| format!("story execution {execution_id} not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_edges() {
        use StoryStatus::*;

        let valid = [
            (Pending, InProgress),
            (InProgress, Review),
            (InProgress, Complete),
            (InProgress, Failed),
            (InProgress, Cancelled),
            (Review, InProgress),
            (Review, Complete),
            (Review, Failed),
            (Failed, InProgress),
        ];
        for (from, to) in valid {
            assert!(
                StoryEngine::is_valid_transition(from, to),
                "{from} -> {to} should be valid"
            );
        }

        let invalid = [
            (Pending, Complete),
            (Pending, Review),
            (Complete, InProgress),
            (Cancelled, InProgress),
            (Failed, Complete),
            (Failed, Review),
            (Complete, Failed),
        ];
        for (from, to) in invalid {
            assert!(
                !StoryEngine::is_valid_transition(from, to),
                "{from} -> {to} should be invalid"
            );
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use StoryStatus::*;
        for to in [Pending, InProgress, Review, Complete, Failed, Cancelled] {
            assert!(!StoryEngine::is_valid_transition(Complete, to));
            assert!(!StoryEngine::is_valid_transition(Cancelled, to));
        }
    }
}
