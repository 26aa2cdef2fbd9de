//! Crash recovery from checkpoints.
//!
//! Four strategies: resume from the last checkpoint, resume from a
//! specific gate, restart from scratch, or skip (cancel). Recovery is
//! idempotent: recovering an already-recovered story lands in the same
//! final state. A single-story recovery is a handful of indexed
//! queries, well inside the five-second contract.

use std::collections::HashMap;
use std::fmt;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use wave_db::models::{CheckpointType, StoryStatus};
use wave_db::queries::checkpoints::{self as checkpoint_db, NewCheckpoint};
use wave_db::queries::stories::{self as story_db};

use crate::gate::GateSchedule;

/// How to bring a story back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    ResumeFromLast,
    ResumeFromGate,
    Restart,
    Skip,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ResumeFromLast => "resume_from_last",
            Self::ResumeFromGate => "resume_from_gate",
            Self::Restart => "restart",
            Self::Skip => "skip",
        };
        f.write_str(s)
    }
}

/// A checkpoint viewed as a candidate recovery target.
#[derive(Debug, Clone)]
pub struct RecoveryPoint {
    pub checkpoint_id: Uuid,
    pub checkpoint_type: CheckpointType,
    pub story_id: Option<String>,
    pub gate: Option<String>,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub seq: i64,
    /// False only for an error checkpoint with no successor: there is
    /// nothing after it to resume into.
    pub can_resume: bool,
}

/// Result of recovering one story.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryResult {
    pub strategy: RecoveryStrategy,
    pub story_id: String,
    pub status: String,
    pub target_gate: Option<String>,
}

/// Result of recovering a whole session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecovery {
    pub recovered: Vec<String>,
    pub failed: Vec<FailedRecovery>,
    pub total_stories: usize,
}

/// A story that could not be recovered, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct FailedRecovery {
    pub story_id: String,
    pub error: String,
}

/// Summary of what a session would need to recover.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStatus {
    pub total_stories: usize,
    pub by_status: HashMap<String, usize>,
    pub recoverable: Vec<String>,
}

/// Replays stories from their checkpoints.
pub struct RecoveryManager {
    pool: PgPool,
    schedule: GateSchedule,
}

impl RecoveryManager {
    pub fn new(pool: PgPool, schedule: GateSchedule) -> Self {
        Self { pool, schedule }
    }

    /// List checkpoints for a session (optionally one story) in
    /// chronological order, tagged with resumability.
    pub async fn find_recovery_points(
        &self,
        session_id: Uuid,
        story_id: Option<&str>,
    ) -> Result<Vec<RecoveryPoint>> {
        let checkpoints = match story_id {
            Some(story_id) => {
                checkpoint_db::list_by_story(&self.pool, session_id, story_id).await?
            }
            None => checkpoint_db::list_by_session(&self.pool, session_id).await?,
        };

        let last_index = checkpoints.len().saturating_sub(1);
        let points = checkpoints
            .into_iter()
            .enumerate()
            .map(|(i, cp)| {
                let is_trailing_error =
                    cp.checkpoint_type == CheckpointType::Error && i == last_index;
                RecoveryPoint {
                    checkpoint_id: cp.id,
                    checkpoint_type: cp.checkpoint_type,
                    story_id: cp.story_id,
                    gate: cp.gate,
                    state: cp.state,
                    created_at: cp.created_at,
                    seq: cp.seq,
                    can_resume: !is_trailing_error,
                }
            })
            .collect();

        Ok(points)
    }

    /// The most recent checkpoint for a story.
    pub async fn get_last_recovery_point(
        &self,
        session_id: Uuid,
        story_id: &str,
    ) -> Result<Option<RecoveryPoint>> {
        let points = self.find_recovery_points(session_id, Some(story_id)).await?;
        Ok(points.into_iter().next_back())
    }

    /// A story is recoverable when it exists and is not terminal.
    pub async fn can_recover(&self, session_id: Uuid, story_id: &str) -> Result<bool> {
        let story = story_db::get_by_story_id(&self.pool, session_id, story_id).await?;
        Ok(story.is_some_and(|s| !s.status.is_terminal()))
    }

    /// Recover one story with the given strategy.
    pub async fn recover_story(
        &self,
        session_id: Uuid,
        story_id: &str,
        strategy: RecoveryStrategy,
        target_gate: Option<usize>,
    ) -> Result<RecoveryResult> {
        let story = story_db::get_by_story_id(&self.pool, session_id, story_id)
            .await?
            .with_context(|| format!("story {story_id} not found in session {session_id}"))?;

        if story.status.is_terminal() {
            bail!(
                "cannot recover story {story_id}: status {} is terminal",
                story.status
            );
        }

        match strategy {
            RecoveryStrategy::ResumeFromLast => {
                let point = self
                    .get_last_recovery_point(session_id, story_id)
                    .await?
                    .with_context(|| format!("no checkpoint found for story {story_id}"))?;

                self.resume(&story, &point.state, None).await?;

                Ok(RecoveryResult {
                    strategy,
                    story_id: story_id.to_owned(),
                    status: "resumed".to_owned(),
                    target_gate: None,
                })
            }
            RecoveryStrategy::ResumeFromGate => {
                let target =
                    target_gate.context("target_gate required for resume_from_gate")?;
                let tag = self.schedule.tag(target);

                let checkpoint = checkpoint_db::latest_gate_checkpoint(
                    &self.pool, session_id, story_id, &tag,
                )
                .await?
                .with_context(|| format!("No checkpoint found for {tag} on story {story_id}"))?;

                self.resume(&story, &checkpoint.state, Some(target)).await?;

                Ok(RecoveryResult {
                    strategy,
                    story_id: story_id.to_owned(),
                    status: "resumed".to_owned(),
                    target_gate: Some(tag),
                })
            }
            RecoveryStrategy::Restart => {
                let mut tx = self.pool.begin().await?;
                story_db::reset_for_restart(&mut *tx, story.id).await?;
                checkpoint_db::insert_checkpoint(
                    &mut *tx,
                    &NewCheckpoint {
                        session_id,
                        parent_checkpoint_id: None,
                        checkpoint_type: CheckpointType::Manual,
                        checkpoint_name: format!("{story_id} restarted"),
                        state: serde_json::json!({
                            "story_id": story_id,
                            "strategy": strategy,
                            "current_gate": 0,
                        }),
                        story_id: Some(story_id.to_owned()),
                        gate: None,
                        agent_id: Some(story.agent.clone()),
                    },
                )
                .await?;
                tx.commit().await?;

                Ok(RecoveryResult {
                    strategy,
                    story_id: story_id.to_owned(),
                    status: "restarted".to_owned(),
                    target_gate: None,
                })
            }
            RecoveryStrategy::Skip => {
                if story.status != StoryStatus::Cancelled {
                    let rows = story_db::transition_story_status(
                        &self.pool,
                        story.id,
                        story.status,
                        StoryStatus::Cancelled,
                    )
                    .await?;
                    if rows == 0 {
                        bail!("optimistic lock failed skipping story {story_id}");
                    }
                }

                Ok(RecoveryResult {
                    strategy,
                    story_id: story_id.to_owned(),
                    status: "skipped".to_owned(),
                    target_gate: None,
                })
            }
        }
    }

    /// Bring a story back to `in_progress`, optionally repositioning
    /// its gate, and record the recovery checkpoint.
    async fn resume(
        &self,
        story: &wave_db::models::StoryExecution,
        restored_state: &serde_json::Value,
        target_gate: Option<usize>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Already in_progress means a repeated recovery; the transition
        // is skipped and the call converges on the same state.
        if story.status != StoryStatus::InProgress {
            let rows = story_db::transition_story_status(
                &mut *tx,
                story.id,
                story.status,
                StoryStatus::InProgress,
            )
            .await?;
            if rows == 0 {
                bail!(
                    "optimistic lock failed resuming story {}",
                    story.story_id
                );
            }
        }
        story_db::clear_failed_at(&mut *tx, story.id).await?;

        if let Some(target) = target_gate {
            story_db::set_current_gate(
                &mut *tx,
                story.id,
                i32::try_from(target).unwrap_or(i32::MAX),
                story.acceptance_criteria_passed,
                story.acceptance_criteria_total,
            )
            .await?;
        }

        checkpoint_db::insert_checkpoint(
            &mut *tx,
            &NewCheckpoint {
                session_id: story.session_id,
                parent_checkpoint_id: None,
                checkpoint_type: CheckpointType::Manual,
                checkpoint_name: format!("{} recovered", story.story_id),
                state: serde_json::json!({
                    "story_id": story.story_id,
                    "restored_from": restored_state,
                    "target_gate": target_gate,
                }),
                story_id: Some(story.story_id.clone()),
                gate: None,
                agent_id: Some(story.agent.clone()),
            },
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            story_id = %story.story_id,
            target_gate = ?target_gate,
            "story recovered"
        );
        Ok(())
    }

    /// Recover every recoverable story in a session with one strategy.
    pub async fn recover_session(
        &self,
        session_id: Uuid,
        strategy: RecoveryStrategy,
    ) -> Result<SessionRecovery> {
        let stories = story_db::list_by_session(&self.pool, session_id).await?;
        let total_stories = stories.len();

        let mut recovered = Vec::new();
        let mut failed = Vec::new();

        for story in stories {
            if story.status.is_terminal() {
                continue;
            }
            match self
                .recover_story(session_id, &story.story_id, strategy, None)
                .await
            {
                Ok(_) => recovered.push(story.story_id),
                Err(e) => failed.push(FailedRecovery {
                    story_id: story.story_id,
                    error: e.to_string(),
                }),
            }
        }

        Ok(SessionRecovery {
            recovered,
            failed,
            total_stories,
        })
    }

    /// Summarize a session's recoverability.
    pub async fn get_recovery_status(&self, session_id: Uuid) -> Result<RecoveryStatus> {
        let stories = story_db::list_by_session(&self.pool, session_id).await?;

        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut recoverable = Vec::new();

        for story in &stories {
            *by_status.entry(story.status.to_string()).or_default() += 1;
            if !story.status.is_terminal() {
                recoverable.push(story.story_id.clone());
            }
        }

        Ok(RecoveryStatus {
            total_stories: stories.len(),
            by_status,
            recoverable,
        })
    }
}
