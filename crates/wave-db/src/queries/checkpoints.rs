//! Database query functions for the `checkpoints` table.
//!
//! Checkpoints are append-only: created at every state transition and
//! gate boundary, never updated, deleted only by cleanup or session
//! delete. Ordering is by the `seq` column, which the database assigns
//! monotonically, so "latest" is well defined even when two checkpoints
//! share a timestamp.

use anyhow::{Context, Result};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{Checkpoint, CheckpointType};

/// Parameters for inserting a new checkpoint.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub session_id: Uuid,
    pub parent_checkpoint_id: Option<Uuid>,
    pub checkpoint_type: CheckpointType,
    pub checkpoint_name: String,
    pub state: serde_json::Value,
    pub story_id: Option<String>,
    pub gate: Option<String>,
    pub agent_id: Option<String>,
}

/// Insert a new checkpoint row. Returns the inserted checkpoint with its
/// server-assigned `seq`.
pub async fn insert_checkpoint(executor: impl PgExecutor<'_>, new: &NewCheckpoint) -> Result<Checkpoint> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "INSERT INTO checkpoints \
         (session_id, parent_checkpoint_id, checkpoint_type, checkpoint_name, state, story_id, gate, agent_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.session_id)
    .bind(new.parent_checkpoint_id)
    .bind(new.checkpoint_type)
    .bind(&new.checkpoint_name)
    .bind(&new.state)
    .bind(&new.story_id)
    .bind(&new.gate)
    .bind(&new.agent_id)
    .fetch_one(executor)
    .await
    .context("failed to insert checkpoint")?;

    Ok(checkpoint)
}

/// Fetch a single checkpoint by ID.
pub async fn get_checkpoint(executor: impl PgExecutor<'_>, id: Uuid) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>("SELECT * FROM checkpoints WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
        .context("failed to fetch checkpoint")?;

    Ok(checkpoint)
}

/// List all checkpoints for a session in chronological (seq) order.
pub async fn list_by_session(executor: impl PgExecutor<'_>, session_id: Uuid) -> Result<Vec<Checkpoint>> {
    let checkpoints = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints WHERE session_id = $1 ORDER BY seq ASC",
    )
    .bind(session_id)
    .fetch_all(executor)
    .await
    .context("failed to list checkpoints for session")?;

    Ok(checkpoints)
}

/// List all checkpoints for a story in chronological (seq) order.
pub async fn list_by_story(
    executor: impl PgExecutor<'_>,
    session_id: Uuid,
    story_id: &str,
) -> Result<Vec<Checkpoint>> {
    let checkpoints = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints \
         WHERE session_id = $1 AND story_id = $2 \
         ORDER BY seq ASC",
    )
    .bind(session_id)
    .bind(story_id)
    .fetch_all(executor)
    .await
    .context("failed to list checkpoints for story")?;

    Ok(checkpoints)
}

/// List checkpoints of one type for a session.
pub async fn list_by_type(
    executor: impl PgExecutor<'_>,
    session_id: Uuid,
    checkpoint_type: CheckpointType,
) -> Result<Vec<Checkpoint>> {
    let checkpoints = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints \
         WHERE session_id = $1 AND checkpoint_type = $2 \
         ORDER BY seq ASC",
    )
    .bind(session_id)
    .bind(checkpoint_type)
    .fetch_all(executor)
    .await
    .context("failed to list checkpoints by type")?;

    Ok(checkpoints)
}

/// Fetch the most recent checkpoint for a story (by seq).
pub async fn latest_by_story(
    executor: impl PgExecutor<'_>,
    session_id: Uuid,
    story_id: &str,
) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints \
         WHERE session_id = $1 AND story_id = $2 \
         ORDER BY seq DESC LIMIT 1",
    )
    .bind(session_id)
    .bind(story_id)
    .fetch_optional(executor)
    .await
    .context("failed to fetch latest checkpoint for story")?;

    Ok(checkpoint)
}

/// Fetch the most recent checkpoint for a session (by seq).
pub async fn latest_by_session(executor: impl PgExecutor<'_>, session_id: Uuid) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints WHERE session_id = $1 ORDER BY seq DESC LIMIT 1",
    )
    .bind(session_id)
    .fetch_optional(executor)
    .await
    .context("failed to fetch latest checkpoint for session")?;

    Ok(checkpoint)
}

/// Fetch the most recent gate checkpoint for a story at a specific gate
/// tag (e.g. "gate-3").
pub async fn latest_gate_checkpoint(
    executor: impl PgExecutor<'_>,
    session_id: Uuid,
    story_id: &str,
    gate: &str,
) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints \
         WHERE session_id = $1 AND story_id = $2 \
           AND checkpoint_type = 'gate' AND gate = $3 \
         ORDER BY seq DESC LIMIT 1",
    )
    .bind(session_id)
    .bind(story_id)
    .bind(gate)
    .fetch_optional(executor)
    .await
    .context("failed to fetch gate checkpoint")?;

    Ok(checkpoint)
}

/// Retain the `keep` most recent checkpoints for a session and delete
/// the rest. Returns the number of deleted rows.
///
/// After this call, `list_by_session(s).len() == min(original, keep)`
/// and the retained checkpoints are the most recent by seq.
pub async fn cleanup_old_checkpoints(executor: impl PgExecutor<'_>, session_id: Uuid, keep: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM checkpoints \
         WHERE session_id = $1 \
           AND seq NOT IN ( \
               SELECT seq FROM checkpoints \
               WHERE session_id = $1 \
               ORDER BY seq DESC \
               LIMIT $2 \
           )",
    )
    .bind(session_id)
    .bind(keep)
    .execute(executor)
    .await
    .context("failed to clean up old checkpoints")?;

    Ok(result.rows_affected())
}

/// Count checkpoints for a session.
pub async fn count_by_session(executor: impl PgExecutor<'_>, session_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM checkpoints WHERE session_id = $1")
        .bind(session_id)
        .fetch_one(executor)
        .await
        .context("failed to count checkpoints")?;

    Ok(row.0)
}
