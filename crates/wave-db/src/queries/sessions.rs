//! Database query functions for the `sessions` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{Session, SessionStatus};

/// Parameters for inserting a new session. Unset fields take the
/// database defaults (status pending, budget 2.00 USD).
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub project_name: String,
    pub wave_number: i32,
    pub budget_usd: Option<f64>,
    pub story_count: Option<i32>,
    pub meta_data: Option<serde_json::Value>,
}

/// Insert a new session row. Returns the inserted session with
/// server-generated defaults (id, created_at, status).
pub async fn insert_session(executor: impl PgExecutor<'_>, new: &NewSession) -> Result<Session> {
    let session = sqlx::query_as::<_, Session>(
        "INSERT INTO sessions (project_name, wave_number, budget_usd, story_count, meta_data) \
         VALUES ($1, $2, COALESCE($3, 2.00), COALESCE($4, 0), COALESCE($5, '{}'::jsonb)) \
         RETURNING *",
    )
    .bind(&new.project_name)
    .bind(new.wave_number)
    .bind(new.budget_usd)
    .bind(new.story_count)
    .bind(&new.meta_data)
    .fetch_one(executor)
    .await
    .context("failed to insert session")?;

    Ok(session)
}

/// Fetch a single session by ID.
pub async fn get_session(executor: impl PgExecutor<'_>, id: Uuid) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
        .context("failed to fetch session")?;

    Ok(session)
}

/// Fetch a session by project name and wave number.
pub async fn get_by_project_and_wave(
    executor: impl PgExecutor<'_>,
    project_name: &str,
    wave_number: i32,
) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions WHERE project_name = $1 AND wave_number = $2 \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(project_name)
    .bind(wave_number)
    .fetch_optional(executor)
    .await
    .context("failed to fetch session by project and wave")?;

    Ok(session)
}

/// Fetch the most recent non-terminal session for a project.
pub async fn get_active_session(executor: impl PgExecutor<'_>, project_name: &str) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions \
         WHERE project_name = $1 AND status IN ('pending', 'in_progress') \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(project_name)
    .fetch_optional(executor)
    .await
    .context("failed to fetch active session")?;

    Ok(session)
}

/// List all sessions, newest first.
pub async fn list_sessions(executor: impl PgExecutor<'_>) -> Result<Vec<Session>> {
    let sessions =
        sqlx::query_as::<_, Session>("SELECT * FROM sessions ORDER BY created_at DESC")
            .fetch_all(executor)
            .await
            .context("failed to list sessions")?;

    Ok(sessions)
}

/// Atomically transition a session between statuses.
///
/// Uses optimistic locking on the current status. Sets `started_at` on
/// entry to `in_progress` and `completed_at`/`failed_at` on the matching
/// terminal statuses. Returns rows affected (0 means the status did not
/// match).
pub async fn transition_session_status(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    from: SessionStatus,
    to: SessionStatus,
) -> Result<u64> {
    let now = Utc::now();
    let started_at = (to == SessionStatus::InProgress).then_some(now);
    let completed_at =
        matches!(to, SessionStatus::Completed | SessionStatus::Cancelled).then_some(now);
    let failed_at = (to == SessionStatus::Failed).then_some(now);

    let result = sqlx::query(
        "UPDATE sessions \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at), \
             failed_at = COALESCE($4, failed_at) \
         WHERE id = $5 AND status = $6",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(failed_at)
    .bind(id)
    .bind(from)
    .execute(executor)
    .await
    .context("failed to transition session status")?;

    Ok(result.rows_affected())
}

/// Record the outcome of one story against the session counters.
///
/// The `stories_completed + stories_failed <= story_count` invariant is
/// enforced by a table CHECK, so an over-count fails loudly here.
pub async fn record_story_outcome(executor: impl PgExecutor<'_>, id: Uuid, succeeded: bool) -> Result<()> {
    let result = if succeeded {
        sqlx::query("UPDATE sessions SET stories_completed = stories_completed + 1 WHERE id = $1")
    } else {
        sqlx::query("UPDATE sessions SET stories_failed = stories_failed + 1 WHERE id = $1")
    }
    .bind(id)
    .execute(executor)
    .await
    .context("failed to record story outcome")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("session {id} not found");
    }

    Ok(())
}

/// Add token and cost usage to a session's running totals.
pub async fn add_usage(executor: impl PgExecutor<'_>, id: Uuid, tokens: i64, cost_usd: f64) -> Result<()> {
    let result = sqlx::query(
        "UPDATE sessions \
         SET token_count = token_count + $1, \
             actual_cost_usd = actual_cost_usd + $2 \
         WHERE id = $3",
    )
    .bind(tokens)
    .bind(cost_usd)
    .bind(id)
    .execute(executor)
    .await
    .context("failed to add session usage")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("session {id} not found");
    }

    Ok(())
}

/// Set the expected story count for a session.
pub async fn set_story_count(executor: impl PgExecutor<'_>, id: Uuid, story_count: i32) -> Result<()> {
    sqlx::query("UPDATE sessions SET story_count = $1 WHERE id = $2")
        .bind(story_count)
        .bind(id)
        .execute(executor)
        .await
        .context("failed to set story count")?;

    Ok(())
}

/// Delete a session. Cascades to its stories and checkpoints.
pub async fn delete_session(executor: impl PgExecutor<'_>, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await
        .context("failed to delete session")?;

    Ok(result.rows_affected())
}
