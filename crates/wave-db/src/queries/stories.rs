//! Database query functions for the `story_executions` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{StoryExecution, StoryStatus};

/// Parameters for inserting a new story execution.
#[derive(Debug, Clone, Default)]
pub struct NewStoryExecution {
    pub session_id: Uuid,
    pub story_id: String,
    pub title: String,
    pub domain: String,
    pub agent: String,
    pub priority: i32,
    pub story_points: i32,
    pub acceptance_criteria_total: i32,
}

/// Insert a new story execution row.
///
/// The `(session_id, story_id)` pair is UNIQUE; inserting a duplicate
/// surfaces as a constraint violation error.
pub async fn insert_story(executor: impl PgExecutor<'_>, new: &NewStoryExecution) -> Result<StoryExecution> {
    let story = sqlx::query_as::<_, StoryExecution>(
        "INSERT INTO story_executions \
         (session_id, story_id, title, domain, agent, priority, story_points, acceptance_criteria_total) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.session_id)
    .bind(&new.story_id)
    .bind(&new.title)
    .bind(&new.domain)
    .bind(&new.agent)
    .bind(new.priority)
    .bind(new.story_points)
    .bind(new.acceptance_criteria_total)
    .fetch_one(executor)
    .await
    .with_context(|| {
        format!(
            "failed to insert story {} for session {}",
            new.story_id, new.session_id
        )
    })?;

    Ok(story)
}

/// Fetch a single story execution by ID.
pub async fn get_story(executor: impl PgExecutor<'_>, id: Uuid) -> Result<Option<StoryExecution>> {
    let story = sqlx::query_as::<_, StoryExecution>("SELECT * FROM story_executions WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
        .context("failed to fetch story execution")?;

    Ok(story)
}

/// Fetch a story execution by its human-readable story id within a session.
pub async fn get_by_story_id(
    executor: impl PgExecutor<'_>,
    session_id: Uuid,
    story_id: &str,
) -> Result<Option<StoryExecution>> {
    let story = sqlx::query_as::<_, StoryExecution>(
        "SELECT * FROM story_executions WHERE session_id = $1 AND story_id = $2",
    )
    .bind(session_id)
    .bind(story_id)
    .fetch_optional(executor)
    .await
    .context("failed to fetch story execution by story id")?;

    Ok(story)
}

/// List all story executions for a session, ordered by creation time.
pub async fn list_by_session(executor: impl PgExecutor<'_>, session_id: Uuid) -> Result<Vec<StoryExecution>> {
    let stories = sqlx::query_as::<_, StoryExecution>(
        "SELECT * FROM story_executions WHERE session_id = $1 ORDER BY created_at ASC",
    )
    .bind(session_id)
    .fetch_all(executor)
    .await
    .context("failed to list story executions")?;

    Ok(stories)
}

/// Atomically transition a story between statuses.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row is only updated if the current status
/// matches. Sets `started_at` on entry to `in_progress`, `completed_at`
/// on `complete`/`cancelled`, and `failed_at` on `failed`. Returns rows
/// affected (0 means the status did not match).
pub async fn transition_story_status(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    from: StoryStatus,
    to: StoryStatus,
) -> Result<u64> {
    let now = Utc::now();
    let started_at = (to == StoryStatus::InProgress).then_some(now);
    let completed_at =
        matches!(to, StoryStatus::Complete | StoryStatus::Cancelled).then_some(now);
    let failed_at = (to == StoryStatus::Failed).then_some(now);

    let result = sqlx::query(
        "UPDATE story_executions \
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
    .context("failed to transition story status")?;

    Ok(result.rows_affected())
}

/// Advance a story's current gate and acceptance-criteria counters.
pub async fn set_current_gate(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    current_gate: i32,
    ac_passed: i32,
    ac_total: i32,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE story_executions \
         SET current_gate = $1, \
             acceptance_criteria_passed = $2, \
             acceptance_criteria_total = $3 \
         WHERE id = $4",
    )
    .bind(current_gate)
    .bind(ac_passed)
    .bind(ac_total)
    .bind(id)
    .execute(executor)
    .await
    .context("failed to set current gate")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("story execution {id} not found");
    }

    Ok(())
}

/// Increment the retry counter, returning the new value.
pub async fn increment_retry(executor: impl PgExecutor<'_>, id: Uuid) -> Result<i32> {
    let row: (i32,) = sqlx::query_as(
        "UPDATE story_executions SET retry_count = retry_count + 1 \
         WHERE id = $1 RETURNING retry_count",
    )
    .bind(id)
    .fetch_one(executor)
    .await
    .context("failed to increment retry count")?;

    Ok(row.0)
}

/// Store an error message on a story execution.
pub async fn set_error_message(executor: impl PgExecutor<'_>, id: Uuid, error: &str) -> Result<()> {
    sqlx::query("UPDATE story_executions SET error_message = $1 WHERE id = $2")
        .bind(error)
        .bind(id)
        .execute(executor)
        .await
        .context("failed to set error message")?;

    Ok(())
}

/// Merge a JSON object into a story's meta_data.
pub async fn merge_meta_data(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    patch: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE story_executions SET meta_data = meta_data || $1 WHERE id = $2")
        .bind(patch)
        .bind(id)
        .execute(executor)
        .await
        .context("failed to merge story meta_data")?;

    Ok(())
}

/// Artifact references recorded when a story completes.
#[derive(Debug, Clone, Default)]
pub struct StoryArtifacts {
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub branch_name: Option<String>,
    pub commit_sha: Option<String>,
    pub pr_url: Option<String>,
    pub tests_passing: Option<bool>,
    pub coverage_achieved: Option<f32>,
}

/// Store completion artifacts on a story execution.
pub async fn record_artifacts(executor: impl PgExecutor<'_>, id: Uuid, artifacts: &StoryArtifacts) -> Result<()> {
    let result = sqlx::query(
        "UPDATE story_executions \
         SET files_created = $1, \
             files_modified = $2, \
             branch_name = $3, \
             commit_sha = $4, \
             pr_url = $5, \
             tests_passing = $6, \
             coverage_achieved = $7 \
         WHERE id = $8",
    )
    .bind(serde_json::json!(artifacts.files_created))
    .bind(serde_json::json!(artifacts.files_modified))
    .bind(&artifacts.branch_name)
    .bind(&artifacts.commit_sha)
    .bind(&artifacts.pr_url)
    .bind(artifacts.tests_passing)
    .bind(artifacts.coverage_achieved)
    .bind(id)
    .execute(executor)
    .await
    .context("failed to record story artifacts")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("story execution {id} not found");
    }

    Ok(())
}

/// Reset a story to its initial state for the RESTART recovery strategy.
///
/// Clears timestamps and counters and returns the story to `pending`
/// with `current_gate` 0.
pub async fn reset_for_restart(executor: impl PgExecutor<'_>, id: Uuid) -> Result<()> {
    let result = sqlx::query(
        "UPDATE story_executions \
         SET status = 'pending', \
             current_gate = 0, \
             retry_count = 0, \
             acceptance_criteria_passed = 0, \
             started_at = NULL, \
             completed_at = NULL, \
             failed_at = NULL, \
             error_message = NULL \
         WHERE id = $1",
    )
    .bind(id)
    .execute(executor)
    .await
    .context("failed to reset story for restart")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("story execution {id} not found");
    }

    Ok(())
}

/// Clear the failed_at marker after a successful recovery.
pub async fn clear_failed_at(executor: impl PgExecutor<'_>, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE story_executions SET failed_at = NULL WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await
        .context("failed to clear failed_at")?;

    Ok(())
}

/// Status counts for a session's stories.
#[derive(Debug, Clone, Default)]
pub struct SessionProgress {
    pub pending: i64,
    pub in_progress: i64,
    pub review: i64,
    pub complete: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

/// Get a summary of story counts by status for a session.
pub async fn get_session_progress(executor: impl PgExecutor<'_>, session_id: Uuid) -> Result<SessionProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM story_executions \
         WHERE session_id = $1 \
         GROUP BY status",
    )
    .bind(session_id)
    .fetch_all(executor)
    .await
    .context("failed to get session progress")?;

    let mut progress = SessionProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "in_progress" => progress.in_progress = *count,
            "review" => progress.review = *count,
            "complete" => progress.complete = *count,
            "failed" => progress.failed = *count,
            "cancelled" => progress.cancelled = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}
