//! Redis-backed task queue for distributing work to domain agents.
//!
//! Per-domain FIFO lists (LPUSH + BRPOP) carry task ids; the task
//! payload lives in a `wave:task:{id}` hash and the result under
//! `wave:result:{id}`, both with a 24 hour TTL. Completions are
//! announced on the `wave:results` channel so waiters can be
//! signal-driven instead of polling.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channels::{result_key, task_key, task_queue_key};

/// Seconds task and result keys stay alive.
const TASK_TTL_SECS: i64 = 86_400;

/// Channel completion notifications are published on.
pub const RESULTS_CHANNEL: &str = "wave:results";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Timeout,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// The seven domain work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainQueue {
    Pm,
    Cto,
    Fe,
    Be,
    Qa,
    Safety,
    /// Human-in-the-loop escalation queue.
    Human,
}

impl DomainQueue {
    /// All queues, for stats iteration.
    pub const ALL: [DomainQueue; 7] = [
        Self::Pm,
        Self::Cto,
        Self::Fe,
        Self::Be,
        Self::Qa,
        Self::Safety,
        Self::Human,
    ];

    /// The short domain name carried in task payloads.
    pub fn domain(self) -> &'static str {
        match self {
            Self::Pm => "pm",
            Self::Cto => "cto",
            Self::Fe => "fe",
            Self::Be => "be",
            Self::Qa => "qa",
            Self::Safety => "safety",
            Self::Human => "human",
        }
    }

    /// The Redis list key for this queue.
    pub fn key(self) -> String {
        task_queue_key(self.domain())
    }

    /// Map a domain string to its queue. Unknown domains fall back to
    /// the PM queue, which owns triage.
    pub fn for_domain(domain: &str) -> Self {
        match domain.to_lowercase().as_str() {
            "cto" => Self::Cto,
            "fe" => Self::Fe,
            "be" => Self::Be,
            "qa" => Self::Qa,
            "safety" => Self::Safety,
            "human" => Self::Human,
            _ => Self::Pm,
        }
    }
}

impl fmt::Display for DomainQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.domain())
    }
}

// ---------------------------------------------------------------------------

/// A work unit dispatched to a domain agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub task_id: String,
    pub story_id: String,
    pub domain: String,
    /// Action discriminator (plan, review, develop, validate, ...).
    /// The consumer validates the payload schema against this before
    /// invoking the agent function.
    pub action: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub timeout_seconds: u64,
    /// Workflow thread id linking back to the state-machine checkpoint.
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
}

impl AgentTask {
    pub fn new(
        task_id: impl Into<String>,
        story_id: impl Into<String>,
        domain: impl Into<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            story_id: story_id.into(),
            domain: domain.into(),
            action: action.into(),
            payload,
            priority: 5,
            timeout_seconds: 300,
            thread_id: String::new(),
            created_at: Utc::now(),
        }
    }
}

/// Result of an agent executing a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub domain: String,
    pub agent_id: String,
    pub result: serde_json::Value,
    pub duration_seconds: f64,
    /// Constitutional safety score in [0, 1].
    pub safety_score: f64,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    /// Synthetic result produced when a wait exceeds its timeout.
    pub fn timed_out(task_id: &str, timeout: Duration) -> Self {
        Self {
            task_id: task_id.to_owned(),
            status: TaskStatus::Timeout,
            domain: "unknown".to_owned(),
            agent_id: "unknown".to_owned(),
            result: serde_json::Value::Object(Default::default()),
            duration_seconds: 0.0,
            safety_score: 1.0,
            error: Some(format!("Task timed out after {}s", timeout.as_secs())),
            completed_at: Utc::now(),
        }
    }
}

/// Generate a unique task id: `{domain}-{story_id}-{8 hex chars}`.
pub fn create_task_id(domain: &str, story_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{domain}-{story_id}-{}", &suffix[..8])
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

/// Redis-backed task queue.
#[derive(Clone)]
pub struct TaskQueue {
    conn: ConnectionManager,
}

impl TaskQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Add a task to a domain queue.
    ///
    /// Writes the task hash (24 h TTL), pushes the id onto the queue
    /// list, and publishes a `task_enqueued` notification on the
    /// queue's notify channel.
    pub async fn enqueue(&self, queue: DomainQueue, task: &AgentTask) -> Result<()> {
        let key = task_key(&task.task_id);
        let data = serde_json::to_string(task).context("failed to serialize task")?;
        let mut conn = self.conn.clone();

        let fields = [
            ("data", data),
            ("status", TaskStatus::Pending.to_string()),
            ("queue", queue.key()),
            ("enqueued_at", Utc::now().to_rfc3339()),
        ];
        let _: () = conn
            .hset_multiple(&key, &fields)
            .await
            .with_context(|| format!("failed to store task {}", task.task_id))?;
        let _: bool = conn.expire(&key, TASK_TTL_SECS).await?;

        let _: i64 = conn
            .lpush(queue.key(), &task.task_id)
            .await
            .with_context(|| format!("failed to enqueue task {}", task.task_id))?;

        let notification = serde_json::json!({
            "event": "task_enqueued",
            "task_id": task.task_id,
            "story_id": task.story_id,
            "action": task.action,
        });
        let _: i64 = conn
            .publish(format!("{}:notify", queue.key()), notification.to_string())
            .await?;

        tracing::debug!(task_id = %task.task_id, queue = %queue, "task enqueued");
        Ok(())
    }

    /// Pop a task from a queue, blocking up to `timeout`.
    ///
    /// Returns `None` if the timeout elapsed. The task hash is marked
    /// `assigned` on successful pop.
    pub async fn dequeue(
        &self,
        queue: DomainQueue,
        timeout: Duration,
    ) -> Result<Option<AgentTask>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn
            .brpop(queue.key(), timeout.as_secs_f64())
            .await
            .with_context(|| format!("failed to dequeue from {queue}"))?;

        let Some((_, task_id)) = popped else {
            return Ok(None);
        };

        let key = task_key(&task_id);
        let data: Option<String> = conn.hget(&key, "data").await?;
        let Some(data) = data else {
            // Task hash expired between push and pop.
            tracing::warn!(task_id = %task_id, "dequeued task has no stored payload");
            return Ok(None);
        };

        let fields = [
            ("status", TaskStatus::Assigned.to_string()),
            ("assigned_at", Utc::now().to_rfc3339()),
        ];
        let _: () = conn.hset_multiple(&key, &fields).await?;

        let task: AgentTask =
            serde_json::from_str(&data).context("failed to deserialize task payload")?;
        Ok(Some(task))
    }

    /// Mark a task as claimed by a specific agent.
    pub async fn mark_in_progress(&self, task_id: &str, agent_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let fields = [
            ("status", TaskStatus::InProgress.to_string()),
            ("agent_id", agent_id.to_owned()),
            ("started_at", Utc::now().to_rfc3339()),
        ];
        let _: () = conn
            .hset_multiple(task_key(task_id), &fields)
            .await
            .with_context(|| format!("failed to mark task {task_id} in progress"))?;
        Ok(())
    }

    /// Store a task's result and announce completion.
    pub async fn submit_result(&self, result: &TaskResult) -> Result<()> {
        let data = serde_json::to_string(result).context("failed to serialize result")?;
        let mut conn = self.conn.clone();

        let _: () = conn
            .set_ex(
                result_key(&result.task_id),
                data,
                u64::try_from(TASK_TTL_SECS).unwrap_or(86_400),
            )
            .await
            .with_context(|| format!("failed to store result for {}", result.task_id))?;

        let fields = [
            ("status", result.status.to_string()),
            ("completed_at", result.completed_at.to_rfc3339()),
            ("duration", result.duration_seconds.to_string()),
        ];
        let _: () = conn
            .hset_multiple(task_key(&result.task_id), &fields)
            .await?;

        let notification = serde_json::json!({
            "event": "task_completed",
            "task_id": result.task_id,
            "status": result.status,
            "domain": result.domain,
            "agent_id": result.agent_id,
        });
        let _: i64 = conn
            .publish(RESULTS_CHANNEL, notification.to_string())
            .await?;

        tracing::debug!(task_id = %result.task_id, status = %result.status, "result submitted");
        Ok(())
    }

    /// Fetch a completed task's result, if present.
    pub async fn get_result(&self, task_id: &str) -> Result<Option<TaskResult>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(result_key(task_id)).await?;
        match data {
            Some(data) => {
                let result =
                    serde_json::from_str(&data).context("failed to deserialize task result")?;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }

    /// Wait for a task result, polling until the timeout.
    ///
    /// On expiry a synthetic result with status `timeout` is returned
    /// rather than an error, so callers decide how to treat it.
    pub async fn wait_for_result(&self, task_id: &str, timeout: Duration) -> Result<TaskResult> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll_interval = Duration::from_millis(500);

        loop {
            if let Some(result) = self.get_result(task_id).await? {
                return Ok(result);
            }
            if tokio::time::Instant::now() + poll_interval > deadline {
                return Ok(TaskResult::timed_out(task_id, timeout));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Wait for several task results under one shared timeout.
    ///
    /// Tasks still missing at the deadline get synthetic timeout
    /// results.
    pub async fn wait_for_multiple(
        &self,
        task_ids: &[String],
        timeout: Duration,
    ) -> Result<HashMap<String, TaskResult>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll_interval = Duration::from_millis(500);

        let mut results = HashMap::new();
        let mut pending: Vec<&String> = task_ids.iter().collect();

        while !pending.is_empty() && tokio::time::Instant::now() < deadline {
            let mut still_pending = Vec::new();
            for task_id in pending {
                match self.get_result(task_id).await? {
                    Some(result) => {
                        results.insert(task_id.clone(), result);
                    }
                    None => still_pending.push(task_id),
                }
            }
            pending = still_pending;
            if !pending.is_empty() {
                tokio::time::sleep(poll_interval).await;
            }
        }

        for task_id in pending {
            results.insert(task_id.clone(), TaskResult::timed_out(task_id, timeout));
        }
        Ok(results)
    }

    /// Number of pending tasks on a queue.
    pub async fn queue_len(&self, queue: DomainQueue) -> Result<i64> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.llen(queue.key()).await?;
        Ok(len)
    }

    /// Pending task counts for every domain queue.
    pub async fn queue_stats(&self) -> Result<HashMap<DomainQueue, i64>> {
        let mut stats = HashMap::new();
        for queue in DomainQueue::ALL {
            stats.insert(queue, self.queue_len(queue).await?);
        }
        Ok(stats)
    }

    /// Drop all pending task ids from a queue.
    pub async fn clear_queue(&self, queue: DomainQueue) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(queue.key()).await?;
        Ok(())
    }

    /// Delete a task's hash and result keys (used by workflow reset).
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(task_key(task_id)).await?;
        let _: i64 = conn.del(result_key(task_id)).await?;
        Ok(())
    }

    /// Run a long-lived worker loop over one domain queue.
    ///
    /// Blocks on the queue in bounded slices so the cancellation token
    /// is observed at least once per timeout. Handler output becomes a
    /// completed result; a handler error becomes a failed result.
    /// Either way the worker keeps consuming.
    pub async fn consume<F>(
        &self,
        queue: DomainQueue,
        agent_id: &str,
        mut handler: F,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<()>
    where
        F: FnMut(&AgentTask) -> Result<serde_json::Value>,
    {
        tracing::info!(queue = %queue, agent_id = agent_id, "worker loop starting");

        loop {
            if cancel.is_cancelled() {
                tracing::info!(queue = %queue, agent_id = agent_id, "worker loop stopping");
                return Ok(());
            }

            let task = tokio::select! {
                task = self.dequeue(queue, Duration::from_secs(5)) => task?,
                () = cancel.cancelled() => return Ok(()),
            };
            let Some(task) = task else {
                continue;
            };

            self.mark_in_progress(&task.task_id, agent_id).await?;
            let started = tokio::time::Instant::now();

            let result = match handler(&task) {
                Ok(output) => TaskResult {
                    task_id: task.task_id.clone(),
                    status: TaskStatus::Completed,
                    domain: task.domain.clone(),
                    agent_id: agent_id.to_owned(),
                    result: output,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    safety_score: 1.0,
                    error: None,
                    completed_at: Utc::now(),
                },
                Err(e) => {
                    tracing::warn!(
                        task_id = %task.task_id,
                        error = %e,
                        "worker handler failed"
                    );
                    TaskResult {
                        task_id: task.task_id.clone(),
                        status: TaskStatus::Failed,
                        domain: task.domain.clone(),
                        agent_id: agent_id.to_owned(),
                        result: serde_json::Value::Null,
                        duration_seconds: started.elapsed().as_secs_f64(),
                        safety_score: 1.0,
                        error: Some(e.to_string()),
                        completed_at: Utc::now(),
                    }
                }
            };

            self.submit_result(&result).await?;
        }
    }
}
