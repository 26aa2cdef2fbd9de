//! Supervisor: domain-typed task dispatch over the queue.
//!
//! The supervisor is the bridge between the workflow graph and the
//! distributed agent workers: it shapes payloads per (domain, action),
//! enqueues them, and waits for results to feed back into graph state.

use std::collections::HashMap;
use std::env;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;

use crate::queue::{AgentTask, DomainQueue, TaskQueue, TaskResult, create_task_id};

/// Default PM wait in seconds.
pub const PM_TIMEOUT_DEFAULT: u64 = 300;
/// Lower clamp for `WAVE_PM_TIMEOUT`.
pub const PM_TIMEOUT_MIN: u64 = 30;
/// Upper clamp for `WAVE_PM_TIMEOUT`.
pub const PM_TIMEOUT_MAX: u64 = 600;

/// Resolve the PM timeout from `WAVE_PM_TIMEOUT`, clamped to
/// [30, 600] seconds. Unparsable values fall back to the default.
pub fn pm_timeout() -> Duration {
    let raw = env::var("WAVE_PM_TIMEOUT")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(PM_TIMEOUT_DEFAULT);
    Duration::from_secs(raw.clamp(PM_TIMEOUT_MIN, PM_TIMEOUT_MAX))
}

/// Task ids for a parallel FE + BE development dispatch.
#[derive(Debug, Clone)]
pub struct ParallelDevTasks {
    pub fe_task_id: String,
    pub be_task_id: String,
}

/// Results of a parallel FE + BE development dispatch.
#[derive(Debug, Clone)]
pub struct ParallelDevResults {
    pub fe: TaskResult,
    pub be: TaskResult,
}

/// Distributes tasks to domain agent workers and collects results.
pub struct Supervisor {
    queue: TaskQueue,
    active: Mutex<HashMap<String, AgentTask>>,
}

impl Supervisor {
    pub fn new(queue: TaskQueue) -> Self {
        Self {
            queue,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Task ids dispatched and not yet waited on.
    pub fn active_task_ids(&self) -> Vec<String> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.keys().cloned().collect()
    }

    async fn dispatch(
        &self,
        queue: DomainQueue,
        story_id: &str,
        action: &str,
        payload: serde_json::Value,
        thread_id: &str,
    ) -> Result<String> {
        let mut task = AgentTask::new(
            create_task_id(queue.domain(), story_id),
            story_id,
            queue.domain(),
            action,
            payload,
        );
        task.thread_id = thread_id.to_owned();

        tracing::info!(
            task_id = %task.task_id,
            queue = %queue,
            action = action,
            "dispatching task"
        );
        self.queue.enqueue(queue, &task).await?;

        let task_id = task.task_id.clone();
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.insert(task_id.clone(), task);
        Ok(task_id)
    }

    /// Dispatch a planning task to the PM agent.
    pub async fn dispatch_to_pm(
        &self,
        story_id: &str,
        requirements: &str,
        project_path: &str,
        thread_id: &str,
    ) -> Result<String> {
        self.dispatch(
            DomainQueue::Pm,
            story_id,
            "plan",
            serde_json::json!({
                "requirements": requirements,
                "project_path": project_path,
            }),
            thread_id,
        )
        .await
    }

    /// Dispatch an architecture review to the CTO agent.
    pub async fn dispatch_to_cto(
        &self,
        story_id: &str,
        code: &str,
        files: &[String],
        plan: serde_json::Value,
        thread_id: &str,
    ) -> Result<String> {
        self.dispatch(
            DomainQueue::Cto,
            story_id,
            "review",
            serde_json::json!({
                "code": code,
                "files": files,
                "plan": plan,
            }),
            thread_id,
        )
        .await
    }

    /// Dispatch frontend development to the FE agent.
    pub async fn dispatch_to_fe(
        &self,
        story_id: &str,
        files: &[String],
        requirements: &str,
        project_path: &str,
        thread_id: &str,
    ) -> Result<String> {
        self.dispatch(
            DomainQueue::Fe,
            story_id,
            "develop",
            serde_json::json!({
                "files": files,
                "requirements": requirements,
                "project_path": project_path,
            }),
            thread_id,
        )
        .await
    }

    /// Dispatch backend development to the BE agent.
    pub async fn dispatch_to_be(
        &self,
        story_id: &str,
        files: &[String],
        requirements: &str,
        project_path: &str,
        thread_id: &str,
    ) -> Result<String> {
        self.dispatch(
            DomainQueue::Be,
            story_id,
            "develop",
            serde_json::json!({
                "files": files,
                "requirements": requirements,
                "project_path": project_path,
            }),
            thread_id,
        )
        .await
    }

    /// Dispatch validation to the QA agent.
    pub async fn dispatch_to_qa(
        &self,
        story_id: &str,
        files: &[String],
        acceptance_criteria: &[String],
        thread_id: &str,
    ) -> Result<String> {
        self.dispatch(
            DomainQueue::Qa,
            story_id,
            "validate",
            serde_json::json!({
                "files": files,
                "acceptance_criteria": acceptance_criteria,
            }),
            thread_id,
        )
        .await
    }

    /// Dispatch FE and BE development simultaneously.
    pub async fn dispatch_parallel_dev(
        &self,
        story_id: &str,
        fe_files: &[String],
        be_files: &[String],
        requirements: &str,
        project_path: &str,
        thread_id: &str,
    ) -> Result<ParallelDevTasks> {
        let fe_task_id = self
            .dispatch_to_fe(story_id, fe_files, requirements, project_path, thread_id)
            .await?;
        let be_task_id = self
            .dispatch_to_be(story_id, be_files, requirements, project_path, thread_id)
            .await?;
        Ok(ParallelDevTasks {
            fe_task_id,
            be_task_id,
        })
    }

    /// Wait for a single task result.
    ///
    /// Timeout yields a synthetic `timeout` result, never an error.
    pub async fn wait_for_result(&self, task_id: &str, timeout: Duration) -> Result<TaskResult> {
        let result = self.queue.wait_for_result(task_id, timeout).await?;
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(task_id);
        Ok(result)
    }

    /// Wait for both halves of a parallel dev dispatch under one
    /// shared timeout.
    pub async fn wait_for_parallel_dev(
        &self,
        tasks: &ParallelDevTasks,
        timeout: Duration,
    ) -> Result<ParallelDevResults> {
        let ids = vec![tasks.fe_task_id.clone(), tasks.be_task_id.clone()];
        let mut results = self.queue.wait_for_multiple(&ids, timeout).await?;

        let fe = results
            .remove(&tasks.fe_task_id)
            .unwrap_or_else(|| TaskResult::timed_out(&tasks.fe_task_id, timeout));
        let be = results
            .remove(&tasks.be_task_id)
            .unwrap_or_else(|| TaskResult::timed_out(&tasks.be_task_id, timeout));

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&tasks.fe_task_id);
        active.remove(&tasks.be_task_id);

        Ok(ParallelDevResults { fe, be })
    }
}
