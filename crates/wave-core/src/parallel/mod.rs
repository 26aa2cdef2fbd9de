//! Parallel story execution across isolated worktrees.
//!
//! Stories are partitioned into batches so that no two stories in a
//! batch share a domain (each batch gets at most one worktree per
//! domain), then fanned out to a bounded worker pool. Successful
//! branches are merged into the run's integration branch and every
//! worktree is cleaned up, even after failures.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worktree::{DomainWorktreeManager, MergeOutcome};

/// A story handed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryTask {
    pub story_id: String,
    pub domain: String,
    pub action: String,
    pub payload: serde_json::Value,
}

impl StoryTask {
    pub fn new(story_id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            story_id: story_id.into(),
            domain: domain.into(),
            action: "implement".to_owned(),
            payload: serde_json::Value::Object(Default::default()),
        }
    }
}

/// Result of executing one story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryResult {
    pub story_id: String,
    pub success: bool,
    pub tokens_used: i64,
    pub files_modified: Vec<String>,
    pub error: Option<String>,
    pub duration_seconds: f64,
}

impl StoryResult {
    /// A failure result carrying only an error message.
    pub fn failure(story_id: &str, error: impl Into<String>) -> Self {
        Self {
            story_id: story_id.to_owned(),
            success: false,
            tokens_used: 0,
            files_modified: Vec::new(),
            error: Some(error.into()),
            duration_seconds: 0.0,
        }
    }
}

/// One round of scheduling: what runs now, what waits.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub parallel_batch: Vec<StoryTask>,
    pub waiting: Vec<StoryTask>,
    pub run_id: String,
}

/// Summary of an execution run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatus {
    pub run_id: String,
    pub total_stories: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_tokens: i64,
    pub duration_seconds: f64,
}

/// The agent callback: runs one story inside its worktree.
///
/// Errors (and panics) are caught by the executor and converted into
/// failed results; a crashing agent never takes down the batch.
pub type AgentFn = Arc<dyn Fn(&StoryTask, &Path) -> Result<StoryResult> + Send + Sync>;

/// Default worker pool size.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Executes stories in parallel with domain-conflict avoidance.
pub struct ParallelStoryExecutor {
    worktree_manager: DomainWorktreeManager,
    max_parallel: usize,
    run_id: String,
    results: Mutex<Vec<StoryResult>>,
    merge_outcome: Mutex<Option<MergeOutcome>>,
    started: Mutex<Option<Instant>>,
    finished: Mutex<Option<Instant>>,
}

impl ParallelStoryExecutor {
    /// Build an executor over a repository.
    pub fn new(repo_path: impl Into<PathBuf>, max_parallel: usize) -> Result<Self> {
        let manager = DomainWorktreeManager::new(repo_path, None)?;
        Ok(Self::with_manager(manager, max_parallel))
    }

    /// Build an executor over an existing worktree manager (lets tests
    /// control the worktree base directory).
    pub fn with_manager(worktree_manager: DomainWorktreeManager, max_parallel: usize) -> Self {
        let run_id = Uuid::new_v4().simple().to_string()[..8].to_owned();
        Self {
            worktree_manager,
            max_parallel: max_parallel.max(1),
            run_id,
            results: Mutex::new(Vec::new()),
            merge_outcome: Mutex::new(None),
            started: Mutex::new(None),
            finished: Mutex::new(None),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Outcome of the merge step, once `execute` has run.
    pub fn merge_outcome(&self) -> Option<MergeOutcome> {
        self.merge_outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Partition stories into a domain-conflict-free batch and a
    /// waiting list.
    ///
    /// Greedy and stable: walking the input in order, a story joins the
    /// batch iff its domain is unclaimed and the batch is below
    /// `max_parallel`; otherwise it waits for a later round.
    pub fn plan(&self, stories: &[StoryTask]) -> ExecutionPlan {
        let mut parallel_batch = Vec::new();
        let mut waiting = Vec::new();
        let mut claimed_domains = std::collections::HashSet::new();

        for story in stories {
            if !claimed_domains.contains(&story.domain) && parallel_batch.len() < self.max_parallel
            {
                claimed_domains.insert(story.domain.clone());
                parallel_batch.push(story.clone());
            } else {
                waiting.push(story.clone());
            }
        }

        ExecutionPlan {
            parallel_batch,
            waiting,
            run_id: self.run_id.clone(),
        }
    }

    /// Execute all stories, batch by batch, then merge and clean up.
    pub async fn execute(&self, stories: &[StoryTask], agent_fn: AgentFn) -> Vec<StoryResult> {
        if stories.is_empty() {
            return Vec::new();
        }

        {
            let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
            results.clear();
        }
        *self.started.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        let mut domain_of: HashMap<String, String> = HashMap::new();
        for story in stories {
            domain_of.insert(story.story_id.clone(), story.domain.clone());
        }

        let mut remaining: Vec<StoryTask> = stories.to_vec();
        while !remaining.is_empty() {
            let plan = self.plan(&remaining);
            let batch_results = self.execute_batch(&plan.parallel_batch, &agent_fn).await;
            {
                let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
                results.extend(batch_results);
            }
            remaining = plan.waiting;
        }

        let results = self
            .results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        // Merge only runs when at least one story succeeded. Merge
        // failures are reported through merge_outcome, never re-raised.
        let mut seen = std::collections::HashSet::new();
        let successful_domains: Vec<String> = results
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| domain_of.get(&r.story_id).cloned())
            .filter(|domain| seen.insert(domain.clone()))
            .collect();

        if !successful_domains.is_empty() {
            let outcome = self.merge_completed(&successful_domains);
            *self
                .merge_outcome
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(outcome);
        }

        if let Err(e) = self.worktree_manager.cleanup_run_worktrees(&self.run_id) {
            tracing::warn!(run_id = %self.run_id, error = %e, "worktree cleanup failed");
        }

        *self.finished.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        results
    }

    /// Execution summary.
    pub fn get_status(&self) -> ExecutionStatus {
        let results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.len() - succeeded;
        let total_tokens = results.iter().map(|r| r.tokens_used).sum();

        let started = *self.started.lock().unwrap_or_else(|e| e.into_inner());
        let finished = *self.finished.lock().unwrap_or_else(|e| e.into_inner());
        let duration_seconds = match (started, finished) {
            (Some(s), Some(f)) => f.duration_since(s).as_secs_f64(),
            _ => 0.0,
        };

        ExecutionStatus {
            run_id: self.run_id.clone(),
            total_stories: results.len(),
            succeeded,
            failed,
            total_tokens,
            duration_seconds,
        }
    }

    /// Run one conflict-free batch on the worker pool.
    async fn execute_batch(&self, batch: &[StoryTask], agent_fn: &AgentFn) -> Vec<StoryResult> {
        let mut results = Vec::new();
        let mut handles = Vec::new();

        for story in batch {
            let worktree = match self
                .worktree_manager
                .create_domain_worktree(&story.domain, &self.run_id)
            {
                Ok(worktree) => worktree,
                Err(e) => {
                    tracing::error!(
                        story_id = %story.story_id,
                        domain = %story.domain,
                        error = %e,
                        "worktree creation failed"
                    );
                    results.push(StoryResult::failure(
                        &story.story_id,
                        format!("Failed to create worktree for {}", story.domain),
                    ));
                    continue;
                }
            };

            let story = story.clone();
            let story_id = story.story_id.clone();
            let agent_fn = Arc::clone(agent_fn);
            let handle = tokio::task::spawn_blocking(move || {
                let start = Instant::now();
                let mut result = match agent_fn(&story, &worktree.path) {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!(
                            story_id = %story.story_id,
                            error = %e,
                            "agent returned error"
                        );
                        StoryResult::failure(&story.story_id, e.to_string())
                    }
                };
                result.duration_seconds = start.elapsed().as_secs_f64();
                result
            });
            handles.push((story_id, handle));
        }

        let (story_ids, futures): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        for (story_id, joined) in story_ids.into_iter().zip(join_all(futures).await) {
            match joined {
                Ok(result) => results.push(result),
                Err(join_error) => {
                    // The agent panicked; the batch keeps going.
                    tracing::error!(
                        story_id = %story_id,
                        error = %join_error,
                        "agent crashed"
                    );
                    results.push(StoryResult::failure(
                        &story_id,
                        format!("agent crashed: {join_error}"),
                    ));
                }
            }
        }

        results
    }

    /// Create the integration branch and merge successful domains.
    fn merge_completed(&self, successful_domains: &[String]) -> MergeOutcome {
        if let Err(e) = self.worktree_manager.create_integration_branch(&self.run_id) {
            tracing::error!(run_id = %self.run_id, error = %e, "integration branch failed");
            return MergeOutcome {
                success: false,
                has_conflicts: false,
                message: format!("Merge error: {e}"),
            };
        }

        match self
            .worktree_manager
            .merge_all_domains(&self.run_id, successful_domains)
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(run_id = %self.run_id, error = %e, "merge failed");
                MergeOutcome {
                    success: false,
                    has_conflicts: false,
                    message: format!("Merge error: {e}"),
                }
            }
        }
    }
}
