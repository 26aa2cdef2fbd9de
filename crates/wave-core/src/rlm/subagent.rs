//! Subagent spawning with depth limits and model tiering.
//!
//! Parent agents delegate subtasks to child agents. Each child runs at
//! `parent_depth + 1` (capped, default 3), on a model tier picked by
//! task complexity, with its own copied context files so siblings never
//! share mutable state.

use std::collections::HashMap;
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default maximum delegation depth.
pub const DEFAULT_MAX_DEPTH: usize = 3;

/// Task complexity, which selects the model tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    /// The model tier for this complexity.
    pub fn model_tier(self) -> &'static str {
        match self {
            Self::Simple => "haiku",
            Self::Medium => "sonnet",
            Self::Complex => "opus",
        }
    }
}

/// Errors from spawning a subagent.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("subagent depth {depth} exceeds max depth {max_depth}")]
    DepthExceeded { depth: usize, max_depth: usize },
}

/// The work function a subagent runs over its isolated context.
pub type TaskFn =
    Box<dyn FnOnce(&HashMap<String, String>, &str) -> Result<serde_json::Value> + Send>;

/// Result of a completed subagent.
#[derive(Debug, Clone, Serialize)]
pub struct SubagentOutcome {
    pub subagent_id: String,
    pub success: bool,
    pub output: serde_json::Value,
    pub tokens_used: i64,
    pub files_modified: Vec<String>,
    pub error: Option<String>,
    pub duration_seconds: f64,
}

/// A spawned child agent.
pub struct Subagent {
    pub subagent_id: String,
    pub task: String,
    pub model_tier: &'static str,
    pub depth: usize,
    pub parent_story_id: String,
    /// Copied, not shared: mutations here never leak to the parent.
    context_files: HashMap<String, String>,
    task_fn: Option<TaskFn>,
    outcome: Option<SubagentOutcome>,
}

impl Subagent {
    /// The isolated context this subagent sees.
    pub fn context_files(&self) -> &HashMap<String, String> {
        &self.context_files
    }

    /// The outcome, once [`Subagent::run`] has completed.
    pub fn outcome(&self) -> Option<&SubagentOutcome> {
        self.outcome.as_ref()
    }

    /// Execute the subagent's task function over its context.
    ///
    /// Task errors are captured in the outcome rather than propagated;
    /// a subagent failure is data for the parent, not a crash.
    pub fn run(&mut self) -> SubagentOutcome {
        let start = Instant::now();
        let result = match self.task_fn.take() {
            Some(task_fn) => task_fn(&self.context_files, &self.task),
            None => Err(anyhow::anyhow!("subagent has already run")),
        };

        let outcome = match result {
            Ok(output) => {
                let tokens_used = output
                    .get("tokens_used")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or(0);
                let files_modified = output
                    .get("files_modified")
                    .and_then(serde_json::Value::as_array)
                    .map(|files| {
                        files
                            .iter()
                            .filter_map(|f| f.as_str().map(str::to_owned))
                            .collect()
                    })
                    .unwrap_or_default();
                SubagentOutcome {
                    subagent_id: self.subagent_id.clone(),
                    success: true,
                    output,
                    tokens_used,
                    files_modified,
                    error: None,
                    duration_seconds: start.elapsed().as_secs_f64(),
                }
            }
            Err(e) => SubagentOutcome {
                subagent_id: self.subagent_id.clone(),
                success: false,
                output: serde_json::Value::Null,
                tokens_used: 0,
                files_modified: Vec::new(),
                error: Some(e.to_string()),
                duration_seconds: start.elapsed().as_secs_f64(),
            },
        };

        self.outcome = Some(outcome.clone());
        outcome
    }
}

/// Spawns and tracks subagents for one parent.
pub struct SubagentSpawner {
    parent_story_id: String,
    parent_domain: String,
    max_depth: usize,
    current_depth: usize,
    subagents: Vec<Subagent>,
}

impl SubagentSpawner {
    pub fn new(
        parent_story_id: impl Into<String>,
        parent_domain: impl Into<String>,
    ) -> Self {
        Self {
            parent_story_id: parent_story_id.into(),
            parent_domain: parent_domain.into(),
            max_depth: DEFAULT_MAX_DEPTH,
            current_depth: 0,
            subagents: Vec::new(),
        }
    }

    pub fn with_depth(mut self, max_depth: usize, current_depth: usize) -> Self {
        self.max_depth = max_depth;
        self.current_depth = current_depth;
        self
    }

    pub fn parent_domain(&self) -> &str {
        &self.parent_domain
    }

    /// Spawn a subagent for a subtask.
    ///
    /// Fails when the child would exceed the depth limit. Context files
    /// are cloned into the child.
    pub fn spawn(
        &mut self,
        task: impl Into<String>,
        context_files: &HashMap<String, String>,
        task_fn: TaskFn,
        complexity: Complexity,
    ) -> Result<&mut Subagent, SpawnError> {
        let depth = self.current_depth + 1;
        if depth > self.max_depth {
            return Err(SpawnError::DepthExceeded {
                depth,
                max_depth: self.max_depth,
            });
        }

        let subagent_id = format!("sa-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let model_tier = complexity.model_tier();

        tracing::info!(
            subagent_id = %subagent_id,
            depth = depth,
            model = model_tier,
            story_id = %self.parent_story_id,
            "spawned subagent"
        );

        self.subagents.push(Subagent {
            subagent_id,
            task: task.into(),
            model_tier,
            depth,
            parent_story_id: self.parent_story_id.clone(),
            context_files: context_files.clone(),
            task_fn: Some(task_fn),
            outcome: None,
        });

        let index = self.subagents.len() - 1;
        Ok(&mut self.subagents[index])
    }

    /// A spawner for a child that needs its own children, one level
    /// deeper.
    pub fn child_spawner(&self) -> Self {
        Self {
            parent_story_id: self.parent_story_id.clone(),
            parent_domain: self.parent_domain.clone(),
            max_depth: self.max_depth,
            current_depth: self.current_depth + 1,
            subagents: Vec::new(),
        }
    }

    pub fn spawned(&self) -> &[Subagent] {
        &self.subagents
    }

    /// Total tokens used across completed subagents.
    pub fn total_tokens_used(&self) -> i64 {
        self.subagents
            .iter()
            .filter_map(|s| s.outcome())
            .map(|o| o.tokens_used)
            .sum()
    }
}

/// Aggregates child outcomes into a parent-facing summary.
#[derive(Debug, Default)]
pub struct ResultCollector {
    outcomes: Vec<SubagentOutcome>,
}

/// Summary over collected subagent outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct CollectedResults {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_tokens: i64,
    pub files_modified: Vec<String>,
    pub errors: Vec<String>,
    pub outputs: Vec<serde_json::Value>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect(&mut self, outcome: SubagentOutcome) {
        self.outcomes.push(outcome);
    }

    /// Roll up everything collected so far.
    pub fn summarize(&self) -> CollectedResults {
        let succeeded = self.outcomes.iter().filter(|o| o.success).count();
        let mut files_modified: Vec<String> = self
            .outcomes
            .iter()
            .flat_map(|o| o.files_modified.iter().cloned())
            .collect();
        files_modified.sort();
        files_modified.dedup();

        CollectedResults {
            total: self.outcomes.len(),
            succeeded,
            failed: self.outcomes.len() - succeeded,
            total_tokens: self.outcomes.iter().map(|o| o.tokens_used).sum(),
            files_modified,
            errors: self
                .outcomes
                .iter()
                .filter_map(|o| o.error.clone())
                .collect(),
            outputs: self
                .outcomes
                .iter()
                .filter(|o| o.success)
                .map(|o| o.output.clone())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> HashMap<String, String> {
        HashMap::from([("src/a.ts".to_owned(), "export const a = 1;\n".to_owned())])
    }

    #[test]
    fn spawn_assigns_depth_and_tier() {
        let mut spawner = SubagentSpawner::new("AUTH-001", "auth");
        let subagent = spawner
            .spawn(
                "extract validation helpers",
                &context(),
                Box::new(|_, _| Ok(serde_json::json!({"tokens_used": 10}))),
                Complexity::Simple,
            )
            .expect("spawn should succeed");

        assert_eq!(subagent.depth, 1);
        assert_eq!(subagent.model_tier, "haiku");
        assert!(subagent.subagent_id.starts_with("sa-"));
    }

    #[test]
    fn complexity_maps_to_model_tier() {
        assert_eq!(Complexity::Simple.model_tier(), "haiku");
        assert_eq!(Complexity::Medium.model_tier(), "sonnet");
        assert_eq!(Complexity::Complex.model_tier(), "opus");
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut spawner = SubagentSpawner::new("AUTH-001", "auth").with_depth(3, 3);
        let result = spawner.spawn(
            "too deep",
            &context(),
            Box::new(|_, _| Ok(serde_json::Value::Null)),
            Complexity::Medium,
        );
        assert!(matches!(result, Err(SpawnError::DepthExceeded { .. })));
    }

    #[test]
    fn child_spawner_is_one_deeper() {
        let spawner = SubagentSpawner::new("AUTH-001", "auth");
        let mut child = spawner.child_spawner();
        let grandchild = child
            .spawn(
                "nested",
                &context(),
                Box::new(|_, _| Ok(serde_json::Value::Null)),
                Complexity::Medium,
            )
            .expect("depth 2 is within the limit");
        assert_eq!(grandchild.depth, 2);
    }

    #[test]
    fn context_is_copied_not_shared() {
        let mut spawner = SubagentSpawner::new("AUTH-001", "auth");
        let mut original = context();

        let subagent = spawner
            .spawn(
                "isolated",
                &original,
                Box::new(|_, _| Ok(serde_json::Value::Null)),
                Complexity::Medium,
            )
            .unwrap();

        original.insert("src/b.ts".to_owned(), "later".to_owned());
        assert_eq!(subagent.context_files().len(), 1);
    }

    #[test]
    fn run_captures_success_output() {
        let mut spawner = SubagentSpawner::new("AUTH-001", "auth");
        let subagent = spawner
            .spawn(
                "count files",
                &context(),
                Box::new(|files, _| {
                    Ok(serde_json::json!({
                        "file_count": files.len(),
                        "tokens_used": 42,
                        "files_modified": ["src/a.ts"],
                    }))
                }),
                Complexity::Medium,
            )
            .unwrap();

        let outcome = subagent.run();
        assert!(outcome.success);
        assert_eq!(outcome.tokens_used, 42);
        assert_eq!(outcome.files_modified, vec!["src/a.ts"]);
        assert_eq!(outcome.output["file_count"], 1);
    }

    #[test]
    fn run_captures_failure() {
        let mut spawner = SubagentSpawner::new("AUTH-001", "auth");
        let subagent = spawner
            .spawn(
                "explode",
                &context(),
                Box::new(|_, _| anyhow::bail!("model refused")),
                Complexity::Complex,
            )
            .unwrap();

        let outcome = subagent.run();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("model refused"));
    }

    #[test]
    fn spawner_totals_tokens() {
        let mut spawner = SubagentSpawner::new("AUTH-001", "auth");
        for tokens in [10, 20] {
            let subagent = spawner
                .spawn(
                    "work",
                    &context(),
                    Box::new(move |_, _| Ok(serde_json::json!({"tokens_used": tokens}))),
                    Complexity::Simple,
                )
                .unwrap();
            subagent.run();
        }
        assert_eq!(spawner.total_tokens_used(), 30);
    }

    #[test]
    fn collector_summarizes() {
        let mut spawner = SubagentSpawner::new("AUTH-001", "auth");
        let mut collector = ResultCollector::new();

        let ok = spawner
            .spawn(
                "ok",
                &context(),
                Box::new(|_, _| {
                    Ok(serde_json::json!({"tokens_used": 5, "files_modified": ["a.ts"]}))
                }),
                Complexity::Simple,
            )
            .unwrap();
        collector.collect(ok.run());

        let bad = spawner
            .spawn(
                "bad",
                &context(),
                Box::new(|_, _| anyhow::bail!("nope")),
                Complexity::Simple,
            )
            .unwrap();
        collector.collect(bad.run());

        let summary = collector.summarize();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total_tokens, 5);
        assert_eq!(summary.files_modified, vec!["a.ts"]);
        assert_eq!(summary.errors, vec!["nope"]);
    }
}
