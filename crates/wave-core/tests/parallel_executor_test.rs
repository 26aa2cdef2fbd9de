//! End-to-end tests for the parallel story executor against real git
//! repositories: four-domain fan-out, same-domain rounds, crash
//! tolerance, and guaranteed worktree cleanup.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;

use wave_core::parallel::{AgentFn, ParallelStoryExecutor, StoryResult, StoryTask};
use wave_core::worktree::DomainWorktreeManager;

/// Create a temporary git repository with an initial commit.
fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    let run = |args: &[&str]| {
        let output = Command::new("git")
            .args(args)
            .current_dir(&repo_path)
            .output()
            .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    };

    run(&["init", "-b", "main"]);
    run(&["config", "user.email", "test@wave.dev"]);
    run(&["config", "user.name", "Wave Test"]);
    std::fs::write(repo_path.join("README.md"), "# Test repo\n").expect("write failed");
    run(&["add", "."]);
    run(&["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

fn executor(repo_path: &Path, base: &TempDir, max_parallel: usize) -> ParallelStoryExecutor {
    let manager = DomainWorktreeManager::new(repo_path, Some(base.path().to_path_buf()))
        .expect("manager should build");
    ParallelStoryExecutor::with_manager(manager, max_parallel)
}

/// An agent that writes and commits one file named after its story.
fn file_writing_agent() -> AgentFn {
    Arc::new(|story: &StoryTask, worktree: &Path| {
        let file_name = format!("{}.txt", story.story_id.to_lowercase());
        std::fs::write(worktree.join(&file_name), format!("{} output\n", story.story_id))?;

        let run = |args: &[&str]| -> anyhow::Result<()> {
            let output = Command::new("git").args(args).current_dir(worktree).output()?;
            anyhow::ensure!(
                output.status.success(),
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
            Ok(())
        };
        run(&["add", "-A"])?;
        run(&["commit", "-m", &format!("{}: add {file_name}", story.story_id)])?;

        Ok(StoryResult {
            story_id: story.story_id.clone(),
            success: true,
            tokens_used: 1000,
            files_modified: vec![file_name],
            error: None,
            duration_seconds: 0.0,
        })
    })
}

#[tokio::test]
async fn four_domains_execute_merge_and_clean_up() {
    let (_dir, repo_path) = create_temp_repo();
    let base = TempDir::new().unwrap();
    let executor = executor(&repo_path, &base, 4);

    let stories = vec![
        StoryTask::new("AUTH-001", "auth"),
        StoryTask::new("BOOK-001", "booking"),
        StoryTask::new("PAY-001", "payment"),
        StoryTask::new("FE-001", "frontend"),
    ];

    // All four domains fit in one batch.
    let plan = executor.plan(&stories);
    assert_eq!(plan.parallel_batch.len(), 4);
    assert!(plan.waiting.is_empty());

    let results = executor.execute(&stories, file_writing_agent()).await;

    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.success));

    let status = executor.get_status();
    assert_eq!(status.total_stories, 4);
    assert_eq!(status.succeeded, 4);
    assert_eq!(status.failed, 0);
    assert_eq!(status.total_tokens, 4000);

    // All four branches merged into the integration branch.
    let merge = executor.merge_outcome().expect("merge ran");
    assert!(merge.success);
    assert!(!merge.has_conflicts);
    for file in ["auth-001.txt", "book-001.txt", "pay-001.txt", "fe-001.txt"] {
        assert!(repo_path.join(file).exists(), "{file} should be merged");
    }

    // Every run worktree was destroyed.
    let manager = DomainWorktreeManager::new(&repo_path, Some(base.path().to_path_buf())).unwrap();
    assert!(
        manager
            .list_run_worktrees(executor.run_id())
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn same_domain_stories_run_in_successive_rounds() {
    let (_dir, repo_path) = create_temp_repo();
    let base = TempDir::new().unwrap();
    let executor = executor(&repo_path, &base, 4);

    let stories = vec![
        StoryTask::new("S-A", "auth"),
        StoryTask::new("S-B", "auth"),
        StoryTask::new("S-C", "booking"),
        StoryTask::new("S-D", "payment"),
    ];

    // First round: S-A, S-C, S-D; S-B waits on the auth domain.
    let plan = executor.plan(&stories);
    let batch_ids: Vec<&str> = plan
        .parallel_batch
        .iter()
        .map(|s| s.story_id.as_str())
        .collect();
    assert_eq!(batch_ids, vec!["S-A", "S-C", "S-D"]);
    assert_eq!(plan.waiting.len(), 1);

    let results = executor.execute(&stories, file_writing_agent()).await;
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.success));

    // Both auth stories landed, in order, on the same domain branch.
    assert!(repo_path.join("s-a.txt").exists());
    assert!(repo_path.join("s-b.txt").exists());
}

#[tokio::test]
async fn failing_agent_does_not_cancel_the_batch() {
    let (_dir, repo_path) = create_temp_repo();
    let base = TempDir::new().unwrap();
    let executor = executor(&repo_path, &base, 4);

    let stories = vec![
        StoryTask::new("GOOD-001", "auth"),
        StoryTask::new("BAD-001", "booking"),
    ];

    let good_agent = file_writing_agent();
    let agent: AgentFn = Arc::new(move |story, worktree| {
        if story.story_id.starts_with("BAD") {
            anyhow::bail!("model returned garbage");
        }
        good_agent(story, worktree)
    });

    let results = executor.execute(&stories, agent).await;
    assert_eq!(results.len(), 2);

    let good = results.iter().find(|r| r.story_id == "GOOD-001").unwrap();
    assert!(good.success);

    let bad = results.iter().find(|r| r.story_id == "BAD-001").unwrap();
    assert!(!bad.success);
    assert!(bad.error.as_deref().unwrap().contains("model returned garbage"));

    // The successful story still merged.
    let merge = executor.merge_outcome().expect("merge ran");
    assert!(merge.success);
    assert!(repo_path.join("good-001.txt").exists());
}

#[tokio::test]
async fn panicking_agent_becomes_a_failed_result() {
    let (_dir, repo_path) = create_temp_repo();
    let base = TempDir::new().unwrap();
    let executor = executor(&repo_path, &base, 4);

    let stories = vec![StoryTask::new("PANIC-001", "auth")];
    let agent: AgentFn = Arc::new(|_, _| panic!("agent exploded"));

    let results = executor.execute(&stories, agent).await;
    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert!(results[0].error.as_deref().unwrap().contains("crashed"));

    // No merge (nothing succeeded), worktrees still cleaned up.
    assert!(executor.merge_outcome().is_none());
    let manager = DomainWorktreeManager::new(&repo_path, Some(base.path().to_path_buf())).unwrap();
    assert!(
        manager
            .list_run_worktrees(executor.run_id())
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn empty_story_list_is_a_noop() {
    let (_dir, repo_path) = create_temp_repo();
    let base = TempDir::new().unwrap();
    let executor = executor(&repo_path, &base, 4);

    let results = executor.execute(&[], file_writing_agent()).await;
    assert!(results.is_empty());
    assert!(executor.merge_outcome().is_none());
}
