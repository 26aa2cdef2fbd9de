//! Git worktree management for parallel story isolation.
//!
//! Each domain agent in a run gets its own worktree on a dedicated
//! branch, sharing the object store of the main repository but with an
//! independent working directory and index. Successful domain branches
//! are merged into a per-run integration branch before the final merge
//! to the base branch.
//!
//! Git does not support concurrent worktree operations on the same
//! repository (it uses a lock file on the shared object store), so all
//! mutating git operations are serialised through an internal mutex.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors that can occur during worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The main repository path does not exist or is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command failed to execute.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The worktree path already exists but is associated with a different
    /// branch than expected.
    #[error("worktree path exists but has unexpected branch: expected {expected}, found {found}")]
    BranchMismatch { expected: String, found: String },

    /// Failed to parse porcelain output from `git worktree list`.
    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// Outcome of merging the run's domain branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub success: bool,
    /// True when at least one branch hit a conflict. Conflicted merges
    /// are aborted, never auto-resolved.
    pub has_conflicts: bool,
    pub message: String,
}

/// A worktree owned by one (run, domain) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainWorktree {
    /// Absolute path to the worktree directory.
    pub path: PathBuf,
    /// Branch checked out in this worktree.
    pub branch: String,
    /// HEAD commit SHA at creation time.
    pub head_commit: String,
    pub domain: String,
    pub run_id: String,
}

/// Raw entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WorktreeInfo {
    path: PathBuf,
    branch: Option<String>,
    head_commit: String,
}

/// Manages per-run, per-domain git worktrees.
#[derive(Debug)]
pub struct DomainWorktreeManager {
    /// Path to the main git repository.
    repo_path: PathBuf,
    /// Base directory under which worktrees are created.
    worktree_base: PathBuf,
    /// Serialises git operations to avoid lock-file contention.
    git_lock: Arc<Mutex<()>>,
}

impl Clone for DomainWorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_base: self.worktree_base.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl DomainWorktreeManager {
    /// Create a manager for a repository.
    ///
    /// `worktree_base` defaults to `../<repo-name>-wave-worktrees/`
    /// relative to `repo_path`.
    ///
    /// # Errors
    ///
    /// Returns [`WorktreeError::NotAGitRepo`] if `repo_path` is not a
    /// git repository.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .arg("rev-parse")
            .arg("--git-dir")
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let worktree_base = worktree_base.unwrap_or_else(|| {
            let repo_name = repo_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("repo");
            let base_name = format!("{repo_name}-wave-worktrees");
            repo_path
                .parent()
                .map(|p| p.join(&base_name))
                .unwrap_or_else(|| PathBuf::from(base_name))
        });

        Ok(Self {
            repo_path,
            worktree_base,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Return the base directory where worktrees are created.
    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    /// Return the main repository path.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Branch name for a (run, domain) pair: `run-{run_id}/{domain}`.
    pub fn domain_branch(run_id: &str, domain: &str) -> String {
        format!("run-{run_id}/{domain}")
    }

    /// Integration branch for a run: `integration/run-{run_id}`.
    pub fn integration_branch(run_id: &str) -> String {
        format!("integration/run-{run_id}")
    }

    /// Create (or return the existing) worktree for a domain in a run.
    ///
    /// The worktree lives at `worktree_base/run-{run}--{domain}` on
    /// branch `run-{run}/{domain}`. Idempotent: an existing worktree on
    /// the expected branch is returned as-is; a partial directory left
    /// by a failed creation is cleaned up.
    pub fn create_domain_worktree(
        &self,
        domain: &str,
        run_id: &str,
    ) -> Result<DomainWorktree, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let branch = Self::domain_branch(run_id, domain);
        let dir_name = branch.replace('/', "--");
        let worktree_path = self.worktree_base.join(&dir_name);

        if let Ok(existing) = self.find_worktree_by_path(&worktree_path) {
            if let Some(ref existing_branch) = existing.branch {
                if *existing_branch == branch {
                    tracing::info!(
                        path = %worktree_path.display(),
                        branch = %branch,
                        "worktree already exists, returning existing"
                    );
                    return Ok(DomainWorktree {
                        path: existing.path,
                        branch,
                        head_commit: existing.head_commit,
                        domain: domain.to_owned(),
                        run_id: run_id.to_owned(),
                    });
                }
                return Err(WorktreeError::BranchMismatch {
                    expected: branch,
                    found: existing_branch.clone(),
                });
            }
        }

        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| {
                WorktreeError::GitCommand {
                    message: format!(
                        "failed to create worktree base directory: {}",
                        self.worktree_base.display()
                    ),
                    source: e,
                }
            })?;
        }

        // If the branch survives from an earlier attempt, check it out
        // instead of creating it again.
        let branch_exists = self.branch_exists_locked(&branch)?;

        let output = if branch_exists {
            Command::new("git")
                .args(["worktree", "add"])
                .arg(&worktree_path)
                .arg(&branch)
                .current_dir(&self.repo_path)
                .output()
                .map_err(|e| WorktreeError::GitCommand {
                    message: "failed to run git worktree add".into(),
                    source: e,
                })?
        } else {
            Command::new("git")
                .args(["worktree", "add", "-b"])
                .arg(&branch)
                .arg(&worktree_path)
                .current_dir(&self.repo_path)
                .output()
                .map_err(|e| WorktreeError::GitCommand {
                    message: "failed to run git worktree add -b".into(),
                    source: e,
                })?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(&worktree_path);
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let info = self.find_worktree_by_path(&worktree_path)?;
        Ok(DomainWorktree {
            path: info.path,
            branch,
            head_commit: info.head_commit,
            domain: domain.to_owned(),
            run_id: run_id.to_owned(),
        })
    }

    /// List the active worktrees belonging to a run.
    pub fn list_run_worktrees(&self, run_id: &str) -> Result<Vec<DomainWorktree>, WorktreeError> {
        let prefix = format!("run-{run_id}/");
        let worktrees = self.list_worktrees()?;

        Ok(worktrees
            .into_iter()
            .filter_map(|wt| {
                let branch = wt.branch?;
                let domain = branch.strip_prefix(&prefix)?.to_owned();
                Some(DomainWorktree {
                    path: wt.path,
                    branch: branch.clone(),
                    head_commit: wt.head_commit,
                    domain,
                    run_id: run_id.to_owned(),
                })
            })
            .collect())
    }

    /// Forcibly remove every worktree belonging to a run.
    ///
    /// Runs on every exit path, so individual removal failures are
    /// logged and swallowed; the final prune drops stale registrations.
    pub fn cleanup_run_worktrees(&self, run_id: &str) -> Result<usize, WorktreeError> {
        let worktrees = self.list_run_worktrees(run_id)?;
        let mut removed = 0;

        for wt in &worktrees {
            match self.remove_worktree(&wt.path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(
                        path = %wt.path.display(),
                        error = %e,
                        "failed to remove run worktree"
                    );
                }
            }
        }

        let _ = self.cleanup_stale();
        Ok(removed)
    }

    /// Remove a worktree by its path.
    ///
    /// Removes the directory and unregisters it from git. A worktree
    /// that does not exist is a no-op (idempotent).
    pub fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.find_worktree_by_path(path).is_err() {
            if path.exists() {
                tracing::warn!(
                    path = %path.display(),
                    "directory exists but not registered as worktree, removing"
                );
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Create the integration branch for a run off the current base
    /// branch and check it out. Idempotent: an existing integration
    /// branch is checked out as-is.
    pub fn create_integration_branch(&self, run_id: &str) -> Result<String, WorktreeError> {
        let branch = Self::integration_branch(run_id);

        if self.branch_exists(&branch)? {
            self.checkout(&branch)?;
            return Ok(branch);
        }

        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let output = Command::new("git")
            .args(["checkout", "-b", &branch])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git checkout -b".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "checkout -b".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(branch)
    }

    /// Merge each successful domain's branch into the run's integration
    /// branch, sequentially, in the order given.
    ///
    /// A conflicted merge is aborted and marks the outcome
    /// `has_conflicts`; remaining branches are still attempted so the
    /// caller sees the full picture.
    pub fn merge_all_domains(
        &self,
        run_id: &str,
        successful_domains: &[String],
    ) -> Result<MergeOutcome, WorktreeError> {
        let integration = Self::integration_branch(run_id);
        self.checkout(&integration)?;

        let mut merged = Vec::new();
        let mut conflicted = Vec::new();

        for domain in successful_domains {
            let branch = Self::domain_branch(run_id, domain);
            match self.merge_branch(&branch)? {
                BranchMerge::Success => merged.push(domain.clone()),
                BranchMerge::Conflict { details } => {
                    tracing::warn!(
                        branch = %branch,
                        details = %details,
                        "merge conflict, branch left unmerged"
                    );
                    conflicted.push(domain.clone());
                }
            }
        }

        let has_conflicts = !conflicted.is_empty();
        let message = if has_conflicts {
            format!(
                "merged {} domain(s), conflicts in: {}",
                merged.len(),
                conflicted.join(", ")
            )
        } else {
            format!("merged {} domain(s) into {integration}", merged.len())
        };

        Ok(MergeOutcome {
            success: !has_conflicts,
            has_conflicts,
            message,
        })
    }

    /// Merge a branch into the currently checked-out branch with
    /// `--no-ff`. Conflicts abort the merge and are reported, not
    /// raised.
    fn merge_branch(&self, branch_name: &str) -> Result<BranchMerge, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["merge", "--no-ff", branch_name])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git merge".into(),
                source: e,
            })?;

        if output.status.success() {
            return Ok(BranchMerge::Success);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        if stderr.contains("CONFLICT")
            || stdout.contains("CONFLICT")
            || stderr.contains("Automatic merge failed")
            || stdout.contains("Automatic merge failed")
        {
            let _ = Command::new("git")
                .args(["merge", "--abort"])
                .current_dir(&self.repo_path)
                .output();

            return Ok(BranchMerge::Conflict {
                details: format!("{stdout}\n{stderr}").trim().to_string(),
            });
        }

        Err(WorktreeError::GitExit {
            command: "merge".into(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        })
    }

    /// Checkout a branch in the main repository.
    pub fn checkout(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["checkout", branch_name])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git checkout".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "checkout".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Check whether a branch exists in the repository.
    pub fn branch_exists(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.branch_exists_locked(branch_name)
    }

    fn branch_exists_locked(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch_name}"))
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;

        Ok(output.status.success())
    }

    /// Delete a local branch (force, since run branches merge --no-ff).
    /// Idempotent: a missing branch is not an error.
    pub fn delete_branch(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["branch", "-D", branch_name])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git branch -D".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("not found") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "branch -D".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// Prune stale worktree registrations whose directories are gone.
    pub fn cleanup_stale(&self) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree prune".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// List all worktrees registered on the repository.
    fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree list".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_porcelain_output(&stdout)
    }

    fn find_worktree_by_path(&self, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let worktrees = self.list_worktrees()?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        for wt in worktrees {
            let wt_canonical = wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone());
            if wt_canonical == canonical {
                return Ok(wt);
            }
        }

        Err(WorktreeError::ParseError(format!(
            "worktree not found at path: {}",
            path.display()
        )))
    }

    /// Best-effort cleanup of a partially created worktree directory.
    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(
                path = %path.display(),
                "cleaning up partial worktree directory"
            );
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.cleanup_stale();
    }
}

/// Result of merging one branch.
enum BranchMerge {
    Success,
    Conflict { details: String },
}

/// Parse the porcelain output of `git worktree list --porcelain`.
///
/// Blocks separated by blank lines:
///
/// ```text
/// worktree <path>
/// HEAD <sha>
/// branch refs/heads/<name>
/// ```
///
/// The main worktree may show `bare`, detached worktrees `detached`.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    branch: current_branch.take(),
                    head_commit: head,
                });
            } else {
                current_path = None;
                current_head = None;
                current_branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            let branch = rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string();
            current_branch = Some(branch);
        }
        // Ignore `bare`, `detached`, `prunable`, etc.
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo {
            path,
            branch: current_branch,
            head_commit: head,
        });
    }

    Ok(worktrees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    /// Create a temporary git repository with an initial commit.
    /// Returns the TempDir (must be held alive) and the repo path.
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

        std::fs::write(repo_path.join("README.md"), "# Test repo\n")
            .expect("failed to write README");
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);

        (dir, repo_path)
    }

    fn manager(repo_path: &Path, base: &TempDir) -> DomainWorktreeManager {
        DomainWorktreeManager::new(repo_path, Some(base.path().to_path_buf()))
            .expect("manager should build")
    }

    fn commit_file(worktree: &Path, name: &str, content: &str) {
        std::fs::write(worktree.join(name), content).expect("write failed");
        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(worktree)
                .output()
                .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
            assert!(
                output.status.success(),
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        };
        run(&["add", name]);
        run(&["commit", "-m", &format!("Add {name}")]);
    }

    #[test]
    fn new_with_invalid_repo_fails() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let result = DomainWorktreeManager::new(dir.path(), None);
        assert!(matches!(result, Err(WorktreeError::NotAGitRepo(_))));
    }

    #[test]
    fn branch_naming() {
        assert_eq!(
            DomainWorktreeManager::domain_branch("abc123", "auth"),
            "run-abc123/auth"
        );
        assert_eq!(
            DomainWorktreeManager::integration_branch("abc123"),
            "integration/run-abc123"
        );
    }

    #[test]
    fn create_and_list_run_worktrees() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = manager(&repo_path, &base);

        let auth = mgr.create_domain_worktree("auth", "r1").expect("create failed");
        let booking = mgr
            .create_domain_worktree("booking", "r1")
            .expect("create failed");

        assert!(auth.path.exists());
        assert_eq!(auth.branch, "run-r1/auth");
        assert_eq!(auth.domain, "auth");
        assert_ne!(auth.path, booking.path);

        let listed = mgr.list_run_worktrees("r1").expect("list failed");
        assert_eq!(listed.len(), 2);

        // A different run sees none of them.
        let other = mgr.list_run_worktrees("r2").expect("list failed");
        assert!(other.is_empty());
    }

    #[test]
    fn create_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = manager(&repo_path, &base);

        let first = mgr.create_domain_worktree("auth", "r1").expect("first create");
        let second = mgr.create_domain_worktree("auth", "r1").expect("second create");
        assert_eq!(first.path, second.path);
        assert_eq!(first.branch, second.branch);
    }

    #[test]
    fn at_most_one_worktree_per_run_domain() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = manager(&repo_path, &base);

        mgr.create_domain_worktree("auth", "r1").expect("create failed");
        mgr.create_domain_worktree("auth", "r1").expect("create failed");

        let listed = mgr.list_run_worktrees("r1").expect("list failed");
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn cleanup_removes_all_run_worktrees() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = manager(&repo_path, &base);

        let auth = mgr.create_domain_worktree("auth", "r1").expect("create failed");
        let booking = mgr
            .create_domain_worktree("booking", "r1")
            .expect("create failed");

        let removed = mgr.cleanup_run_worktrees("r1").expect("cleanup failed");
        assert_eq!(removed, 2);
        assert!(!auth.path.exists());
        assert!(!booking.path.exists());
        assert!(mgr.list_run_worktrees("r1").expect("list failed").is_empty());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = manager(&repo_path, &base);

        mgr.create_domain_worktree("auth", "r1").expect("create failed");
        mgr.cleanup_run_worktrees("r1").expect("first cleanup");
        let removed = mgr.cleanup_run_worktrees("r1").expect("second cleanup");
        assert_eq!(removed, 0);
    }

    #[test]
    fn worktree_isolation() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = manager(&repo_path, &base);

        let wt = mgr.create_domain_worktree("auth", "r1").expect("create failed");
        std::fs::write(wt.path.join("agent-work.txt"), "agent output\n")
            .expect("write failed");

        assert!(
            !repo_path.join("agent-work.txt").exists(),
            "file created in worktree should not appear in main repo"
        );
    }

    #[test]
    fn merge_all_domains_clean() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = manager(&repo_path, &base);

        let auth = mgr.create_domain_worktree("auth", "r1").expect("create failed");
        let booking = mgr
            .create_domain_worktree("booking", "r1")
            .expect("create failed");

        commit_file(&auth.path, "auth.ts", "auth feature\n");
        commit_file(&booking.path, "booking.ts", "booking feature\n");

        mgr.cleanup_run_worktrees("r1").expect("cleanup failed");

        mgr.create_integration_branch("r1").expect("integration failed");
        let outcome = mgr
            .merge_all_domains("r1", &["auth".to_owned(), "booking".to_owned()])
            .expect("merge failed");

        assert!(outcome.success);
        assert!(!outcome.has_conflicts);
        assert!(repo_path.join("auth.ts").exists());
        assert!(repo_path.join("booking.ts").exists());
    }

    #[test]
    fn merge_conflict_is_reported_not_raised() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = manager(&repo_path, &base);

        let auth = mgr.create_domain_worktree("auth", "r1").expect("create failed");
        let booking = mgr
            .create_domain_worktree("booking", "r1")
            .expect("create failed");

        // Both branches change the same file differently.
        commit_file(&auth.path, "shared.txt", "auth version\n");
        commit_file(&booking.path, "shared.txt", "booking version\n");

        mgr.cleanup_run_worktrees("r1").expect("cleanup failed");

        mgr.create_integration_branch("r1").expect("integration failed");
        let outcome = mgr
            .merge_all_domains("r1", &["auth".to_owned(), "booking".to_owned()])
            .expect("merge should not raise");

        assert!(!outcome.success);
        assert!(outcome.has_conflicts);
        assert!(outcome.message.contains("booking"));

        // First branch landed; the conflicted one was aborted cleanly.
        let content = std::fs::read_to_string(repo_path.join("shared.txt")).unwrap();
        assert_eq!(content, "auth version\n");
    }

    #[test]
    fn integration_branch_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let base = TempDir::new().unwrap();
        let mgr = manager(&repo_path, &base);

        let first = mgr.create_integration_branch("r1").expect("first create");
        let second = mgr.create_integration_branch("r1").expect("second create");
        assert_eq!(first, second);
    }

    #[test]
    fn delete_branch_is_idempotent() {
        let (_dir, repo_path) = create_temp_repo();
        let mgr = DomainWorktreeManager::new(&repo_path, None).unwrap();
        mgr.delete_branch("run-none/ghost")
            .expect("deleting nonexistent branch should not fail");
    }

    #[test]
    fn parse_porcelain_output_blocks() {
        let input = "\
worktree /home/user/project
HEAD abc123def456
branch refs/heads/main

worktree /home/user/worktrees/auth
HEAD 789abc012def
branch refs/heads/run-r1/auth

worktree /home/user/worktrees/detached
HEAD 111222333444
detached

";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].branch.as_deref(), Some("main"));
        assert_eq!(result[1].branch.as_deref(), Some("run-r1/auth"));
        assert_eq!(result[2].branch, None);
    }

    #[test]
    fn parse_porcelain_output_no_trailing_newline() {
        let input = "\
worktree /home/user/project
HEAD abc123
branch refs/heads/main";
        let result = parse_porcelain_output(input).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].branch.as_deref(), Some("main"));
    }

    #[test]
    fn parse_porcelain_output_empty() {
        assert!(parse_porcelain_output("").unwrap().is_empty());
    }
}
