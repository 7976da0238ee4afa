//! Git worktree isolation.
//!
//! Each running task gets its own `git worktree` checked out on its own
//! branch so concurrent tasks never share a working directory. All git
//! operations shell out to the `git` binary rather than going through
//! `git2`, matching how the teacher's agent executor drove worktree
//! lifecycle — `git2` is reserved for read-only repository introspection
//! (see [`crate::tracker`]).

use anyhow::Context as _;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::errors::WorktreeError;

pub struct WorktreeManager {
    /// The primary checkout that worktrees are added relative to.
    project_dir: PathBuf,
    worktrees_root: PathBuf,
}

/// A handle to an acquired worktree. Dropping this does not remove the
/// worktree; callers must call [`WorktreeManager::release`] explicitly so
/// cleanup failures can be surfaced and retried.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
}

impl WorktreeManager {
    pub fn new(project_dir: impl Into<PathBuf>, worktrees_root: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            worktrees_root: worktrees_root.into(),
        }
    }

    async fn run_git(&self, args: &[&str]) -> Result<std::process::Output, WorktreeError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.project_dir)
            .output()
            .await
            .map_err(|e| WorktreeError::Other(anyhow::anyhow!(e).context("failed to spawn git")))
    }

    /// Refuse to create worktrees off a primary tree with uncommitted
    /// changes to tracked files: the worktree would branch from a base that
    /// doesn't match what's actually on disk.
    pub async fn check_primary_clean(&self) -> Result<(), WorktreeError> {
        let output = self.run_git(&["status", "--porcelain", "--untracked-files=no"]).await?;
        if !output.stdout.is_empty() {
            return Err(WorktreeError::DirtyPrimaryTree);
        }
        Ok(())
    }

    /// Create a worktree for `task_id` on a new branch cut from `base_branch`.
    /// Idempotent: calling `acquire` again for the same task and branch is a
    /// no-op that returns the existing worktree rather than re-running `git
    /// worktree add`. On a stale-registration failure, `prune_stale` runs
    /// once and the add is retried exactly once before surfacing the error.
    pub async fn acquire(
        &self,
        task_id: &str,
        branch: &str,
        base_branch: &str,
    ) -> Result<Worktree, WorktreeError> {
        let path = self.worktrees_root.join(task_id);
        if path.exists() {
            match self.registered_branch(&path).await? {
                Some(existing) if existing == branch => {
                    return Ok(Worktree {
                        path,
                        branch: branch.to_string(),
                    });
                }
                Some(_) => return Err(WorktreeError::BranchMismatch(task_id.to_string())),
                None => {}
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create worktrees root")
                .map_err(WorktreeError::Other)?;
        }
        let path_str = path.to_str().ok_or_else(|| {
            WorktreeError::Other(anyhow::anyhow!("worktree path is not valid UTF-8"))
        })?;

        let mut output = self
            .run_git(&["worktree", "add", "-b", branch, path_str, base_branch])
            .await?;
        if !output.status.success() {
            self.prune_stale().await?;
            output = self
                .run_git(&["worktree", "add", "-b", branch, path_str, base_branch])
                .await?;
        }
        if !output.status.success() {
            return Err(WorktreeError::AddFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(Worktree {
            path,
            branch: branch.to_string(),
        })
    }

    /// Remove a worktree and prune its registration. Idempotent: a
    /// worktree that's already gone is not an error.
    pub async fn release(&self, worktree: &Worktree) -> Result<(), WorktreeError> {
        let path_str = worktree.path.to_string_lossy().into_owned();
        let output = self
            .run_git(&["worktree", "remove", "--force", &path_str])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::RemoveFailed(stderr.trim().to_string()));
        }
        Ok(())
    }

    /// Drop stale worktree registrations left behind by a worktree
    /// directory that was deleted out from under git (e.g. after a crash
    /// that interrupted [`release`]).
    pub async fn prune_stale(&self) -> Result<(), WorktreeError> {
        let output = self.run_git(&["worktree", "prune"]).await?;
        if !output.status.success() {
            return Err(WorktreeError::PruneFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    /// List branches currently checked out in a worktree, per `git worktree
    /// list --porcelain`. Used to detect a stale registration pointing at
    /// the wrong branch before reusing a task's worktree slot.
    pub async fn registered_branch(&self, path: &Path) -> Result<Option<String>, WorktreeError> {
        let output = self.run_git(&["worktree", "list", "--porcelain"]).await?;
        if !output.status.success() {
            return Err(WorktreeError::Other(anyhow::anyhow!(
                "git worktree list failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let mut current_path: Option<PathBuf> = None;
        for line in text.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(p));
            } else if let Some(b) = line.strip_prefix("branch refs/heads/") {
                if current_path.as_deref() == Some(path) {
                    return Ok(Some(b.to_string()));
                }
            }
        }
        Ok(None)
    }
}
