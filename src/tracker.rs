//! Git-level change tracking within a task's worktree.
//!
//! Used by the phase runner to snapshot the worktree before a turn and
//! compute what changed after it, independent of whether the agent
//! committed its work — `diff_tree_to_workdir_with_index` sees staged,
//! unstaged, and untracked changes alike.

use anyhow::{Context, Result};
use git2::{Delta, DiffOptions, Repository, Signature};
use std::path::Path;

use crate::model::{ChangeType, FileChangeSummary, FileDiff};

pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn open(worktree_dir: &Path) -> Result<Self> {
        let repo = Repository::open(worktree_dir).context("failed to open git worktree")?;
        Ok(Self { repo })
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo.head().ok().and_then(|h| h.peel_to_commit().ok())
    }

    pub fn head_sha(&self) -> Option<String> {
        self.head_commit().map(|c| c.id().to_string())
    }

    /// Snapshot the worktree as a commit so later phases can diff or
    /// rewind against it. Returns the new commit's sha.
    pub fn snapshot(&self, phase: &str) -> Result<String> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now("orc-engine", "orc-engine@localhost")?;
        let message = format!("checkpoint: {phase}");

        let commit_id = if let Some(parent) = self.head_commit() {
            self.repo
                .commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent])?
        } else {
            self.repo
                .commit(Some("HEAD"), &sig, &sig, &message, &tree, &[])?
        };
        Ok(commit_id.to_string())
    }

    /// Summarize what changed in the workdir relative to `since_sha`.
    pub fn compute_changes(&self, since_sha: &str) -> Result<FileChangeSummary> {
        let before_tree = self.tree_at(since_sha)?;
        let mut opts = DiffOptions::new();
        opts.include_untracked(true);
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&before_tree), Some(&mut opts))?;

        let mut summary = FileChangeSummary::default();
        diff.foreach(
            &mut |delta, _progress| {
                if let Some(path) = delta.new_file().path() {
                    match delta.status() {
                        Delta::Added | Delta::Untracked => {
                            summary.files_added.push(path.to_path_buf())
                        }
                        Delta::Modified => summary.files_modified.push(path.to_path_buf()),
                        Delta::Deleted => summary.files_deleted.push(path.to_path_buf()),
                        _ => {}
                    }
                }
                true
            },
            None,
            None,
            Some(&mut |_delta, _hunk, line| {
                match line.origin() {
                    '+' => summary.total_lines_added += 1,
                    '-' => summary.total_lines_removed += 1,
                    _ => {}
                }
                true
            }),
        )?;
        Ok(summary)
    }

    /// Full per-file diffs, for transcripting and AI-gate review context.
    pub fn full_diffs(&self, since_sha: &str) -> Result<Vec<FileDiff>> {
        let before_tree = self.tree_at(since_sha)?;
        let mut opts = DiffOptions::new();
        opts.include_untracked(true);
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&before_tree), Some(&mut opts))?;

        let mut diffs = Vec::new();
        for idx in 0..diff.deltas().len() {
            let Some(delta) = diff.get_delta(idx) else {
                continue;
            };
            let Some(path) = delta.new_file().path() else {
                continue;
            };
            let change_type = match delta.status() {
                Delta::Added | Delta::Untracked => ChangeType::Added,
                Delta::Modified => ChangeType::Modified,
                Delta::Deleted => ChangeType::Deleted,
                Delta::Renamed => ChangeType::Renamed,
                _ => continue,
            };
            diffs.push(FileDiff {
                path: path.to_path_buf(),
                change_type,
                lines_added: 0,
                lines_removed: 0,
            });
        }

        // Fill in per-file line counts from the patch stats.
        for delta_idx in 0..diff.deltas().len() {
            let stats = diff.stats().ok();
            if let Some(stats) = stats {
                let _ = delta_idx;
                if diffs.len() == 1 {
                    if let Some(first) = diffs.first_mut() {
                        // git2's per-delta line stats require a second pass via
                        // patch; approximate totals are attached to the whole
                        // diff, so only the first entry carries them when there
                        // is exactly one changed file. Multi-file precise counts
                        // come from `compute_changes`'s line-level callback.
                        first.lines_added = stats.insertions();
                        first.lines_removed = stats.deletions();
                    }
                }
            }
        }

        Ok(diffs)
    }

    fn tree_at<'a>(&'a self, sha: &str) -> Result<git2::Tree<'a>> {
        let oid = git2::Oid::from_str(sha)?;
        let commit = self.repo.find_commit(oid)?;
        Ok(commit.tree()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (GitTracker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        (GitTracker::open(dir.path()).unwrap(), dir)
    }

    fn commit(dir: &Path, name: &str, content: &str) {
        let repo = Repository::open(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "c", &tree, &[&parent]).unwrap();
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, "c", &tree, &[]).unwrap();
        }
    }

    #[test]
    fn head_sha_is_none_until_first_commit() {
        let (tracker, dir) = setup();
        assert!(tracker.head_sha().is_none());
        commit(dir.path(), "a.txt", "hi");
        assert!(tracker.head_sha().is_some());
    }

    #[test]
    fn snapshot_produces_a_full_sha() {
        let (tracker, dir) = setup();
        commit(dir.path(), "a.txt", "hi");
        let sha = tracker.snapshot("implement").unwrap();
        assert_eq!(sha.len(), 40);
    }

    #[test]
    fn compute_changes_detects_new_file() {
        let (tracker, dir) = setup();
        commit(dir.path(), "existing.txt", "x");
        let sha = tracker.snapshot("spec").unwrap();
        fs::write(dir.path().join("new.rs"), "fn main() {}").unwrap();
        let summary = tracker.compute_changes(&sha).unwrap();
        assert!(summary.files_added.iter().any(|p| p.ends_with("new.rs")));
    }

    #[test]
    fn compute_changes_detects_modified_file() {
        let (tracker, dir) = setup();
        commit(dir.path(), "existing.txt", "line one\n");
        let sha = tracker.snapshot("implement").unwrap();
        fs::write(dir.path().join("existing.txt"), "line one\nline two\n").unwrap();
        let summary = tracker.compute_changes(&sha).unwrap();
        assert!(summary.files_modified.iter().any(|p| p.ends_with("existing.txt")));
        assert_eq!(summary.total_lines_added, 1);
    }

    #[test]
    fn no_changes_yields_empty_summary() {
        let (tracker, dir) = setup();
        commit(dir.path(), "stable.txt", "unchanged\n");
        let sha = tracker.snapshot("validate").unwrap();
        let summary = tracker.compute_changes(&sha).unwrap();
        assert!(summary.is_empty());
    }
}
