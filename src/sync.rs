//! Branch synchronization and finalization.
//!
//! Two distinct moments use this module: an in-flight task re-syncing its
//! worktree branch against a moving target branch (per
//! [`crate::config::SyncStrategy`]), and a completed task finalizing —
//! re-syncing one last time, classifying the risk of what it's about to
//! ship, running the pre-merge gate, and then either merging directly or
//! opening a pull request through the hosting CLI and waiting on CI.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;

use crate::config::{CompletionAction, EngineConfig, MergeMethod, RiskLevel};
use crate::errors::{ExecutorError, SyncError};
use crate::gates::{GateContext, GateEvaluator, GateOutcome};
use crate::model::{FileChangeSummary, PhaseName};
use crate::supervisor::signals::IterationSignals;
use crate::tracker::GitTracker;
use crate::worktree::Worktree;

/// A pluggable risk classifier: typically a cheaper-model invocation against
/// the diff, but swappable for tests. Falls back to a size heuristic when no
/// classifier is wired up.
#[async_trait]
pub trait RiskClassifier: Send + Sync {
    async fn classify(&self, changes: &FileChangeSummary) -> anyhow::Result<RiskLevel>;
}

fn heuristic_risk(changes: &FileChangeSummary) -> RiskLevel {
    let total = changes.total_files();
    let lines = changes.total_lines_added + changes.total_lines_removed;
    if total > 40 || lines > 2000 {
        RiskLevel::Critical
    } else if total > 15 || lines > 600 {
        RiskLevel::High
    } else if total > 5 || lines > 150 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

fn merge_method_flag(method: MergeMethod) -> &'static str {
    match method {
        MergeMethod::Squash => "--squash",
        MergeMethod::Merge => "--merge",
        MergeMethod::Rebase => "--rebase",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    UpToDate,
    Synced,
    Conflicted { files: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// `completion.action` was `none`; nothing shipped.
    NoAction,
    Merged { commit: String },
    PrOpened { pr_id: String },
    AwaitingGate,
}

pub struct SyncCoordinator {
    config: Arc<EngineConfig>,
    gates: Arc<GateEvaluator>,
    risk_classifier: Option<Arc<dyn RiskClassifier>>,
}

impl SyncCoordinator {
    pub fn new(
        config: Arc<EngineConfig>,
        gates: Arc<GateEvaluator>,
        risk_classifier: Option<Arc<dyn RiskClassifier>>,
    ) -> Self {
        Self {
            config,
            gates,
            risk_classifier,
        }
    }

    async fn run_git(&self, dir: &Path, args: &[&str]) -> Result<std::process::Output, SyncError> {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| SyncError::GitFailed(e.to_string()))
    }

    /// Rebase or merge the worktree's branch onto the current tip of
    /// `target_branch`, per the configured [`FinalizeStrategy`].
    pub async fn sync_with_target(
        &self,
        worktree: &Worktree,
        target_branch: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let fetch = self.run_git(&worktree.path, &["fetch", "origin", target_branch]).await?;
        if !fetch.status.success() {
            return Err(SyncError::GitFailed(
                String::from_utf8_lossy(&fetch.stderr).trim().to_string(),
            ));
        }

        let verb = match self.config.sync.finalize_strategy {
            crate::config::FinalizeStrategy::Rebase => "rebase",
            crate::config::FinalizeStrategy::Merge => "merge",
        };
        let target_ref = format!("origin/{target_branch}");
        let output = self.run_git(&worktree.path, &[verb, &target_ref]).await?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stdout.contains("up to date") || stdout.contains("up-to-date") {
                return Ok(SyncOutcome::UpToDate);
            }
            return Ok(SyncOutcome::Synced);
        }

        let status = self
            .run_git(&worktree.path, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        let conflicted = String::from_utf8_lossy(&status.stdout).lines().count();

        let abort_verb = format!("--{verb}");
        let _ = self.run_git(&worktree.path, &[verb, &abort_verb]).await;

        if self.config.sync.max_conflict_files > 0 && conflicted > self.config.sync.max_conflict_files {
            return Err(SyncError::TooManyConflicts {
                found: conflicted,
                cap: self.config.sync.max_conflict_files,
            });
        }
        if self.config.sync.fail_on_conflict {
            return Err(SyncError::Conflict(conflicted));
        }
        Ok(SyncOutcome::Conflicted { files: conflicted })
    }

    /// Classify the risk of a diff via the configured model-backed
    /// classifier, falling back to a size heuristic when none is wired up.
    pub async fn classify_risk(&self, changes: &FileChangeSummary) -> Result<RiskLevel, SyncError> {
        match &self.risk_classifier {
            Some(classifier) => classifier.classify(changes).await.map_err(SyncError::Other),
            None => Ok(heuristic_risk(changes)),
        }
    }

    /// Finalize a task: re-sync, classify risk, gate, then ship according
    /// to `completion.action`.
    pub async fn finalize(
        &self,
        task_id: &str,
        worktree: &Worktree,
        target_branch: &str,
    ) -> Result<FinalizeOutcome, ExecutorError> {
        if matches!(self.config.completion.action, CompletionAction::DirectMerge)
            && self.config.is_protected(target_branch)
        {
            return Err(ExecutorError::ProtectedBranch(target_branch.to_string()));
        }

        self.sync_with_target(worktree, target_branch).await?;

        let tracker = GitTracker::open(&worktree.path).map_err(SyncError::Other)?;
        let base_sha = tracker.head_sha().unwrap_or_default();
        let changes = tracker.compute_changes(&base_sha).map_err(SyncError::Other)?;
        let risk = self.classify_risk(&changes).await?;

        let gate = if risk >= self.config.sync.re_review_threshold {
            escalate_gate(self.config.completion.pre_merge_gate)
        } else {
            self.config.completion.pre_merge_gate
        };

        let ctx = GateContext {
            phase: PhaseName::Finalize,
            changes,
            signals: IterationSignals::new(),
        };
        match self.gates.evaluate(gate, &ctx).await.map_err(SyncError::Other)? {
            GateOutcome::Pending => return Ok(FinalizeOutcome::AwaitingGate),
            GateOutcome::Rejected { feedback } => {
                return Err(ExecutorError::Other(anyhow::anyhow!(
                    "finalize gate rejected task {task_id}: {feedback}"
                )));
            }
            GateOutcome::Approved { .. } => {}
        }

        match self.config.completion.action {
            CompletionAction::None => Ok(FinalizeOutcome::NoAction),
            CompletionAction::DirectMerge => self.direct_merge(worktree, target_branch).await,
            CompletionAction::OpenPr => self.open_pr_and_wait(task_id, worktree, target_branch).await,
        }
    }

    async fn direct_merge(
        &self,
        worktree: &Worktree,
        target_branch: &str,
    ) -> Result<FinalizeOutcome, ExecutorError> {
        let project_dir = self.config.project_dir.as_path();

        let checkout = self.run_git(project_dir, &["checkout", target_branch]).await?;
        if !checkout.status.success() {
            return Err(SyncError::GitFailed(String::from_utf8_lossy(&checkout.stderr).trim().to_string()).into());
        }

        let message = format!("Merge {}", worktree.branch);
        let merge = self
            .run_git(project_dir, &["merge", "--no-ff", "-m", &message, &worktree.branch])
            .await?;
        if !merge.status.success() {
            let _ = self.run_git(project_dir, &["merge", "--abort"]).await;
            return Err(SyncError::GitFailed(String::from_utf8_lossy(&merge.stderr).trim().to_string()).into());
        }

        let tracker = GitTracker::open(project_dir).map_err(SyncError::Other)?;
        let commit = tracker.head_sha().unwrap_or_default();
        Ok(FinalizeOutcome::Merged { commit })
    }

    async fn open_pr_and_wait(
        &self,
        task_id: &str,
        worktree: &Worktree,
        target_branch: &str,
    ) -> Result<FinalizeOutcome, ExecutorError> {
        let pr_id = self.create_pr(task_id, worktree, target_branch).await?;

        if self.config.completion.wait_for_ci {
            self.wait_for_ci(&worktree.path, &pr_id).await?;
            self.merge_pr(&worktree.path, &pr_id).await?;
        } else if self.config.completion.auto_merge {
            self.enable_auto_merge(&worktree.path, &pr_id).await?;
        }

        Ok(FinalizeOutcome::PrOpened { pr_id })
    }

    fn pr_create_args(&self, task_id: &str, worktree: &Worktree, target_branch: &str, with_labels: bool) -> Vec<String> {
        let mut args = vec![
            "pr".to_string(),
            "create".to_string(),
            "--base".to_string(),
            target_branch.to_string(),
            "--head".to_string(),
            worktree.branch.clone(),
            "--title".to_string(),
            format!("orc: {task_id}"),
            "--fill".to_string(),
        ];
        if with_labels {
            for label in &self.config.completion.labels {
                args.push("--label".to_string());
                args.push(label.clone());
            }
            for reviewer in &self.config.completion.reviewers {
                args.push("--reviewer".to_string());
                args.push(reviewer.clone());
            }
            for assignee in &self.config.completion.assignees {
                args.push("--assignee".to_string());
                args.push(assignee.clone());
            }
        }
        args
    }

    /// Create the PR, retrying once without labels/reviewers/assignees if
    /// the hosting CLI rejects the request over an unrecognized/missing
    /// label — a label mismatch should never be fatal to opening the PR.
    async fn create_pr(
        &self,
        task_id: &str,
        worktree: &Worktree,
        target_branch: &str,
    ) -> Result<String, ExecutorError> {
        let args = self.pr_create_args(task_id, worktree, target_branch, true);
        let output = Command::new(&self.config.hosting_cmd)
            .args(&args)
            .current_dir(&worktree.path)
            .output()
            .await
            .map_err(|e| SyncError::HostingCliFailed(e.to_string()))?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.to_lowercase().contains("label") {
            return Err(SyncError::HostingCliFailed(stderr).into());
        }

        let retry_args = self.pr_create_args(task_id, worktree, target_branch, false);
        let retry_output = Command::new(&self.config.hosting_cmd)
            .args(&retry_args)
            .current_dir(&worktree.path)
            .output()
            .await
            .map_err(|e| SyncError::HostingCliFailed(e.to_string()))?;
        if !retry_output.status.success() {
            return Err(SyncError::HostingCliFailed(String::from_utf8_lossy(&retry_output.stderr).trim().to_string()).into());
        }
        Ok(String::from_utf8_lossy(&retry_output.stdout).trim().to_string())
    }

    /// Defer to the hosting provider's native auto-merge when CI waiting is
    /// disabled but auto-merge is enabled.
    async fn enable_auto_merge(&self, dir: &Path, pr_id: &str) -> Result<(), ExecutorError> {
        let method_flag = merge_method_flag(self.config.completion.merge_method);
        let output = Command::new(&self.config.hosting_cmd)
            .args(["pr", "merge", pr_id, "--auto", method_flag])
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| SyncError::HostingCliFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(SyncError::HostingCliFailed(String::from_utf8_lossy(&output.stderr).trim().to_string()).into());
        }
        Ok(())
    }

    async fn wait_for_ci(&self, dir: &Path, pr_id: &str) -> Result<(), ExecutorError> {
        let deadline = tokio::time::Instant::now() + self.config.completion.ci_timeout;
        loop {
            let output = Command::new(&self.config.hosting_cmd)
                .args(["pr", "checks", pr_id, "--json", "state"])
                .current_dir(dir)
                .output()
                .await
                .map_err(|e| SyncError::HostingCliFailed(e.to_string()))?;
            let state = String::from_utf8_lossy(&output.stdout);
            if state.contains("SUCCESS") || state.contains("success") {
                return Ok(());
            }
            if state.contains("FAILURE") || state.contains("failure") {
                return Err(SyncError::HostingCliFailed(format!("CI failed for {pr_id}")).into());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SyncError::CiTimeout.into());
            }
            tokio::time::sleep(self.config.completion.poll_interval).await;
        }
    }

    async fn merge_pr(&self, dir: &Path, pr_id: &str) -> Result<(), ExecutorError> {
        let method_flag = merge_method_flag(self.config.completion.merge_method);
        let output = Command::new(&self.config.hosting_cmd)
            .args(["pr", "merge", pr_id, method_flag])
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| SyncError::HostingCliFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(SyncError::HostingCliFailed(String::from_utf8_lossy(&output.stderr).trim().to_string()).into());
        }
        Ok(())
    }

}

/// Bump a gate at least one level of scrutiny when the change is riskier
/// than the static configuration anticipated.
fn escalate_gate(gate: crate::model::GateType) -> crate::model::GateType {
    use crate::model::GateType::*;
    match gate {
        None | Auto => Ai,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn classify_risk_buckets_by_size() {
        let config = Arc::new(EngineConfig::default());
        let gates = Arc::new(GateEvaluator::new(None, false));
        let coordinator = SyncCoordinator::new(config, gates, None);

        let mut changes = FileChangeSummary::default();
        assert_eq!(coordinator.classify_risk(&changes).await.unwrap(), RiskLevel::Low);

        for i in 0..10 {
            changes.files_modified.push(format!("f{i}.rs").into());
        }
        assert_eq!(coordinator.classify_risk(&changes).await.unwrap(), RiskLevel::Medium);

        for i in 10..50 {
            changes.files_modified.push(format!("f{i}.rs").into());
        }
        assert_eq!(coordinator.classify_risk(&changes).await.unwrap(), RiskLevel::Critical);
    }

    struct FixedRiskClassifier(RiskLevel);
    #[async_trait]
    impl RiskClassifier for FixedRiskClassifier {
        async fn classify(&self, _changes: &FileChangeSummary) -> anyhow::Result<RiskLevel> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn classify_risk_prefers_the_pluggable_classifier_over_the_heuristic() {
        let config = Arc::new(EngineConfig::default());
        let gates = Arc::new(GateEvaluator::new(None, false));
        let coordinator = SyncCoordinator::new(config, gates, Some(Arc::new(FixedRiskClassifier(RiskLevel::Critical))));

        // A tiny diff that the heuristic alone would call Low.
        let changes = FileChangeSummary::default();
        assert_eq!(coordinator.classify_risk(&changes).await.unwrap(), RiskLevel::Critical);
    }

    #[test]
    fn escalate_gate_bumps_auto_and_none_to_ai() {
        use crate::model::GateType;
        assert_eq!(escalate_gate(GateType::Auto), GateType::Ai);
        assert_eq!(escalate_gate(GateType::None), GateType::Ai);
        assert_eq!(escalate_gate(GateType::Human), GateType::Human);
        assert_eq!(escalate_gate(GateType::Ai), GateType::Ai);
    }
}
