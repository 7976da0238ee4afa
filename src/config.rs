//! Resolved engine configuration.
//!
//! The full layered (runtime > personal > shared > defaults) loader with
//! per-source tracking is out of scope for this repository (see
//! `SPEC_FULL.md` §6); `EngineConfig` is the single resolved value the rest
//! of the engine consumes, with a convenience two-level loader
//! (`<project>/.orc/config.yaml` over built-in defaults) good enough for
//! the engine's own fixtures and for a real loader to produce.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::{GateType, PhaseName, Weight};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    None,
    Phase,
    #[serde(alias = "completion")]
    Completion,
    Detect,
}

impl Default for SyncStrategy {
    fn default() -> Self {
        SyncStrategy::Completion
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeStrategy {
    Rebase,
    Merge,
}

impl Default for FinalizeStrategy {
    fn default() -> Self {
        FinalizeStrategy::Merge
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    Squash,
    Merge,
    Rebase,
}

impl Default for MergeMethod {
    fn default() -> Self {
        MergeMethod::Squash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionAction {
    None,
    DirectMerge,
    OpenPr,
}

impl Default for CompletionAction {
    fn default() -> Self {
        CompletionAction::OpenPr
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub turn_max: Duration,
    pub phase_max: Duration,
    pub idle_warning: Duration,
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub grace_period: Duration,
    pub gate_check: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            turn_max: Duration::from_secs(10 * 60),
            phase_max: Duration::from_secs(60 * 60),
            idle_warning: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(2 * 60),
            heartbeat_interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(10),
            gate_check: Duration::from_secs(2 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub map: HashMap<PhaseName, PhaseName>,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let mut map = HashMap::new();
        map.insert(PhaseName::Test, PhaseName::Implement);
        map.insert(PhaseName::Review, PhaseName::Implement);
        Self {
            enabled: true,
            map,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub strategy: SyncStrategy,
    pub finalize_strategy: FinalizeStrategy,
    pub fail_on_conflict: bool,
    pub ai_conflict_resolution: bool,
    pub max_conflict_files: usize,
    pub re_review_threshold: RiskLevel,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            strategy: SyncStrategy::default(),
            finalize_strategy: FinalizeStrategy::default(),
            fail_on_conflict: true,
            ai_conflict_resolution: false,
            max_conflict_files: 0,
            re_review_threshold: RiskLevel::High,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub action: CompletionAction,
    pub target_branch: String,
    pub merge_method: MergeMethod,
    pub pre_merge_gate: GateType,
    pub wait_for_ci: bool,
    pub poll_interval: Duration,
    pub ci_timeout: Duration,
    pub protected_branches: Vec<String>,
    pub labels: Vec<String>,
    pub reviewers: Vec<String>,
    pub assignees: Vec<String>,
    /// When `wait_for_ci` is unset, defer to the hosting provider's own
    /// auto-merge instead of leaving the PR unmerged.
    pub auto_merge: bool,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            action: CompletionAction::default(),
            target_branch: "main".to_string(),
            merge_method: MergeMethod::default(),
            pre_merge_gate: GateType::Auto,
            wait_for_ci: true,
            poll_interval: Duration::from_secs(30),
            ci_timeout: Duration::from_secs(30 * 60),
            protected_branches: vec![
                "main".into(),
                "master".into(),
                "develop".into(),
                "release".into(),
            ],
            labels: Vec::new(),
            reviewers: Vec::new(),
            assignees: Vec::new(),
            auto_merge: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_retries: u32,
    pub checkpoint_interval: u32,
    pub parallel_tasks: usize,
    pub orphan_scan_interval: Duration,
    pub branch_prefix: String,
    pub worktrees_root: PathBuf,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            checkpoint_interval: 1,
            parallel_tasks: 2,
            orphan_scan_interval: Duration::from_secs(60),
            branch_prefix: "orc".to_string(),
            worktrees_root: PathBuf::from(".orc/worktrees"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingConfig {
    pub commands: HashMap<String, String>,
    pub required: bool,
    pub coverage_threshold: Option<f64>,
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            commands: HashMap::new(),
            required: false,
            coverage_threshold: None,
        }
    }
}

/// The single resolved configuration value consumed by every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub project_dir: PathBuf,
    pub agent_cmd: String,
    pub hosting_cmd: String,
    pub auto_approve_on_success: bool,
    /// Phases that are skipped outright if their well-known artifact already exists.
    pub artifact_skip_phases: Vec<PhaseName>,
    pub timeouts: TimeoutsConfig,
    pub retry: RetryConfig,
    pub sync: SyncConfig,
    pub completion: CompletionConfig,
    pub execution: ExecutionConfig,
    pub testing: TestingConfig,
    /// Per-weight gate overrides, e.g. trivial tasks get `none` everywhere.
    pub gate_overrides: HashMap<Weight, GateType>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            agent_cmd: "claude".to_string(),
            hosting_cmd: "gh".to_string(),
            auto_approve_on_success: true,
            artifact_skip_phases: vec![PhaseName::Spec, PhaseName::Research, PhaseName::Docs],
            timeouts: TimeoutsConfig::default(),
            retry: RetryConfig::default(),
            sync: SyncConfig::default(),
            completion: CompletionConfig::default(),
            execution: ExecutionConfig::default(),
            testing: TestingConfig::default(),
            gate_overrides: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn orc_dir(&self) -> PathBuf {
        self.project_dir.join(".orc")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.orc_dir().join("tasks")
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(task_id)
    }

    pub fn worktrees_root(&self) -> PathBuf {
        if self.execution.worktrees_root.is_absolute() {
            self.execution.worktrees_root.clone()
        } else {
            self.project_dir.join(&self.execution.worktrees_root)
        }
    }

    pub fn sqlite_cache_path(&self) -> PathBuf {
        self.orc_dir().join("orc.db")
    }

    /// Resolve the gate type for a phase, honoring weight overrides, falling
    /// back to the phase template's own gate.
    pub fn gate_for(&self, weight: Weight, template_gate: GateType) -> GateType {
        self.gate_overrides.get(&weight).copied().unwrap_or(template_gate)
    }

    pub fn is_protected(&self, branch: &str) -> bool {
        self.completion
            .protected_branches
            .iter()
            .any(|b| b == branch)
    }

    /// Two-level loader: `<project>/.orc/config.yaml` over built-in defaults.
    /// The full four-level, source-tracked loader lives outside this crate.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("failed to resolve project dir {}", project_dir.display()))?;
        let mut config = EngineConfig {
            project_dir: project_dir.clone(),
            ..EngineConfig::default()
        };

        let config_path = project_dir.join(".orc").join("config.yaml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            let overrides: EngineConfigOverrides = serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse {}", config_path.display()))?;
            overrides.apply(&mut config);
        }

        Ok(config)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.tasks_dir()).context("failed to create tasks directory")?;
        std::fs::create_dir_all(self.worktrees_root())
            .context("failed to create worktrees directory")?;
        Ok(())
    }
}

/// Sparse overlay applied on top of [`EngineConfig::default`]. Every field is
/// optional so a project's `.orc/config.yaml` only needs to name what it
/// wants to change.
#[derive(Debug, Default, Deserialize)]
struct EngineConfigOverrides {
    agent_cmd: Option<String>,
    hosting_cmd: Option<String>,
    auto_approve_on_success: Option<bool>,
    execution: Option<ExecutionConfigOverrides>,
    completion: Option<CompletionConfigOverrides>,
}

#[derive(Debug, Default, Deserialize)]
struct ExecutionConfigOverrides {
    parallel_tasks: Option<usize>,
    max_retries: Option<u32>,
    branch_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionConfigOverrides {
    target_branch: Option<String>,
    wait_for_ci: Option<bool>,
    auto_merge: Option<bool>,
}

impl EngineConfigOverrides {
    fn apply(self, config: &mut EngineConfig) {
        if let Some(v) = self.agent_cmd {
            config.agent_cmd = v;
        }
        if let Some(v) = self.hosting_cmd {
            config.hosting_cmd = v;
        }
        if let Some(v) = self.auto_approve_on_success {
            config.auto_approve_on_success = v;
        }
        if let Some(exec) = self.execution {
            if let Some(v) = exec.parallel_tasks {
                config.execution.parallel_tasks = v;
            }
            if let Some(v) = exec.max_retries {
                config.execution.max_retries = v;
            }
            if let Some(v) = exec.branch_prefix {
                config.execution.branch_prefix = v;
            }
        }
        if let Some(completion) = self.completion {
            if let Some(v) = completion.target_branch {
                config.completion.target_branch = v;
            }
            if let Some(v) = completion.wait_for_ci {
                config.completion.wait_for_ci = v;
            }
            if let Some(v) = completion.auto_merge {
                config.completion.auto_merge = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.execution.parallel_tasks, 2);
        assert!(config.is_protected("main"));
        assert!(!config.is_protected("orc/TASK-1"));
    }

    #[test]
    fn load_with_no_override_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.agent_cmd, "claude");
        assert_eq!(config.execution.parallel_tasks, 2);
    }

    #[test]
    fn load_applies_overrides_from_yaml() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".orc")).unwrap();
        std::fs::write(
            dir.path().join(".orc/config.yaml"),
            "agent_cmd: my-agent\nexecution:\n  parallel_tasks: 5\n",
        )
        .unwrap();

        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.agent_cmd, "my-agent");
        assert_eq!(config.execution.parallel_tasks, 5);
        // Unspecified fields keep their defaults.
        assert_eq!(config.hosting_cmd, "gh");
    }

    #[test]
    fn gate_for_honors_weight_override() {
        let mut config = EngineConfig::default();
        config.gate_overrides.insert(Weight::Trivial, GateType::None);
        assert_eq!(config.gate_for(Weight::Trivial, GateType::Auto), GateType::None);
        assert_eq!(config.gate_for(Weight::Large, GateType::Auto), GateType::Auto);
    }

    #[test]
    fn task_dir_nests_under_tasks_dir() {
        let config = EngineConfig::default();
        assert_eq!(
            config.task_dir("TASK-1"),
            config.project_dir.join(".orc/tasks/TASK-1")
        );
    }
}
