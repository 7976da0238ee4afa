//! Core data model: tasks, phases, execution records, checkpoints, transcripts.
//!
//! This mirrors the schema the rest of the engine agrees on; the `Store`
//! (see [`crate::store`]) is responsible for making it durable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Coarse sizing used to pick a task's phase template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weight {
    Trivial,
    Small,
    Medium,
    Large,
    Greenfield,
}

impl Weight {
    /// The phase template selected for this weight, in ordinal order.
    pub fn phase_template(self) -> &'static [PhaseName] {
        use PhaseName::*;
        match self {
            Weight::Trivial => &[Implement, Validate],
            Weight::Small | Weight::Medium => &[Spec, Implement, Test, Validate],
            Weight::Large | Weight::Greenfield => &[
                Research, Spec, Design, Implement, Test, Review, Docs, Validate,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    Active,
    Backlog,
}

/// One step in a task's workflow template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Research,
    Spec,
    Design,
    Implement,
    Test,
    Review,
    Docs,
    Validate,
    Finalize,
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseName::Research => "research",
            PhaseName::Spec => "spec",
            PhaseName::Design => "design",
            PhaseName::Implement => "implement",
            PhaseName::Test => "test",
            PhaseName::Review => "review",
            PhaseName::Docs => "docs",
            PhaseName::Validate => "validate",
            PhaseName::Finalize => "finalize",
        };
        write!(f, "{s}")
    }
}

/// The decision point at the end of a phase that admits, rejects, or pauses a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    Auto,
    Ai,
    Human,
    None,
}

/// A phase's static configuration within a task's template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: PhaseName,
    pub ordinal: u32,
    pub gate: GateType,
    pub max_iterations: u32,
}

/// Per-task per-phase run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Pending,
    Active,
    Completed,
    Rejected,
    Skipped,
}

/// Observable task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Classifying,
    Planned,
    Running,
    Paused,
    Blocked,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Structured reason attached to a `blocked`/`failed` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StuckReason {
    Interrupted,
    GateRejected { feedback: String },
    IterationLimit { phase: PhaseName },
    Timeout { phase: PhaseName },
    ProtectedBranch { branch: String },
    Conflict { files: Vec<PathBuf> },
    Crashed { detail: String },
    RetriesExhausted { phase: PhaseName, attempts: u32 },
}

/// The unit of work the engine drives end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub weight: Weight,
    pub priority: Priority,
    pub queue: Queue,
    #[serde(default)]
    pub initiative: Option<String>,
    pub status: TaskStatus,

    pub branch: String,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    pub target_branch: String,
    #[serde(default)]
    pub pr_id: Option<String>,
    #[serde(default)]
    pub parent_task: Option<String>,

    /// Concrete phase template, fixed at creation time.
    pub phases: Vec<PhaseSpec>,
    /// Current position in `phases`, by ordinal.
    pub current_phase: usize,
    #[serde(default)]
    pub phase_state: std::collections::BTreeMap<String, PhaseState>,
    /// Number of cross-phase retries observed so far, keyed by phase name.
    #[serde(default)]
    pub retry_counts: std::collections::BTreeMap<String, u32>,
    #[serde(default)]
    pub stuck_reason: Option<StuckReason>,
    /// Context injected by `escalate`, consumed by the next implement phase.
    #[serde(default)]
    pub escalation_context: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn branch_for(prefix: &str, id: &str) -> String {
        format!("{prefix}/{id}")
    }

    pub fn current_phase_spec(&self) -> Option<&PhaseSpec> {
        self.phases.get(self.current_phase)
    }

    pub fn state_of(&self, phase: PhaseName) -> PhaseState {
        self.phase_state
            .get(&phase.to_string())
            .copied()
            .unwrap_or(PhaseState::Pending)
    }

    pub fn set_state(&mut self, phase: PhaseName, state: PhaseState) {
        self.phase_state.insert(phase.to_string(), state);
        self.updated_at = Utc::now();
    }

    pub fn retry_count(&self, phase: PhaseName) -> u32 {
        self.retry_counts.get(&phase.to_string()).copied().unwrap_or(0)
    }

    pub fn bump_retry(&mut self, phase: PhaseName) -> u32 {
        let entry = self.retry_counts.entry(phase.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Jump the cursor back to the given phase, clearing downstream state.
    pub fn rewind_to(&mut self, phase: PhaseName) -> Result<(), String> {
        let idx = self
            .phases
            .iter()
            .position(|p| p.name == phase)
            .ok_or_else(|| format!("phase {phase} is not in this task's template"))?;
        for spec in &self.phases[idx..] {
            self.phase_state.insert(spec.name.to_string(), PhaseState::Pending);
        }
        self.current_phase = idx;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Attached to a task while a worker owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub pid: u32,
    pub hostname: String,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_stale(&self, max_age: chrono::Duration) -> bool {
        Utc::now().signed_duration_since(self.last_heartbeat) > max_age
    }
}

/// A version-control commit taken at a phase boundary so work can be rewound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    pub phase: PhaseName,
    pub commit: String,
    pub timestamp: DateTime<Utc>,
}

/// One streamed line of agent stdout/stderr.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub task_id: String,
    pub phase: PhaseName,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileChangeSummary {
    pub files_added: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
    pub total_lines_added: usize,
    pub total_lines_removed: usize,
}

impl FileChangeSummary {
    pub fn total_files(&self) -> usize {
        self.files_added.len() + self.files_modified.len() + self.files_deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_files() == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: PathBuf,
    pub change_type: ChangeType,
    pub lines_added: usize,
    pub lines_removed: usize,
}

/// Token usage aggregated from a supervisor invocation's embedded
/// `<cost tokens="N"/>` telemetry lines.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub total_tokens: u64,
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.total_tokens += rhs.total_tokens;
    }
}
