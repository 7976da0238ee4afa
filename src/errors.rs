//! Typed error hierarchy for the orchestration engine.
//!
//! One enum per component (C1-C7), each `thiserror`-derived, aggregated by
//! [`EngineError`]. Subsystems propagate their own error type internally and
//! convert to `EngineError` at component boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} already exists")]
    Conflict(String),

    #[error("task {0} is already running under another claim")]
    AlreadyRunning(String),

    #[error("lost claim on task {0}: ownership changed")]
    LostClaim(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("failed to acquire lock on {0}")]
    LockFailed(std::path::PathBuf),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("primary working tree has uncommitted changes in tracked files")]
    DirtyPrimaryTree,

    #[error("worktree already exists for task {0} on a different branch")]
    BranchMismatch(String),

    #[error("git worktree add failed: {0}")]
    AddFailed(String),

    #[error("git worktree remove failed: {0}")]
    RemoveFailed(String),

    #[error("git worktree prune failed: {0}")]
    PruneFailed(String),

    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("turn exceeded {0:?}")]
    TurnTimeout(std::time::Duration),

    #[error("phase exceeded {0:?}")]
    PhaseTimeout(std::time::Duration),

    #[error("agent process crashed: {0}")]
    Crashed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("budget exhausted after {iterations} iteration(s) without completion")]
    IterationLimit { iterations: u32 },

    #[error("phase timed out")]
    Timeout,

    #[error("agent process crashed: {0}")]
    Crashed(String),

    #[error("gate rejected: {feedback}")]
    GateRejected { feedback: String },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("target branch {0} is protected; direct merge is refused")]
    ProtectedBranch(String),

    #[error("cross-phase retries exhausted for phase {phase} after {attempts} attempt(s)")]
    RetriesExhausted { phase: String, attempts: u32 },

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("merge conflict in {0} file(s)")]
    Conflict(usize),

    #[error("too many conflicted files: {found} exceeds cap of {cap}")]
    TooManyConflicts { found: usize, cap: usize },

    #[error("git command failed: {0}")]
    GitFailed(String),

    #[error("hosting CLI failed: {0}")]
    HostingCliFailed(String),

    #[error("CI did not pass within the configured timeout")]
    CiTimeout,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} has no live worker to signal")]
    NoWorker(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Top-level error type returned across component boundaries.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Semantic classification used by the propagation policy (retry vs. surface vs. fail).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    NotFound,
    Conflict,
    Transient,
    Timeout,
    GateRejected,
    Fatal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
            EngineError::Store(StoreError::Conflict(_))
            | EngineError::Store(StoreError::AlreadyRunning(_))
            | EngineError::Store(StoreError::LostClaim(_)) => ErrorKind::Conflict,
            EngineError::Phase(PhaseError::Timeout)
            | EngineError::Supervisor(SupervisorError::TurnTimeout(_))
            | EngineError::Supervisor(SupervisorError::PhaseTimeout(_)) => ErrorKind::Timeout,
            EngineError::Phase(PhaseError::GateRejected { .. }) => ErrorKind::GateRejected,
            EngineError::Supervisor(SupervisorError::Crashed(_))
            | EngineError::Phase(PhaseError::Crashed(_)) => ErrorKind::Transient,
            EngineError::Executor(ExecutorError::ProtectedBranch(_)) => ErrorKind::Fatal,
            EngineError::Executor(ExecutorError::RetriesExhausted { .. }) => ErrorKind::Fatal,
            EngineError::Worktree(_) => ErrorKind::Fatal,
            _ => ErrorKind::Fatal,
        }
    }
}
