//! Drives a single phase of a task to a gated outcome.
//!
//! One phase may take several agent turns ("iterations") before it signals
//! completion; each iteration is a fresh [`crate::supervisor::Supervisor`]
//! turn against the worktree, followed by a diff against the pre-turn
//! snapshot and a gate check. Iterating stops the moment the gate approves,
//! rejects for good (iteration budget exhausted), or the agent asks a
//! question a human needs to answer.

use std::path::Path;
use std::sync::Arc;

use crate::errors::PhaseError;
use crate::gates::{GateContext, GateEvaluator, GateOutcome};
use crate::model::{Checkpoint, FileChangeSummary, GateType, PhaseName, PhaseSpec, TranscriptLine};
use crate::store::Store;
use crate::supervisor::{Supervisor, TokioAgentProcess, agent_args};
use crate::tracker::GitTracker;

pub enum PhaseResult {
    Completed {
        changes: FileChangeSummary,
        checkpoint: Checkpoint,
    },
    /// Iteration budget exhausted without a gate ever approving.
    IterationLimitReached { last_feedback: Option<String> },
    NeedsClarification {
        question: String,
    },
}

pub struct PhaseRunner {
    supervisor: Supervisor,
    gates: GateEvaluator,
    store: Arc<Store>,
    agent_cmd: String,
}

impl PhaseRunner {
    pub fn new(supervisor: Supervisor, gates: GateEvaluator, store: Arc<Store>, agent_cmd: String) -> Self {
        Self {
            supervisor,
            gates,
            store,
            agent_cmd,
        }
    }

    /// Check whether a phase's well-known artifact already exists, letting
    /// a resumed task skip regenerating e.g. a spec document it already has.
    pub fn artifact_already_present(phase: PhaseName, worktree_dir: &Path) -> bool {
        let artifact = match phase {
            PhaseName::Spec => "SPEC.md",
            PhaseName::Research => "RESEARCH.md",
            PhaseName::Docs => "CHANGELOG.md",
            _ => return false,
        };
        worktree_dir.join(artifact).exists()
    }

    pub async fn run(
        &self,
        task_id: &str,
        worktree_dir: &Path,
        spec: &PhaseSpec,
        mut prompt: String,
    ) -> Result<PhaseResult, PhaseError> {
        let tracker = GitTracker::open(worktree_dir).map_err(PhaseError::Other)?;
        let mut last_feedback: Option<String> = None;
        let phase_deadline = tokio::time::Instant::now() + self.supervisor.timeouts().phase_max;

        for iteration in 1..=spec.max_iterations {
            let before_sha = tracker
                .snapshot(&format!("{}-pre-{iteration}", spec.name))
                .map_err(PhaseError::Other)?;

            let process = TokioAgentProcess::spawn(
                &self.agent_cmd,
                &agent_args(spec.name, &prompt),
                worktree_dir,
            )
            .map_err(|e| PhaseError::Supervisor(crate::errors::SupervisorError::SpawnFailed(e)))?;

            let store = self.store.clone();
            let task_id_owned = task_id.to_string();
            let phase = spec.name;
            let outcome = self
                .supervisor
                .run_turn(
                    Box::new(process),
                    |line| {
                        let _ = store.append_transcript(&TranscriptLine {
                            task_id: task_id_owned.clone(),
                            phase,
                            iteration,
                            timestamp: chrono::Utc::now(),
                            text: line.to_string(),
                        });
                    },
                    || {},
                    phase_deadline,
                )
                .await?;

            let changes = tracker.compute_changes(&before_sha).map_err(PhaseError::Other)?;

            use crate::supervisor::TurnOutcome::*;
            let signals = match outcome {
                Completed { signals } | NotComplete { signals } => signals,
                TimedOut { signals } => {
                    if tokio::time::Instant::now() >= phase_deadline {
                        return Err(PhaseError::Timeout);
                    }
                    signals
                }
                NeedsClarification { question, .. } => {
                    return Ok(PhaseResult::NeedsClarification { question });
                }
                Crashed { detail, .. } => return Err(PhaseError::Crashed(detail)),
            };

            let phase_complete = signals.phase_complete;
            let ctx = GateContext {
                phase: spec.name,
                changes: changes.clone(),
                signals,
            };

            if !phase_complete {
                // The agent exited (or timed out) without declaring the
                // phase done; give it another turn if the budget allows.
                continue;
            }

            match self
                .gates
                .evaluate(spec.gate, &ctx)
                .await
                .map_err(PhaseError::Other)?
            {
                GateOutcome::Approved { .. } => {
                    let commit = tracker
                        .snapshot(&format!("{}-approved", spec.name))
                        .map_err(PhaseError::Other)?;
                    let checkpoint = Checkpoint {
                        task_id: task_id.to_string(),
                        phase: spec.name,
                        commit,
                        timestamp: chrono::Utc::now(),
                    };
                    self.store
                        .record_checkpoint(&checkpoint)
                        .map_err(|e| PhaseError::Other(e.into()))?;
                    return Ok(PhaseResult::Completed { changes, checkpoint });
                }
                GateOutcome::Pending => {
                    return Err(PhaseError::GateRejected {
                        feedback: "awaiting human review".to_string(),
                    });
                }
                GateOutcome::Rejected { feedback } => {
                    prompt = format!("{prompt}\n\nPrevious attempt was rejected: {feedback}");
                    last_feedback = Some(feedback);
                }
            }
        }

        write_stuck_note(
            worktree_dir,
            spec.name,
            last_feedback.as_deref().unwrap_or("iteration budget exhausted"),
        );
        Ok(PhaseResult::IterationLimitReached { last_feedback })
    }

    /// Resolve a gate type honoring `None` (skip) without running a turn at
    /// all — used when the artifact already exists for this phase.
    pub fn skip_gate(&self) -> GateType {
        GateType::None
    }
}

fn write_stuck_note(worktree_dir: &Path, phase: PhaseName, reason: &str) {
    let path = worktree_dir.join(".stuck.md");
    let body = format!("# Stuck in phase `{phase}`\n\n{reason}\n");
    let _ = std::fs::write(path, body);
}
