//! Task state machine: walks a task's phase template end to end, applying
//! the cross-phase retry policy and handing off worktree lifecycle.
//!
//! One [`Executor::run_task`] call owns a task from claim to either a
//! terminal state or a parked (`blocked`/`paused`) one; the caller
//! ([`crate::scheduler`]) is responsible for persisting the claim and
//! deciding what happens to a parked task next.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::errors::{ExecutorError, PhaseError};
use crate::events::{EventBus, EventPayload};
use crate::model::{PhaseState, StuckReason, Task, TaskStatus};
use crate::phase_runner::{PhaseResult, PhaseRunner};
use crate::store::Store;
use crate::worktree::{Worktree, WorktreeManager};

/// What became of a task after one `run_task` call.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Completed,
    Blocked { reason: StuckReason },
    Paused,
    Failed { reason: StuckReason },
}

pub struct Executor {
    store: Arc<Store>,
    worktrees: Arc<WorktreeManager>,
    phase_runner: Arc<PhaseRunner>,
    events: EventBus,
    config: Arc<EngineConfig>,
}

impl Executor {
    pub fn new(
        store: Arc<Store>,
        worktrees: Arc<WorktreeManager>,
        phase_runner: Arc<PhaseRunner>,
        events: EventBus,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            worktrees,
            phase_runner,
            events,
            config,
        }
    }

    /// Run a claimed task forward until it reaches a terminal or parked
    /// state. Cooperative cancellation is left to the caller, which should
    /// not poll this future past a scheduler `cancel` request — the
    /// in-flight phase still runs to its next gate check either way.
    pub async fn run_task(&self, task_id: &str) -> Result<ExecutionOutcome, ExecutorError> {
        let mut task = self.store.mutate(task_id, |t| t.status = TaskStatus::Running)?;

        let worktree = self.ensure_worktree(&task).await?;

        loop {
            if task.current_phase >= task.phases.len() {
                self.worktrees.release(&worktree).await.ok();
                let task = self.store.mutate(task_id, |t| {
                    t.status = TaskStatus::Completed;
                    t.worktree_path = None;
                })?;
                self.events.publish(
                    task.id.clone(),
                    None,
                    None,
                    EventPayload::TaskStateChanged {
                        from: "running".into(),
                        to: "completed".into(),
                    },
                );
                return Ok(ExecutionOutcome::Completed);
            }

            let spec = task.phases[task.current_phase].clone();

            if task.state_of(spec.name) == PhaseState::Completed {
                task = self.store.mutate(task_id, |t| t.current_phase += 1)?;
                continue;
            }

            if PhaseRunner::artifact_already_present(spec.name, &worktree.path) {
                task = self.store.mutate(task_id, |t| {
                    t.set_state(spec.name, PhaseState::Skipped);
                    t.current_phase += 1;
                })?;
                continue;
            }

            task = self.store.mutate(task_id, |t| t.set_state(spec.name, PhaseState::Active))?;
            self.events.publish(
                task.id.clone(),
                Some(spec.name),
                None,
                EventPayload::PhaseStarted,
            );

            let prompt = build_prompt(&task);
            let result = self
                .phase_runner
                .run(task_id, &worktree.path, &spec, prompt)
                .await;

            match result {
                Ok(PhaseResult::Completed { .. }) => {
                    task = self.store.mutate(task_id, |t| {
                        t.set_state(spec.name, PhaseState::Completed);
                        t.current_phase += 1;
                    })?;
                    self.events.publish(
                        task.id.clone(),
                        Some(spec.name),
                        None,
                        EventPayload::PhaseEnded {
                            outcome: "completed".into(),
                        },
                    );
                }
                Ok(PhaseResult::NeedsClarification { question }) => {
                    self.store.mutate(task_id, |t| {
                        t.status = TaskStatus::Blocked;
                        t.stuck_reason = Some(StuckReason::Interrupted);
                        t.escalation_context = Some(question.clone());
                    })?;
                    return Ok(ExecutionOutcome::Blocked {
                        reason: StuckReason::Interrupted,
                    });
                }
                Ok(PhaseResult::IterationLimitReached { last_feedback }) => {
                    task = self.store.mutate(task_id, |t| {
                        t.set_state(spec.name, PhaseState::Rejected);
                    })?;
                    match self.retry_or_fail(&task, spec.name, last_feedback)? {
                        Some(outcome) => return Ok(outcome),
                        None => {
                            task = self.store.load(task_id)?;
                            continue;
                        }
                    }
                }
                Err(PhaseError::GateRejected { feedback }) => {
                    let reason = StuckReason::GateRejected {
                        feedback: feedback.clone(),
                    };
                    self.store.mutate(task_id, |t| {
                        t.status = TaskStatus::Blocked;
                        t.stuck_reason = Some(reason.clone());
                    })?;
                    return Ok(ExecutionOutcome::Blocked { reason });
                }
                Err(PhaseError::Timeout) => match self.retry_or_fail(&task, spec.name, None)? {
                    Some(outcome) => return Ok(outcome),
                    None => {
                        task = self.store.load(task_id)?;
                        continue;
                    }
                },
                Err(PhaseError::Crashed(detail)) => {
                    match self.retry_or_fail(&task, spec.name, Some(detail))? {
                        Some(outcome) => return Ok(outcome),
                        None => {
                            task = self.store.load(task_id)?;
                            continue;
                        }
                    }
                }
                Err(other) => return Err(ExecutorError::Phase(other)),
            }
        }
    }

    /// Either rewind to the configured retry target and return `None` (the
    /// caller should reload and keep looping), or mark the task `failed`
    /// and return `Some(outcome)` once retries are exhausted.
    fn retry_or_fail(
        &self,
        task: &Task,
        failed_phase: crate::model::PhaseName,
        feedback: Option<String>,
    ) -> Result<Option<ExecutionOutcome>, ExecutorError> {
        let attempts = task.retry_count(failed_phase) + 1;
        let retry_target = self.config.retry.map.get(&failed_phase).copied();

        if self.config.retry.enabled
            && attempts <= self.config.retry.max_retries
            && retry_target.is_some()
        {
            let target = retry_target.unwrap();
            self.store.mutate(&task.id, |t| {
                t.bump_retry(failed_phase);
                let _ = t.rewind_to(target);
                if let Some(fb) = &feedback {
                    t.escalation_context = Some(fb.clone());
                }
            })?;
            return Ok(None);
        }

        let reason = StuckReason::RetriesExhausted {
            phase: failed_phase,
            attempts,
        };
        self.store.mutate(&task.id, |t| {
            t.status = TaskStatus::Failed;
            t.stuck_reason = Some(reason.clone());
        })?;
        Ok(Some(ExecutionOutcome::Failed { reason }))
    }

    async fn ensure_worktree(&self, task: &Task) -> Result<Worktree, ExecutorError> {
        if let Some(path) = &task.worktree_path {
            return Ok(Worktree {
                path: path.clone(),
                branch: task.branch.clone(),
            });
        }
        self.worktrees.check_primary_clean().await?;
        let worktree = self
            .worktrees
            .acquire(&task.id, &task.branch, &task.target_branch)
            .await?;
        self.store.mutate(&task.id, |t| {
            t.worktree_path = Some(worktree.path.clone());
        })?;
        Ok(worktree)
    }
}

fn build_prompt(task: &Task) -> String {
    match &task.escalation_context {
        Some(ctx) => format!("{}\n\nAdditional context: {}", task.description, ctx),
        None => task.description.clone(),
    }
}
