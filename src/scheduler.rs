//! Cross-task coordination: command dispatch, concurrency enforcement, and
//! orphan recovery.
//!
//! One `Scheduler` owns every running task's worker. Each worker is a
//! Tokio task gated by a semaphore sized to `execution.parallel_tasks`;
//! the scheduler itself never blocks on a worker's phase loop, it only
//! starts, signals, and reaps them.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::errors::SchedulerError;
use crate::events::{EventBus, EventPayload};
use crate::executor::{ExecutionOutcome, Executor};
use crate::model::{ExecutionRecord, StuckReason, TaskStatus};
use crate::store::Store;
use crate::sync::{FinalizeOutcome, SyncCoordinator};

pub struct Scheduler {
    store: Arc<Store>,
    executor: Arc<Executor>,
    sync: Arc<SyncCoordinator>,
    events: EventBus,
    config: Arc<EngineConfig>,
    permits: Arc<Semaphore>,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
    worker_id: String,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        executor: Arc<Executor>,
        sync: Arc<SyncCoordinator>,
        events: EventBus,
        config: Arc<EngineConfig>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.execution.parallel_tasks));
        Self {
            store,
            executor,
            sync,
            events,
            config,
            permits,
            workers: Mutex::new(HashMap::new()),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Claim a task and spawn its worker. Blocks only until a concurrency
    /// permit is free, then returns immediately — the phase loop runs in
    /// the background.
    pub async fn run(self: &Arc<Self>, task_id: &str) -> Result<(), SchedulerError> {
        let task = self.store.load(task_id)?;
        if task.status.is_terminal() {
            return Err(SchedulerError::Other(anyhow::anyhow!(
                "task {task_id} already reached a terminal state"
            )));
        }

        self.store.claim(
            task_id,
            ExecutionRecord {
                pid: std::process::id(),
                hostname: hostname(),
                worker_id: self.worker_id.clone(),
                started_at: chrono::Utc::now(),
                last_heartbeat: chrono::Utc::now(),
            },
            claim_staleness(&self.config),
        )?;

        let scheduler = self.clone();
        let permits = self.permits.clone();
        let task_id_owned = task_id.to_string();
        let task_id_for_task = task_id_owned.clone();
        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await;
            scheduler.drive(&task_id_for_task).await;
        });

        self.workers.lock().await.insert(task_id_owned, handle);
        Ok(())
    }

    async fn drive(&self, task_id: &str) {
        let outcome = self.executor.run_task(task_id).await;
        match outcome {
            Ok(ExecutionOutcome::Completed) => {
                if let Ok(task) = self.store.load(task_id) {
                    if let Some(path) = task.worktree_path.clone() {
                        let worktree = crate::worktree::Worktree {
                            path,
                            branch: task.branch.clone(),
                        };
                        match self.sync.finalize(task_id, &worktree, &task.target_branch).await {
                            Ok(FinalizeOutcome::AwaitingGate) => {
                                let _ = self.store.mutate(task_id, |t| {
                                    t.status = TaskStatus::Blocked;
                                    t.stuck_reason = Some(StuckReason::Interrupted);
                                });
                            }
                            Ok(_) => {}
                            Err(e) => {
                                let _ = self.store.mutate(task_id, |t| {
                                    t.status = TaskStatus::Failed;
                                    t.stuck_reason = Some(StuckReason::Crashed {
                                        detail: e.to_string(),
                                    });
                                });
                            }
                        }
                    }
                }
            }
            Ok(ExecutionOutcome::Blocked { .. } | ExecutionOutcome::Paused | ExecutionOutcome::Failed { .. }) => {}
            Err(e) => {
                let _ = self.store.mutate(task_id, |t| {
                    t.status = TaskStatus::Failed;
                    t.stuck_reason = Some(StuckReason::Crashed {
                        detail: e.to_string(),
                    });
                });
            }
        }
        let _ = self.store.release(task_id, &self.worker_id);
        self.events.publish(
            task_id.to_string(),
            None,
            None,
            EventPayload::TaskStateChanged {
                from: "running".into(),
                to: "settled".into(),
            },
        );
        self.workers.lock().await.remove(task_id);
    }

    /// Abort a task's worker without releasing its claim, so a crash
    /// recovery scan won't immediately treat it as orphaned.
    pub async fn pause(&self, task_id: &str) -> Result<(), SchedulerError> {
        let mut workers = self.workers.lock().await;
        let handle = workers.remove(task_id).ok_or_else(|| SchedulerError::NoWorker(task_id.to_string()))?;
        handle.abort();
        self.store.mutate(task_id, |t| t.status = TaskStatus::Paused)?;
        Ok(())
    }

    pub async fn cancel(&self, task_id: &str) -> Result<(), SchedulerError> {
        let mut workers = self.workers.lock().await;
        if let Some(handle) = workers.remove(task_id) {
            handle.abort();
        }
        self.store.mutate(task_id, |t| {
            t.status = TaskStatus::Failed;
            t.stuck_reason = Some(StuckReason::Interrupted);
        })?;
        let _ = self.store.release(task_id, &self.worker_id);
        Ok(())
    }

    pub async fn resume(self: &Arc<Self>, task_id: &str) -> Result<(), SchedulerError> {
        self.store.mutate(task_id, |t| t.status = TaskStatus::Running)?;
        self.run(task_id).await
    }

    /// Rewind a failed/blocked task to the start of its template and
    /// re-queue it.
    pub async fn reset(self: &Arc<Self>, task_id: &str) -> Result<(), SchedulerError> {
        self.store.mutate(task_id, |t| {
            t.current_phase = 0;
            t.phase_state.clear();
            t.retry_counts.clear();
            t.stuck_reason = None;
            t.status = TaskStatus::Created;
        })?;
        self.run(task_id).await
    }

    /// Unblock a task parked on a gate or clarification request with an
    /// operator's answer, then resume it.
    pub async fn resolve(self: &Arc<Self>, task_id: &str, feedback: String) -> Result<(), SchedulerError> {
        self.store.mutate(task_id, |t| {
            t.status = TaskStatus::Running;
            t.stuck_reason = None;
            t.escalation_context = Some(feedback);
        })?;
        self.run(task_id).await
    }

    /// Inject operator context for the next implement turn without
    /// changing phase position (e.g. a course correction mid-flight).
    pub async fn escalate(&self, task_id: &str, context: String) -> Result<(), SchedulerError> {
        self.store.mutate(task_id, |t| {
            t.escalation_context = Some(context);
        })?;
        Ok(())
    }

    /// Periodically reclaim tasks whose worker crashed without releasing
    /// its claim. Intended to run as a background loop at
    /// `execution.orphan_scan_interval`.
    pub async fn scan_orphans(self: &Arc<Self>) -> Result<Vec<String>, SchedulerError> {
        let max_age = claim_staleness(&self.config);
        let orphaned = self.store.find_orphaned(max_age)?;
        for task_id in &orphaned {
            let _ = self.store.release(task_id, "orphan-scan");
            self.events.publish(
                task_id.clone(),
                None,
                None,
                EventPayload::ExecutionOrphaned {
                    reason: "claim went stale".into(),
                },
            );
            let _ = self.run(task_id).await;
        }
        Ok(orphaned)
    }
}

fn claim_staleness(config: &EngineConfig) -> chrono::Duration {
    chrono::Duration::from_std(config.timeouts.heartbeat_interval * 4)
        .unwrap_or_else(|_| chrono::Duration::minutes(10))
}

fn hostname() -> String {
    dirs::home_dir()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown-host".to_string())
}
