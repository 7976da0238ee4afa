//! `orcd`: runs the orchestration engine against a project directory.
//!
//! This binary is intentionally thin — a full command surface (listing
//! tasks, tailing transcripts, answering gates) belongs on top of the
//! library's `Scheduler`/`Store` API, not baked into argument parsing
//! here. `orcd` wires the components together, starts the orphan-recovery
//! loop, and blocks until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use orc_engine::config::EngineConfig;
use orc_engine::executor::Executor;
use orc_engine::events::EventBus;
use orc_engine::gates::GateEvaluator;
use orc_engine::phase_runner::PhaseRunner;
use orc_engine::scheduler::Scheduler;
use orc_engine::store::Store;
use orc_engine::supervisor::Supervisor;
use orc_engine::sync::SyncCoordinator;
use orc_engine::worktree::WorktreeManager;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let project_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let config = Arc::new(EngineConfig::load(&project_dir).context("failed to load engine config")?);
    config.ensure_directories().context("failed to create .orc directories")?;

    let store = Arc::new(Store::open(config.tasks_dir())?);
    let worktrees = Arc::new(WorktreeManager::new(config.project_dir.clone(), config.worktrees_root()));
    let gates = Arc::new(GateEvaluator::new(None, config.auto_approve_on_success));
    let supervisor = Supervisor::new(config.timeouts.clone());
    let phase_runner = Arc::new(PhaseRunner::new(
        supervisor,
        GateEvaluator::new(None, config.auto_approve_on_success),
        store.clone(),
        config.agent_cmd.clone(),
    ));
    let events = EventBus::default();
    let executor = Arc::new(Executor::new(
        store.clone(),
        worktrees.clone(),
        phase_runner,
        events.clone(),
        config.clone(),
    ));
    let sync = Arc::new(SyncCoordinator::new(config.clone(), gates, None));

    let scheduler = Arc::new(Scheduler::new(store.clone(), executor, sync, events, config.clone()));

    tracing::info!(project_dir = %project_dir.display(), "orc-engine started");

    let mut orphan_tick = tokio::time::interval(config.execution.orphan_scan_interval);
    loop {
        tokio::select! {
            _ = orphan_tick.tick() => {
                match scheduler.scan_orphans().await {
                    Ok(ids) if !ids.is_empty() => tracing::warn!(?ids, "recovered orphaned tasks"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "orphan scan failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}
