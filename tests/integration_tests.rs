//! End-to-end scenarios that exercise the store, worktree manager,
//! supervisor, gates, phase runner, executor, and scheduler together against
//! a real git repository, driving a stand-in "agent" shell script in place
//! of the real coding-agent binary.

use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::Arc;

use orc_engine::config::EngineConfig;
use orc_engine::events::EventBus;
use orc_engine::executor::{ExecutionOutcome, Executor};
use orc_engine::gates::GateEvaluator;
use orc_engine::model::{GateType, PhaseName, PhaseSpec, Priority, Queue, Task, TaskStatus, Weight};
use orc_engine::phase_runner::PhaseRunner;
use orc_engine::scheduler::Scheduler;
use orc_engine::store::Store;
use orc_engine::supervisor::Supervisor;
use orc_engine::sync::SyncCoordinator;
use orc_engine::worktree::WorktreeManager;
use tempfile::TempDir;

fn init_repo(dir: &Path) {
    let run = |args: &[&str]| {
        StdCommand::new("git").args(args).current_dir(dir).status().unwrap();
    };
    run(&["init", "-q"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "test"]);
    std::fs::write(dir.join("README.md"), "hello\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-q", "-m", "init"]);
    run(&["branch", "-M", "main"]);
}

/// Write an executable stand-in agent script. Ignores its argv entirely,
/// so one script serves every phase of a task.
fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }
    path
}

fn fast_config(project_dir: &Path, agent_cmd: &str) -> EngineConfig {
    let mut config = EngineConfig::load(project_dir).unwrap();
    config.agent_cmd = agent_cmd.to_string();
    config.timeouts.turn_max = std::time::Duration::from_secs(5);
    config.timeouts.idle_warning = std::time::Duration::from_millis(300);
    config.timeouts.idle_timeout = std::time::Duration::from_millis(800);
    config.timeouts.grace_period = std::time::Duration::from_millis(100);
    config.timeouts.heartbeat_interval = std::time::Duration::from_millis(20);
    config.execution.worktrees_root = PathBuf::from(".orc/worktrees");
    config
}

fn task_with_phases(id: &str, phases: Vec<(PhaseName, GateType, u32)>) -> Task {
    let now = chrono::Utc::now();
    Task {
        id: id.into(),
        title: id.into(),
        description: "exercise the engine".into(),
        weight: Weight::Small,
        priority: Priority::Normal,
        queue: Queue::Active,
        initiative: None,
        status: TaskStatus::Created,
        branch: format!("orc/{id}"),
        worktree_path: None,
        target_branch: "main".into(),
        pr_id: None,
        parent_task: None,
        phases: phases
            .into_iter()
            .enumerate()
            .map(|(i, (name, gate, max_iterations))| PhaseSpec {
                name,
                ordinal: i as u32,
                gate,
                max_iterations,
            })
            .collect(),
        current_phase: 0,
        phase_state: Default::default(),
        retry_counts: Default::default(),
        stuck_reason: None,
        escalation_context: None,
        created_at: now,
        updated_at: now,
    }
}

struct Harness {
    _project: TempDir,
    config: Arc<EngineConfig>,
    store: Arc<Store>,
    executor: Arc<Executor>,
    sync: Arc<SyncCoordinator>,
}

impl Harness {
    fn new(agent_script: &str) -> Self {
        let project = TempDir::new().unwrap();
        init_repo(project.path());
        let agent_path = write_script(project.path(), agent_script);

        let config = Arc::new(fast_config(project.path(), agent_path.to_str().unwrap()));
        config.ensure_directories().unwrap();

        let store = Arc::new(Store::open(config.tasks_dir()).unwrap());
        let worktrees = Arc::new(WorktreeManager::new(config.project_dir.clone(), config.worktrees_root()));
        let gates = GateEvaluator::new(None, config.auto_approve_on_success);
        let supervisor = Supervisor::new(config.timeouts.clone());
        let phase_runner = Arc::new(PhaseRunner::new(supervisor, gates, store.clone(), config.agent_cmd.clone()));
        let events = EventBus::default();
        let executor = Arc::new(Executor::new(
            store.clone(),
            worktrees,
            phase_runner,
            events,
            config.clone(),
        ));
        let sync = Arc::new(SyncCoordinator::new(
            config.clone(),
            Arc::new(GateEvaluator::new(None, config.auto_approve_on_success)),
            None,
        ));

        Self {
            _project: project,
            config,
            store,
            executor,
            sync,
        }
    }
}

#[tokio::test]
async fn task_completes_when_agent_signals_phase_complete() {
    let harness = Harness::new("echo '<phase_complete>true</phase_complete>'\nexit 0");
    let task = task_with_phases("TASK-1", vec![(PhaseName::Implement, GateType::Auto, 3)]);
    harness.store.create(&task).unwrap();

    let outcome = harness.executor.run_task("TASK-1").await.unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Completed));

    let reloaded = harness.store.load("TASK-1").unwrap();
    assert_eq!(reloaded.status, TaskStatus::Completed);
    assert!(reloaded.worktree_path.is_none(), "worktree is released once the task is done");
}

#[tokio::test]
async fn task_blocks_on_needs_clarification_and_records_the_question() {
    let harness = Harness::new("echo '<needs_clarification>which database?</needs_clarification>'\nexit 0");
    let task = task_with_phases("TASK-2", vec![(PhaseName::Implement, GateType::Auto, 3)]);
    harness.store.create(&task).unwrap();

    let outcome = harness.executor.run_task("TASK-2").await.unwrap();
    match outcome {
        ExecutionOutcome::Blocked { .. } => {}
        other => panic!("expected Blocked, got {other:?}"),
    }

    let reloaded = harness.store.load("TASK-2").unwrap();
    assert_eq!(reloaded.status, TaskStatus::Blocked);
    assert_eq!(reloaded.escalation_context.as_deref(), Some("which database?"));
}

#[tokio::test]
async fn phase_recovers_within_its_own_iteration_budget_after_a_gate_rejection() {
    let project = TempDir::new().unwrap();
    init_repo(project.path());
    let counter = project.path().join("second-attempt");
    let script = format!(
        "if [ -f '{marker}' ]; then\n  echo '<phase_complete>true</phase_complete>'\nelse\n  touch '{marker}'\n  echo '<blocker>missing validation</blocker>'\n  echo '<phase_complete>true</phase_complete>'\nfi\nexit 0",
        marker = counter.display(),
    );
    let agent_path = write_script(project.path(), &script);
    let config = Arc::new(fast_config(project.path(), agent_path.to_str().unwrap()));
    config.ensure_directories().unwrap();
    let store = Arc::new(Store::open(config.tasks_dir()).unwrap());
    let supervisor = Supervisor::new(config.timeouts.clone());
    let phase_runner = PhaseRunner::new(supervisor, GateEvaluator::new(None, true), store.clone(), config.agent_cmd.clone());

    let spec = PhaseSpec {
        name: PhaseName::Implement,
        ordinal: 0,
        gate: GateType::Auto,
        max_iterations: 4,
    };
    let result = phase_runner
        .run("TASK-3", project.path(), &spec, "do the thing".to_string())
        .await
        .unwrap();

    match result {
        orc_engine::phase_runner::PhaseResult::Completed { .. } => {}
        _ => panic!("expected the second iteration to be approved"),
    }
    assert!(counter.exists());
}

#[tokio::test]
async fn cross_phase_retries_exhaust_and_the_task_fails() {
    // The implement phase always signals completion; the test phase never
    // does, so it burns its iteration budget every pass. With the default
    // retry map (test -> implement) and a low retry ceiling, the task should
    // eventually give up rather than loop forever.
    let harness = Harness::new(
        "case \"$*\" in\n  *\\[test\\]*) echo 'still failing'; exit 0 ;;\n  *) echo '<phase_complete>true</phase_complete>'; exit 0 ;;\nesac",
    );
    let mut config = (*harness.config).clone();
    config.retry.max_retries = 1;
    let config = Arc::new(config);

    let store = harness.store.clone();
    let worktrees = Arc::new(WorktreeManager::new(config.project_dir.clone(), config.worktrees_root()));
    let supervisor = Supervisor::new(config.timeouts.clone());
    let phase_runner = Arc::new(PhaseRunner::new(
        supervisor,
        GateEvaluator::new(None, config.auto_approve_on_success),
        store.clone(),
        config.agent_cmd.clone(),
    ));
    let executor = Executor::new(store.clone(), worktrees, phase_runner, EventBus::default(), config);

    let task = task_with_phases(
        "TASK-4",
        vec![
            (PhaseName::Implement, GateType::Auto, 1),
            (PhaseName::Test, GateType::Auto, 1),
        ],
    );
    store.create(&task).unwrap();

    let outcome = executor.run_task("TASK-4").await.unwrap();
    match outcome {
        ExecutionOutcome::Failed { .. } => {}
        other => panic!("expected retries to exhaust into Failed, got {other:?}"),
    }
    let reloaded = store.load("TASK-4").unwrap();
    assert_eq!(reloaded.status, TaskStatus::Failed);
}

#[tokio::test]
async fn scheduler_reclaims_an_orphaned_claim_and_resumes_the_task() {
    let harness = Harness::new("echo '<phase_complete>true</phase_complete>'\nexit 0");
    let task = task_with_phases("TASK-5", vec![(PhaseName::Implement, GateType::Auto, 3)]);
    harness.store.create(&task).unwrap();

    // Simulate a worker that claimed the task and then crashed without ever
    // releasing or heartbeating it.
    harness
        .store
        .claim(
            "TASK-5",
            orc_engine::model::ExecutionRecord {
                pid: 999_999,
                hostname: "dead-worker".into(),
                worker_id: "dead-worker-1".into(),
                started_at: chrono::Utc::now() - chrono::Duration::minutes(30),
                last_heartbeat: chrono::Utc::now() - chrono::Duration::minutes(30),
            },
            chrono::Duration::minutes(5),
        )
        .unwrap();
    harness
        .store
        .mutate("TASK-5", |t| t.status = TaskStatus::Running)
        .unwrap();

    let scheduler = Arc::new(Scheduler::new(
        harness.store.clone(),
        harness.executor.clone(),
        harness.sync.clone(),
        EventBus::default(),
        harness.config.clone(),
    ));

    let recovered = scheduler.scan_orphans().await.unwrap();
    assert_eq!(recovered, vec!["TASK-5".to_string()]);

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let task = harness.store.load("TASK-5").unwrap();
        if task.status.is_terminal() {
            assert_eq!(task.status, TaskStatus::Completed);
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("orphaned task never completed after recovery");
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn scheduler_serializes_workers_when_parallelism_is_capped_to_one() {
    let harness = Harness::new("sleep 0.25\necho '<phase_complete>true</phase_complete>'\nexit 0");
    let mut config = (*harness.config).clone();
    config.execution.parallel_tasks = 1;
    let config = Arc::new(config);

    let store = harness.store.clone();
    let worktrees = Arc::new(WorktreeManager::new(config.project_dir.clone(), config.worktrees_root()));
    let supervisor = Supervisor::new(config.timeouts.clone());
    let phase_runner = Arc::new(PhaseRunner::new(
        supervisor,
        GateEvaluator::new(None, config.auto_approve_on_success),
        store.clone(),
        config.agent_cmd.clone(),
    ));
    let executor = Arc::new(Executor::new(
        store.clone(),
        worktrees,
        phase_runner,
        EventBus::default(),
        config.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        executor,
        harness.sync.clone(),
        EventBus::default(),
        config,
    ));

    for id in ["TASK-6", "TASK-7"] {
        store
            .create(&task_with_phases(id, vec![(PhaseName::Implement, GateType::Auto, 1)]))
            .unwrap();
    }

    let started = tokio::time::Instant::now();
    scheduler.run("TASK-6").await.unwrap();
    scheduler.run("TASK-7").await.unwrap();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let a = store.load("TASK-6").unwrap();
        let b = store.load("TASK-7").unwrap();
        if a.status.is_terminal() && b.status.is_terminal() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("tasks never settled under a capped scheduler");
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    // A single permit means the two ~250ms agent turns cannot have run
    // concurrently; the wall clock should reflect roughly their sum rather
    // than roughly one of them.
    assert!(
        started.elapsed() >= std::time::Duration::from_millis(400),
        "expected serialized execution to take at least ~2x one turn, took {:?}",
        started.elapsed()
    );
}
