//! Agent subprocess supervision.
//!
//! Spawns the external coding-agent command for one phase turn, streams its
//! stdout line by line, extracts [`signals`] as they arrive, and enforces
//! the timeout taxonomy: a per-line idle timeout, an idle-warning threshold
//! published as an event before the hard idle timeout fires, and an
//! overall turn ceiling. Cancellation is graceful: SIGTERM first, SIGKILL
//! only after the grace period elapses.

pub mod signals;

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

use crate::config::TimeoutsConfig;
use crate::errors::SupervisorError;
use crate::model::PhaseName;
use signals::IterationSignals;

/// Abstraction over a running agent process, so the turn loop can be driven
/// by a real subprocess or by a scripted test double.
#[async_trait]
pub trait AgentProcess: Send {
    async fn next_line(&mut self) -> std::io::Result<Option<String>>;
    async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus>;
    /// Send a graceful termination request (SIGTERM on unix, `kill()` on
    /// platforms without signals).
    async fn terminate(&mut self) -> std::io::Result<()>;
    async fn kill(&mut self) -> std::io::Result<()>;
}

pub struct TokioAgentProcess {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl TokioAgentProcess {
    pub fn spawn(cmd: &str, args: &[String], cwd: &Path) -> std::io::Result<Self> {
        let mut child = Command::new(cmd)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("agent process has no stdout"))?;
        Ok(Self {
            child,
            lines: BufReader::new(stdout).lines(),
        })
    }
}

#[async_trait]
impl AgentProcess for TokioAgentProcess {
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }

    async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    async fn terminate(&mut self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SAFETY: sending SIGTERM to a pid we own.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}

/// Result of one supervised agent turn.
#[derive(Debug)]
pub enum TurnOutcome {
    /// The agent emitted `<phase_complete/>` and exited cleanly.
    Completed { signals: IterationSignals },
    /// The agent is stuck on a question it needs a human to answer.
    NeedsClarification {
        question: String,
        signals: IterationSignals,
    },
    /// The agent exited cleanly without signaling completion; another
    /// iteration is warranted.
    NotComplete { signals: IterationSignals },
    /// No output for longer than `idle_timeout`, or the turn ran past
    /// `turn_max`.
    TimedOut { signals: IterationSignals },
    /// The process exited with a non-zero status.
    Crashed { detail: String, signals: IterationSignals },
}

pub struct Supervisor {
    timeouts: TimeoutsConfig,
}

impl Supervisor {
    pub fn new(timeouts: TimeoutsConfig) -> Self {
        Self { timeouts }
    }

    pub fn timeouts(&self) -> &TimeoutsConfig {
        &self.timeouts
    }

    /// Drive one turn to completion, applying the timeout taxonomy.
    /// `on_line` is called for every raw stdout line (for transcript
    /// persistence); `on_idle_warning` fires (without cancelling anything)
    /// once a turn goes quiet past `idle_warning`, and again past
    /// `idle_timeout`. Only `turn_max` and the caller-supplied
    /// `phase_deadline` cancel the process.
    pub async fn run_turn(
        &self,
        mut process: Box<dyn AgentProcess>,
        mut on_line: impl FnMut(&str),
        mut on_idle_warning: impl FnMut(),
        phase_deadline: tokio::time::Instant,
    ) -> Result<TurnOutcome, SupervisorError> {
        let mut signals = IterationSignals::new();
        let turn_deadline = tokio::time::Instant::now() + self.timeouts.turn_max;
        let deadline = turn_deadline.min(phase_deadline);
        let idle_poll = self.timeouts.idle_warning.min(self.timeouts.idle_timeout);
        let mut last_activity = tokio::time::Instant::now();
        let mut warned_idle_warning = false;
        let mut warned_idle_timeout = false;

        loop {
            let now = tokio::time::Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if remaining.is_zero() {
                let _ = self.cancel(&mut process).await;
                return Ok(TurnOutcome::TimedOut { signals });
            }

            let read_budget = remaining.min(idle_poll);
            match tokio::time::timeout(read_budget, process.next_line()).await {
                Ok(Ok(Some(line))) => {
                    on_line(&line);
                    signals.merge_line(&line);
                    last_activity = tokio::time::Instant::now();
                    warned_idle_warning = false;
                    warned_idle_timeout = false;
                    if signals.phase_complete {
                        // Drain to EOF so the process can exit on its own,
                        // but don't wait past the overall deadline for it.
                        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                        let _ = tokio::time::timeout(remaining, process.wait()).await;
                        return Ok(TurnOutcome::Completed { signals });
                    }
                    if let Some(question) = signals.needs_clarification.clone() {
                        let _ = self.cancel(&mut process).await;
                        return Ok(TurnOutcome::NeedsClarification { question, signals });
                    }
                }
                Ok(Ok(None)) => {
                    // stdout closed; wait for the exit status.
                    return match process.wait().await {
                        Ok(status) if status.success() => Ok(TurnOutcome::NotComplete { signals }),
                        Ok(status) => Ok(TurnOutcome::Crashed {
                            detail: format!("agent exited with {status}"),
                            signals,
                        }),
                        Err(e) => Err(SupervisorError::Other(e.into())),
                    };
                }
                Ok(Err(e)) => return Err(SupervisorError::Other(e.into())),
                Err(_timed_out) => {
                    // Neither idle threshold cancels anything; they only ever
                    // escalate how loudly we warn. The outer `remaining`
                    // check above (turn_max / phase_max) is the only thing
                    // that cancels the process.
                    let idle_elapsed = tokio::time::Instant::now().saturating_duration_since(last_activity);
                    if !warned_idle_timeout && idle_elapsed >= self.timeouts.idle_timeout {
                        on_idle_warning();
                        warned_idle_timeout = true;
                    } else if !warned_idle_warning && idle_elapsed >= self.timeouts.idle_warning {
                        on_idle_warning();
                        warned_idle_warning = true;
                    }
                }
            }
        }
    }

    /// Graceful cancellation: SIGTERM, then SIGKILL after the grace period
    /// if the process hasn't exited.
    pub async fn cancel(&self, process: &mut Box<dyn AgentProcess>) -> Result<(), SupervisorError> {
        process
            .terminate()
            .await
            .map_err(|e| SupervisorError::Other(e.into()))?;
        match tokio::time::timeout(self.timeouts.grace_period, process.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => process
                .kill()
                .await
                .map_err(|e| SupervisorError::Other(e.into())),
        }
    }
}

/// Build the argument vector for one agent invocation of a given phase.
pub fn agent_args(phase: PhaseName, prompt: &str) -> Vec<String> {
    vec![
        "--print".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "-p".to_string(),
        format!("[{phase}] {prompt}"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scripted process for exercising the turn loop without a real
    /// subprocess.
    struct ScriptedProcess {
        lines: VecDeque<Option<String>>,
        exit_success: bool,
        terminated: Arc<Mutex<bool>>,
    }

    impl ScriptedProcess {
        fn new(lines: Vec<&str>, exit_success: bool) -> Self {
            Self {
                lines: lines.into_iter().map(|l| Some(l.to_string())).chain(std::iter::once(None)).collect(),
                exit_success,
                terminated: Arc::new(Mutex::new(false)),
            }
        }
    }

    #[async_trait]
    impl AgentProcess for ScriptedProcess {
        async fn next_line(&mut self) -> std::io::Result<Option<String>> {
            Ok(self.lines.pop_front().flatten())
        }

        async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                Ok(std::process::ExitStatus::from_raw(if self.exit_success { 0 } else { 1 }))
            }
            #[cfg(not(unix))]
            {
                Ok(std::process::Command::new("cmd").arg("/C").arg("exit 0").status().unwrap())
            }
        }

        async fn terminate(&mut self) -> std::io::Result<()> {
            *self.terminated.lock().unwrap() = true;
            Ok(())
        }

        async fn kill(&mut self) -> std::io::Result<()> {
            *self.terminated.lock().unwrap() = true;
            Ok(())
        }
    }

    fn fast_timeouts() -> TimeoutsConfig {
        TimeoutsConfig {
            turn_max: std::time::Duration::from_secs(5),
            phase_max: std::time::Duration::from_secs(30),
            idle_warning: std::time::Duration::from_millis(200),
            idle_timeout: std::time::Duration::from_millis(400),
            heartbeat_interval: std::time::Duration::from_millis(50),
            grace_period: std::time::Duration::from_millis(50),
            gate_check: std::time::Duration::from_secs(1),
        }
    }

    /// A deadline so far out it never itself triggers cancellation, letting
    /// a test isolate whichever timeout it actually cares about.
    fn far_deadline() -> tokio::time::Instant {
        tokio::time::Instant::now() + std::time::Duration::from_secs(3600)
    }

    #[tokio::test]
    async fn completes_on_phase_complete_tag() {
        let supervisor = Supervisor::new(fast_timeouts());
        let process = ScriptedProcess::new(vec!["working...", "<phase_complete>true</phase_complete>"], true);
        let mut collected = Vec::new();
        let outcome = supervisor
            .run_turn(Box::new(process), |l| collected.push(l.to_string()), || {}, far_deadline())
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        assert_eq!(collected.len(), 2);
    }

    #[tokio::test]
    async fn stops_on_needs_clarification() {
        let supervisor = Supervisor::new(fast_timeouts());
        let process = ScriptedProcess::new(
            vec!["<needs_clarification>which db?</needs_clarification>"],
            true,
        );
        let outcome = supervisor
            .run_turn(Box::new(process), |_| {}, || {}, far_deadline())
            .await
            .unwrap();
        match outcome {
            TurnOutcome::NeedsClarification { question, .. } => assert_eq!(question, "which db?"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_exit_without_completion_tag_is_not_complete() {
        let supervisor = Supervisor::new(fast_timeouts());
        let process = ScriptedProcess::new(vec!["still thinking"], true);
        let outcome = supervisor
            .run_turn(Box::new(process), |_| {}, || {}, far_deadline())
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::NotComplete { .. }));
    }

    #[tokio::test]
    async fn nonzero_exit_is_crashed() {
        let supervisor = Supervisor::new(fast_timeouts());
        let process = ScriptedProcess::new(vec!["oops"], false);
        let outcome = supervisor
            .run_turn(Box::new(process), |_| {}, || {}, far_deadline())
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Crashed { .. }));
    }

    struct HangingProcess {
        terminated: Arc<Mutex<bool>>,
    }
    #[async_trait]
    impl AgentProcess for HangingProcess {
        async fn next_line(&mut self) -> std::io::Result<Option<String>> {
            // Never returns before the caller's timeout fires.
            futures_util::future::pending().await
        }
        async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
            futures_util::future::pending().await
        }
        async fn terminate(&mut self) -> std::io::Result<()> {
            *self.terminated.lock().unwrap() = true;
            Ok(())
        }
        async fn kill(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn turn_max_exceeded_cancels_and_reports_timed_out() {
        let timeouts = TimeoutsConfig {
            turn_max: std::time::Duration::from_millis(150),
            idle_warning: std::time::Duration::from_secs(10),
            idle_timeout: std::time::Duration::from_secs(20),
            ..fast_timeouts()
        };
        let terminated = Arc::new(Mutex::new(false));
        let supervisor = Supervisor::new(timeouts);
        let process = HangingProcess {
            terminated: terminated.clone(),
        };
        let outcome = supervisor
            .run_turn(Box::new(process), |_| {}, || {}, far_deadline())
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::TimedOut { .. }));
        assert!(*terminated.lock().unwrap());
    }

    #[tokio::test]
    async fn phase_deadline_exceeded_cancels_even_within_turn_max() {
        let timeouts = TimeoutsConfig {
            turn_max: std::time::Duration::from_secs(10),
            idle_warning: std::time::Duration::from_secs(10),
            idle_timeout: std::time::Duration::from_secs(20),
            ..fast_timeouts()
        };
        let terminated = Arc::new(Mutex::new(false));
        let supervisor = Supervisor::new(timeouts);
        let process = HangingProcess {
            terminated: terminated.clone(),
        };
        let phase_deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(150);
        let outcome = supervisor
            .run_turn(Box::new(process), |_| {}, || {}, phase_deadline)
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::TimedOut { .. }));
        assert!(*terminated.lock().unwrap());
    }

    #[tokio::test]
    async fn idle_timeout_only_warns_and_never_cancels() {
        // `next_line` is re-invoked on every idle-poll cycle once the prior
        // call is cancelled by `tokio::time::timeout`, so the delay has to
        // be anchored to a fixed wall-clock instant rather than restarted
        // on each call, or it would never actually elapse.
        struct SlowThenCompleteProcess {
            ready_at: tokio::time::Instant,
            done: bool,
        }
        #[async_trait]
        impl AgentProcess for SlowThenCompleteProcess {
            async fn next_line(&mut self) -> std::io::Result<Option<String>> {
                if self.done {
                    return Ok(None);
                }
                let now = tokio::time::Instant::now();
                if now < self.ready_at {
                    tokio::time::sleep(self.ready_at - now).await;
                }
                self.done = true;
                Ok(Some("<phase_complete>true</phase_complete>".to_string()))
            }
            async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    Ok(std::process::ExitStatus::from_raw(0))
                }
                #[cfg(not(unix))]
                {
                    Ok(std::process::Command::new("cmd").arg("/C").arg("exit 0").status().unwrap())
                }
            }
            async fn terminate(&mut self) -> std::io::Result<()> {
                Ok(())
            }
            async fn kill(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let timeouts = TimeoutsConfig {
            turn_max: std::time::Duration::from_secs(5),
            idle_warning: std::time::Duration::from_millis(150),
            idle_timeout: std::time::Duration::from_millis(300),
            ..fast_timeouts()
        };
        let warnings = Arc::new(Mutex::new(0));
        let warnings_clone = warnings.clone();
        let supervisor = Supervisor::new(timeouts);
        let process = SlowThenCompleteProcess {
            ready_at: tokio::time::Instant::now() + std::time::Duration::from_millis(350),
            done: false,
        };
        let outcome = supervisor
            .run_turn(
                Box::new(process),
                |_| {},
                || *warnings_clone.lock().unwrap() += 1,
                far_deadline(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        // Both the idle_warning and idle_timeout thresholds should have
        // fired as warnings; neither cancelled the turn.
        assert_eq!(*warnings.lock().unwrap(), 2);
    }

    #[test]
    fn agent_args_embeds_phase_and_prompt() {
        let args = agent_args(PhaseName::Implement, "build the thing");
        assert!(args.iter().any(|a| a.contains("build the thing")));
    }
}
