//! Restart loop keeping one external program alive.
//!
//! The supervisor owns the only handle to the child. Each iteration either
//! starts the child (subject to the [`RestartPolicy`]) or polls it, then
//! sleeps briefly. Shutdown is observed through [`Shutdown`] within one
//! sleep slice and always ends with the child confirmed dead.

use std::{
    io,
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    policy::RestartPolicy,
    process::{ChildExit, ChildHandle, CommandSpec, OsLauncher, ProcessLauncher},
    shutdown::Shutdown,
};

/// Time a child gets to exit after a cooperative stop request.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);
/// Sleep between liveness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Poll granularity while waiting out the grace period.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Exited,
}

/// Bookkeeping for the supervised program across restarts.
#[derive(Debug, Clone)]
pub struct SupervisedProcess {
    pub command: CommandSpec,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    /// Successful starts during this supervisor's lifetime.
    pub restart_count: u32,
    pub state: ProcessState,
    pub last_exit: Option<ChildExit>,
    pub last_runtime: Option<Duration>,
    started_at: Option<Instant>,
}

impl SupervisedProcess {
    fn new(command: CommandSpec) -> Self {
        Self {
            command,
            pid: None,
            start_time: None,
            restart_count: 0,
            state: ProcessState::NotStarted,
            last_exit: None,
            last_runtime: None,
            started_at: None,
        }
    }

    fn runtime(&self) -> Duration {
        self.started_at
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }
}

/// Why [`ProcessSupervisor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ShutdownRequested,
    RestartLimitReached,
}

pub struct ProcessSupervisor<L: ProcessLauncher = OsLauncher> {
    launcher: L,
    policy: RestartPolicy,
    process: SupervisedProcess,
    child: Option<L::Child>,
    shutdown: Shutdown,
    grace_period: Duration,
    poll_interval: Duration,
}

impl ProcessSupervisor<OsLauncher> {
    pub fn new(command: CommandSpec, policy: RestartPolicy, shutdown: Shutdown) -> Self {
        Self::with_launcher(OsLauncher, command, policy, shutdown)
    }
}

impl<L: ProcessLauncher> ProcessSupervisor<L> {
    pub fn with_launcher(
        launcher: L,
        command: CommandSpec,
        policy: RestartPolicy,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            launcher,
            policy,
            process: SupervisedProcess::new(command),
            child: None,
            shutdown,
            grace_period: DEFAULT_GRACE_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn process(&self) -> &SupervisedProcess {
        &self.process
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Spawn the child and record its pid and start time.
    pub fn start(&mut self) -> Result<u32, SupervisorError> {
        let command = &self.process.command;
        info!("Starting supervised process: {command}");
        let child = self
            .launcher
            .spawn(command)
            .map_err(|source| SupervisorError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let pid = child.pid();
        self.child = Some(child);
        self.process.pid = Some(pid);
        self.process.start_time = Some(Utc::now());
        self.process.started_at = Some(Instant::now());
        self.process.restart_count = self.process.restart_count.saturating_add(1);
        self.process.state = ProcessState::Running;
        metrics::counter!("watchdog_child_starts_total").increment(1);
        info!("Supervised process started with PID: {pid}");
        Ok(pid)
    }

    /// Check the child without blocking. Returns `true` while it is running.
    pub fn poll(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };

        match child.poll_exit() {
            Ok(None) => {
                for line in child.drain_output() {
                    info!("Detection: {line}");
                }
                true
            }
            Ok(Some(exit)) => {
                let output = child.drain_output();
                self.record_exit(exit);
                warn!(
                    "Supervised process terminated with {exit} after {:.1}s",
                    self.process.last_runtime.unwrap_or_default().as_secs_f64()
                );
                if !output.is_empty() {
                    info!("Final output: {}", output.join("\n"));
                }
                false
            }
            Err(err) => {
                warn!("Failed to poll supervised process: {err}");
                true
            }
        }
    }

    fn record_exit(&mut self, exit: ChildExit) {
        self.process.last_runtime = Some(self.process.runtime());
        self.process.last_exit = Some(exit);
        self.process.state = ProcessState::Exited;
        self.process.pid = None;
        self.process.started_at = None;
        self.child = None;
        metrics::counter!("watchdog_child_exits_total").increment(1);
    }

    /// Whether the child may be (re)started now.
    pub fn should_restart(&self) -> bool {
        !self.shutdown.is_triggered() && self.policy.allows_start(self.process.restart_count)
    }

    /// Terminate the child: cooperative request, grace period, then kill.
    ///
    /// Returns once the child is confirmed dead. Does nothing without a child.
    pub fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.pid();
        info!("Stopping supervised process (PID: {pid})...");

        if let Err(err) = child.request_graceful_stop() {
            warn!("Failed to request graceful stop of PID {pid}: {err}");
        }

        let exit = match wait_for_exit(&mut child, self.grace_period) {
            Some(exit) => Some(exit),
            None => {
                warn!("Process didn't stop gracefully, force killing...");
                if let Err(err) = child.force_stop() {
                    error!("Failed to kill PID {pid}: {err}");
                }
                match child.wait() {
                    Ok(exit) => Some(exit),
                    Err(err) => {
                        error!("Error waiting for PID {pid}: {err}");
                        None
                    }
                }
            }
        };

        for line in child.drain_output() {
            debug!("Detection: {line}");
        }
        match exit {
            Some(exit) => self.record_exit(exit),
            None => {
                self.process.state = ProcessState::Exited;
                self.process.pid = None;
            }
        }
        info!("Supervised process stopped");
    }

    /// Supervise until shutdown is requested or the restart cap is reached.
    pub fn run(&mut self) -> StopReason {
        let span = tracing::info_span!(
            "watchdog.supervise",
            command = %self.process.command,
            max_restarts = ?self.policy.max_restarts,
            restart_delay_s = self.policy.restart_delay.as_secs_f64(),
        );
        let _guard = span.enter();
        info!("Starting watchdog service...");

        let reason = loop {
            if self.shutdown.is_triggered() {
                break StopReason::ShutdownRequested;
            }

            if self.child.is_none() {
                if !self.should_restart() {
                    if self.shutdown.is_triggered() {
                        break StopReason::ShutdownRequested;
                    }
                    error!(
                        "Maximum restart limit ({}) reached",
                        self.policy.max_restarts.unwrap_or_default()
                    );
                    break StopReason::RestartLimitReached;
                }

                if self.process.restart_count > 0 {
                    info!(
                        "Waiting {:.1}s before restart #{}...",
                        self.policy.restart_delay.as_secs_f64(),
                        self.process.restart_count + 1
                    );
                    if !self.shutdown.sleep(self.policy.restart_delay) {
                        continue;
                    }
                }

                if let Err(err) = self.start() {
                    error!("{err}; waiting before retry...");
                    self.shutdown.sleep(self.policy.restart_delay);
                    continue;
                }
            }

            if !self.poll() {
                continue;
            }

            self.shutdown.sleep(self.poll_interval);
        };

        if reason == StopReason::ShutdownRequested {
            info!("Shutdown requested");
        }
        self.stop();
        info!("Watchdog service stopped");
        reason
    }
}

impl<L: ProcessLauncher> Drop for ProcessSupervisor<L> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Poll until the child exits or `grace` elapses.
fn wait_for_exit<C: ChildHandle>(child: &mut C, grace: Duration) -> Option<ChildExit> {
    let deadline = Instant::now() + grace;
    loop {
        match child.poll_exit() {
            Ok(Some(exit)) => return Some(exit),
            Ok(None) => {}
            Err(err) => {
                warn!("Failed to poll PID {}: {err}", child.pid());
                return None;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
    }
}
