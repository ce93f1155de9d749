//! Child process lifecycle: spawn with piped streams, escalating termination.
//!
//! The ssh client is an opaque child process here. The one hard requirement
//! is that it never outlives its session: termination escalates through a
//! configurable signal sequence and always ends with the process confirmed
//! gone, without ever blocking longer than the sequence's timeout budget.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, trace};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;

use crate::error::SessionError;

/// One step of an escalating termination sequence: send `signal`, then wait
/// up to `timeout` for the process to exit before escalating.
#[derive(Debug, Clone, Copy)]
pub struct SignalStep {
    pub signal: Signal,
    pub timeout: Duration,
}

/// The default sequence: interrupt, then terminate, a second apiece, then an
/// unconditional kill.
pub fn default_signal_steps() -> Vec<SignalStep> {
    vec![
        SignalStep {
            signal: Signal::SIGINT,
            timeout: Duration::from_millis(1000),
        },
        SignalStep {
            signal: Signal::SIGTERM,
            timeout: Duration::from_millis(1000),
        },
    ]
}

/// Owns one spawned connection attempt.
///
/// The three standard streams are piped and handed out once via the `take_*`
/// methods; everything else is waiting and killing. `kill_on_drop` backstops
/// every path, so even a supervisor dropped mid-teardown cannot leak its
/// child.
pub struct Supervisor {
    child: Child,
}

impl Supervisor {
    /// Start the child with stdin, stdout and stderr piped.
    pub fn spawn(mut command: Command) -> Result<Self, SessionError> {
        let program = command
            .as_std()
            .get_program()
            .to_string_lossy()
            .into_owned();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|source| SessionError::Spawn {
            program: program.clone(),
            source,
        })?;
        debug!("spawned {program:?} (pid {:?})", child.id());
        Ok(Self { child })
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the child to exit. `None` if its status could not be
    /// collected (it is gone either way).
    pub async fn wait(&mut self) -> Option<ExitStatus> {
        self.child.wait().await.ok()
    }

    /// Send a signal to the child. A no-op once the process has exited.
    pub fn send_signal(&self, signal: Signal) {
        if let Some(pid) = self.child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), signal) {
                trace!("signal {signal} to pid {pid} failed: {e}");
            }
        }
    }

    /// Escalating termination: walk the signal sequence, racing each step's
    /// timeout against the child exiting, then force-kill if it is somehow
    /// still alive and `final_force_kill` is set.
    ///
    /// Never fails. Returns the exit status when the process is confirmed
    /// exited; `None` only if `final_force_kill` is `false` and the process
    /// survived the whole sequence.
    pub async fn terminate(
        &mut self,
        steps: &[SignalStep],
        final_force_kill: bool,
    ) -> Option<ExitStatus> {
        for step in steps {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            self.send_signal(step.signal);
            match timeout(step.timeout, self.child.wait()).await {
                Ok(status) => return status.ok(),
                // Still alive; escalate.
                Err(_) => {}
            }
        }
        if final_force_kill {
            return self.force_kill().await;
        }
        self.child.try_wait().ok().flatten()
    }

    /// Kill the child outright and reap it.
    pub async fn force_kill(&mut self) -> Option<ExitStatus> {
        if let Err(e) = self.child.kill().await {
            trace!("force kill failed: {e}");
        }
        self.child.wait().await.ok()
    }
}
