//! The per-target session state machine.
//!
//! One machine owns one logical target: it connects through the target's
//! endpoint alternatives round-robin, watches the session's framed output for
//! a decision point, answers the unlock prompt or holds an unlocked shell
//! open, and reconnects on anything it cannot classify. It never gives up;
//! the only way out is the stop signal, which routes every state to `exit`.
//!
//! States are an explicit enum and each entry handler returns the next
//! state. The child process and its streams are owned by exactly one state's
//! handler at a time, so no burst can be processed after the machine has
//! moved on.

use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use secrecy::{ExposeSecret, SecretString};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::console::TargetLog;
use crate::destination::{ClientCommand, Endpoint, TargetGroup};
use crate::error::{Result, SessionError};
use crate::framing::{BurstReader, DEFAULT_SILENCE_TIMEOUT, LineWriter};
use crate::probe;
use crate::process::{SignalStep, Supervisor, default_signal_steps};
use crate::prompt::{self, PromptKind};

/// Interrupt twice, then end-of-transmission. Sent on stop in case the
/// remote shell is sitting in the hold command.
const CONTROL_INTERRUPT_EOF: &[u8] = b"\x03\x03\x04";

/// Upper bound on each best-effort I/O step of the exit sequence.
const EXIT_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Classification looks at a bounded window of recent output, so prompts
/// that arrive as several bursts (banner, instruction, cue) still match.
const WINDOW_MAX: usize = 4096;

/// Tunable knobs for one session machine. The defaults are the production
/// values; tests shrink the timeouts and substitute a scripted client.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// How to invoke the remote-login client.
    pub client: ClientCommand,
    /// Reconnect when no prompt has been classified for this long.
    pub read_timeout: Duration,
    /// Silence interval after which partial output is framed as a burst.
    pub silence_timeout: Duration,
    /// Command written to an unlocked shell to keep the session open.
    pub hold_command: String,
    /// Command to run when a shell prompt appears but the pool may still be
    /// locked. `None` means a shell prompt is taken as already-unlocked.
    pub unlock_command: Option<String>,
    /// Escalation sequence used to end a connection attempt.
    pub signal_steps: Vec<SignalStep>,
    /// Probe the ssh banner before each attempt, for the logs.
    pub probe_server_type: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            client: ClientCommand::default(),
            read_timeout: Duration::from_secs(5),
            silence_timeout: DEFAULT_SILENCE_TIMEOUT,
            hold_command: "sleep infinity".to_string(),
            unlock_command: None,
            signal_steps: default_signal_steps(),
            probe_server_type: true,
        }
    }
}

/// The machine's states. `Exit` is final; everything else loops forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    ReadingOutput,
    EnteringPassphrase,
    CheckingStatus,
    Holding,
    Cleanup,
    Exit,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Connecting => "connecting",
            State::ReadingOutput => "readingOutput",
            State::EnteringPassphrase => "enteringPassphrase",
            State::CheckingStatus => "checkingStatus",
            State::Holding => "holding",
            State::Cleanup => "cleanup",
            State::Exit => "exit",
        };
        f.write_str(name)
    }
}

/// Everything belonging to one live connection attempt. Constructed whole in
/// `connecting` and destroyed whole on the way out.
struct Session {
    endpoint: Endpoint,
    supervisor: Supervisor,
    stdin: LineWriter<tokio::process::ChildStdin>,
    stdout: BurstReader<ChildStdout>,
    stderr: BurstReader<ChildStderr>,
    /// Once stderr hits end of stream it is no longer polled; only stdout
    /// ending means the session itself is over.
    stderr_open: bool,
    /// Recent stdout, for classification across burst boundaries.
    window: String,
}

/// What the session produced while we were reading.
enum Output {
    Stdout(String),
    Stderr(String),
    StderrClosed,
    Closed,
}

impl Session {
    async fn next_output(&mut self) -> Output {
        if self.stderr_open {
            tokio::select! {
                burst = self.stdout.next_burst() => match burst {
                    Some(text) => Output::Stdout(text),
                    None => Output::Closed,
                },
                burst = self.stderr.next_burst() => match burst {
                    Some(text) => Output::Stderr(text),
                    None => {
                        self.stderr_open = false;
                        Output::StderrClosed
                    }
                },
            }
        } else {
            match self.stdout.next_burst().await {
                Some(text) => Output::Stdout(text),
                None => Output::Closed,
            }
        }
    }
}

pub struct SessionMachine {
    targets: TargetGroup,
    passphrase: Arc<SecretString>,
    config: MachineConfig,
    log: TargetLog,
    stop: CancellationToken,
    session: Option<Session>,
    /// The unlock command is issued at most once per connection.
    unlock_command_sent: bool,
}

impl SessionMachine {
    pub fn new(
        targets: TargetGroup,
        passphrase: Arc<SecretString>,
        config: MachineConfig,
        log: TargetLog,
        stop: CancellationToken,
    ) -> Self {
        Self {
            targets,
            passphrase,
            config,
            log,
            stop,
            session: None,
            unlock_command_sent: false,
        }
    }

    /// Drive the machine until the stop signal arrives. Recoverable trouble
    /// (connection failures, read timeouts, unclassifiable output) stays
    /// inside the loop; only invariant violations escape as errors.
    pub async fn run(mut self) -> Result<()> {
        let mut state = State::Connecting;
        loop {
            if self.stop.is_cancelled() {
                state = State::Exit;
            }
            trace!("[{}] state: {state}", self.log.label());
            state = match state {
                State::Connecting => self.connecting().await?,
                State::ReadingOutput => self.reading_output().await,
                State::EnteringPassphrase => self.entering_passphrase().await,
                State::CheckingStatus => self.checking_status().await,
                State::Holding => self.holding().await,
                State::Cleanup => self.cleanup().await,
                State::Exit => {
                    self.exit().await;
                    return Ok(());
                }
            };
        }
    }

    /// Pick the next endpoint alternative, spawn the client, wrap its
    /// streams. Connection-level failure is not visible here; it surfaces in
    /// `readingOutput` as a timeout or closed stream.
    async fn connecting(&mut self) -> Result<State> {
        // A session must never survive into a new connection attempt.
        if let Some(session) = self.session.take() {
            drop(session); // kill_on_drop reaps the child
        }
        self.unlock_command_sent = false;

        let endpoint = self.targets.next_endpoint().clone();

        if self.config.probe_server_type {
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(State::Exit),
                probed = probe::server_type(&endpoint) => match probed {
                    Ok(Some(kind)) => self.log.debug(format_args!(
                        "{}:{} answers as {kind}", endpoint.host, endpoint.port
                    )),
                    Ok(None) => self.log.debug(format_args!(
                        "{}:{} sent no recognizable ssh banner", endpoint.host, endpoint.port
                    )),
                    Err(e) => self.log.debug(format_args!(
                        "banner probe of {}:{} failed: {e}", endpoint.host, endpoint.port
                    )),
                },
            }
        }

        self.log.info(format_args!("connecting to {endpoint}"));
        let mut supervisor = Supervisor::spawn(self.config.client.build(&endpoint))?;
        let stdin = supervisor
            .take_stdin()
            .ok_or(SessionError::MissingStream("stdin"))?;
        let stdout = supervisor
            .take_stdout()
            .ok_or(SessionError::MissingStream("stdout"))?;
        let stderr = supervisor
            .take_stderr()
            .ok_or(SessionError::MissingStream("stderr"))?;

        let silence = Some(self.config.silence_timeout);
        self.session = Some(Session {
            endpoint,
            supervisor,
            stdin: LineWriter::new(stdin),
            stdout: BurstReader::new(stdout, silence),
            stderr: BurstReader::new(stderr, silence),
            stderr_open: true,
            window: String::new(),
        });
        Ok(State::ReadingOutput)
    }

    /// Read bursts until one classifies, the inactivity ceiling passes, or
    /// the stream ends. The ceiling restarts on every burst: a session that
    /// keeps talking is a session worth listening to.
    async fn reading_output(&mut self) -> State {
        let Some(session) = self.session.as_mut() else {
            return State::Cleanup;
        };
        loop {
            let event = tokio::select! {
                _ = self.stop.cancelled() => return State::Exit,
                event = timeout(self.config.read_timeout, session.next_output()) => event,
            };
            match event {
                Err(_) => {
                    self.log.info(format_args!(
                        "no prompt from {} within {:?}; reconnecting",
                        session.endpoint, self.config.read_timeout
                    ));
                    return State::Cleanup;
                }
                Ok(Output::Closed) => {
                    self.log.info(format_args!(
                        "session with {} closed; reconnecting",
                        session.endpoint
                    ));
                    return State::Cleanup;
                }
                Ok(Output::Stderr(text)) => {
                    self.log.debug(format_args!("stderr: {}", text.trim_end()));
                }
                Ok(Output::StderrClosed) => {
                    self.log.debug("stderr closed; still reading stdout");
                }
                Ok(Output::Stdout(text)) => {
                    session.window.push_str(&text);
                    trim_window(&mut session.window);
                    match prompt::classify(&session.window) {
                        PromptKind::Unlock => {
                            session.window.clear();
                            self.log.info("unlock prompt detected");
                            return State::EnteringPassphrase;
                        }
                        PromptKind::Shell => {
                            session.window.clear();
                            self.log.info("shell prompt detected");
                            return State::CheckingStatus;
                        }
                        PromptKind::Other => {
                            self.log.debug(format_args!("output: {}", text.trim_end()));
                        }
                    }
                }
            }
        }
    }

    /// Answer the unlock prompt. The passphrase itself never reaches a log.
    async fn entering_passphrase(&mut self) -> State {
        let Some(session) = self.session.as_mut() else {
            return State::Cleanup;
        };
        self.log.info("entering passphrase");
        tokio::select! {
            _ = self.stop.cancelled() => State::Exit,
            written = session.stdin.write_line(self.passphrase.expose_secret()) => match written {
                Ok(()) => State::ReadingOutput,
                Err(e) => {
                    self.log.warn(format_args!("could not enter passphrase: {e}"));
                    State::Cleanup
                }
            },
        }
    }

    /// Policy point: a shell prompt means the machine booted far enough to
    /// serve one. With no unlock command configured, that is taken to mean
    /// the filesystem is already unlocked. With one configured, it is issued
    /// once per connection and the prompt it triggers is handled normally.
    async fn checking_status(&mut self) -> State {
        let Some(session) = self.session.as_mut() else {
            return State::Cleanup;
        };
        if let Some(command) = &self.config.unlock_command {
            if !self.unlock_command_sent {
                self.unlock_command_sent = true;
                self.log
                    .info(format_args!("shell is up; running {command:?}"));
                return tokio::select! {
                    _ = self.stop.cancelled() => State::Exit,
                    written = session.stdin.write_line(command) => match written {
                        Ok(()) => State::ReadingOutput,
                        Err(e) => {
                            self.log.warn(format_args!("could not run unlock command: {e}"));
                            State::Cleanup
                        }
                    },
                };
            }
        }
        State::Holding
    }

    /// Keep the session open and block until the child exits, which happens
    /// when the server reboots. Waiting for a reboot has no natural upper
    /// bound, so there is deliberately no timeout here.
    async fn holding(&mut self) -> State {
        let Some(session) = self.session.as_mut() else {
            return State::Cleanup;
        };
        self.log
            .info("filesystem unlocked; holding session open until reboot");
        let written = tokio::select! {
            _ = self.stop.cancelled() => return State::Exit,
            written = session.stdin.write_line(&self.config.hold_command) => written,
        };
        if let Err(e) = written {
            self.log
                .warn(format_args!("could not hold the session open: {e}"));
            return State::Cleanup;
        }
        tokio::select! {
            _ = self.stop.cancelled() => State::Exit,
            status = session.supervisor.wait() => {
                self.log.info(format_args!(
                    "session ended ({}); server is likely rebooting",
                    describe_exit(status)
                ));
                State::Cleanup
            }
        }
    }

    /// Tear the connection attempt down: stdin first, so the write half is
    /// released before the child is signaled, then readers, then the
    /// escalating terminate. Errors here are swallowed; cleanup always
    /// completes, and always retries via `connecting`.
    async fn cleanup(&mut self) -> State {
        let Some(mut session) = self.session.take() else {
            return State::Connecting;
        };
        let steps = &self.config.signal_steps;
        let teardown = async move {
            if let Err(e) = session.stdin.shutdown().await {
                trace!("stdin close during cleanup: {e}");
            }
            drop(session.stdin);
            drop(session.stdout);
            drop(session.stderr);
            session.supervisor.terminate(steps, true).await
        };
        tokio::select! {
            // The dropped teardown still reaps the child via kill_on_drop.
            _ = self.stop.cancelled() => State::Exit,
            status = teardown => {
                self.log.debug(format_args!(
                    "connection attempt cleaned up ({})",
                    describe_exit(status)
                ));
                State::Connecting
            }
        }
    }

    /// Final, bounded, best-effort teardown.
    async fn exit(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = timeout(EXIT_IO_TIMEOUT, session.stdin.write_raw(CONTROL_INTERRUPT_EOF)).await;
            let _ = timeout(EXIT_IO_TIMEOUT, session.stdin.shutdown()).await;
            drop(session.stdin);
            drop(session.stdout);
            drop(session.stderr);
            session.supervisor.force_kill().await;
        }
        self.log.info("stopped");
    }
}

/// Keep only the most recent output, trimming at a character boundary.
fn trim_window(window: &mut String) {
    if window.len() > WINDOW_MAX {
        let excess = window.len() - WINDOW_MAX;
        let cut = (excess..=window.len())
            .find(|i| window.is_char_boundary(*i))
            .unwrap_or(window.len());
        window.drain(..cut);
    }
}

fn describe_exit(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "status unknown".to_string(),
    }
}
