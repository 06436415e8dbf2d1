//! One supervised worker process.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::{timeout_at, Instant};

use super::config::IsolationConfig;
use crate::error::{Result, SandboxError};
use crate::ipc::{AsyncFramedReader, AsyncFramedWriter, Job, WorkerMessage};
use crate::worker::WorkerExit;

/// Lifecycle of a session.
///
/// `Idle -> Spawned -> Running -> (Completed | Faulted | TimedOut)`, with a
/// jump to `Faulted` or `TimedOut` possible from any live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Nothing started yet
    Idle,
    /// Worker process exists, job not yet handed over
    Spawned,
    /// Guest is executing; replies may arrive
    Running,
    /// Guest returned normally
    Completed,
    /// Guest trapped, worker misbehaved, or the session was cancelled
    Faulted,
    /// Budget ran out and the worker was killed
    TimedOut,
}

impl SessionState {
    /// True for the three end states.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Faulted | Self::TimedOut)
    }
}

/// Terminal status of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The guest returned normally
    Completed,
    /// Execution error, with a human-readable reason
    Faulted {
        /// What went wrong
        reason: String,
    },
    /// The wall-clock budget ran out
    TimedOut,
}

impl Outcome {
    /// True for [`Outcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// User-facing one-line description.
    pub fn describe(&self) -> String {
        match self {
            Self::Completed => "completed".to_string(),
            Self::Faulted { reason } => format!("execution error: {}", reason),
            Self::TimedOut => "timed out".to_string(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

fn faulted(reason: impl Into<String>) -> Outcome {
    Outcome::Faulted { reason: reason.into() }
}

/// Map a worker's exit status to an outcome.
fn outcome_for(status: ExitStatus) -> Outcome {
    if let Some(code) = status.code() {
        return match WorkerExit::from_code(code) {
            Some(WorkerExit::Completed) => Outcome::Completed,
            Some(WorkerExit::Faulted) => faulted("guest trapped"),
            Some(WorkerExit::Rejected) => faulted("worker rejected the job"),
            Some(WorkerExit::Exited) => faulted("guest exited with a non-zero status"),
            None => faulted(format!("worker exited with status {}", code)),
        };
    }
    match status.signal() {
        Some(raw) => match Signal::try_from(raw) {
            Ok(signal) => faulted(format!("worker killed by {}", signal)),
            Err(_) => faulted(format!("worker killed by signal {}", raw)),
        },
        None => faulted("worker ended without a status"),
    }
}

/// A running invocation: the worker process and the read side of its pipe.
///
/// Dropping a session kills the worker.
pub struct Session {
    child: Child,
    reader: AsyncFramedReader<ChildStdout>,
    state: SessionState,
    outcome: Option<Outcome>,
    deadline: Instant,
    budget: Duration,
    pid: Option<u32>,
}

impl Session {
    /// Spawn a worker and hand it `job`.
    ///
    /// Failure to start the process is an error. Anything after that ends up
    /// in the session's [`Outcome`].
    pub(crate) async fn start(config: &IsolationConfig, job: &Job<'_>) -> Result<Self> {
        let budget = config.timeout_duration();
        let deadline = Instant::now() + budget;

        let mut command = Command::new(config.worker_program()?);
        command
            .args(&config.worker_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::ConfigError("worker stdin was not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::ConfigError("worker stdout was not piped".to_string()))?;
        tracing::info!(pid = ?pid, "worker spawned");

        let mut session = Self {
            child,
            reader: AsyncFramedReader::new(stdout),
            state: SessionState::Spawned,
            outcome: None,
            deadline,
            budget,
            pid,
        };

        let mut writer = AsyncFramedWriter::new(stdin);
        let handoff = async {
            writer.send(job).await?;
            writer.close().await
        };
        match timeout_at(deadline, handoff).await {
            Ok(Ok(())) => session.state = SessionState::Running,
            // A worker that dies early breaks the pipe; its exit status says why.
            Ok(Err(e)) => {
                tracing::warn!(pid = ?pid, "job hand-off failed: {}", e);
                session.reap().await;
            }
            Err(_) => session.expire().await,
        }
        Ok(session)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The terminal status, once there is one.
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// OS process id of the worker.
    pub fn worker_pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the next reply.
    ///
    /// Returns `None` once the session is over; [`outcome`](Self::outcome)
    /// then says how it ended. Every wait is bounded by the session deadline.
    pub async fn next_reply(&mut self) -> Option<String> {
        if self.state != SessionState::Running {
            return None;
        }
        match timeout_at(self.deadline, self.reader.recv::<WorkerMessage>()).await {
            Ok(Ok(WorkerMessage::Reply { content })) => Some(content),
            Ok(Err(e)) if e.is_end_of_stream() => {
                tracing::debug!(pid = ?self.pid, "worker closed its pipe: {}", e);
                self.reap().await;
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = ?self.pid, "protocol violation from worker: {}", e);
                self.terminate(faulted(format!("protocol violation: {}", e))).await;
                None
            }
            Err(_) => {
                self.expire().await;
                None
            }
        }
    }

    /// Discard remaining replies and wait for the outcome.
    pub async fn finish(mut self) -> Outcome {
        while self.next_reply().await.is_some() {}
        self.outcome
            .take()
            .unwrap_or_else(|| faulted("session ended without an outcome"))
    }

    /// Kill the worker now. No-op once the session is over.
    pub async fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.terminate(faulted("cancelled")).await;
        }
    }

    /// Wait for the worker to exit on its own, within the deadline.
    async fn reap(&mut self) {
        match timeout_at(self.deadline, self.child.wait()).await {
            Ok(Ok(status)) => self.settle(outcome_for(status)),
            Ok(Err(e)) => self.terminate(faulted(format!("failed to wait for worker: {}", e))).await,
            Err(_) => self.expire().await,
        }
    }

    /// The deadline passed: kill the worker and record the timeout.
    async fn expire(&mut self) {
        let err = SandboxError::Timeout(self.budget);
        tracing::warn!(pid = ?self.pid, category = ?err.category(), "{}", err);
        self.terminate(err.into()).await;
    }

    /// Kill and reap the worker, then record `outcome`.
    async fn terminate(&mut self, outcome: Outcome) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(pid = ?self.pid, "kill failed: {}", e);
        }
        if let Err(e) = self.child.wait().await {
            tracing::warn!(pid = ?self.pid, "failed to reap worker: {}", e);
        }
        self.settle(outcome);
    }

    fn settle(&mut self, outcome: Outcome) {
        self.reader.close();
        self.state = match outcome {
            Outcome::Completed => SessionState::Completed,
            Outcome::Faulted { .. } => SessionState::Faulted,
            Outcome::TimedOut => SessionState::TimedOut,
        };
        match &outcome {
            Outcome::Completed => tracing::info!(pid = ?self.pid, "session completed"),
            other => tracing::warn!(pid = ?self.pid, "session ended: {}", other),
        }
        self.outcome = Some(outcome);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("outcome", &self.outcome)
            .finish()
    }
}
