//! Supervision of one long-running engine process.
//!
//! A started engine is driven by three background tasks: a waiter that owns
//! the child and reacts to cancellation, a reader that decodes status lines
//! from stdout, and a collector for stderr. [`EngineHandle::wait`] joins them
//! and classifies the run.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn};

use super::status::{self, ProgressSnapshot};
use crate::config::{DEFAULT_GRACE_PERIOD_SECS, MAX_CAPTURED_STDERR, MAX_STATUS_LINE_BYTES};

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    NotStarted,
    Running,
    /// Search space covered, nothing (more) found
    Exhausted,
    /// Exited successfully after recovering at least one secret
    Recovered,
    Crashed,
    TimedOut,
    Cancelled,
}

impl EngineState {
    /// The engine finished its search on its own.
    pub fn is_finished_search(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Recovered)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Running => "running",
            Self::Exhausted => "exhausted",
            Self::Recovered => "recovered",
            Self::Crashed => "crashed",
            Self::TimedOut => "timed out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to start engine {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine crashed (exit code {code:?}): {stderr}")]
    EngineCrashed { code: Option<i32>, stderr: String },

    #[error("Engine timed out after {elapsed:?}")]
    EngineTimedOut { elapsed: Duration },
}

/// How a supervised run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitOutcome {
    pub state: EngineState,
    /// Exit code, absent when the process died from a signal
    pub code: Option<i32>,
    pub final_snapshot: Option<ProgressSnapshot>,
    /// Highest recovered count seen in any snapshot
    pub max_recovered: u64,
    /// Captured stderr, truncated
    pub stderr: String,
    pub elapsed: Duration,
}

impl ExitOutcome {
    /// Turns engine faults into errors; exhausted, recovered and cancelled
    /// runs pass through.
    pub fn into_result(self) -> Result<Self, SupervisorError> {
        match self.state {
            EngineState::Crashed => Err(SupervisorError::EngineCrashed {
                code: self.code,
                stderr: self.stderr,
            }),
            EngineState::TimedOut => Err(SupervisorError::EngineTimedOut {
                elapsed: self.elapsed,
            }),
            _ => Ok(self),
        }
    }
}

/// Starts engine processes.
#[derive(Debug, Clone)]
pub struct Supervisor {
    grace_period: Duration,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
            cancel: CancellationToken::new(),
        }
    }

    /// Time between the termination signal and a forced kill.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Engines started afterwards are cancelled together with `token`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Spawns the engine with `working_dir` as its current directory.
    pub fn start(
        &self,
        binary: &Path,
        args: &[String],
        working_dir: &Path,
    ) -> Result<EngineHandle, SupervisorError> {
        let mut command = Command::new(binary);
        command
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Keep terminal signals away from the engine; shutdown goes through
        // the cancellation token so a checkpoint is always written.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                binary: binary.to_path_buf(),
                source,
            })?;

        let pid = child.id();
        info!(
            binary = %binary.display(),
            cwd = %working_dir.display(),
            pid = ?pid,
            "Engine started"
        );

        let (tx, rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
        let reader = match child.stdout.take() {
            Some(stdout) => tokio::spawn(read_status(stdout, tx)),
            None => tokio::spawn(async { Observed::default() }),
        };
        let collector = match child.stderr.take() {
            Some(stderr) => tokio::spawn(capture_stderr(stderr)),
            None => tokio::spawn(async { String::new() }),
        };

        let cancel = self.cancel.child_token();
        let waiter = tokio::spawn(supervise(child, cancel.clone(), self.grace_period));

        Ok(EngineHandle {
            pid,
            started: Instant::now(),
            grace_period: self.grace_period,
            guard: cancel.clone().drop_guard(),
            cancel,
            snapshots: Some(rx),
            waiter,
            reader,
            collector,
        })
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// A running engine.
///
/// Dropping the handle without waiting terminates the engine.
pub struct EngineHandle {
    pid: Option<u32>,
    started: Instant,
    grace_period: Duration,
    cancel: CancellationToken,
    guard: DropGuard,
    snapshots: Option<mpsc::Receiver<ProgressSnapshot>>,
    waiter: JoinHandle<Ending>,
    reader: JoinHandle<Observed>,
    collector: JoinHandle<String>,
}

impl EngineHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True until the engine process has exited and been reaped.
    pub fn is_running(&self) -> bool {
        !self.waiter.is_finished()
    }

    /// Snapshots decoded from stdout, ending when the process exits.
    ///
    /// The stream can be taken once; later calls return an empty stream.
    /// Snapshots are dropped rather than blocking the engine when the
    /// consumer falls behind.
    pub fn stream_status(&mut self) -> BoxStream<'static, ProgressSnapshot> {
        match self.snapshots.take() {
            Some(rx) => ReceiverStream::new(rx).boxed(),
            None => stream::empty().boxed(),
        }
    }

    /// Token that cancels this engine. Safe to use from any task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests termination. Idempotent, and a no-op once the engine exited.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the engine to exit, cancelling it once `timeout` elapses.
    pub async fn wait(self, timeout: Duration) -> ExitOutcome {
        let EngineHandle {
            pid,
            started,
            grace_period,
            cancel,
            guard,
            mut waiter,
            mut reader,
            mut collector,
            ..
        } = self;

        let mut timed_out = false;
        let joined = match tokio::time::timeout(timeout, &mut waiter).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(pid = ?pid, ?timeout, "Engine timed out, terminating");
                timed_out = true;
                cancel.cancel();
                waiter.await
            }
        };
        guard.disarm();

        let ending = joined.unwrap_or_else(|e| Ending::Lost(format!("supervisor task failed: {e}")));

        // Output pipes may outlive the engine if it left children behind.
        let observed = join_within(grace_period, &mut reader).await;
        let mut stderr = join_within(grace_period, &mut collector).await;

        let (state, code) = match ending {
            Ending::Cancelled(status) if timed_out => (EngineState::TimedOut, status.and_then(|s| s.code())),
            Ending::Cancelled(status) => (EngineState::Cancelled, status.and_then(|s| s.code())),
            Ending::Exited(status) => (classify_exit(status.code(), observed.max_recovered), status.code()),
            Ending::Lost(reason) => {
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(&reason);
                (EngineState::Crashed, None)
            }
        };

        let elapsed = started.elapsed();
        info!(pid = ?pid, state = %state, code = ?code, ?elapsed, "Engine finished");

        ExitOutcome {
            state,
            code,
            final_snapshot: observed.last,
            max_recovered: observed.max_recovered,
            stderr,
            elapsed,
        }
    }
}

/// Joins a pipe task, aborting it if it is still running after `limit`.
async fn join_within<T: Default>(limit: Duration, task: &mut JoinHandle<T>) -> T {
    match tokio::time::timeout(limit, &mut *task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            task.abort();
            T::default()
        }
    }
}

/// Maps an exit code onto a state.
///
/// Code 0 is only trusted as a recovery when snapshots actually reported
/// recovered items; some engine versions exit 0 without finding anything.
fn classify_exit(code: Option<i32>, max_recovered: u64) -> EngineState {
    match code {
        Some(0) if max_recovered > 0 => EngineState::Recovered,
        Some(0) | Some(1) => EngineState::Exhausted,
        _ => EngineState::Crashed,
    }
}

enum Ending {
    Exited(ExitStatus),
    Cancelled(Option<ExitStatus>),
    Lost(String),
}

#[derive(Debug, Default)]
struct Observed {
    last: Option<ProgressSnapshot>,
    max_recovered: u64,
}

async fn supervise(mut child: Child, cancel: CancellationToken, grace: Duration) -> Ending {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };

    match exited {
        Some(Ok(status)) => Ending::Exited(status),
        Some(Err(e)) => Ending::Lost(format!("failed to wait for engine: {e}")),
        None => Ending::Cancelled(terminate(&mut child, grace).await),
    }
}

/// Asks the engine to stop, then kills it after `grace`.
async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    send_terminate(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            warn!(pid = ?child.id(), ?grace, "Engine ignored termination, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill engine");
            }
            child.wait().await.ok()
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM not delivered");
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Failed to stop engine");
    }
}

async fn read_status(stdout: ChildStdout, tx: mpsc::Sender<ProgressSnapshot>) -> Observed {
    let mut reader = BufReader::new(stdout);
    let mut observed = Observed::default();
    let mut buf = Vec::new();
    let mut skipping = false;

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_STATUS_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Engine stdout closed");
                break;
            }
        }

        // A capped read without a newline is the head of an oversized line;
        // everything up to the next newline belongs to it.
        let capped = buf.len() >= MAX_STATUS_LINE_BYTES && buf.last() != Some(&b'\n');
        if skipping || capped {
            if capped && !skipping {
                debug!(limit = MAX_STATUS_LINE_BYTES, "Skipping oversized engine output line");
            }
            skipping = capped;
            continue;
        }

        let line = String::from_utf8_lossy(&buf);
        let Some(snapshot) = status::parse(&line) else {
            trace!(line = %line.trim_end(), "Engine output");
            continue;
        };

        observed.max_recovered = observed.max_recovered.max(snapshot.recovered());
        observed.last = Some(snapshot.clone());
        if tx.try_send(snapshot).is_err() {
            trace!("Status consumer not keeping up, dropping snapshot");
        }
    }

    observed
}

async fn capture_stderr(mut stderr: ChildStderr) -> String {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_CAPTURED_STDERR.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }

    String::from_utf8_lossy(&kept).trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_zero_needs_recovered_items() {
        assert_eq!(classify_exit(Some(0), 0), EngineState::Exhausted);
        assert_eq!(classify_exit(Some(0), 2), EngineState::Recovered);
        assert_eq!(classify_exit(Some(1), 0), EngineState::Exhausted);
        assert_eq!(classify_exit(Some(255), 0), EngineState::Crashed);
        assert_eq!(classify_exit(None, 0), EngineState::Crashed);
    }

    #[test]
    fn test_into_result() {
        let outcome = ExitOutcome {
            state: EngineState::Crashed,
            code: Some(255),
            final_snapshot: None,
            max_recovered: 0,
            stderr: "no devices".to_string(),
            elapsed: Duration::from_secs(1),
        };
        let err = outcome.clone().into_result().unwrap_err();
        assert!(err.to_string().contains("no devices"));

        let exhausted = ExitOutcome {
            state: EngineState::Exhausted,
            ..outcome
        };
        assert!(exhausted.into_result().is_ok());
    }
}
