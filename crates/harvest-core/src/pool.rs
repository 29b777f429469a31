//! Bounded worker pool for short, independent extraction jobs.
//!
//! Work units run on their own tokio tasks, so a panic in one unit is
//! caught at the join boundary and reported as that unit's failure. The
//! shipped [`CommandExtractor`] additionally runs every unit in its own OS
//! process, which keeps native crashes and hangs away from the orchestrator.
//!
//! Results stream back in completion order.

use std::any::Any;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ExtractorConfig, DEFAULT_TASK_TIMEOUT_SECS};
use crate::target::Target;

/// One less than the available parallelism, never below one.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

/// Failure of a single work unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct WorkerFailure {
    pub message: String,
    /// Process id of the worker, when the unit ran in a child process
    pub pid: Option<u32>,
}

impl WorkerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            pid: None,
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    fn from_join_error(err: JoinError) -> Self {
        if err.is_panic() {
            Self::new(format!("worker panicked: {}", panic_message(err.into_panic())))
        } else {
            Self::new("worker was cancelled")
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Fans work out across a bounded number of workers.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    concurrency: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Creates a pool running at most `concurrency` units at once.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Stops dispatching new units once `token` is cancelled.
    ///
    /// Units already in flight still finish and are yielded.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Runs `work` once per task and streams `(task, outcome)` pairs.
    ///
    /// Outcomes arrive in completion order, not submission order. A unit that
    /// returns an error or panics produces a failure for that task only.
    pub fn run_all<T, O, F, Fut>(
        &self,
        tasks: impl IntoIterator<Item = T>,
        work: F,
    ) -> BoxStream<'static, (T, Result<O, WorkerFailure>)>
    where
        T: Clone + Send + 'static,
        O: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, WorkerFailure>> + Send + 'static,
    {
        let work = Arc::new(work);
        let cancel = self.cancel.clone();
        let stop = async move { cancel.cancelled().await };
        let tasks: Vec<T> = tasks.into_iter().collect();

        debug!(units = tasks.len(), concurrency = self.concurrency, "Dispatching work units");

        stream::iter(tasks)
            .take_until(stop)
            .map(move |task| {
                let work = Arc::clone(&work);
                let input = task.clone();
                async move {
                    let outcome = match tokio::spawn(async move { work(input).await }).await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(WorkerFailure::from_join_error(e)),
                    };
                    (task, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .boxed()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(default_concurrency())
    }
}

/// Produces the engine-facing identifier (hash) for one target.
#[async_trait]
pub trait Extractor: Send + Sync + 'static {
    async fn extract(&self, target: &Target) -> Result<String, WorkerFailure>;
}

/// Runs an external utility once per target and picks the hash line from
/// its stdout.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
    hash_prefix: String,
    timeout: Duration,
}

impl CommandExtractor {
    pub fn new(program: impl Into<String>, args: Vec<String>, hash_prefix: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            hash_prefix: hash_prefix.into(),
            timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
        }
    }

    pub fn from_config(config: &ExtractorConfig, timeout: Duration) -> Self {
        Self::new(&config.program, config.args.clone(), &config.hash_prefix).with_timeout(timeout)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Extractor for CommandExtractor {
    async fn extract(&self, target: &Target) -> Result<String, WorkerFailure> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&target.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group: a terminal Ctrl-C must not kill in-flight units.
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|e| WorkerFailure::new(format!("failed to start {}: {e}", self.program)))?;

        let pid = child.id();

        // Dropping the output future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                WorkerFailure::new(format!("extraction timed out after {:?}", self.timeout))
                    .with_pid(pid)
            })?
            .map_err(|e| WorkerFailure::new(format!("extraction I/O error: {e}")).with_pid(pid))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkerFailure::new(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            ))
            .with_pid(pid));
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with(&self.hash_prefix))
            .map(str::to_string)
            .ok_or_else(|| WorkerFailure::new("no hash found in extractor output").with_pid(pid))
    }
}
