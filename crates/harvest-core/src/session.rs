//! Sessions: the unit of resumability.
//!
//! A session is a fixed set of tasks plus the run parameters they were
//! created with. Its counters are owned here and change only through the
//! task transition methods, so the persisted document is always internally
//! consistent.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::SESSION_ID_LEN;
use crate::target::Target;
use crate::task::{Task, TaskError, TaskResult, TaskStatus};

/// Parameters a batch was started with.
///
/// Together with the calendar day they determine the session id, so
/// re-running with identical parameters finds the earlier session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParameters {
    /// Descriptor of the target set, usually the scanned root path
    pub target: String,
    /// Search-space mask handed to the engine
    pub mask: String,
    /// Processing mode label
    pub mode: String,
    /// Any further engine-relevant options
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl RunParameters {
    pub fn new(target: impl Into<String>, mask: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            mask: mask.into(),
            mode: mode.into(),
            options: BTreeMap::new(),
        }
    }

    /// Parameters for a scanned root, described by its canonical path so
    /// every spelling of the same directory derives the same session id.
    pub fn for_root(
        root: &Path,
        mask: impl Into<String>,
        mode: impl Into<String>,
    ) -> std::io::Result<Self> {
        let root = root.canonicalize()?;
        Ok(Self::new(root.display().to_string(), mask, mode))
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Derives the session id for a run on a given day.
pub fn session_id(params: &RunParameters, day: NaiveDate) -> String {
    let mut hasher = Sha256::new();
    for part in [params.target.as_str(), params.mask.as_str(), params.mode.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    // BTreeMap iteration is ordered, so option order never changes the id.
    for (key, value) in &params.options {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(day.format("%Y%m%d").to_string().as_bytes());

    let mut id = hex::encode(hasher.finalize());
    id.truncate(SESSION_ID_LEN);
    id
}

/// A resumable batch run over a fixed target set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub run_parameters: RunParameters,
    total: usize,
    completed_count: usize,
    failed_count: usize,
    skipped_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub estimated_completion: Option<DateTime<Utc>>,
    /// Engine-side session name, so an interrupted search can be restored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_session: Option<String>,
    tasks: Vec<Task>,
}

impl Session {
    /// Creates a session with one pending task per target.
    pub fn new(
        session_id: impl Into<String>,
        run_parameters: RunParameters,
        targets: Vec<Target>,
    ) -> Result<Self, SessionError> {
        if targets.is_empty() {
            return Err(SessionError::NoTargets);
        }

        let mut seen = HashSet::with_capacity(targets.len());
        for target in &targets {
            if !seen.insert(target.id.as_str()) {
                return Err(SessionError::DuplicateTarget(target.id.clone()));
            }
        }

        let tasks: Vec<Task> = targets.iter().map(Task::new).collect();
        let now = Utc::now();

        Ok(Self {
            session_id: session_id.into(),
            run_parameters,
            total: tasks.len(),
            completed_count: 0,
            failed_count: 0,
            skipped_count: 0,
            created_at: now,
            updated_at: now,
            estimated_completion: None,
            engine_session: None,
            tasks,
        })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed_count(&self) -> usize {
        self.completed_count
    }

    pub fn failed_count(&self) -> usize {
        self.failed_count
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped_count
    }

    /// Tasks that reached a terminal status.
    pub fn finished_count(&self) -> usize {
        self.completed_count + self.failed_count + self.skipped_count
    }

    /// Tasks that still have to reach a terminal status.
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.finished_count())
    }

    pub fn is_finished(&self) -> bool {
        self.finished_count() >= self.total
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.finished_count() as f64 / self.total as f64 * 100.0
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, target_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.target_id == target_id)
    }

    /// Snapshot of the pending tasks in insertion order.
    pub fn pending_tasks(&self) -> Vec<Task> {
        self.tasks_with_status(TaskStatus::Pending).cloned().collect()
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |t| t.status() == status)
    }

    /// Moves a pending task into processing.
    pub fn begin(&mut self, target_id: &str) -> Result<(), SessionError> {
        self.task_mut(target_id)?.begin()?;
        self.touch();
        Ok(())
    }

    pub fn complete(&mut self, target_id: &str, result: TaskResult) -> Result<(), SessionError> {
        self.task_mut(target_id)?.complete(result)?;
        self.completed_count += 1;
        self.after_terminal();
        Ok(())
    }

    pub fn fail(&mut self, target_id: &str, error: impl Into<String>) -> Result<(), SessionError> {
        self.task_mut(target_id)?.fail(error)?;
        self.failed_count += 1;
        self.after_terminal();
        Ok(())
    }

    pub fn skip(&mut self, target_id: &str, reason: impl Into<String>) -> Result<(), SessionError> {
        self.task_mut(target_id)?.skip(reason)?;
        self.skipped_count += 1;
        self.after_terminal();
        Ok(())
    }

    /// Resets every task left processing by an interrupted run to pending.
    ///
    /// A processing task with no live worker or engine behind it cannot be
    /// trusted, so it is simply dispatched again. Returns the number reset.
    pub fn reconcile_interrupted(&mut self) -> usize {
        let reset = self
            .tasks
            .iter_mut()
            .map(|t| t.reset_interrupted())
            .filter(|reset| *reset)
            .count();
        if reset > 0 {
            self.touch();
        }
        reset
    }

    /// Checks that a loaded document is internally consistent.
    pub fn validate(&self) -> Result<(), SessionError> {
        let inconsistent = |reason: String| SessionError::Inconsistent {
            session_id: self.session_id.clone(),
            reason,
        };

        if self.total != self.tasks.len() {
            return Err(inconsistent(format!(
                "total is {} but {} tasks are stored",
                self.total,
                self.tasks.len()
            )));
        }

        let count = |status| self.tasks_with_status(status).count();
        let counted = (
            count(TaskStatus::Completed),
            count(TaskStatus::Failed),
            count(TaskStatus::Skipped),
        );
        if counted != (self.completed_count, self.failed_count, self.skipped_count) {
            return Err(inconsistent(format!(
                "counters {:?} do not match task states {:?}",
                (self.completed_count, self.failed_count, self.skipped_count),
                counted
            )));
        }

        let mut seen = HashSet::with_capacity(self.tasks.len());
        if let Some(dup) = self.tasks.iter().find(|t| !seen.insert(t.target_id.as_str())) {
            return Err(inconsistent(format!("duplicate target {}", dup.target_id)));
        }

        Ok(())
    }

    /// Pure projection of counts and recovered results.
    pub fn summary(&self) -> SessionSummary {
        let results: Vec<CompletedEntry> = self
            .tasks
            .iter()
            .filter_map(|task| {
                task.result().map(|result| CompletedEntry {
                    target_id: task.target_id.clone(),
                    target_path: task.target_path.clone(),
                    result: result.clone(),
                    duration_seconds: task.duration_seconds(),
                })
            })
            .collect();

        SessionSummary {
            session_id: self.session_id.clone(),
            run_parameters: self.run_parameters.clone(),
            created_at: self.created_at,
            total: self.total,
            completed: self.completed_count,
            failed: self.failed_count,
            skipped: self.skipped_count,
            pending: self.remaining(),
            success_rate: self.completed_count as f64 / self.total.max(1) as f64,
            results,
        }
    }

    /// Converts the session to a lightweight listing entry.
    pub fn to_info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            target: self.run_parameters.target.clone(),
            total: self.total,
            finished: self.finished_count(),
            completed: self.completed_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn task_mut(&mut self, target_id: &str) -> Result<&mut Task, SessionError> {
        self.tasks
            .iter_mut()
            .find(|t| t.target_id == target_id)
            .ok_or_else(|| SessionError::TaskNotFound(target_id.to_string()))
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn after_terminal(&mut self) {
        self.touch();
        self.update_estimated_completion();
    }

    /// Mean completed-task duration times the number of unfinished tasks.
    fn update_estimated_completion(&mut self) {
        let durations: Vec<f64> = self
            .tasks_with_status(TaskStatus::Completed)
            .filter_map(Task::duration_seconds)
            .collect();

        if durations.is_empty() {
            return;
        }

        let mean = durations.iter().sum::<f64>() / durations.len() as f64;
        let remaining_ms = (mean * self.remaining() as f64 * 1000.0) as i64;
        self.estimated_completion = Some(Utc::now() + Duration::milliseconds(remaining_ms));
    }
}

/// A lightweight summary of a session for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub target: String,
    pub total: usize,
    pub finished: usize,
    pub completed: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn is_finished(&self) -> bool {
        self.finished >= self.total
    }
}

/// Aggregate view of a session for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub run_parameters: RunParameters,
    pub created_at: DateTime<Utc>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    /// Completed tasks over total, in the range 0..=1
    pub success_rate: f64,
    pub results: Vec<CompletedEntry>,
}

/// One recovered target in a summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedEntry {
    pub target_id: String,
    pub target_path: PathBuf,
    pub result: TaskResult,
    pub duration_seconds: Option<f64>,
}

/// Errors from session state transitions.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error(transparent)]
    InvalidState(#[from] TaskError),

    #[error("A session needs at least one target")]
    NoTargets,

    #[error("Duplicate target id: {0}")]
    DuplicateTarget(String),

    #[error("Inconsistent session {session_id}: {reason}")]
    Inconsistent { session_id: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(names: &[&str]) -> Vec<Target> {
        names
            .iter()
            .map(|n| Target::from_path(format!("/certs/{n}/apk.keystore")))
            .collect()
    }

    fn params() -> RunParameters {
        RunParameters::new("/certs", "?1?1?1?1?1?1", "batch")
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
    }

    #[test]
    fn test_session_id_is_deterministic() {
        assert_eq!(session_id(&params(), day()), session_id(&params(), day()));
        assert_eq!(session_id(&params(), day()).len(), SESSION_ID_LEN);
    }

    #[test]
    fn test_session_id_changes_with_inputs() {
        let base = session_id(&params(), day());
        let other_day = session_id(&params(), day().succ_opt().unwrap());
        let other_mask = session_id(&RunParameters::new("/certs", "?d?d", "batch"), day());
        let with_option = session_id(&params().with_option("charset", "abc"), day());

        assert_ne!(base, other_day);
        assert_ne!(base, other_mask);
        assert_ne!(base, with_option);
    }

    #[test]
    fn test_new_rejects_bad_target_sets() {
        assert!(matches!(
            Session::new("s", params(), Vec::new()),
            Err(SessionError::NoTargets)
        ));

        let mut dup = targets(&["a"]);
        dup.push(dup[0].clone());
        assert!(matches!(
            Session::new("s", params(), dup),
            Err(SessionError::DuplicateTarget(_))
        ));
    }

    #[test]
    fn test_transitions_update_counters() {
        let t = targets(&["a", "b", "c"]);
        let mut session = Session::new("s", params(), t.clone()).unwrap();

        session.begin(&t[0].id).unwrap();
        session.complete(&t[0].id, TaskResult::new("pw")).unwrap();
        session.begin(&t[1].id).unwrap();
        session.fail(&t[1].id, "exhausted").unwrap();

        assert_eq!(session.completed_count(), 1);
        assert_eq!(session.failed_count(), 1);
        assert_eq!(session.remaining(), 1);
        assert!(session.estimated_completion.is_some());
        assert_eq!(session.pending_tasks().len(), 1);
        assert!(session.validate().is_ok());
    }

    #[test]
    fn test_invalid_transitions_are_errors() {
        let t = targets(&["a"]);
        let mut session = Session::new("s", params(), t.clone()).unwrap();

        assert!(matches!(
            session.complete(&t[0].id, TaskResult::new("pw")),
            Err(SessionError::InvalidState(_))
        ));

        session.begin(&t[0].id).unwrap();
        assert!(matches!(
            session.begin(&t[0].id),
            Err(SessionError::InvalidState(_))
        ));

        session.skip(&t[0].id, "unsupported").unwrap();
        assert!(session.fail(&t[0].id, "late").is_err());
        assert_eq!(session.skipped_count(), 1);

        assert!(matches!(
            session.begin("missing"),
            Err(SessionError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_summary_projects_results() {
        let t = targets(&["a", "b"]);
        let mut session = Session::new("s", params(), t.clone()).unwrap();
        session.begin(&t[1].id).unwrap();
        session.complete(&t[1].id, TaskResult::new("hunter2")).unwrap();

        let summary = session.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.pending, 1);
        assert!((summary.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].result.secret, "hunter2");
        assert_eq!(summary.results[0].target_id, t[1].id);
    }

    #[test]
    fn test_validate_detects_counter_drift() {
        let t = targets(&["a"]);
        let session = Session::new("s", params(), t).unwrap();
        let mut json = serde_json::to_value(&session).unwrap();
        json["completed_count"] = serde_json::json!(1);

        let tampered: Session = serde_json::from_value(json).unwrap();
        assert!(matches!(
            tampered.validate(),
            Err(SessionError::Inconsistent { .. })
        ));
    }
}
