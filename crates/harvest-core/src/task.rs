use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inspect::CredentialInfo;
use crate::target::Target;

/// Coarse lifecycle status of a task.
///
/// Tasks move linearly:
/// Pending → Processing → {Completed | Failed | Skipped}
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be dispatched
    #[default]
    Pending,
    /// Dispatched to a worker or an engine run
    Processing,
    /// A secret was recovered
    Completed,
    /// Work ran and did not produce a secret
    Failed,
    /// Work was deliberately not attempted
    Skipped,
}

impl TaskStatus {
    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Returns a human-readable name for the status.
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Processing => "Processing",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
            TaskStatus::Skipped => "Skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Payload recorded when a secret was recovered for a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// The recovered secret
    pub secret: String,
    /// Metadata from the credential inspector, when enrichment succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialInfo>,
    /// Why enrichment failed; the recovery itself still stands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment_error: Option<String>,
}

impl TaskResult {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            credential: None,
            enrichment_error: None,
        }
    }

    pub fn with_credential(mut self, credential: CredentialInfo) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_enrichment_error(mut self, error: impl Into<String>) -> Self {
        self.enrichment_error = Some(error.into());
        self
    }
}

/// Lifecycle state of a task together with the data that state carries.
///
/// A result only exists on `Completed`, an error only on `Failed`, a reason
/// only on `Skipped`, so no inconsistent combination can be represented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Processing,
    Completed { result: TaskResult },
    Failed { error: String },
    Skipped { reason: String },
}

impl TaskState {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskState::Pending => TaskStatus::Pending,
            TaskState::Processing => TaskStatus::Processing,
            TaskState::Completed { .. } => TaskStatus::Completed,
            TaskState::Failed { .. } => TaskStatus::Failed,
            TaskState::Skipped { .. } => TaskStatus::Skipped,
        }
    }
}

/// One unit of work against one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier, unique within a session
    pub target_id: String,
    /// Where the target lives on disk
    pub target_path: PathBuf,
    /// Current state (serialized as `status` plus its payload)
    #[serde(flatten)]
    pub state: TaskState,
    /// Number of times the task entered processing
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates a pending task for the given target.
    pub fn new(target: &Target) -> Self {
        Self {
            target_id: target.id.clone(),
            target_path: target.path.clone(),
            state: TaskState::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.state.status()
    }

    /// The target this task works on.
    pub fn target(&self) -> Target {
        Target {
            id: self.target_id.clone(),
            path: self.target_path.clone(),
        }
    }

    /// Returns the recovery result if the task completed.
    pub fn result(&self) -> Option<&TaskResult> {
        match &self.state {
            TaskState::Completed { result } => Some(result),
            _ => None,
        }
    }

    /// Returns the error or skip reason if the task failed or was skipped.
    pub fn error(&self) -> Option<&str> {
        match &self.state {
            TaskState::Failed { error } => Some(error),
            TaskState::Skipped { reason } => Some(reason),
            _ => None,
        }
    }

    /// Wall-clock time between entering processing and finishing.
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds().max(0) as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// Moves a pending task into processing.
    pub fn begin(&mut self) -> Result<(), TaskError> {
        self.expect_status(TaskStatus::Pending, TaskStatus::Processing)?;
        self.state = TaskState::Processing;
        self.attempts += 1;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        Ok(())
    }

    /// Records a recovered secret.
    pub fn complete(&mut self, result: TaskResult) -> Result<(), TaskError> {
        self.finish(TaskState::Completed { result })
    }

    /// Records a failure.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TaskError> {
        self.finish(TaskState::Failed {
            error: error.into(),
        })
    }

    /// Records that the task was not attempted.
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<(), TaskError> {
        self.finish(TaskState::Skipped {
            reason: reason.into(),
        })
    }

    /// Resets a task that was left processing by an interrupted run.
    ///
    /// Returns true if the task was reset.
    pub fn reset_interrupted(&mut self) -> bool {
        if self.status() != TaskStatus::Processing {
            return false;
        }
        self.state = TaskState::Pending;
        self.started_at = None;
        true
    }

    fn finish(&mut self, state: TaskState) -> Result<(), TaskError> {
        self.expect_status(TaskStatus::Processing, state.status())?;
        self.state = state;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn expect_status(&self, expected: TaskStatus, to: TaskStatus) -> Result<(), TaskError> {
        let actual = self.status();
        if actual != expected {
            return Err(TaskError::InvalidTransition {
                target_id: self.target_id.clone(),
                from: actual,
                to,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Invalid transition for task {target_id}: {from} -> {to}")]
    InvalidTransition {
        target_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(&Target::from_path("/data/a/apk.keystore"))
    }

    #[test]
    fn test_serialized_shape() {
        let mut task = task();
        task.begin().unwrap();
        task.complete(TaskResult::new("s3cret")).unwrap();

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["result"]["secret"], "s3cret");
        assert_eq!(json["attempts"], 1);
        assert!(json.get("error").is_none());

        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_pending_task_serializes_without_payload() {
        let json = serde_json::to_value(task()).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("result").is_none());
        assert!(json.get("started_at").is_none());
    }

    #[test]
    fn test_reset_only_touches_processing() {
        let mut task = task();
        assert!(!task.reset_interrupted());

        task.begin().unwrap();
        assert!(task.reset_interrupted());
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.attempts, 1);

        task.begin().unwrap();
        assert_eq!(task.attempts, 2);
    }
}
