use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_AUTOSAVE_INTERVAL_SECS;
use crate::session::{session_id, RunParameters, Session, SessionError, SessionInfo, SessionSummary};
use crate::storage::{Storage, StorageError};
use crate::target::Target;
use crate::task::{Task, TaskResult};

/// Manages sessions and their task transitions.
///
/// Every transition schedules a persist. Non-terminal transitions are
/// throttled to one write per autosave interval; terminal transitions are
/// always written immediately. A failed write is logged and retried at the
/// next persist point instead of interrupting the batch.
pub struct SessionManager<S: Storage> {
    storage: S,
    autosave_interval: Duration,
    last_save: Option<Instant>,
    dirty: bool,
}

impl<S: Storage> SessionManager<S> {
    /// Creates a new SessionManager with the default autosave interval.
    pub fn new(storage: S) -> Self {
        Self::with_interval(storage, Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL_SECS))
    }

    /// Creates a new SessionManager with a custom autosave interval.
    pub fn with_interval(storage: S, autosave_interval: Duration) -> Self {
        Self {
            storage,
            autosave_interval,
            last_save: None,
            dirty: false,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// True when a change has not reached storage yet.
    pub fn has_unsaved_changes(&self) -> bool {
        self.dirty
    }

    /// Resumes today's session for these parameters or creates a new one.
    ///
    /// Returns the session and whether it was resumed.
    pub fn create_or_resume(
        &mut self,
        params: RunParameters,
        targets: Vec<Target>,
    ) -> Result<(Session, bool), ManagerError> {
        self.create_or_resume_on(params, targets, Local::now().date_naive())
    }

    /// Same as [`create_or_resume`](Self::create_or_resume) for an explicit calendar day.
    pub fn create_or_resume_on(
        &mut self,
        params: RunParameters,
        targets: Vec<Target>,
        day: NaiveDate,
    ) -> Result<(Session, bool), ManagerError> {
        let id = session_id(&params, day);

        if let Some(session) = self.load(&id) {
            info!(
                session_id = %id,
                finished = session.finished_count(),
                total = session.total(),
                "Resuming session"
            );
            return Ok((session, true));
        }

        let session = self.create_session(id, params, targets)?;
        Ok((session, false))
    }

    /// Creates a new session for today even if one with the same id exists.
    ///
    /// Used when the caller declines to resume; the old document is replaced.
    pub fn create_fresh(
        &mut self,
        params: RunParameters,
        targets: Vec<Target>,
    ) -> Result<Session, ManagerError> {
        let id = session_id(&params, Local::now().date_naive());
        self.create_session(id, params, targets)
    }

    fn create_session(
        &mut self,
        id: String,
        params: RunParameters,
        targets: Vec<Target>,
    ) -> Result<Session, ManagerError> {
        let session = Session::new(id, params, targets)?;
        info!(session_id = %session.session_id, total = session.total(), "Created session");
        self.persist(&session, true);
        Ok(session)
    }

    /// Loads a session, best effort.
    ///
    /// A missing, unreadable or corrupt document yields `None` so the caller
    /// can start over instead of being blocked. Tasks left processing by an
    /// interrupted run are reset to pending.
    pub fn load(&mut self, id: &str) -> Option<Session> {
        let mut session = match self.storage.load_session(id) {
            Ok(session) => session,
            Err(e) if e.is_not_found() => {
                debug!(session_id = %id, "No stored session");
                return None;
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Ignoring unreadable session");
                return None;
            }
        };

        let reset = session.reconcile_interrupted();
        if reset > 0 {
            info!(session_id = %id, reset, "Reset interrupted tasks to pending");
            self.persist(&session, true);
        }

        Some(session)
    }

    /// Snapshot of pending tasks in insertion order.
    pub fn pending_tasks(&self, session: &Session) -> Vec<Task> {
        session.pending_tasks()
    }

    /// Marks a pending task as processing.
    pub fn begin(&mut self, session: &mut Session, target_id: &str) -> Result<(), ManagerError> {
        session.begin(target_id)?;
        debug!(session_id = %session.session_id, target_id, "Task started");
        self.persist(session, false);
        Ok(())
    }

    /// Records a recovered secret and persists immediately.
    pub fn complete(
        &mut self,
        session: &mut Session,
        target_id: &str,
        result: TaskResult,
    ) -> Result<(), ManagerError> {
        session.complete(target_id, result)?;
        info!(session_id = %session.session_id, target_id, "Task completed");
        self.persist(session, true);
        Ok(())
    }

    /// Records a failure and persists immediately.
    pub fn fail(
        &mut self,
        session: &mut Session,
        target_id: &str,
        error: impl Into<String>,
    ) -> Result<(), ManagerError> {
        let error = error.into();
        session.fail(target_id, error.as_str())?;
        info!(session_id = %session.session_id, target_id, error = %error, "Task failed");
        self.persist(session, true);
        Ok(())
    }

    /// Records a skipped task and persists immediately.
    pub fn skip(
        &mut self,
        session: &mut Session,
        target_id: &str,
        reason: impl Into<String>,
    ) -> Result<(), ManagerError> {
        let reason = reason.into();
        session.skip(target_id, reason.as_str())?;
        info!(session_id = %session.session_id, target_id, reason = %reason, "Task skipped");
        self.persist(session, true);
        Ok(())
    }

    /// Writes the session now, reporting any storage error to the caller.
    pub fn save(&mut self, session: &Session) -> Result<(), StorageError> {
        self.storage.save_session(session)?;
        self.last_save = Some(Instant::now());
        self.dirty = false;
        Ok(())
    }

    /// Writes the session if a throttled change is still outstanding.
    pub fn flush(&mut self, session: &Session) {
        if self.dirty {
            self.persist(session, true);
        }
    }

    /// Aggregate counts and recovered results.
    pub fn summary(&self, session: &Session) -> SessionSummary {
        session.summary()
    }

    /// Lists stored sessions, most recent first.
    pub fn list_sessions(&self) -> Result<Vec<SessionInfo>, ManagerError> {
        Ok(self.storage.list_sessions()?)
    }

    /// Deletes a stored session.
    pub fn delete_session(&mut self, id: &str) -> Result<(), ManagerError> {
        self.storage.delete_session(id)?;
        Ok(())
    }

    /// Deletes finished sessions not updated within `retention`.
    ///
    /// Unfinished sessions are never removed. Returns the number deleted.
    pub fn cleanup_finished(&mut self, retention: Duration) -> Result<usize, ManagerError> {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = Utc::now() - retention;

        let mut removed = 0;
        for info in self.storage.list_sessions()? {
            if info.is_finished() && info.updated_at < cutoff {
                self.storage.delete_session(&info.session_id)?;
                info!(session_id = %info.session_id, "Removed finished session");
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn persist(&mut self, session: &Session, force: bool) {
        let due = self
            .last_save
            .map_or(true, |at| at.elapsed() >= self.autosave_interval);

        if !force && !due {
            self.dirty = true;
            return;
        }

        if let Err(e) = self.save(session) {
            warn!(
                session_id = %session.session_id,
                error = %e,
                "Failed to persist session; will retry at next persist point"
            );
            self.dirty = true;
        }
    }
}

/// Errors that can occur in SessionManager operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Session(#[from] SessionError),
}
