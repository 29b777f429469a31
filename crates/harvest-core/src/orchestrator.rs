//! Drives one batch through extraction, search and reconciliation.
//!
//! Pending tasks are handed to the worker pool for hash extraction, the
//! resulting manifest is searched by one supervised engine run, and the
//! engine's potfile is then matched back onto tasks. Tasks stay
//! `processing` while the engine holds them; if the run is cut short they
//! are reset to `pending` the next time the session is loaded.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError, EngineConfig, StorageConfig, POTFILE_NAME};
use crate::engine::{
    engine_session_token, EngineCommand, EngineState, ExitOutcome, ProgressSnapshot, Supervisor,
    SupervisorError,
};
use crate::inspect::CredentialInspector;
use crate::manager::{ManagerError, SessionManager};
use crate::manifest::HashManifest;
use crate::pool::{Extractor, WorkerPool};
use crate::potfile::read_potfile;
use crate::session::{RunParameters, Session, SessionSummary};
use crate::storage::{Storage, StorageError};
use crate::target::Target;
use crate::task::{TaskResult, TaskStatus};

/// Failure reason recorded for tasks the engine searched without success.
pub const EXHAUSTED_REASON: &str = "search space exhausted";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Outcome of the extraction step.
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub manifest: HashManifest,
    pub extracted: usize,
    pub failed: usize,
    /// Tasks begun but never dispatched because the run was cancelled
    pub undispatched: usize,
}

/// Outcome of matching the potfile back onto tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub recovered: usize,
    pub exhausted: usize,
}

/// Outcome of one engine run.
#[derive(Debug, Clone)]
pub struct SearchReport {
    pub outcome: ExitOutcome,
    /// The engine was started from its checkpoint and did not reject it
    pub restored: bool,
}

/// Everything a caller needs to report on a batch.
#[derive(Debug)]
pub struct RunReport {
    pub session_id: String,
    /// The engine resumed its own checkpoint and accepted it
    pub restored: bool,
    pub extracted: usize,
    pub extraction_failures: usize,
    pub engine: Option<ExitOutcome>,
    pub reconciled: ReconcileReport,
    pub interrupted: bool,
    pub summary: SessionSummary,
}

impl RunReport {
    pub fn engine_state(&self) -> EngineState {
        self.engine
            .as_ref()
            .map_or(EngineState::NotStarted, |outcome| outcome.state)
    }
}

pub struct Orchestrator<S: Storage> {
    manager: SessionManager<S>,
    storage: StorageConfig,
    engine: EngineConfig,
    pool: WorkerPool,
    supervisor: Supervisor,
    extractor: Arc<dyn Extractor>,
    inspector: Option<Arc<dyn CredentialInspector>>,
    cancel: CancellationToken,
}

impl<S: Storage> Orchestrator<S> {
    pub fn new(manager: SessionManager<S>, config: &Config, extractor: Arc<dyn Extractor>) -> Self {
        let cancel = CancellationToken::new();
        Self {
            manager,
            storage: config.storage.clone(),
            engine: config.engine.clone(),
            pool: WorkerPool::new(config.pool.concurrency_or_default())
                .with_cancellation(cancel.clone()),
            supervisor: Supervisor::new()
                .with_grace_period(config.engine.grace_period())
                .with_cancellation(cancel.clone()),
            extractor,
            inspector: None,
            cancel,
        }
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn CredentialInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    /// Cancelling this token stops dispatching extractions and terminates
    /// the engine. Progress made so far is kept.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn manager(&self) -> &SessionManager<S> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut SessionManager<S> {
        &mut self.manager
    }

    /// Resumes or creates the session for these parameters.
    ///
    /// With `fresh`, any earlier session with the same id is replaced and
    /// its engine state discarded.
    pub fn open(
        &mut self,
        params: RunParameters,
        targets: Vec<Target>,
        fresh: bool,
    ) -> Result<(Session, bool), OrchestratorError> {
        if !fresh {
            return Ok(self.manager.create_or_resume(params, targets)?);
        }

        let session = self.manager.create_fresh(params, targets)?;
        self.discard_engine_state(&session.session_id);
        Ok((session, false))
    }

    /// Runs every remaining step for `session`.
    pub async fn run<F>(
        &mut self,
        session: &mut Session,
        on_snapshot: F,
    ) -> Result<RunReport, OrchestratorError>
    where
        F: FnMut(&ProgressSnapshot),
    {
        let (manifest, restore, extraction_failures) = match self.restore_point(session) {
            Some(manifest) => {
                self.begin_listed(session, &manifest)?;
                (manifest, true, 0)
            }
            None => {
                let report = self.extract(session).await?;
                (report.manifest, false, report.failed)
            }
        };

        let mut report = RunReport {
            session_id: session.session_id.clone(),
            restored: false,
            extracted: manifest.target_ids().count(),
            extraction_failures,
            engine: None,
            reconciled: ReconcileReport::default(),
            interrupted: self.cancel.is_cancelled(),
            summary: session.summary(),
        };

        if report.interrupted || manifest.is_empty() {
            self.manager.flush(session);
            report.summary = self.manager.summary(session);
            return Ok(report);
        }

        let SearchReport { outcome, restored } =
            self.search(session, &manifest, restore, on_snapshot).await?;
        report.reconciled = self.reconcile(session, &manifest, &outcome).await?;
        report.restored = restored;
        report.interrupted = outcome.state == EngineState::Cancelled;
        report.engine = Some(outcome);
        report.summary = self.manager.summary(session);

        Ok(report)
    }

    /// Extracts identifiers for every pending task.
    ///
    /// Failed extractions are terminal for their task. Successful ones stay
    /// `processing` and are written to the session's manifest.
    pub async fn extract(&mut self, session: &mut Session) -> Result<ExtractReport, OrchestratorError> {
        let pending = self.manager.pending_tasks(session);
        let mut report = ExtractReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        for task in &pending {
            self.manager.begin(session, &task.target_id)?;
        }

        info!(
            session_id = %session.session_id,
            tasks = pending.len(),
            concurrency = self.pool.concurrency(),
            "Extracting hashes"
        );

        let extractor = Arc::clone(&self.extractor);
        let targets: Vec<Target> = pending.iter().map(|task| task.target()).collect();
        let mut outcomes = self.pool.run_all(targets, move |target: Target| {
            let extractor = Arc::clone(&extractor);
            async move { extractor.extract(&target).await }
        });

        let mut dispatched = 0;
        while let Some((target, outcome)) = outcomes.next().await {
            dispatched += 1;
            match outcome {
                Ok(identifier) => {
                    report.manifest.insert(identifier, target.id);
                    report.extracted += 1;
                }
                Err(failure) => {
                    warn!(
                        target = %target.path.display(),
                        pid = ?failure.pid,
                        error = %failure,
                        "Extraction failed"
                    );
                    self.manager.fail(session, &target.id, failure.message)?;
                    report.failed += 1;
                }
            }
        }
        report.undispatched = pending.len() - dispatched;
        self.manager.flush(session);

        if !report.manifest.is_empty() {
            report.manifest.write(&self.storage.work_path(&session.session_id))?;
        }

        info!(
            extracted = report.extracted,
            failed = report.failed,
            undispatched = report.undispatched,
            "Extraction finished"
        );
        Ok(report)
    }

    /// Runs the engine over `manifest`, feeding snapshots to `on_snapshot`.
    ///
    /// With `restore`, the engine is asked to continue its own checkpoint
    /// when one exists. A rejected checkpoint is removed so the next run
    /// starts over.
    pub async fn search<F>(
        &mut self,
        session: &mut Session,
        manifest: &HashManifest,
        restore: bool,
        mut on_snapshot: F,
    ) -> Result<SearchReport, OrchestratorError>
    where
        F: FnMut(&ProgressSnapshot),
    {
        let binary = self.engine.locate_binary()?;
        let install_dir = self.engine.install_dir()?;
        let work_dir = absolute(&self.storage.work_path(&session.session_id))?;
        let token = session
            .engine_session
            .get_or_insert_with(|| engine_session_token(&session.session_id))
            .clone();
        if let Err(e) = self.manager.save(session) {
            warn!(session_id = %session.session_id, error = %e, "Failed to record engine session");
        }

        let command = EngineCommand::from_config(
            &self.engine,
            &token,
            HashManifest::hash_file(&work_dir),
            work_dir.join(POTFILE_NAME),
        );
        let restore = restore && command.can_restore(&install_dir);
        let args = if restore {
            command.restore_args()
        } else {
            command.args()
        };

        info!(
            session_id = %session.session_id,
            engine_session = %token,
            identifiers = manifest.len(),
            restore,
            "Starting search"
        );

        let mut handle = self.supervisor.start(&binary, &args, &install_dir)?;
        let mut snapshots = handle.stream_status();
        let wait = handle.wait(self.engine.timeout());
        tokio::pin!(wait);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(snapshot) = snapshots.next() => on_snapshot(&snapshot),
                outcome = &mut wait => break outcome,
            }
        };
        // The reader has exited by now, so this only drains buffered lines.
        while let Some(snapshot) = snapshots.next().await {
            on_snapshot(&snapshot);
        }

        let rejected = restore && outcome.state == EngineState::Crashed;
        if rejected {
            warn!(
                engine_session = %token,
                stderr = %outcome.stderr,
                "Engine rejected its checkpoint; the next run starts the search over"
            );
            remove_file(&command.restore_file(&install_dir));
        }

        Ok(SearchReport {
            outcome,
            restored: restore && !rejected,
        })
    }

    /// Applies the potfile to the tasks in `manifest`.
    ///
    /// When the engine finished its search, tasks without a recovered secret
    /// fail as exhausted. Otherwise they stay `processing`.
    pub async fn reconcile(
        &mut self,
        session: &mut Session,
        manifest: &HashManifest,
        outcome: &ExitOutcome,
    ) -> Result<ReconcileReport, OrchestratorError> {
        let potfile = self.storage.work_path(&session.session_id).join(POTFILE_NAME);
        let mut report = ReconcileReport::default();

        for entry in read_potfile(&potfile)? {
            let Some(target_ids) = manifest.lookup(&entry.identifier) else {
                debug!(identifier = %entry.identifier, "Potfile entry outside this batch");
                continue;
            };

            for target_id in target_ids {
                let Some(task) = session.task(target_id) else {
                    continue;
                };
                if task.status() != TaskStatus::Processing {
                    continue;
                }
                let path = task.target_path.clone();
                let result = self.enrich(&path, &entry.secret).await;
                self.manager.complete(session, target_id, result)?;
                report.recovered += 1;
            }
        }

        if outcome.state.is_finished_search() {
            let leftover: Vec<String> = manifest
                .target_ids()
                .filter(|id| {
                    session
                        .task(id)
                        .is_some_and(|task| task.status() == TaskStatus::Processing)
                })
                .map(str::to_string)
                .collect();
            for target_id in leftover {
                self.manager.fail(session, &target_id, EXHAUSTED_REASON)?;
                report.exhausted += 1;
            }
        } else {
            info!(
                state = %outcome.state,
                "Search did not finish; unconfirmed tasks resume on the next run"
            );
        }

        self.manager.flush(session);
        info!(
            recovered = report.recovered,
            exhausted = report.exhausted,
            observed = outcome.max_recovered,
            "Reconciled engine results"
        );
        Ok(report)
    }

    async fn enrich(&self, path: &Path, secret: &str) -> TaskResult {
        let result = TaskResult::new(secret);
        let Some(inspector) = &self.inspector else {
            return result;
        };

        match inspector.inspect(path, secret).await {
            Ok(info) => result.with_credential(info),
            Err(e) => {
                warn!(target = %path.display(), error = %e, "Credential inspection failed");
                result.with_enrichment_error(e.to_string())
            }
        }
    }

    /// The stored manifest, when the engine left a checkpoint for it and at
    /// least one of its tasks is still pending.
    fn restore_point(&self, session: &Session) -> Option<HashManifest> {
        let token = session.engine_session.as_deref()?;
        let install_dir = match self.engine.install_dir() {
            Ok(dir) => dir,
            Err(e) => {
                debug!(error = %e, "Engine not found, no checkpoint to restore");
                return None;
            }
        };
        if !EngineCommand::restore_path(&install_dir, token).is_file() {
            return None;
        }

        let manifest = match HashManifest::load(&self.storage.work_path(&session.session_id)) {
            Ok(manifest) => manifest?,
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "Ignoring unreadable manifest");
                return None;
            }
        };

        let resumable = manifest.target_ids().any(|id| {
            session
                .task(id)
                .is_some_and(|task| task.status() == TaskStatus::Pending)
        });
        resumable.then_some(manifest)
    }

    fn begin_listed(&mut self, session: &mut Session, manifest: &HashManifest) -> Result<(), OrchestratorError> {
        let listed: Vec<String> = manifest
            .target_ids()
            .filter(|id| {
                session
                    .task(id)
                    .is_some_and(|task| task.status() == TaskStatus::Pending)
            })
            .map(str::to_string)
            .collect();

        for target_id in &listed {
            self.manager.begin(session, target_id)?;
        }

        let left_out = session.tasks_with_status(TaskStatus::Pending).count();
        info!(
            session_id = %session.session_id,
            resumed = listed.len(),
            left_out,
            "Restoring engine checkpoint"
        );
        Ok(())
    }

    fn discard_engine_state(&self, session_id: &str) {
        let work = self.storage.work_path(session_id);
        if work.exists() {
            if let Err(e) = fs::remove_dir_all(&work) {
                warn!(path = %work.display(), error = %e, "Failed to clear work directory");
            }
        }
        let token = engine_session_token(session_id);
        match self.engine.install_dir() {
            Ok(dir) => remove_file(&EngineCommand::restore_path(&dir, &token)),
            Err(e) => debug!(error = %e, "Engine not found, no checkpoint to discard"),
        }
    }
}

fn remove_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf, StorageError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| StorageError::io(path, e))?;
    Ok(cwd.join(path))
}
