use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{StorageConfig, SESSION_FILE_EXTENSION};
use crate::session::{Session, SessionInfo};

use super::error::StorageError;
use super::Storage;

/// File-based storage implementation.
///
/// Stores one JSON document per session:
/// ```text
/// .harvest/
///   sessions/
///     {session-id}.json
///   work/
///     {session-id}/          # hash file, manifest, potfile
/// ```
pub struct FileStorage {
    config: StorageConfig,
}

impl FileStorage {
    /// Creates a new FileStorage with default config.
    pub fn new() -> Self {
        Self::with_config(StorageConfig::default())
    }

    /// Creates a new FileStorage with custom configuration.
    pub fn with_config(config: StorageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Returns the path to the sessions directory.
    fn sessions_dir(&self) -> PathBuf {
        self.config.sessions_path()
    }

    /// Returns the path to a session document.
    pub fn session_file(&self, id: &str) -> PathBuf {
        self.sessions_dir()
            .join(format!("{id}.{SESSION_FILE_EXTENSION}"))
    }
}

impl Default for FileStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for FileStorage {
    fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        let path = self.session_file(&session.session_id);
        let json = serde_json::to_vec_pretty(session)?;
        write_atomic(&path, &json)?;
        debug!(session_id = %session.session_id, path = %path.display(), "Session saved");
        Ok(())
    }

    fn load_session(&self, id: &str) -> Result<Session, StorageError> {
        let path = self.session_file(id);
        if !path.exists() {
            return Err(StorageError::SessionNotFound(id.to_string()));
        }

        let json = fs::read(&path).map_err(|e| StorageError::io(&path, e))?;
        let session: Session =
            serde_json::from_slice(&json).map_err(|e| StorageError::corrupt(&path, e))?;
        session
            .validate()
            .map_err(|e| StorageError::corrupt(&path, e))?;

        Ok(session)
    }

    fn list_sessions(&self) -> Result<Vec<SessionInfo>, StorageError> {
        let dir = self.sessions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut infos = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| StorageError::io(&dir, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&dir, e))?;
            let path = entry.path();

            if path.extension().and_then(|e| e.to_str()) != Some(SESSION_FILE_EXTENSION) {
                continue;
            }

            if let Some(id) = path.file_stem().and_then(|n| n.to_str()) {
                match self.load_session(id) {
                    Ok(session) => infos.push(session.to_info()),
                    Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable session"),
                }
            }
        }

        infos.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        Ok(infos)
    }

    fn delete_session(&self, id: &str) -> Result<(), StorageError> {
        let path = self.session_file(id);
        if !path.exists() {
            return Err(StorageError::SessionNotFound(id.to_string()));
        }

        fs::remove_file(&path).map_err(|e| StorageError::io(&path, e))?;

        let work = self.config.work_path(id);
        if work.exists() {
            fs::remove_dir_all(&work).map_err(|e| StorageError::io(&work, e))?;
        }

        Ok(())
    }
}

/// Writes `bytes` to `path` via a sibling temp file and a rename.
///
/// Readers see either the old content or the new content, never a mix.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
    }

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp).map_err(|e| StorageError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| StorageError::io(&tmp, e))?;
    file.sync_all().map_err(|e| StorageError::io(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))?;
    Ok(())
}
