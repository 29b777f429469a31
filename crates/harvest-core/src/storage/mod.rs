mod error;
mod file;

pub use error::StorageError;
pub use file::{write_atomic, FileStorage};

use crate::session::{Session, SessionInfo};

/// Trait for session storage backends.
///
/// Implementations persist whole session documents. A save must replace
/// the previous document atomically so a concurrent reader never observes
/// a partial write.
pub trait Storage: Send + Sync {
    /// Saves a session, replacing any earlier version.
    fn save_session(&self, session: &Session) -> Result<(), StorageError>;

    /// Loads a session by id.
    fn load_session(&self, id: &str) -> Result<Session, StorageError>;

    /// Lists all stored sessions, most recently updated first.
    fn list_sessions(&self) -> Result<Vec<SessionInfo>, StorageError>;

    /// Deletes a session document.
    fn delete_session(&self, id: &str) -> Result<(), StorageError>;
}
