pub mod config;
pub mod engine;
pub mod inspect;
pub mod logging;
pub mod manager;
pub mod manifest;
pub mod orchestrator;
pub mod pool;
pub mod potfile;
pub mod session;
pub mod storage;
pub mod target;
pub mod task;

pub use config::{Config, StorageConfig};
pub use engine::{EngineState, ExitOutcome, ProgressSnapshot, Supervisor};
pub use manager::SessionManager;
pub use manifest::HashManifest;
pub use orchestrator::{Orchestrator, RunReport};
pub use pool::{CommandExtractor, Extractor, WorkerFailure, WorkerPool};
pub use session::{RunParameters, Session, SessionSummary};
pub use storage::{FileStorage, Storage};
pub use target::{discover_targets, Target};
pub use task::{Task, TaskResult, TaskStatus};
