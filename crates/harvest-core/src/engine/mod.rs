//! External search engine: invocation, supervision and status decoding.

pub mod command;
pub mod status;
pub mod supervisor;

pub use command::{engine_session_token, EngineCommand};
pub use status::{parse, DeviceReading, LifecycleState, ProgressSnapshot};
pub use supervisor::{EngineHandle, EngineState, ExitOutcome, Supervisor, SupervisorError};
