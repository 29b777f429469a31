//! Default values for Harvest configuration.
//!
//! All hardcoded defaults are centralized here for easy maintenance.

// ============================================================================
// Storage Defaults
// ============================================================================

/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = ".harvest";

/// Default sessions subdirectory.
pub const DEFAULT_SESSIONS_DIR: &str = "sessions";

/// Default subdirectory for hash files, manifests and potfiles.
pub const DEFAULT_WORK_DIR: &str = "work";

/// Extension of persisted session documents.
pub const SESSION_FILE_EXTENSION: &str = "json";

// ============================================================================
// Session Defaults
// ============================================================================

/// Number of hex characters kept from the session digest.
pub const SESSION_ID_LEN: usize = 12;

/// Minimum seconds between non-terminal persists.
pub const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 10;

/// Finished sessions older than this are eligible for cleanup.
pub const DEFAULT_RETENTION_DAYS: u64 = 7;

/// Mode label recorded in run parameters.
pub const DEFAULT_RUN_MODE: &str = "batch";

// ============================================================================
// Target Defaults
// ============================================================================

/// File extensions treated as targets.
pub const DEFAULT_TARGET_EXTENSIONS: &[&str] = &["keystore", "jks", "p12", "pfx"];

// ============================================================================
// Worker Pool Defaults
// ============================================================================

/// Per-target extraction timeout.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 30;

/// Extraction program.
pub const DEFAULT_EXTRACTOR_PROGRAM: &str = "java";

/// Arguments placed before the target path.
pub const DEFAULT_EXTRACTOR_ARGS: &[&str] = &["-jar", "JksPrivkPrepare.jar"];

/// Prefix of the stdout line carrying the extracted hash.
pub const DEFAULT_HASH_PREFIX: &str = "$jksprivk$";

// ============================================================================
// Engine Defaults
// ============================================================================

/// Search engine binary (resolved through PATH when not absolute).
pub const DEFAULT_ENGINE_BINARY: &str = "hashcat";

/// Hash type selector.
pub const DEFAULT_HASH_MODE: &str = "15500";

/// Attack mode selector (3 = mask).
pub const DEFAULT_ATTACK_MODE: &str = "3";

/// Six characters from custom charset 1.
pub const DEFAULT_MASK: &str = "?1?1?1?1?1?1";

/// Custom charset 1: a-z, A-Z, 0-9.
pub const DEFAULT_CHARSET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Seconds between engine status lines.
pub const DEFAULT_STATUS_TIMER_SECS: u64 = 5;

/// Upper bound on a single supervised engine run.
pub const DEFAULT_ENGINE_TIMEOUT_SECS: u64 = 3600;

/// Time the engine gets to exit after a termination signal.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;

/// Prefix of the engine-side session name.
pub const ENGINE_SESSION_PREFIX: &str = "harvest";

/// Extension of the engine's restore file.
pub const ENGINE_RESTORE_EXTENSION: &str = "restore";

/// Hash file handed to the engine, one identifier per line.
pub const HASH_FILE_NAME: &str = "hashes.txt";

/// Identifier to target mapping written next to the hash file.
pub const MAPPING_FILE_NAME: &str = "mapping.json";

/// Engine result sink.
pub const POTFILE_NAME: &str = "found.pot";

/// Bytes of stderr kept for crash reports.
pub const MAX_CAPTURED_STDERR: usize = 16 * 1024;

/// Longest engine stdout line decoded; longer lines are skipped.
pub const MAX_STATUS_LINE_BYTES: usize = 64 * 1024;

// ============================================================================
// Logging Defaults
// ============================================================================

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";
