//! Configuration management for Harvest.
//!
//! Configuration is loaded from multiple sources with the following priority:
//! 1. Environment variables (highest priority)
//! 2. Project-local `harvest.toml` file
//! 3. User config `~/.config/harvest/config.toml`
//! 4. Built-in defaults (lowest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod defaults;

pub use defaults::*;

use crate::logging::{LogConfig, LogFormat, LogLevel};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where sessions and work files live.
    pub storage: StorageConfig,

    /// Session persistence behaviour.
    pub session: SessionConfig,

    /// Bulk extraction worker pool.
    pub pool: PoolConfig,

    /// External hash extraction utility.
    pub extractor: ExtractorConfig,

    /// External search engine.
    pub engine: EngineConfig,

    /// Log output.
    pub logging: LogConfig,
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// Searches for config in order:
    /// 1. `./harvest.toml` (project local)
    /// 2. `~/.config/harvest/config.toml` (user config)
    /// 3. Falls back to defaults
    pub fn load() -> Result<Self, ConfigError> {
        if Path::new("harvest.toml").exists() {
            return Self::from_file("harvest.toml");
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("harvest").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("HARVEST_DATA_DIR") {
            self.storage.data_dir = dir;
        }

        if let Ok(path) = std::env::var("HARVEST_ENGINE_PATH") {
            self.engine.binary_path = PathBuf::from(path);
        }
        if let Ok(mask) = std::env::var("HARVEST_MASK") {
            self.engine.mask = mask;
        }
        if let Ok(secs) = std::env::var("HARVEST_ENGINE_TIMEOUT") {
            if let Ok(n) = secs.parse() {
                self.engine.timeout_secs = n;
            }
        }

        if let Ok(n) = std::env::var("HARVEST_CONCURRENCY") {
            if let Ok(n) = n.parse() {
                self.pool.concurrency = Some(n);
            }
        }

        if let Ok(level) = std::env::var("HARVEST_LOG_LEVEL") {
            if let Ok(level) = level.parse::<LogLevel>() {
                self.logging.level = level;
            }
        }
        if let Ok(format) = std::env::var("HARVEST_LOG_FORMAT") {
            if let Ok(format) = format.parse::<LogFormat>() {
                self.logging.format = format;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.concurrency == Some(0) {
            return Err(ConfigError::Invalid(
                "pool.concurrency must be at least 1".to_string(),
            ));
        }
        if self.engine.mask.is_empty() {
            return Err(ConfigError::Invalid("engine.mask must not be empty".to_string()));
        }
        Ok(())
    }

    /// Create a default config file content as a string.
    pub fn default_config_string() -> String {
        Config::default().to_toml_string()
    }

    /// Render this configuration as TOML.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for harvest data (default: ".harvest").
    pub data_dir: String,

    /// Session documents subdirectory name.
    pub sessions_dir: String,

    /// Hash files, manifests and potfiles subdirectory name.
    pub work_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: DEFAULT_DATA_DIR.to_string(),
            sessions_dir: DEFAULT_SESSIONS_DIR.to_string(),
            work_dir: DEFAULT_WORK_DIR.to_string(),
        }
    }
}

impl StorageConfig {
    /// Full path to the sessions directory.
    pub fn sessions_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.sessions_dir)
    }

    /// Full path to a session's work directory.
    pub fn work_path(&self, session_id: &str) -> PathBuf {
        PathBuf::from(&self.data_dir)
            .join(&self.work_dir)
            .join(session_id)
    }
}

/// Session persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Minimum seconds between non-terminal persists.
    pub autosave_interval_secs: u64,

    /// Days a finished session is kept before cleanup may delete it.
    pub retention_days: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autosave_interval_secs: DEFAULT_AUTOSAVE_INTERVAL_SECS,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl SessionConfig {
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of parallel workers. Unset means one less than the CPU count.
    pub concurrency: Option<usize>,

    /// Per-target timeout applied by the extractor.
    pub task_timeout_secs: u64,

    /// Target file extensions (without leading dot).
    pub target_extensions: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            target_extensions: DEFAULT_TARGET_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PoolConfig {
    /// Configured concurrency, falling back to the pool default.
    pub fn concurrency_or_default(&self) -> usize {
        self.concurrency
            .unwrap_or_else(crate::pool::default_concurrency)
            .max(1)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// Hash extraction utility configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Program to run once per target.
    pub program: String,

    /// Arguments placed before the target path.
    pub args: Vec<String>,

    /// Prefix of the stdout line that carries the hash.
    pub hash_prefix: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_EXTRACTOR_PROGRAM.to_string(),
            args: DEFAULT_EXTRACTOR_ARGS.iter().map(|s| s.to_string()).collect(),
            hash_prefix: DEFAULT_HASH_PREFIX.to_string(),
        }
    }
}

/// Search engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the engine binary. Its parent directory becomes the working
    /// directory of every run.
    pub binary_path: PathBuf,

    /// Hash type selector.
    pub hash_mode: String,

    /// Attack mode selector.
    pub attack_mode: String,

    /// Search-space mask.
    pub mask: String,

    /// Custom charset 1, used when the mask references `?1`.
    pub charset: String,

    /// Seconds between status lines.
    pub status_timer_secs: u64,

    /// Upper bound on one engine run.
    pub timeout_secs: u64,

    /// Seconds between the termination signal and a forced kill.
    pub grace_period_secs: u64,

    /// Additional arguments passed verbatim (device selection, tuning).
    pub extra_args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from(DEFAULT_ENGINE_BINARY),
            hash_mode: DEFAULT_HASH_MODE.to_string(),
            attack_mode: DEFAULT_ATTACK_MODE.to_string(),
            mask: DEFAULT_MASK.to_string(),
            charset: DEFAULT_CHARSET.to_string(),
            status_timer_secs: DEFAULT_STATUS_TIMER_SECS,
            timeout_secs: DEFAULT_ENGINE_TIMEOUT_SECS,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            extra_args: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Absolute path of the engine binary.
    ///
    /// Bare names are looked up on `PATH`. Symlinks are followed so the
    /// parent is the directory the engine's resources actually live in.
    pub fn locate_binary(&self) -> Result<PathBuf, ConfigError> {
        let binary = &self.binary_path;
        let found = match binary.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                if binary.is_absolute() {
                    binary.clone()
                } else {
                    std::env::current_dir()?.join(binary)
                }
            }
            _ => which::which(binary).map_err(|e| {
                ConfigError::Invalid(format!(
                    "engine binary {} not found on PATH: {e}",
                    binary.display()
                ))
            })?,
        };
        Ok(std::fs::canonicalize(&found).unwrap_or(found))
    }

    /// Directory the engine is installed in.
    ///
    /// The engine resolves kernels and other resources relative to its cwd,
    /// so runs must start there.
    pub fn install_dir(&self) -> Result<PathBuf, ConfigError> {
        let binary = self.locate_binary()?;
        binary.parent().map(Path::to_path_buf).ok_or_else(|| {
            ConfigError::Invalid(format!("engine binary {} has no directory", binary.display()))
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}
