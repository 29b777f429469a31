use std::path::{Path, PathBuf};

use crate::config::{
    EngineConfig, DEFAULT_ATTACK_MODE, DEFAULT_CHARSET, DEFAULT_HASH_MODE,
    DEFAULT_STATUS_TIMER_SECS, ENGINE_RESTORE_EXTENSION, ENGINE_SESSION_PREFIX,
};

/// Engine-side session name for a harvest session.
pub fn engine_session_token(session_id: &str) -> String {
    format!("{ENGINE_SESSION_PREFIX}_{session_id}")
}

/// Builds the engine's argument vector.
///
/// Paths should be absolute: the engine runs inside its own installation
/// directory, not the caller's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    session_token: String,
    hash_file: PathBuf,
    potfile: PathBuf,
    mask: String,
    hash_mode: String,
    attack_mode: String,
    charset: Option<String>,
    status_timer_secs: u64,
    extra_args: Vec<String>,
}

impl EngineCommand {
    pub fn new(
        session_token: impl Into<String>,
        hash_file: impl Into<PathBuf>,
        potfile: impl Into<PathBuf>,
        mask: impl Into<String>,
    ) -> Self {
        Self {
            session_token: session_token.into(),
            hash_file: hash_file.into(),
            potfile: potfile.into(),
            mask: mask.into(),
            hash_mode: DEFAULT_HASH_MODE.to_string(),
            attack_mode: DEFAULT_ATTACK_MODE.to_string(),
            charset: Some(DEFAULT_CHARSET.to_string()),
            status_timer_secs: DEFAULT_STATUS_TIMER_SECS,
            extra_args: Vec::new(),
        }
    }

    /// Command for `config`, using its mask and charset.
    pub fn from_config(
        config: &EngineConfig,
        session_token: impl Into<String>,
        hash_file: impl Into<PathBuf>,
        potfile: impl Into<PathBuf>,
    ) -> Self {
        Self::new(session_token, hash_file, potfile, &config.mask)
            .hash_mode(&config.hash_mode)
            .attack_mode(&config.attack_mode)
            .charset(Some(config.charset.clone()).filter(|c| !c.is_empty()))
            .status_timer(config.status_timer_secs)
            .extra_args(config.extra_args.clone())
    }

    pub fn hash_mode(mut self, mode: impl Into<String>) -> Self {
        self.hash_mode = mode.into();
        self
    }

    pub fn attack_mode(mut self, mode: impl Into<String>) -> Self {
        self.attack_mode = mode.into();
        self
    }

    pub fn charset(mut self, charset: Option<String>) -> Self {
        self.charset = charset;
        self
    }

    pub fn status_timer(mut self, secs: u64) -> Self {
        self.status_timer_secs = secs.max(1);
        self
    }

    pub fn extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    /// Arguments for a fresh search.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--hash-type".to_string(),
            self.hash_mode.clone(),
            "--attack-mode".to_string(),
            self.attack_mode.clone(),
            "--potfile-path".to_string(),
            self.potfile.to_string_lossy().into_owned(),
            "--session".to_string(),
            self.session_token.clone(),
            "--status".to_string(),
            "--status-timer".to_string(),
            self.status_timer_secs.to_string(),
            "--status-json".to_string(),
            "--quiet".to_string(),
        ];

        // The custom charset only matters when the mask refers to it.
        if let Some(charset) = self.charset.as_ref().filter(|_| self.mask.contains("?1")) {
            args.push("-1".to_string());
            args.push(charset.clone());
        }

        args.extend(self.extra_args.iter().cloned());
        args.push(self.hash_file.to_string_lossy().into_owned());
        args.push(self.mask.clone());
        args
    }

    /// Arguments that resume the engine's own checkpoint for this session.
    pub fn restore_args(&self) -> Vec<String> {
        vec![
            "--session".to_string(),
            self.session_token.clone(),
            "--restore".to_string(),
        ]
    }

    /// Location of the engine's checkpoint inside its installation directory.
    pub fn restore_file(&self, install_dir: &Path) -> PathBuf {
        Self::restore_path(install_dir, &self.session_token)
    }

    pub fn restore_path(install_dir: &Path, session_token: &str) -> PathBuf {
        install_dir.join(format!("{session_token}.{ENGINE_RESTORE_EXTENSION}"))
    }

    pub fn can_restore(&self, install_dir: &Path) -> bool {
        self.restore_file(install_dir).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> EngineCommand {
        EngineCommand::new("harvest_abc", "/work/hashes.txt", "/work/found.pot", "?1?1?1")
    }

    #[test]
    fn test_fresh_args_order() {
        let args = command().args();
        assert_eq!(args[0..2], ["--hash-type", "15500"]);
        assert!(args.windows(2).any(|w| w == ["--session", "harvest_abc"]));
        assert!(args.windows(2).any(|w| w == ["--potfile-path", "/work/found.pot"]));
        assert!(args.contains(&"--status-json".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-1" && w[1] == DEFAULT_CHARSET));
        assert_eq!(args[args.len() - 2..], ["/work/hashes.txt", "?1?1?1"]);
    }

    #[test]
    fn test_charset_omitted_when_mask_does_not_use_it() {
        let args = EngineCommand::new("t", "/h", "/p", "?d?d?d?d").args();
        assert!(!args.contains(&"-1".to_string()));
    }

    #[test]
    fn test_restore_args() {
        assert_eq!(
            command().restore_args(),
            ["--session", "harvest_abc", "--restore"]
        );
        assert_eq!(
            command().restore_file(Path::new("/opt/engine")),
            PathBuf::from("/opt/engine/harvest_abc.restore")
        );
    }

    #[test]
    fn test_from_config() {
        let config = EngineConfig {
            mask: "?d?d".to_string(),
            extra_args: vec!["--force".to_string()],
            ..EngineConfig::default()
        };
        let args = EngineCommand::from_config(&config, "t", "/h", "/p").args();
        assert!(args.contains(&"--force".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("?d?d"));
        assert_eq!(engine_session_token("abc"), "harvest_abc");
    }
}
