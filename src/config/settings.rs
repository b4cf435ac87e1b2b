//! Server configuration
//!
//! Loads the server configuration from a TOML file. Every field has a default,
//! so a missing file or a partial file both produce a usable configuration.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::pty::PromptMarker;

/// Valid log level values for the tracing filter
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound on concurrent sessions
const MAX_SESSIONS_LIMIT: usize = 1000;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("port must be between 1024 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("session timeout must be at least 1 second")]
    InvalidSessionTimeout,

    #[error("cleanup_interval must be at least 1 second")]
    InvalidCleanupInterval,

    #[error("max_execution_time must be between 1 and 300 seconds, got {0}")]
    InvalidExecutionTime(u64),

    #[error("max_output_size must be between 1024 and 10485760 bytes, got {0}")]
    InvalidOutputSize(usize),

    #[error("max_file_size must be greater than 0")]
    InvalidFileSize,

    #[error("invalid prompt marker: {0}")]
    InvalidPromptMarker(String),

    #[error("blocked pattern '{pattern}' is not a valid regex: {reason}")]
    InvalidBlockedPattern { pattern: String, reason: String },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("{name} must be at least 1 second")]
    InvalidShellTimeout { name: &'static str },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener settings
    pub server: ServerSettings,
    /// Shell process settings
    pub shell: ShellSettings,
    /// Session lifecycle settings
    pub session: SessionSettings,
    /// Command gate and resource limits
    pub security: SecuritySettings,
    /// Log output
    pub logging: LoggingSettings,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Optional authentication token
    pub token: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9000,
            token: None,
        }
    }
}

/// Shell process settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellSettings {
    /// Shell executable
    pub default_shell: String,
    /// Extra arguments passed to the shell
    pub shell_args: Vec<String>,
    /// Prompt string used to detect command completion
    pub prompt_marker: String,
    /// Seconds to wait for the first prompt after spawning
    pub startup_timeout_secs: u64,
    /// Seconds to wait for the `echo $?` probe
    pub exit_code_timeout_secs: u64,
    /// Seconds to wait for a graceful `exit` before killing
    pub terminate_timeout_secs: u64,
    /// Seconds to wait for the `pwd` probe
    pub cwd_timeout_secs: u64,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            default_shell: "/bin/bash".to_string(),
            shell_args: Vec::new(),
            prompt_marker: "__PERSISTENT_SHELL_PROMPT__> ".to_string(),
            startup_timeout_secs: 5,
            exit_code_timeout_secs: 5,
            terminate_timeout_secs: 5,
            cwd_timeout_secs: 5,
        }
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Idle seconds before a session is evicted
    pub timeout_secs: u64,
    /// Seconds between eviction sweeps
    pub cleanup_interval_secs: u64,
    /// Maximum concurrent named sessions
    pub max_sessions: usize,
    /// Blocking worker slots (0 = one per session plus the default session)
    pub worker_threads: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            cleanup_interval_secs: 300,
            max_sessions: 100,
            worker_threads: 0,
        }
    }
}

/// Command gate and resource limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecuritySettings {
    /// Enable command validation
    pub enabled: bool,
    /// Executables allowed to run (empty = any)
    pub allowed_executables: Vec<String>,
    /// Regex patterns that reject a command
    pub blocked_patterns: Vec<String>,
    /// Maximum execution time per command in seconds
    pub max_execution_time: u64,
    /// Maximum captured output per command in bytes
    pub max_output_size: usize,
    /// Maximum file transfer size in bytes
    pub max_file_size: u64,
    /// Working directory for new shells
    pub working_directory: PathBuf,
    /// Log every validation decision
    pub audit_log: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_executables: Vec::new(),
            blocked_patterns: Vec::new(),
            max_execution_time: 30,
            max_output_size: 1024 * 1024,
            max_file_size: 10 * 1024 * 1024,
            working_directory: PathBuf::from("/workspace"),
            audit_log: true,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Console,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// A missing file yields the default configuration.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate all configuration values
    pub fn validate(&self) -> ConfigResult<()> {
        if self.server.port < 1024 {
            return Err(ConfigError::InvalidPort(self.server.port));
        }

        let session = &self.session;
        if session.max_sessions == 0 || session.max_sessions > MAX_SESSIONS_LIMIT {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }
        if session.timeout_secs == 0 {
            return Err(ConfigError::InvalidSessionTimeout);
        }
        if session.cleanup_interval_secs == 0 {
            return Err(ConfigError::InvalidCleanupInterval);
        }

        let shell = &self.shell;
        PromptMarker::new(&shell.prompt_marker)
            .map_err(|e| ConfigError::InvalidPromptMarker(e.to_string()))?;
        for (name, value) in [
            ("startup_timeout_secs", shell.startup_timeout_secs),
            ("exit_code_timeout_secs", shell.exit_code_timeout_secs),
            ("terminate_timeout_secs", shell.terminate_timeout_secs),
            ("cwd_timeout_secs", shell.cwd_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidShellTimeout { name });
            }
        }

        let security = &self.security;
        if !(1..=300).contains(&security.max_execution_time) {
            return Err(ConfigError::InvalidExecutionTime(security.max_execution_time));
        }
        if !(1024..=10 * 1024 * 1024).contains(&security.max_output_size) {
            return Err(ConfigError::InvalidOutputSize(security.max_output_size));
        }
        if security.max_file_size == 0 {
            return Err(ConfigError::InvalidFileSize);
        }
        for pattern in &security.blocked_patterns {
            if let Err(e) = Regex::new(pattern) {
                return Err(ConfigError::InvalidBlockedPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Number of blocking worker slots to provision
    pub fn worker_threads(&self) -> usize {
        match self.session.worker_threads {
            0 => self.session.max_sessions + 1,
            n => n,
        }
    }

    /// Idle timeout for session eviction
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session.timeout_secs)
    }

    /// Interval between eviction sweeps
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.session.cleanup_interval_secs)
    }

    /// Upper bound on a single command's execution time
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.security.max_execution_time)
    }

    /// Log warnings for settings that weaken isolation
    pub fn warn_if_insecure(&self) {
        if !self.security.enabled {
            warn!("Security validation is DISABLED; all commands will be executed without checks");
        }

        if self.server.bind == "0.0.0.0" {
            warn!("Server is binding to all interfaces (0.0.0.0); the shell is exposed to the network");
        }

        if self.server.token.is_none() && self.server.bind != "127.0.0.1" {
            warn!("No authentication token configured for a non-loopback bind address");
        }

        if self.worker_threads() <= self.session.max_sessions {
            warn!(
                worker_threads = self.worker_threads(),
                max_sessions = self.session.max_sessions,
                "Worker pool is smaller than the session limit; commands may queue behind other sessions"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.session.max_sessions, 100);
        assert_eq!(config.security.max_execution_time, 30);
        assert_eq!(config.logging.format, LogFormat::Console);
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
            [shell]
            default_shell = "/bin/sh"

            [session]
            max_sessions = 4

            [security]
            enabled = true
            blocked_patterns = ["rm\\s+-rf"]

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.shell.default_shell, "/bin/sh");
        assert_eq!(config.shell.prompt_marker, ShellSettings::default().prompt_marker);
        assert_eq!(config.session.max_sessions, 4);
        assert_eq!(config.session.timeout_secs, 3600);
        assert!(config.security.enabled);
        assert_eq!(config.security.blocked_patterns, vec!["rm\\s+-rf".to_string()]);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[session\nmax_sessions = ").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config = Config::default();
        config.session.max_sessions = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidMaxSessions(0))));

        let mut config = Config::default();
        config.security.max_execution_time = 301;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidExecutionTime(301))));

        let mut config = Config::default();
        config.security.max_output_size = 10;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidOutputSize(10))));

        let mut config = Config::default();
        config.server.port = 80;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPort(80))));

        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidLogLevel(_))));

        let mut config = Config::default();
        config.shell.terminate_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellTimeout { name: "terminate_timeout_secs" })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_marker_and_pattern() {
        let mut config = Config::default();
        config.shell.prompt_marker = "$ ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPromptMarker(_))));

        let mut config = Config::default();
        config.security.blocked_patterns = vec!["(unclosed".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBlockedPattern { .. })
        ));
    }

    #[test]
    fn test_worker_threads_default_covers_sessions() {
        let mut config = Config::default();
        config.session.max_sessions = 8;
        assert_eq!(config.worker_threads(), 9);

        config.session.worker_threads = 3;
        assert_eq!(config.worker_threads(), 3);
    }

    #[test]
    fn test_duration_accessors() {
        let config = Config::default();
        assert_eq!(config.idle_timeout(), Duration::from_secs(3600));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(300));
        assert_eq!(config.max_execution_time(), Duration::from_secs(30));
    }
}
