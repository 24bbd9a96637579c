//! Configuration management for the ptyrelay daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptyrelay/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::EnterConvention;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("rows and cols must be between 1 and 1000, got {rows}x{cols}")]
    InvalidWindowSize { rows: u16, cols: u16 },

    #[error("read_buffer_size must be between 256 and 1048576 bytes, got {0}")]
    InvalidReadBufferSize(usize),

    #[error("poll_interval_ms must be between 10 and 1000, got {0}")]
    InvalidPollInterval(u64),

    #[error("terminate_grace_ms must be at most 60000, got {0}")]
    InvalidTerminateGrace(u64),

    #[error("viewer_queue_capacity must be between 1 and 65536, got {0}")]
    InvalidViewerQueueCapacity(usize),

    #[error("viewer_send_timeout_ms must be between 1 and 60000, got {0}")]
    InvalidViewerSendTimeout(u64),

    #[error("command timeout_secs must be between 1 and 3600, got {0}")]
    InvalidCommandTimeout(u64),

    #[error("listen_addr must be a socket address like 127.0.0.1:8081, got {0}")]
    InvalidListenAddr(String),

    #[error("term must not be empty")]
    InvalidTerm,

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the ptyrelay daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Network-related configuration.
    pub network: NetworkConfig,

    /// Session configuration.
    pub session: SessionConfig,

    /// One-shot command configuration.
    pub command: CommandConfig,

    /// Keyboard translation.
    pub keys: KeysConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (PID file, logs).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily log files. Logs go to stderr when unset,
    /// except in attach mode, which always logs to a file.
    pub log_dir: Option<PathBuf>,
}

/// Network configuration for the viewer surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the WebSocket server listens on.
    pub listen_addr: String,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell for new sessions. Unset means `$SHELL`, then `/bin/sh`.
    pub default_shell: Option<String>,

    /// Start shells as login shells.
    pub login_shell: bool,

    /// `TERM` value for spawned shells.
    pub term: String,

    /// Initial terminal rows.
    pub rows: u16,

    /// Initial terminal columns.
    pub cols: u16,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Maximum bytes per output chunk.
    pub read_buffer_size: usize,

    /// Reader readability wait, in milliseconds.
    pub poll_interval_ms: u64,

    /// Time between the terminate signal and force-kill, in milliseconds.
    pub terminate_grace_ms: u64,

    /// Output chunks queued per viewer.
    pub viewer_queue_capacity: usize,

    /// How long a viewer may stall before it is disconnected, in milliseconds.
    pub viewer_send_timeout_ms: u64,

    /// Terminate a session when its last viewer detaches.
    pub close_when_unattached: bool,
}

/// One-shot command configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandConfig {
    /// Time limit for one command, in seconds.
    pub timeout_secs: u64,
}

/// Keyboard translation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct KeysConfig {
    /// What Enter sends.
    pub enter: EnterConvention,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8081".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: None,
            login_shell: true,
            term: "xterm-256color".to_string(),
            rows: 24,
            cols: 80,
            max_sessions: 10,
            read_buffer_size: 8192,
            poll_interval_ms: 100,
            terminate_grace_ms: 5000,
            viewer_queue_capacity: 256,
            viewer_send_timeout_ms: 5000,
            close_when_unattached: true,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl CommandConfig {
    /// Returns the command time limit.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptyrelay")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptyrelay")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYRELAY_LISTEN_ADDR: Override the WebSocket listen address
    /// - PTYRELAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PTYRELAY_SHELL: Override the default shell
    pub fn apply_env_overrides(&mut self) {
        if let Some(addr) = non_empty_env("PTYRELAY_LISTEN_ADDR") {
            tracing::info!("Overriding listen_addr from environment: {}", addr);
            self.network.listen_addr = addr;
        }

        if let Some(level) = non_empty_env("PTYRELAY_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(shell) = non_empty_env("PTYRELAY_SHELL") {
            tracing::info!("Overriding default_shell from environment: {}", shell);
            self.session.default_shell = Some(shell);
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if !(1..=1000).contains(&session.rows) || !(1..=1000).contains(&session.cols) {
            return Err(ConfigError::InvalidWindowSize {
                rows: session.rows,
                cols: session.cols,
            });
        }

        if !(256..=1024 * 1024).contains(&session.read_buffer_size) {
            return Err(ConfigError::InvalidReadBufferSize(session.read_buffer_size));
        }

        if !(10..=1000).contains(&session.poll_interval_ms) {
            return Err(ConfigError::InvalidPollInterval(session.poll_interval_ms));
        }

        if session.terminate_grace_ms > 60_000 {
            return Err(ConfigError::InvalidTerminateGrace(session.terminate_grace_ms));
        }

        if !(1..=65_536).contains(&session.viewer_queue_capacity) {
            return Err(ConfigError::InvalidViewerQueueCapacity(
                session.viewer_queue_capacity,
            ));
        }

        if !(1..=60_000).contains(&session.viewer_send_timeout_ms) {
            return Err(ConfigError::InvalidViewerSendTimeout(
                session.viewer_send_timeout_ms,
            ));
        }

        if session.term.trim().is_empty() {
            return Err(ConfigError::InvalidTerm);
        }

        if !(1..=3600).contains(&self.command.timeout_secs) {
            return Err(ConfigError::InvalidCommandTimeout(self.command.timeout_secs));
        }

        if self.network.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.network.listen_addr.clone(),
            ));
        }

        if let Some(shell) = &session.default_shell {
            let shell_path = Path::new(shell);

            // Absolute paths must exist; bare names are looked up in PATH.
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(shell).is_ok()
            };

            if !found {
                return Err(ConfigError::InvalidShellPath(shell.clone()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Returns the parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.network
            .listen_addr
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddr(self.network.listen_addr.clone()))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var("PTYRELAY_LISTEN_ADDR");
        std::env::remove_var("PTYRELAY_LOG_LEVEL");
        std::env::remove_var("PTYRELAY_SHELL");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.log_dir.is_none());
        assert_eq!(config.network.listen_addr, "127.0.0.1:8081");
        assert_eq!(config.session.max_sessions, 10);
        assert_eq!((config.session.rows, config.session.cols), (24, 80));
        assert_eq!(config.session.term, "xterm-256color");
        assert!(config.session.login_shell);
        assert_eq!(config.session.read_buffer_size, 8192);
        assert_eq!(config.session.poll_interval_ms, 100);
        assert!(config.session.close_when_unattached);
        assert_eq!(config.command.timeout(), Duration::from_secs(30));
        assert_eq!(config.keys.enter, EnterConvention::CarriageReturn);
    }

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.data_dir.to_string_lossy().contains("ptyrelay"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
max_sessions = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.max_sessions, 5);
        assert_eq!(config.network.listen_addr, "127.0.0.1:8081");
        assert_eq!(config.session.rows, 24);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/custom/data"
log_level = "trace"
log_dir = "/custom/logs"

[network]
listen_addr = "0.0.0.0:9000"

[session]
default_shell = "/bin/zsh"
login_shell = false
term = "xterm"
rows = 40
cols = 120
max_sessions = 20
read_buffer_size = 4096
poll_interval_ms = 250
terminate_grace_ms = 1000
viewer_queue_capacity = 64
viewer_send_timeout_ms = 2000
close_when_unattached = false

[command]
timeout_secs = 5

[keys]
enter = "line_feed"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.daemon.log_dir, Some(PathBuf::from("/custom/logs")));
        assert_eq!(config.network.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.session.default_shell, Some("/bin/zsh".to_string()));
        assert!(!config.session.login_shell);
        assert_eq!(config.session.term, "xterm");
        assert_eq!((config.session.rows, config.session.cols), (40, 120));
        assert_eq!(config.session.max_sessions, 20);
        assert_eq!(config.session.read_buffer_size, 4096);
        assert_eq!(config.session.poll_interval_ms, 250);
        assert_eq!(config.session.terminate_grace_ms, 1000);
        assert_eq!(config.session.viewer_queue_capacity, 64);
        assert_eq!(config.session.viewer_send_timeout_ms, 2000);
        assert!(!config.session.close_when_unattached);
        assert_eq!(config.command.timeout_secs, 5);
        assert_eq!(config.keys.enter, EnterConvention::LineFeed);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
max_sessions = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_from_toml_unknown_enter_convention() {
        let toml = r#"
[keys]
enter = "crlf"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_to_toml() {
        let config = Config::default();
        let toml = config.to_toml().unwrap();

        assert!(toml.contains("[daemon]"));
        assert!(toml.contains("[network]"));
        assert!(toml.contains("[session]"));
        assert!(toml.contains("[command]"));
        assert!(toml.contains("[keys]"));
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.daemon.log_dir = Some(PathBuf::from("/var/log/ptyrelay"));
        original.session.default_shell = Some("/bin/bash".to_string());
        original.session.max_sessions = 42;
        original.keys.enter = EnterConvention::LineFeed;

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut original = Config::default();
        original.daemon.log_level = "debug".to_string();
        original.session.max_sessions = 15;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_save_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir
            .path()
            .join("nested")
            .join("dirs")
            .join("config.toml");

        Config::default().save(&config_path).unwrap();
        assert!(config_path.exists());
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        fs::write(&config_path, "invalid [ toml").unwrap();

        let result = Config::load(&config_path);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("ptyrelay"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("PTYRELAY_LISTEN_ADDR", "127.0.0.1:9999");
        std::env::set_var("PTYRELAY_LOG_LEVEL", "debug");
        std::env::set_var("PTYRELAY_SHELL", "/bin/sh");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.network.listen_addr, "127.0.0.1:9999");
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.default_shell, Some("/bin/sh".to_string()));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("PTYRELAY_LISTEN_ADDR", "");
        std::env::set_var("PTYRELAY_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config, Config::default());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_max_sessions() {
        let mut config = Config::default();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));

        config.session.max_sessions = 1;
        assert!(config.validate().is_ok());
        config.session.max_sessions = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_window_size() {
        let mut config = Config::default();
        config.session.rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidWindowSize { rows: 0, cols: 80 })
        );
    }

    #[test]
    fn test_validate_reader_settings() {
        let mut config = Config::default();
        config.session.read_buffer_size = 16;
        assert_eq!(config.validate(), Err(ConfigError::InvalidReadBufferSize(16)));

        let mut config = Config::default();
        config.session.poll_interval_ms = 5000;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPollInterval(5000)));

        let mut config = Config::default();
        config.session.poll_interval_ms = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_viewer_settings() {
        let mut config = Config::default();
        config.session.viewer_queue_capacity = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidViewerQueueCapacity(0))
        );

        let mut config = Config::default();
        config.session.viewer_send_timeout_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidViewerSendTimeout(0)));
    }

    #[test]
    fn test_validate_terminate_grace() {
        let mut config = Config::default();
        config.session.terminate_grace_ms = 0;
        assert!(config.validate().is_ok());

        config.session.terminate_grace_ms = 60_001;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTerminateGrace(60_001))
        );
    }

    #[test]
    fn test_validate_command_timeout() {
        let mut config = Config::default();
        config.command.timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidCommandTimeout(0)));
    }

    #[test]
    fn test_validate_listen_addr() {
        let mut config = Config::default();
        config.network.listen_addr = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidListenAddr("localhost".to_string()))
        );

        config.network.listen_addr = "[::1]:8081".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr().unwrap().port(), 8081);
    }

    #[test]
    fn test_validate_term() {
        let mut config = Config::default();
        config.session.term = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::InvalidTerm));
    }

    #[test]
    fn test_validate_shell_path_absolute_exists() {
        let mut config = Config::default();
        config.session.default_shell = Some("/bin/sh".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_shell_path_absolute_not_exists() {
        let mut config = Config::default();
        config.session.default_shell = Some("/nonexistent/path/to/shell".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(
                "/nonexistent/path/to/shell".to_string()
            ))
        );
    }

    #[test]
    fn test_validate_shell_path_in_path() {
        let mut config = Config::default();
        config.session.default_shell = Some("sh".to_string());
        assert!(config.validate().is_ok());

        config.session.default_shell = Some("nonexistent_shell_xyz".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(
                "nonexistent_shell_xyz".to_string()
            ))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        for level in ["trace", "debug", "info", "warn", "error", "DEBUG", "Info"] {
            config.daemon.log_level = level.to_string();
            assert!(config.validate().is_ok(), "{} should be valid", level);
        }

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );

        config.daemon.log_level = "warning".to_string();
        assert!(config.validate().is_err());
    }
}
