use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

/// Upper bound for every plugin timeout: one week.
pub const MAX_TIMEOUT_SECS: f64 = 604_800.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            logging: LoggingConfig::default(),
            plugins: PluginsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    #[serde(default = "default_stdout_enabled")]
    pub stdout: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            stdout: default_stdout_enabled(),
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// What a connection does when its transport reports a "not found" error.
///
/// Primary connections usually want `Fatal`; auxiliary ones may choose to
/// keep running and only log the condition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotFoundPolicy {
    #[default]
    Fatal,
    Ignore,
}

/// Plugin process tuning, all timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// How long the host waits for a launched child to connect.
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_secs: f64,
    /// How long a running child may stay silent before it is declared locked up.
    #[serde(default = "default_lockup_timeout")]
    pub lockup_timeout_secs: f64,
    /// How long the host waits for the child to exit after asking it to shut down.
    #[serde(default = "default_exit_timeout")]
    pub exit_timeout_secs: f64,
    /// Disables every timeout and launches synchronously, for attached debuggers.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub use_poll_thread: bool,
    /// Child executable; the running binary is used when unset.
    #[serde(default)]
    pub launcher: Option<PathBuf>,
    #[serde(default)]
    pub not_found_policy: NotFoundPolicy,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            launch_timeout_secs: default_launch_timeout(),
            lockup_timeout_secs: default_lockup_timeout(),
            exit_timeout_secs: default_exit_timeout(),
            debug: false,
            use_poll_thread: false,
            launcher: None,
            not_found_policy: NotFoundPolicy::default(),
        }
    }
}

impl PluginsConfig {
    pub fn launch_timeout(&self) -> Duration {
        seconds_to_duration(self.launch_timeout_secs)
    }

    pub fn lockup_timeout(&self) -> Duration {
        seconds_to_duration(self.lockup_timeout_secs)
    }

    pub fn exit_timeout(&self) -> Duration {
        seconds_to_duration(self.exit_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("launch_timeout_secs", self.launch_timeout_secs),
            ("lockup_timeout_secs", self.lockup_timeout_secs),
            ("exit_timeout_secs", self.exit_timeout_secs),
        ] {
            // Also rejects NaN and infinity, which Duration cannot represent.
            if !(value.is_finite() && value > 0.0 && value <= MAX_TIMEOUT_SECS) {
                return Err(ValidationError::InvalidTimeout { field, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error(
        "plugins.{field} must be a positive number of seconds no larger than {}, got {value}",
        MAX_TIMEOUT_SECS
    )]
    InvalidTimeout { field: &'static str, value: f64 },
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }
        self.plugins.validate()
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_stdout_enabled() -> bool {
    true
}

/// Clamps into `0..=MAX_TIMEOUT_SECS`, so unvalidated values cannot panic.
fn seconds_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_TIMEOUT_SECS)).unwrap_or(Duration::ZERO)
}

fn default_launch_timeout() -> f64 {
    60.0
}

fn default_lockup_timeout() -> f64 {
    15.0
}

fn default_exit_timeout() -> f64 {
    15.0
}
