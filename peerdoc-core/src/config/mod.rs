//! Configuration management for peerdoc
//!
//! Layered the usual way: compiled defaults, then an optional TOML file,
//! then `PEERDOC_<SECTION>_<KEY>` environment overrides.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Request/retry behaviour of the sync protocol
    #[serde(default)]
    pub sync: SyncConfig,

    /// Presence heartbeat and expiry
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sync protocol timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a sync or directory request may stay unanswered
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Re-sends after the first attempt before giving up
    pub max_retries: u32,

    /// First backoff delay; doubled on every retry
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Upper bound for the backoff delay
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
}

/// Presence relay timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Period of the full-store heartbeat broadcast
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Age after which a remote entry is swept; twice the heartbeat when unset
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub expiry: Option<Duration>,

    /// Period of the expiry sweep; the heartbeat interval when unset
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub sweep_interval: Option<Duration>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            expiry: None,
            sweep_interval: None,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid("sync.request_timeout", "must be greater than 0"));
        }
        if self.backoff_base.is_zero() {
            return Err(ConfigError::invalid("sync.backoff_base", "must be greater than 0"));
        }
        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::invalid(
                "sync.backoff_base",
                format!("{:?} exceeds backoff_max {:?}", self.backoff_base, self.backoff_max),
            ));
        }
        Ok(())
    }
}

impl PresenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::invalid(
                "presence.heartbeat_interval",
                "must be greater than 0",
            ));
        }
        if self.sweep_period().is_zero() {
            return Err(ConfigError::invalid(
                "presence.sweep_interval",
                "must be greater than 0",
            ));
        }
        // Shorter windows drop live peers between refreshes
        if self.expiry_window() <= self.heartbeat_interval {
            return Err(ConfigError::invalid(
                "presence.expiry",
                format!(
                    "{:?} must be longer than the heartbeat interval {:?}",
                    self.expiry_window(),
                    self.heartbeat_interval
                ),
            ));
        }
        Ok(())
    }

    pub fn expiry_window(&self) -> Duration {
        self.expiry.unwrap_or(self.heartbeat_interval * 2)
    }

    pub fn sweep_period(&self) -> Duration {
        self.sweep_interval.unwrap_or(self.heartbeat_interval)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
        }
    }
}

fn parse_env<T>(key: &str, what: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map(Some).map_err(|e| ConfigError::Env {
            key: key.to_string(),
            reason: format!("invalid {}: {}", what, e),
        }),
        Err(_) => Ok(None),
    }
}

fn parse_env_duration(key: &str, what: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(raw) => humantime_serde::re::humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| ConfigError::Env {
                key: key.to_string(),
                reason: format!("invalid {}: {}", what, e),
            }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables on top of the defaults
    ///
    /// Example: `PEERDOC_SYNC_REQUEST_TIMEOUT=2s`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PEERDOC_*` overrides to an already loaded configuration
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = parse_env_duration("PEERDOC_SYNC_REQUEST_TIMEOUT", "request timeout")? {
            self.sync.request_timeout = v;
        }
        if let Some(v) = parse_env("PEERDOC_SYNC_MAX_RETRIES", "max retries")? {
            self.sync.max_retries = v;
        }
        if let Some(v) = parse_env_duration("PEERDOC_SYNC_BACKOFF_BASE", "backoff base")? {
            self.sync.backoff_base = v;
        }
        if let Some(v) = parse_env_duration("PEERDOC_SYNC_BACKOFF_MAX", "backoff max")? {
            self.sync.backoff_max = v;
        }

        if let Some(v) =
            parse_env_duration("PEERDOC_PRESENCE_HEARTBEAT_INTERVAL", "heartbeat interval")?
        {
            self.presence.heartbeat_interval = v;
        }
        if let Some(v) = parse_env_duration("PEERDOC_PRESENCE_EXPIRY", "presence expiry")? {
            self.presence.expiry = Some(v);
        }
        if let Some(v) = parse_env_duration("PEERDOC_PRESENCE_SWEEP_INTERVAL", "sweep interval")? {
            self.presence.sweep_interval = Some(v);
        }

        if let Ok(level) = env::var("PEERDOC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(v) = parse_env("PEERDOC_LOG_JSON", "JSON flag")? {
            self.logging.json_format = v;
        }

        Ok(())
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sync.validate()?;
        self.presence.validate()?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("unknown level {:?}", self.logging.level),
            ));
        }

        Ok(())
    }

    /// Render as pretty TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = self.to_toml()?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
