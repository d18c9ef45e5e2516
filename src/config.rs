//! Runtime configuration: TOML file plus `EDGEHELM_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ConfigError;

/// Top-level configuration for the edgehelm runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub metrics: MetricsConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Admission loop cadence.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Time a running task gets to stop cooperatively before forced cancel.
    #[serde(with = "humantime_serde")]
    pub cancel_grace: Duration,
    /// Preset activated on first boot when the store has no policy yet.
    pub default_policy: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(2),
            cancel_grace: Duration::from_secs(10),
            default_policy: "balanced".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Stream interval used when the caller does not specify one.
    #[serde(with = "humantime_serde")]
    pub default_stream_interval: Duration,
    /// Number of top-CPU processes included in each snapshot.
    pub top_processes: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            default_stream_interval: Duration::from_secs(1),
            top_processes: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file location; the platform data directory when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter, overridable via `RUST_LOG`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file when given (missing file is an error), defaults
    /// otherwise, then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
                toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("EDGEHELM_DB_PATH") {
            self.storage.path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("EDGEHELM_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("EDGEHELM_TICK_INTERVAL") {
            self.scheduler.tick_interval =
                humantime::parse_duration(&v).map_err(|e| ConfigError::InvalidValue {
                    key: "EDGEHELM_TICK_INTERVAL".to_string(),
                    reason: e.to_string(),
                })?;
        }
        if let Ok(v) = std::env::var("EDGEHELM_CANCEL_GRACE") {
            self.scheduler.cancel_grace =
                humantime::parse_duration(&v).map_err(|e| ConfigError::InvalidValue {
                    key: "EDGEHELM_CANCEL_GRACE".to_string(),
                    reason: e.to_string(),
                })?;
        }
        if let Ok(v) = std::env::var("EDGEHELM_DEFAULT_POLICY") {
            self.scheduler.default_policy = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.tick_interval".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.metrics.default_stream_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "metrics.default_stream_interval".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.metrics.top_processes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "metrics.top_processes".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
