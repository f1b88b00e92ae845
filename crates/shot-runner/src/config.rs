//! Runner configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `SHOT_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use shot_runner::config::ShotRunnerConfig;
//!
//! let config = ShotRunnerConfig::load_from("config/shot_runner.toml")?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), shot_runner::config::ConfigError>(())
//! ```
//!
//! `SHOT_QUEUE__TRANSITION_TIMEOUT_MS=2500` overrides
//! `queue.transition_timeout_ms`.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use shot_hardware::DeviceConfig;
use shot_queue::QueueSettings;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::logging::OutputFormat;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SHOT_";

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be extracted into the config structure
    #[error("Failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    /// Loaded values are inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShotRunnerConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Queue timeouts and switches
    #[serde(default)]
    pub queue: QueueSettings,
    /// Active connection table (JSON). Relative paths resolve against the
    /// configuration file's directory.
    pub connection_table: PathBuf,
    /// Worker-backed devices
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

fn default_name() -> String {
    "shot-runner".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl ShotRunnerConfig {
    /// Load configuration from a TOML file, then apply `SHOT_` environment
    /// overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        let mut config: Self = figment.extract()?;

        if config.connection_table.is_relative() {
            if let Some(dir) = path.parent() {
                config.connection_table = dir.join(&config.connection_table);
            }
        }
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LEVELS.join(", ")
            )));
        }

        self.queue.validate().map_err(ConfigError::Invalid)?;

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }
        }

        Ok(())
    }

    /// Devices to start.
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.devices.iter().filter(|d| d.enabled)
    }
}
