//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RSTCHART_CONFIG or --config)
//! 3. Environment variables

use rstchart_core::session::{SessionConfig, DEFAULT_MAX_MICROSTEPS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session execution limits.
    pub engine: EngineConfig,
    /// Driver channel sizes.
    pub driver: DriverConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("RSTCHART_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Like [`load`](Self::load) with an explicit file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.engine.apply_env_overrides();
        self.driver.apply_env_overrides();
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_microsteps_per_run == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_microsteps_per_run must be positive".to_string(),
            ));
        }
        if self.driver.event_capacity == 0 || self.driver.update_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "driver channel capacities must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Session execution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on microsteps per run before a session is reported as
    /// runaway.
    pub max_microsteps_per_run: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_microsteps_per_run: DEFAULT_MAX_MICROSTEPS,
        }
    }
}

impl EngineConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("RSTCHART_MAX_MICROSTEPS") {
            if let Ok(n) = max.parse() {
                self.max_microsteps_per_run = n;
            }
        }
    }

    /// Session settings derived from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_microsteps_per_run: self.max_microsteps_per_run,
            ..Default::default()
        }
    }
}

/// Session driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Capacity of the inbound event channel.
    pub event_capacity: usize,
    /// Capacity of the session update broadcast channel.
    pub update_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            update_capacity: 1024,
        }
    }
}

impl DriverConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(capacity) = std::env::var("RSTCHART_EVENT_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.event_capacity = n;
            }
        }

        if let Ok(capacity) = std::env::var("RSTCHART_UPDATE_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.update_capacity = n;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
