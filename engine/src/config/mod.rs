//! Configuration management
//!
//! This module handles loading, validation, and management of the Sortie configuration.
//! Configuration is stored in TOML format at ~/.sortie/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **operation**: Polling intervals, timeouts, obfuscator, learning toggle
//! - **executor**: Per-shell invocation overrides
//!
//! # Polling Intervals
//!
//! The three `*_poll_secs` values bound how long the engine waits between
//! re-checks while a link is held for admission, while a link is running, and
//! while the operation waits to close. Waits are woken early by state-change
//! signals, so these are worst-case latencies. They must be strictly positive.
//!
//! # Examples
//!
//! ```no_run
//! use sortie_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Data dir: {:?}", config.core.data_dir);
//! println!("Default planner: {}", config.operation.default_planner);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Obfuscators the engine knows how to render commands with
pub const SUPPORTED_OBFUSCATORS: &[&str] = &["plain-text"];

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Operation lifecycle settings
    #[serde(default)]
    pub operation: OperationConfig,

    /// Command executor settings
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion); holds the result database
    /// and event logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Operation lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Re-check interval while `apply` holds a link for a paused operation
    #[serde(default = "default_apply_poll_secs")]
    pub apply_poll_secs: u64,

    /// Re-check interval while waiting for a link to finish
    #[serde(default = "default_link_poll_secs")]
    pub link_poll_secs: u64,

    /// Re-check interval while waiting for the operation to become closeable
    #[serde(default = "default_finish_poll_secs")]
    pub finish_poll_secs: u64,

    /// Wall-clock budget for a whole operation before it is forced out of time
    #[serde(default = "default_base_timeout")]
    pub base_timeout_secs: u64,

    /// Fallback per-link timeout when an executor does not declare one
    #[serde(default = "default_link_timeout")]
    pub link_timeout_secs: u64,

    /// Command obfuscator name
    #[serde(default = "default_obfuscator")]
    pub obfuscator: String,

    /// Run generic learning parsers on output of executors without parsers
    #[serde(default = "default_true")]
    pub use_learning_parsers: bool,

    /// Close the operation once the planner completes, even if the objective
    /// is not satisfied
    #[serde(default = "default_true")]
    pub auto_close: bool,

    /// Planner used when the profile does not name one
    #[serde(default = "default_planner")]
    pub default_planner: String,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            apply_poll_secs: default_apply_poll_secs(),
            link_poll_secs: default_link_poll_secs(),
            finish_poll_secs: default_finish_poll_secs(),
            base_timeout_secs: default_base_timeout(),
            link_timeout_secs: default_link_timeout(),
            obfuscator: default_obfuscator(),
            use_learning_parsers: true,
            auto_close: true,
            default_planner: default_planner(),
        }
    }
}

impl OperationConfig {
    pub fn apply_poll(&self) -> Duration {
        Duration::from_secs(self.apply_poll_secs)
    }

    pub fn link_poll(&self) -> Duration {
        Duration::from_secs(self.link_poll_secs)
    }

    pub fn finish_poll(&self) -> Duration {
        Duration::from_secs(self.finish_poll_secs)
    }

    pub fn base_timeout(&self) -> Duration {
        Duration::from_secs(self.base_timeout_secs)
    }
}

/// Command executor configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutorConfig {
    /// Replacement invocation prefixes keyed by shell name, e.g.
    /// `sh = ["bash", "-c"]`. The command is appended as the final argument.
    #[serde(default)]
    pub shells: BTreeMap<String, Vec<String>>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.sortie")
}

fn default_apply_poll_secs() -> u64 {
    15
}

fn default_link_poll_secs() -> u64 {
    5
}

fn default_finish_poll_secs() -> u64 {
    10
}

fn default_base_timeout() -> u64 {
    180
}

fn default_link_timeout() -> u64 {
    30
}

fn default_obfuscator() -> String {
    "plain-text".to_string()
}

fn default_planner() -> String {
    "privileged_persistence".to_string()
}

impl Config {
    /// Load configuration from the default location (~/.sortie/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails (unknown log level, zero intervals, unknown obfuscator)
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default_config();
        config.validate_and_process()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.sortie/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".sortie").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                data_dir: default_data_dir(),
            },
            operation: OperationConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates the log level
    /// - Rejects zero polling intervals and timeouts
    /// - Rejects obfuscators the engine cannot render
    /// - Expands ~ in the data directory and creates it
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        self.operation.validate()?;

        for (shell, prefix) in &self.executor.shells {
            if prefix.is_empty() {
                return Err(EngineError::Config(format!(
                    "executor.shells.{} must name a program",
                    shell
                )));
            }
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

impl OperationConfig {
    /// Check intervals, timeouts, and obfuscator without touching the file system
    pub fn validate(&self) -> Result<(), EngineError> {
        let intervals = [
            ("apply_poll_secs", self.apply_poll_secs),
            ("link_poll_secs", self.link_poll_secs),
            ("finish_poll_secs", self.finish_poll_secs),
            ("base_timeout_secs", self.base_timeout_secs),
            ("link_timeout_secs", self.link_timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(EngineError::Config(format!(
                    "operation.{} must be greater than zero",
                    name
                )));
            }
        }

        if !SUPPORTED_OBFUSCATORS.contains(&self.obfuscator.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid obfuscator '{}'. Must be one of: {}",
                self.obfuscator,
                SUPPORTED_OBFUSCATORS.join(", ")
            )));
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
