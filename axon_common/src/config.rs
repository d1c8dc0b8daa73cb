//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! across AXON applications.
//!
//! # Usage
//!
//! ```rust,no_run
//! use axon_common::config::{ConfigLoader, IpcSettings, ConfigError};
//! use serde::Deserialize;
//! use std::path::Path;
//!
//! #[derive(Debug, Deserialize)]
//! struct MyAppConfig {
//!     ipc: IpcSettings,
//! }
//!
//! impl ConfigLoader for MyAppConfig {
//!     fn validate(&self) -> Result<(), ConfigError> {
//!         self.ipc.validate()
//!     }
//! }
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = MyAppConfig::load(Path::new("config.toml"))?;
//!     println!("namespace: {}", config.ipc.namespace);
//!     Ok(())
//! }
//! ```

use crate::consts;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// IPC substrate parameters shared by both peer processes.
///
/// Both processes of a pairing must load identical values; the segment and
/// queue headers carry the creating side's geometry and the attaching side
/// verifies it against its own settings.
///
/// # TOML Example
///
/// ```toml
/// [ipc]
/// namespace = "axon"
/// queue_capacity = 1024
/// slot_size = 256
/// slot_count = 4096
/// heartbeat_interval_ms = 1000
/// miss_threshold = 8
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcSettings {
    /// Namespace prefix for every backing file.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Bounded capacity of each direction's shared queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Size of one payload slot in bytes.
    #[serde(default = "default_slot_size")]
    pub slot_size: usize,

    /// Number of payload slots in the segment.
    #[serde(default = "default_slot_count")]
    pub slot_count: usize,

    /// Heartbeat period in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive missed heartbeats before the peer is declared dead.
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
}

fn default_namespace() -> String {
    consts::DEFAULT_NAMESPACE.to_string()
}

fn default_queue_capacity() -> usize {
    consts::DEFAULT_QUEUE_CAPACITY
}

fn default_slot_size() -> usize {
    consts::DEFAULT_SLOT_SIZE
}

fn default_slot_count() -> usize {
    consts::DEFAULT_SLOT_COUNT
}

fn default_heartbeat_interval_ms() -> u64 {
    consts::HEARTBEAT_INTERVAL_MS
}

fn default_miss_threshold() -> u32 {
    consts::HEARTBEAT_MISS_THRESHOLD
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            queue_capacity: default_queue_capacity(),
            slot_size: default_slot_size(),
            slot_count: default_slot_count(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            miss_threshold: default_miss_threshold(),
        }
    }
}

impl IpcSettings {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `namespace` is empty or contains a path separator
    /// - `queue_capacity`, `slot_size` or `slot_count` is zero
    /// - `miss_threshold` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::ValidationError(
                "namespace cannot be empty".to_string(),
            ));
        }
        if self.namespace.contains('/') {
            return Err(ConfigError::ValidationError(
                "namespace cannot contain '/'".to_string(),
            ));
        }
        if self.queue_capacity == 0 || self.slot_size == 0 || self.slot_count == 0 {
            return Err(ConfigError::ValidationError(
                "queue_capacity, slot_size and slot_count must be non-zero".to_string(),
            ));
        }
        if self.miss_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "miss_threshold must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
/// - Returns `ConfigError::ValidationError` if semantic validation fails
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound);
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let config: Self =
            toml::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Semantic validation hook, called by [`ConfigLoader::load`].
    fn validate(&self) -> Result<(), ConfigError>;
}

impl ConfigLoader for IpcSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        IpcSettings::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        assert!(IpcSettings::default().validate().is_ok());
    }

    #[test]
    fn test_empty_namespace_rejected() {
        let settings = IpcSettings {
            namespace: String::new(),
            ..IpcSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_load_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let settings = IpcSettings {
            namespace: "axon_test".to_string(),
            queue_capacity: 16,
            ..IpcSettings::default()
        };
        write!(file, "{}", toml::to_string(&settings).unwrap()).unwrap();

        let loaded = IpcSettings::load(file.path()).unwrap();
        assert_eq!(loaded.namespace, "axon_test");
        assert_eq!(loaded.queue_capacity, 16);
        assert_eq!(loaded.slot_size, crate::consts::DEFAULT_SLOT_SIZE);
    }

    #[test]
    fn test_missing_file() {
        let result = IpcSettings::load(Path::new("/nonexistent/axon.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }
}
