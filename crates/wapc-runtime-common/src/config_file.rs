//! Configuration file structures for the wapc-runtime.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`PolicyConfig`]: Capability allowlist applied to host callbacks
//! - [`ModuleLoadSpec`]: Guest modules loaded at startup

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ModuleLoadSpec, RuntimeConfig};

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// pooling_allocator = true
/// max_instances = 1000
///
/// [runtime.pool]
/// default_pool_size = 100
/// acquire_timeout_ms = 5000
///
/// [policy]
/// enabled = true
/// allow = ["default:counter:*"]
///
/// [[modules]]
/// name = "hello"
/// path = "./modules/hello.wasm"
/// pool_size = 8
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, execution and pool settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Capability policy for host callbacks.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Modules to load at startup.
    #[serde(default)]
    pub modules: Vec<ModuleLoadSpec>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }

    /// Look up a configured module by name.
    pub fn module(&self, name: &str) -> Option<&ModuleLoadSpec> {
        self.modules.iter().find(|m| m.name == name)
    }
}

/// Capability policy configuration.
///
/// Each `allow` entry is a `namespace:capability:operation` pattern where
/// any segment may be `*`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Enforce the allowlist. When disabled every registered callback is reachable.
    #[serde(default)]
    pub enabled: bool,

    /// Allowed callback patterns.
    #[serde(default)]
    pub allow: Vec<String>,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}
