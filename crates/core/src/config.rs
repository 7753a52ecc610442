//! Configuration management for Trustbind.
//!
//! Components own their configuration structs; this module provides the
//! shared TOML loading and the logging section every binary carries.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CoreError, Result};

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
        }
    }
}

/// Parse a TOML document into a configuration struct.
pub fn from_toml_str<T: DeserializeOwned>(content: &str) -> Result<T> {
    toml::from_str(content).map_err(|e| CoreError::Config(format!("failed to decode configuration: {e}")))
}

/// Read and parse a TOML configuration file.
pub fn load_toml<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        CoreError::Config(format!("failed to read configuration file {}: {e}", path.display()))
    })?;
    from_toml_str(&content)
}
