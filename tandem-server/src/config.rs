//! Configuration loading for the server binary.

use serde::Deserialize;
use std::path::Path;
use tandem_sync::{EngineConfig, ServerConfig};
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "TANDEM_CONFIG";
/// Environment variable overriding `server.bind_addr`.
pub const BIND_ENV: &str = "TANDEM_BIND";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level settings file.
///
/// ```toml
/// [server]
/// bind_addr = "0.0.0.0:9090"
/// storage_path = "/var/lib/tandem"
///
/// [engine]
/// max_resolution_attempts = 5
/// abandon_after_secs = 600
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub engine: EngineConfig,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve settings from an optional path, falling back to defaults,
    /// then apply the bind override.
    pub fn resolve(path: Option<&Path>, bind: Option<String>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(bind) = bind.filter(|b| !b.is_empty()) {
            settings.server.bind_addr = bind;
        }
        Ok(settings)
    }
}
