//! Server configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use hookrelay_webhooks::{DispatcherConfig, Webhook};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Server-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Log level, used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Log format.
    pub log_format: LogFormat,
    /// JSON-lines delivery journal. Attempts are kept in memory when unset.
    pub journal_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            journal_path: None,
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// `[server]` section.
    pub server: ServerConfig,
    /// `[delivery]` section.
    pub delivery: DispatcherConfig,
    /// `[[webhooks]]` entries seeding the registry.
    pub webhooks: Vec<Webhook>,
}

/// Loads configuration from a TOML file.
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
    parse_config(&content)
}

/// Parses configuration from TOML text.
pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    let config: toml::Value =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    let server: ServerConfig = section(&config, "server")?.unwrap_or_default();
    let delivery: DispatcherConfig = section(&config, "delivery")?.unwrap_or_default();
    let webhooks: Vec<Webhook> = section(&config, "webhooks")?.unwrap_or_default();

    let mut seen = HashSet::new();
    for webhook in &webhooks {
        if !seen.insert(webhook.id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate webhook id: {}",
                webhook.id
            )));
        }
        if let Err(e) = webhook.validate() {
            tracing::warn!(webhook_id = %webhook.id, error = %e, "Webhook deliveries will be abandoned");
        }
    }

    Ok(AppConfig {
        server,
        delivery,
        webhooks,
    })
}

fn section<T: serde::de::DeserializeOwned>(
    config: &toml::Value,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    config
        .get(name)
        .map(|v| toml::Value::try_into(v.clone()))
        .transpose()
        .map_err(|e| ConfigError::ParseError(format!("[{}]: {}", name, e)))
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
