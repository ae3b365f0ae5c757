//! Configuration of an object: endpoints, identity and runtime tunables
//!
//! Values come from a [`ConfigProvider`]. Lookups try the object's own section
//! first and fall back to the provider's defaults, so several objects can share
//! endpoints while each keeps its own id:
//!
//! ```toml
//! [defaults]
//! ws_url = "wss://platform.example/iotgateway/"
//! api_url = "https://platform.example/api"
//!
//! [thermostat]
//! obj_id = "6b1b1c0e-7c1a-4d55-9a53-0a0f5b3d8a11"
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
const CONFIG_DIR: &str = "aliot";
const DEFAULTS_SECTION: &str = "defaults";

pub const KEY_WS_URL: &str = "ws_url";
pub const KEY_API_URL: &str = "api_url";
pub const KEY_OBJECT_ID: &str = "obj_id";
pub const KEY_REQUEST_TIMEOUT: &str = "request_timeout_secs";
pub const KEY_HOOK_JOIN_TIMEOUT: &str = "hook_join_timeout_secs";
pub const KEY_OUTBOUND_CAPACITY: &str = "outbound_capacity";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration file found (looked for {0})")]
    NotFound(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Missing key {key:?} for object {section:?} (and no default)")]
    MissingKey { section: String, key: String },

    #[error("Invalid value {value:?} for {key:?}")]
    InvalidValue { key: String, value: String },
}

/// Source of configuration values, consulted once when an object is built
pub trait ConfigProvider {
    fn get(&self, section: &str, key: &str) -> Option<String>;

    fn defaults(&self) -> &HashMap<String, String>;

    /// Section value if present and non-empty, otherwise the default
    fn lookup(&self, section: &str, key: &str) -> Option<String> {
        self.get(section, key)
            .filter(|value| !value.is_empty())
            .or_else(|| self.defaults().get(key).cloned())
    }
}

/// TOML backed provider. The `[defaults]` table (and any top-level scalar)
/// provides fallbacks; every other table is a section.
#[derive(Debug, Clone, Default)]
pub struct TomlConfig {
    defaults: HashMap<String, String>,
    sections: HashMap<String, HashMap<String, String>>,
}

impl TomlConfig {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(content)?;
        let mut config = TomlConfig::default();

        for (key, value) in table {
            match value {
                toml::Value::Table(entries) if key == DEFAULTS_SECTION => {
                    config.defaults.extend(flatten(entries));
                }
                toml::Value::Table(entries) => {
                    config.sections.insert(key, flatten(entries));
                }
                scalar => {
                    config.defaults.insert(key, scalar_to_string(scalar));
                }
            }
        }

        debug!(
            "Parsed configuration with {} section(s) and {} default(s)",
            config.sections.len(),
            config.defaults.len()
        );
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        info!("Loaded configuration from {}", path.display());
        Self::parse(&content)
    }

    /// Finds the configuration file: the explicit path, `./config.toml`, then
    /// `<config dir>/aliot/config.toml`.
    pub async fn discover(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }

        let mut candidates = vec![PathBuf::from(DEFAULT_CONFIG_FILE)];
        if let Some(mut dir) = dirs::config_dir() {
            dir.push(CONFIG_DIR);
            dir.push(DEFAULT_CONFIG_FILE);
            candidates.push(dir);
        }

        for candidate in &candidates {
            if tokio::fs::try_exists(candidate).await.unwrap_or(false) {
                return Ok(candidate.clone());
            }
        }

        Err(ConfigError::NotFound(
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        ))
    }

    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }
}

impl ConfigProvider for TomlConfig {
    fn get(&self, section: &str, key: &str) -> Option<String> {
        self.sections.get(section)?.get(key).cloned()
    }

    fn defaults(&self) -> &HashMap<String, String> {
        &self.defaults
    }
}

fn flatten(entries: toml::Table) -> HashMap<String, String> {
    entries
        .into_iter()
        .map(|(key, value)| (key, scalar_to_string(value)))
        .collect()
}

fn scalar_to_string(value: toml::Value) -> String {
    match value {
        toml::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Everything an object needs from configuration, resolved once
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectConfig {
    pub ws_url: String,
    pub api_url: String,
    pub object_id: String,
    pub request_timeout: Duration,
    pub hook_join_timeout: Duration,
    pub outbound_capacity: usize,
}

impl ObjectConfig {
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_HOOK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

    pub fn new(
        ws_url: impl Into<String>,
        api_url: impl Into<String>,
        object_id: impl Into<String>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_url: api_url.into(),
            object_id: object_id.into(),
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
            hook_join_timeout: Self::DEFAULT_HOOK_JOIN_TIMEOUT,
            outbound_capacity: Self::DEFAULT_OUTBOUND_CAPACITY,
        }
    }

    pub fn resolve(provider: &dyn ConfigProvider, name: &str) -> Result<Self, ConfigError> {
        let required = |key: &str| {
            provider
                .lookup(name, key)
                .ok_or_else(|| ConfigError::MissingKey {
                    section: name.to_string(),
                    key: key.to_string(),
                })
        };

        let mut config = Self::new(
            required(KEY_WS_URL)?,
            required(KEY_API_URL)?,
            required(KEY_OBJECT_ID)?,
        );

        if let Some(secs) = parse_optional::<u64>(provider, name, KEY_REQUEST_TIMEOUT)? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_optional::<u64>(provider, name, KEY_HOOK_JOIN_TIMEOUT)? {
            config.hook_join_timeout = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse_optional::<usize>(provider, name, KEY_OUTBOUND_CAPACITY)? {
            if capacity == 0 {
                return Err(ConfigError::InvalidValue {
                    key: KEY_OUTBOUND_CAPACITY.to_string(),
                    value: capacity.to_string(),
                });
            }
            config.outbound_capacity = capacity;
        }

        debug!("Resolved configuration for {}: {:?}", name, config);
        Ok(config)
    }
}

fn parse_optional<T: std::str::FromStr>(
    provider: &dyn ConfigProvider,
    section: &str,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match provider.lookup(section, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}
