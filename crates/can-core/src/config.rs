//! Configuration resolution for can.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/can/settings.json)
//! 3. Project config (.can/settings.json)
//! 4. Environment variables
//!
//! Files are merged key by key, so a project file only needs the keys it
//! overrides.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Complete can configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub log: LogSettings,
}

/// Settings used to reach the can daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientSettings {
    /// Daemon address, `host:port` or a full `http://` URI.
    pub server: String,
    /// Namespace every pod operation is scoped to.
    pub namespace: String,
    pub connect_timeout_secs: u64,
    /// Deadline for unary calls. Streaming calls are not bounded.
    pub request_timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server: "localhost:5000".to_string(),
            namespace: "can".to_string(),
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LogSettings {
    /// `EnvFilter` directive covering the can crates at the configured level.
    pub fn filter(&self) -> String {
        format!("can_client={0},can_core={0}", self.level)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut paths = Vec::new();
    if let Some(global_path) = global_config_path() {
        paths.push(global_path);
    }
    if let Some(dir) = project_dir {
        paths.push(dir.join(".can").join("settings.json"));
    }

    let mut config = load_config_files(&paths)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Merge the given config files in order (missing files are skipped).
pub fn load_config_files(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for path in paths {
        if path.exists() {
            merge_json(&mut merged, load_config_file(path)?);
            debug!(path = %path.display(), "Loaded config file");
        }
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid merged configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        dirs::home_dir().map(|h| h.join("Library/Application Support/can/settings.json"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        dirs::config_dir().map(|p| p.join("can").join("settings.json"))
    }
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `CAN_*` environment variable overrides.
pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary variable lookup.
///
/// Values that fail to parse are ignored.
pub fn apply_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("CAN_SERVER") {
        config.client.server = val;
    }
    if let Some(val) = lookup("CAN_NAMESPACE") {
        config.client.namespace = val;
    }
    if let Some(n) = lookup("CAN_CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.client.connect_timeout_secs = n;
    }
    if let Some(n) = lookup("CAN_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.client.request_timeout_secs = n;
    }
    if let Some(val) = lookup("CAN_LOG_LEVEL") {
        config.log.level = val;
    }
    if let Some(val) = lookup("CAN_LOG_JSON") {
        config.log.json = matches!(val.as_str(), "1" | "true" | "yes");
    }
}
