//! Multi-tier TOML configuration for Toolbridge.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > project file > global file > defaults

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toolbridge_mcp::{McpConfig, McpServerConfig};

/// The default log filter when nothing else is configured.
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// Name of the per-project config file, looked up in the working directory.
pub const PROJECT_CONFIG_FILE: &str = "toolbridge.toml";

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

/// Resolved configuration for a Toolbridge host.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub log_level: String,
    /// Applied to every server when set, replacing its own `timeout_ms`.
    pub request_timeout_ms: Option<u64>,
    pub mcp: McpConfig,
    pub config_dir: PathBuf,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSettings {
    pub log_level: Option<String>,
    pub request_timeout_ms: Option<u64>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_dir: Option<PathBuf>,
    /// Explicit project file; unlike the implicit lookup, failures to read it are errors.
    pub config_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub request_timeout_ms: Option<u64>,
}

impl BridgeConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables (`TOOLBRIDGE_LOG`, `TOOLBRIDGE_REQUEST_TIMEOUT_MS`)
    /// 3. Project config (`./toolbridge.toml` or `--config`)
    /// 4. Global config (`~/.toolbridge/config.toml`)
    /// 5. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        let config_dir = overrides.config_dir.clone().unwrap_or_else(config_dir);
        let global = load_settings_file(&config_dir.join("config.toml"));

        let project = match &overrides.config_file {
            Some(path) => read_settings_file(path)?,
            None => std::env::current_dir()
                .map(|dir| load_settings_file(&dir.join(PROJECT_CONFIG_FILE)))
                .unwrap_or_default(),
        };

        resolve(overrides, config_dir, global, project, |key| {
            std::env::var(key).ok()
        })
    }
}

/// Merge the layers. Project servers replace global servers of the same name.
fn resolve(
    overrides: CliOverrides,
    config_dir: PathBuf,
    global: SettingsFile,
    project: SettingsFile,
    env: impl Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, ConfigError> {
    let log_level = overrides
        .log_level
        .or_else(|| env("TOOLBRIDGE_LOG"))
        .or(project.client.log_level)
        .or(global.client.log_level)
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

    let env_timeout = env("TOOLBRIDGE_REQUEST_TIMEOUT_MS")
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "TOOLBRIDGE_REQUEST_TIMEOUT_MS".into(),
                    message: format!("'{raw}': {e}"),
                })
        })
        .transpose()?;

    let request_timeout_ms = overrides
        .request_timeout_ms
        .or(env_timeout)
        .or(project.client.request_timeout_ms)
        .or(global.client.request_timeout_ms);

    let mut servers = global.servers;
    servers.extend(project.servers);
    if let Some(ms) = request_timeout_ms {
        for server in servers.values_mut() {
            server.set_timeout_ms(ms);
        }
    }

    Ok(BridgeConfig {
        log_level,
        request_timeout_ms,
        mcp: McpConfig { servers },
        config_dir,
    })
}

/// Get the Toolbridge config directory path (~/.toolbridge/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TOOLBRIDGE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolbridge")
}

/// Load and parse a TOML settings file, returning defaults on any error.
fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}

/// Load and parse a TOML settings file that must exist.
fn read_settings_file(path: &Path) -> Result<SettingsFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
