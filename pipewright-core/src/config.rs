//! Configuration system for Pipewright.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides. Configuration is
//! loaded from `~/.config/pipewright/config.toml` and/or
//! `.pipewright/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::pipeline::RetryConfig;

/// Top-level configuration for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quality gate for pipelines that do not set their own.
    pub default_quality_threshold: f64,
    /// Records per chunk for filter, map and validate steps. Zero disables chunking.
    pub max_batch_size: usize,
    /// IANA zone for schedules without their own timezone. UTC when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_timezone: Option<String>,
    /// Retry policy for pipelines that do not set their own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_retry: Option<RetryConfig>,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_quality_threshold: 80.0,
            max_batch_size: 10_000,
            default_timezone: None,
            default_retry: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive for the stderr layer, e.g. `info` or `pipewright_core=debug`.
    pub level: String,
    /// Also write JSON logs to a daily rolling file.
    pub json_file: bool,
    /// Directory for the JSON log file. Defaults to the user data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_file: false,
            log_dir: None,
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "pipewright", "pipewright")
}

/// Default directory for rolling log files.
pub fn default_log_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Load configuration by merging all sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `PIPEWRIGHT_`)
/// 3. Workspace-local config (`.pipewright/config.toml`)
/// 4. User config (`~/.config/pipewright/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&EngineConfig>,
) -> Result<EngineConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));

    if let Some(dirs) = project_dirs() {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".pipewright").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // PIPEWRIGHT_MAX_BATCH_SIZE, PIPEWRIGHT_LOGGING__LEVEL, ...
    figment = figment.merge(Env::prefixed("PIPEWRIGHT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Load a `.env` file into the process environment so `PIPEWRIGHT_` variables
/// defined there reach [`load_config`]. Looks in `workspace` first, then the
/// current directory and its parents. Returns the file that was loaded.
pub fn load_env_file(workspace: Option<&Path>) -> Option<PathBuf> {
    if let Some(ws) = workspace {
        let path = ws.join(".env");
        if path.exists() && dotenvy::from_path(&path).is_ok() {
            return Some(path);
        }
    }
    dotenvy::dotenv().ok()
}

/// Write `config` to the workspace config file, creating `.pipewright/` if
/// needed. Returns the path written.
pub fn save_workspace_config(workspace: &Path, config: &EngineConfig) -> anyhow::Result<PathBuf> {
    let config_dir = workspace.join(".pipewright");
    std::fs::create_dir_all(&config_dir)?;
    let config_path = config_dir.join("config.toml");
    let toml_str = toml::to_string_pretty(config)?;
    std::fs::write(&config_path, toml_str)?;
    Ok(config_path)
}
