//! Configuration file resolution and loading
//!
//! The configuration file is located using the following priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. Per-user config file (`<config dir>/songshare/songshare.toml`), if present
//! 4. Compiled defaults (no file)
//!
//! A missing or absent file never aborts startup: callers get built-in defaults
//! and a warning. A file that exists but does not parse is a hard error.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "SONGSHARE_CONFIG";

/// Application directory name under the platform config dir
const APP_DIR: &str = "songshare";

/// Configuration file name
const CONFIG_FILE_NAME: &str = "songshare.toml";

/// Where the active configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Path passed on the command line
    CommandLine(PathBuf),
    /// Path taken from the environment variable
    Environment(PathBuf),
    /// Per-user configuration file
    UserFile(PathBuf),
    /// No file, compiled defaults only
    Defaults,
}

impl ConfigSource {
    /// File path for this source, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigSource::CommandLine(p)
            | ConfigSource::Environment(p)
            | ConfigSource::UserFile(p) => Some(p),
            ConfigSource::Defaults => None,
        }
    }
}

/// Logging configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve which configuration file to use
pub fn resolve_config_source(cli_arg: Option<&Path>, env_var_name: &str) -> ConfigSource {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return ConfigSource::CommandLine(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return ConfigSource::Environment(PathBuf::from(path));
        }
    }

    // Priority 3: Per-user config file, only when it exists
    if let Some(path) = user_config_path() {
        if path.exists() {
            return ConfigSource::UserFile(path);
        }
    }

    // Priority 4: Compiled defaults
    ConfigSource::Defaults
}

/// Platform-specific per-user configuration file path
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE_NAME))
}

/// Load a TOML configuration from the resolved source
///
/// Missing files fall back to `T::default()` with a warning.
pub fn load_toml_config<T>(source: &ConfigSource) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = source.path() else {
        debug!("No configuration file, using compiled defaults");
        return Ok(T::default());
    };

    if !path.exists() {
        warn!(
            path = %path.display(),
            "Configuration file not found, using compiled defaults"
        );
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Read {} failed: {}", path.display(), e))
    })?;
    let config = parse_toml_config(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

/// Parse a TOML document into a configuration value
pub fn parse_toml_config<T>(content: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    Ok(toml::from_str(content)?)
}
