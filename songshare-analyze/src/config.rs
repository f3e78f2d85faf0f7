//! Engine configuration (`songshare.toml`)
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [engine]
//! default_threshold = 0.6
//! workers = 4
//! backup_tags = false
//!
//! [classifiers.rhythm]
//! cv_low = 0.005
//!
//! [constraints]
//! max_tags = 256
//!
//! [[fields]]
//! name = "mood"
//! threshold = 0.7
//! ```

use crate::classifiers::ClassifierConfig;
use crate::constraints::TagConstraints;
use crate::error::ConfigurationError;
use crate::policy::{FieldRowSpec, PolicyRegistry, DEFAULT_THRESHOLD};
use serde::{Deserialize, Serialize};
use songshare_common::config::{
    load_toml_config, resolve_config_source, ConfigSource, LoggingConfig, CONFIG_ENV_VAR,
};
use std::path::Path;
use tracing::info;

/// Side-record file suffix appended to the audio path
pub const DEFAULT_SIDE_RECORD_SUFFIX: &str = ".analysis.json";

/// Analysis bundle file suffix appended to the audio path
pub const DEFAULT_BUNDLE_SUFFIX: &str = ".bundle.json";

/// Extractor report file suffix appended to the audio path
pub const DEFAULT_REPORT_SUFFIX: &str = ".report.json";

/// `[engine]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Write threshold for rows that set none
    pub default_threshold: f64,
    /// Items processed concurrently in batch runs
    pub workers: usize,
    /// Keep a JSON copy of the pre-merge tags next to each audio file
    pub backup_tags: bool,
    pub side_record_suffix: String,
    pub bundle_suffix: String,
    pub report_suffix: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            default_threshold: DEFAULT_THRESHOLD,
            workers: 4,
            backup_tags: false,
            side_record_suffix: DEFAULT_SIDE_RECORD_SUFFIX.to_string(),
            bundle_suffix: DEFAULT_BUNDLE_SUFFIX.to_string(),
            report_suffix: DEFAULT_REPORT_SUFFIX.to_string(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub logging: LoggingConfig,
    pub engine: EngineSection,
    pub classifiers: ClassifierConfig,
    pub constraints: TagConstraints,
    /// Policy rows overriding or extending the default field table
    pub fields: Vec<FieldRowSpec>,
}

impl EngineConfig {
    /// Resolve, load and validate the configuration
    ///
    /// `cli_path` wins over `SONGSHARE_CONFIG`, which wins over the per-user
    /// file. Without any file the compiled defaults apply.
    pub fn load(cli_path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let source = resolve_config_source(cli_path, CONFIG_ENV_VAR);
        Self::load_from(&source)
    }

    pub fn load_from(source: &ConfigSource) -> Result<Self, ConfigurationError> {
        let config: EngineConfig = load_toml_config(source)?;
        config.validate()?;
        info!(
            source = ?source,
            threshold = config.engine.default_threshold,
            workers = config.engine.workers,
            overrides = config.fields.len(),
            "Engine configuration ready"
        );
        Ok(config)
    }

    /// Reject out-of-range parameters before any item is processed
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.engine.workers == 0 {
            return Err(ConfigurationError::InvalidParameter {
                name: "engine.workers".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        for (name, suffix) in [
            ("engine.side_record_suffix", &self.engine.side_record_suffix),
            ("engine.bundle_suffix", &self.engine.bundle_suffix),
            ("engine.report_suffix", &self.engine.report_suffix),
        ] {
            if suffix.is_empty() || suffix.contains(std::path::is_separator) {
                return Err(ConfigurationError::InvalidParameter {
                    name: name.to_string(),
                    message: format!("'{}' is not a file name suffix", suffix),
                });
            }
        }
        self.classifiers.validate()?;
        // Registry validation covers thresholds, formatters and tag keys
        self.registry()?;
        Ok(())
    }

    /// Field policy registry with this configuration's overrides applied
    pub fn registry(&self) -> Result<PolicyRegistry, ConfigurationError> {
        PolicyRegistry::load(
            &self.fields,
            self.engine.default_threshold,
            &self.constraints,
        )
    }
}
