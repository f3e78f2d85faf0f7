//! Derived classifiers
//!
//! Small algorithms that turn raw extractor fields into higher-level fields:
//! rhythm timing, chord simplification, tuning reference and vocal pitch
//! summary. Each classifier reads the bundle and returns new fields; [`derive`]
//! runs all of them and returns a new bundle. Extractor-supplied fields are
//! never replaced.

pub mod chords;
pub mod rhythm;
pub mod stats;
pub mod tuning;
pub mod vocals;

pub use chords::ChordConfig;
pub use rhythm::{QuantizationMethod, RhythmConfig, RhythmTiming};
pub use stats::RobustEstimator;
pub use tuning::TuningConfig;

use crate::error::ConfigurationError;
use crate::model::{AnalysisBundle, AnalysisField, Provenance};
use crate::ENGINE_PRODUCER;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Classifier parameter out of range
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Invalid parameter {name}: {message}")]
pub struct ClassifierConfigError {
    pub name: String,
    pub message: String,
}

impl From<ClassifierConfigError> for ConfigurationError {
    fn from(e: ClassifierConfigError) -> Self {
        ConfigurationError::InvalidParameter {
            name: e.name,
            message: e.message,
        }
    }
}

/// All classifier parameters (`[classifiers]`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Robust estimator shared by rhythm and tuning
    pub estimator: RobustEstimator,
    pub rhythm: RhythmConfig,
    pub chords: ChordConfig,
    pub tuning: TuningConfig,
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.estimator
            .validate()
            .map_err(|message| ConfigurationError::InvalidParameter {
                name: "classifiers.estimator".to_string(),
                message,
            })?;
        self.rhythm.validate()?;
        self.chords.validate()?;
        self.tuning.validate()?;
        Ok(())
    }
}

/// Run every classifier and return the bundle extended with derived fields
pub fn derive(bundle: &AnalysisBundle, config: &ClassifierConfig) -> AnalysisBundle {
    let estimator = &config.estimator;
    let mut derived: Vec<AnalysisField> = Vec::new();
    derived.extend(rhythm::derive(bundle, &config.rhythm, estimator));
    derived.extend(chords::derive(bundle, &config.chords, estimator));
    derived.extend(tuning::derive(bundle, &config.tuning, estimator));
    derived.extend(vocals::derive(bundle, estimator));

    debug!(derived = derived.len(), "Derived classifiers complete");
    bundle.extended(derived)
}

/// Provenance for a field computed by one of this crate's classifiers
pub(crate) fn derived_provenance(
    classifier: &str,
    input: &AnalysisField,
    estimator: &RobustEstimator,
) -> Provenance {
    Provenance::new(ENGINE_PRODUCER, env!("CARGO_PKG_VERSION"))
        .with_param("classifier", classifier)
        .with_param("estimator", estimator.describe())
        .with_param("input_field", input.name.clone())
        .with_param("input_producer", input.provenance.producer.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldValue;

    #[test]
    fn test_derive_adds_rhythm_fields_with_provenance() {
        let bundle: AnalysisBundle = [AnalysisField::new(
            rhythm::BEATS_FIELD,
            FieldValue::Sequence(vec![0.0, 0.500, 1.001, 1.499, 2.000]),
            0.9,
            Provenance::new("essentia", "2.1b6"),
        )]
        .into_iter()
        .collect();

        let extended = derive(&bundle, &ClassifierConfig::default());
        let timing = extended.get(rhythm::TIMING_FIELD).unwrap();
        assert_eq!(timing.value, FieldValue::Label("clicktrack".to_string()));
        assert_eq!(timing.provenance.producer, ENGINE_PRODUCER);
        assert_eq!(
            timing.provenance.params.get("input_producer"),
            Some(&serde_json::json!("essentia"))
        );
        assert_eq!(
            timing.provenance.params.get("estimator"),
            Some(&serde_json::json!({"method": "mad"}))
        );
        assert!(extended.contains(rhythm::BEAT_CV_FIELD));
        assert!(extended.contains(rhythm::QUANT_SCORE_FIELD));
        // Input bundle unchanged
        assert_eq!(bundle.len(), 1);
    }

    #[test]
    fn test_empty_bundle_derives_nothing() {
        let extended = derive(&AnalysisBundle::new(), &ClassifierConfig::default());
        assert!(extended.is_empty());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ClassifierConfig::default().validate().is_ok());
    }

    #[test]
    fn test_out_of_range_parameter_names_the_setting() {
        let config = ClassifierConfig {
            rhythm: RhythmConfig {
                min_beats: 2,
                ..RhythmConfig::default()
            },
            ..ClassifierConfig::default()
        };
        let err = config.rhythm.validate().unwrap_err();
        assert_eq!(err.name, "classifiers.rhythm.min_beats");
        assert!(err.to_string().starts_with("Invalid parameter classifiers.rhythm.min_beats"));
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidParameter { .. })
        ));
    }
}
