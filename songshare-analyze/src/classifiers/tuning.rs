//! Tuning reference estimation
//!
//! Per-frame pitch estimates are compared against the nearest equal-tempered
//! note at A4 = 440 Hz. The robust center of the deviations (in cents) is the
//! tuning offset; their spread drives the confidence.

use super::stats::RobustEstimator;
use super::{derived_provenance, ClassifierConfigError};
use crate::model::{AnalysisBundle, AnalysisField, FieldValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const PITCH_FIELD: &str = "tuning.pitch_hz";
pub const SALIENCE_FIELD: &str = "tuning.pitch_salience";
pub const CENTS_OFFSET_FIELD: &str = "tuning.cents_offset";
pub const REFERENCE_HZ_FIELD: &str = "tuning.reference_hz";

/// Concert pitch
pub const A4_HZ: f64 = 440.0;

/// Spread (cents) at which confidence reaches zero
const MAX_SPREAD_CENTS: f64 = 50.0;

/// Tuning estimation parameters (`[classifiers.tuning]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Frames with salience below this are discarded
    pub salience_floor: f64,
    /// Minimum retained frames for a non-zero confidence
    pub min_frames: usize,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            salience_floor: 0.1,
            min_frames: 50,
        }
    }
}

impl TuningConfig {
    pub fn validate(&self) -> Result<(), ClassifierConfigError> {
        if !(self.salience_floor.is_finite() && self.salience_floor >= 0.0) {
            return Err(ClassifierConfigError {
                name: "classifiers.tuning.salience_floor".to_string(),
                message: format!("{} must be a non-negative number", self.salience_floor),
            });
        }
        Ok(())
    }
}

/// Deviation of `freq_hz` from the nearest equal-tempered note, in cents [-50, 50]
pub fn cents_from_nearest_note(freq_hz: f64) -> f64 {
    let semitones = 12.0 * (freq_hz / A4_HZ).log2();
    100.0 * (semitones - semitones.round())
}

/// Reference pitch implied by a cents offset
pub fn reference_hz(cents_offset: f64) -> f64 {
    A4_HZ * 2f64.powf(cents_offset / 1200.0)
}

/// Tuning estimate for one item
#[derive(Debug, Clone, PartialEq)]
pub struct TuningEstimate {
    pub cents_offset: f64,
    pub reference_hz: f64,
    pub spread_cents: f64,
    pub frames_used: usize,
    /// Confidence before scaling by the input field confidence
    pub confidence: f64,
}

/// Estimate tuning from pitch frames and their salience
///
/// Returns None when the lengths differ or no frame survives filtering.
pub fn estimate(
    pitch_hz: &[f64],
    salience: &[f64],
    config: &TuningConfig,
    estimator: &RobustEstimator,
) -> Option<TuningEstimate> {
    if pitch_hz.len() != salience.len() {
        return None;
    }

    let deviations: Vec<f64> = pitch_hz
        .iter()
        .zip(salience)
        .filter(|(f, s)| **f > 0.0 && **s >= config.salience_floor)
        .map(|(f, _)| cents_from_nearest_note(*f))
        .collect();

    let cents_offset = estimator.center(&deviations)?;
    let spread_cents = estimator.spread(&deviations).unwrap_or(MAX_SPREAD_CENTS);

    let confidence = if deviations.len() < config.min_frames {
        0.0
    } else {
        (1.0 - spread_cents / MAX_SPREAD_CENTS).clamp(0.0, 1.0)
    };

    Some(TuningEstimate {
        cents_offset,
        reference_hz: reference_hz(cents_offset),
        spread_cents,
        frames_used: deviations.len(),
        confidence,
    })
}

/// Derive tuning fields from the pitch track and salience
pub fn derive(
    bundle: &AnalysisBundle,
    config: &TuningConfig,
    estimator: &RobustEstimator,
) -> Vec<AnalysisField> {
    let (Some(pitch), Some(salience)) = (bundle.get(PITCH_FIELD), bundle.get(SALIENCE_FIELD)) else {
        return Vec::new();
    };
    let (Some(pitch_hz), Some(salience_values)) =
        (pitch.value.as_sequence(), salience.value.as_sequence())
    else {
        debug!("Tuning inputs are not sequences, skipping");
        return Vec::new();
    };
    if pitch.validate().is_err() || salience.validate().is_err() {
        debug!("Tuning inputs are malformed, skipping");
        return Vec::new();
    }
    if pitch_hz.len() != salience_values.len() {
        warn!(
            pitch_frames = pitch_hz.len(),
            salience_frames = salience_values.len(),
            "Pitch and salience lengths differ, tuning not derived"
        );
        return Vec::new();
    }

    let Some(estimate) = estimate(pitch_hz, salience_values, config, estimator) else {
        debug!("No salient pitched frames, tuning not derived");
        return Vec::new();
    };

    let confidence = estimate.confidence * pitch.confidence;
    debug!(
        cents = estimate.cents_offset,
        spread = estimate.spread_cents,
        frames = estimate.frames_used,
        confidence = confidence,
        "Tuning estimated"
    );

    let provenance = derived_provenance("tuning_reference", pitch, estimator)
        .with_param("salience_floor", config.salience_floor)
        .with_param("min_frames", config.min_frames as u64)
        .with_param("frames_used", estimate.frames_used as u64)
        .with_param("spread_cents", estimate.spread_cents);

    vec![
        AnalysisField::new(
            CENTS_OFFSET_FIELD,
            FieldValue::Scalar(estimate.cents_offset),
            confidence,
            provenance.clone(),
        ),
        AnalysisField::new(
            REFERENCE_HZ_FIELD,
            FieldValue::Scalar(estimate.reference_hz),
            confidence,
            provenance,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cents_from_nearest_note() {
        assert!(cents_from_nearest_note(440.0).abs() < 1e-9);
        assert!(cents_from_nearest_note(880.0).abs() < 1e-9);
        let sharp = 440.0 * 2f64.powf(10.0 / 1200.0);
        assert!((cents_from_nearest_note(sharp) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_reference_hz() {
        assert!((reference_hz(0.0) - 440.0).abs() < 1e-9);
        assert!((reference_hz(-1200.0) - 220.0).abs() < 1e-9);
    }

    #[test]
    fn test_consistent_offset_is_confident() {
        // 60 frames, all 8 cents flat of various notes
        let pitch: Vec<f64> = (0..60)
            .map(|i| 440.0 * 2f64.powf(((i % 12) as f64 * 100.0 - 8.0) / 1200.0))
            .collect();
        let salience = vec![0.9; 60];
        let est = estimate(&pitch, &salience, &TuningConfig::default(), &RobustEstimator::Mad).unwrap();
        assert!((est.cents_offset + 8.0).abs() < 1e-6);
        assert!(est.confidence > 0.99);
        assert!((est.reference_hz - reference_hz(-8.0)).abs() < 1e-9);
    }

    #[test]
    fn test_too_few_frames_has_zero_confidence() {
        let pitch = vec![440.0; 10];
        let salience = vec![0.9; 10];
        let est = estimate(&pitch, &salience, &TuningConfig::default(), &RobustEstimator::Mad).unwrap();
        assert_eq!(est.confidence, 0.0);
        assert_eq!(est.frames_used, 10);
    }

    #[test]
    fn test_low_salience_and_unvoiced_frames_dropped() {
        let pitch = vec![440.0, 0.0, 450.0];
        let salience = vec![0.5, 0.9, 0.05];
        let est = estimate(&pitch, &salience, &TuningConfig::default(), &RobustEstimator::Mad).unwrap();
        assert_eq!(est.frames_used, 1);
    }

    #[test]
    fn test_mismatched_lengths() {
        assert!(estimate(&[440.0], &[], &TuningConfig::default(), &RobustEstimator::Mad).is_none());
    }
}
