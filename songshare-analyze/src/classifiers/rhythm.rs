//! Rhythm timing classification
//!
//! Decides whether a performance follows a click track (machine-steady beat
//! grid) or human timing, from the beat timestamps of `rhythm.beats`.
//!
//! The beat-interval variation is a robust coefficient of variation
//! (`spread / mean` of the inter-beat intervals). Quantization measures how
//! many beats land on a fine grid derived from the mean period.
//!
//! Decision:
//! - `cv < cv_low` and `quant >= quant_min` => clicktrack
//! - `cv > cv_high` => human
//! - anything else => uncertain, with a confidence capped below the default
//!   write threshold

use super::stats::{mean, median, RobustEstimator};
use super::{derived_provenance, ClassifierConfigError};
use crate::model::{AnalysisBundle, AnalysisField, FieldValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Input field
pub const BEATS_FIELD: &str = "rhythm.beats";
/// Timing label output
pub const TIMING_FIELD: &str = "rhythm.timing";
/// Beat interval variation output
pub const BEAT_CV_FIELD: &str = "rhythm.beat_cv";
/// Quantization score output
pub const QUANT_SCORE_FIELD: &str = "rhythm.quant_score";
/// Human-timing score: the confidence when human, else 0
pub const HUMAN_FIELD: &str = "rhythm.human";
/// Click-track score: the confidence when clicktrack, else 0
pub const MACHINE_FIELD: &str = "rhythm.machine";
/// Reason label of the timing decision
pub const TIMING_REASON_FIELD: &str = "rhythm.timing_reason";

/// Highest confidence a write threshold can be set to before "uncertain"
/// could be persisted
const UNCERTAIN_CEILING_LIMIT: f64 = 0.6;

/// How the quantization score is computed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum QuantizationMethod {
    /// Fraction of beats whose phase, measured from the first beat, lies
    /// within `tolerance_sec` of a `subdivisions`-point grid over the mean period
    GridPhase { subdivisions: u32, tolerance_sec: f64 },
    /// Fraction of intervals within `tolerance_sec` of the median interval
    IntervalResidual { tolerance_sec: f64 },
}

impl Default for QuantizationMethod {
    fn default() -> Self {
        QuantizationMethod::GridPhase {
            subdivisions: 16,
            tolerance_sec: 0.01,
        }
    }
}

/// Rhythm classifier parameters (`[classifiers.rhythm]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RhythmConfig {
    pub cv_low: f64,
    pub cv_high: f64,
    pub quant_min: f64,
    pub min_beats: usize,
    pub uncertain_ceiling: f64,
    pub quantization: QuantizationMethod,
}

impl Default for RhythmConfig {
    fn default() -> Self {
        Self {
            cv_low: 0.005,
            cv_high: 0.02,
            quant_min: 0.9,
            min_beats: 4,
            uncertain_ceiling: 0.5,
            quantization: QuantizationMethod::default(),
        }
    }
}

impl RhythmConfig {
    pub fn validate(&self) -> Result<(), ClassifierConfigError> {
        let err = |name: &str, message: String| ClassifierConfigError {
            name: format!("classifiers.rhythm.{}", name),
            message,
        };

        if !(self.cv_low.is_finite() && self.cv_high.is_finite())
            || self.cv_low <= 0.0
            || self.cv_low >= self.cv_high
        {
            return Err(err(
                "cv_low",
                format!("need 0 < cv_low < cv_high, got {} / {}", self.cv_low, self.cv_high),
            ));
        }
        if !(self.quant_min.is_finite() && self.quant_min > 0.0 && self.quant_min < 1.0) {
            return Err(err("quant_min", format!("{} must be within (0, 1)", self.quant_min)));
        }
        if self.min_beats < 3 {
            return Err(err("min_beats", "at least 3 beats are needed".to_string()));
        }
        if !(self.uncertain_ceiling.is_finite()
            && self.uncertain_ceiling >= 0.0
            && self.uncertain_ceiling < UNCERTAIN_CEILING_LIMIT)
        {
            return Err(err(
                "uncertain_ceiling",
                format!(
                    "{} must be within [0, {})",
                    self.uncertain_ceiling, UNCERTAIN_CEILING_LIMIT
                ),
            ));
        }
        match self.quantization {
            QuantizationMethod::GridPhase {
                subdivisions,
                tolerance_sec,
            } => {
                if subdivisions == 0 {
                    return Err(err("quantization.subdivisions", "must be positive".to_string()));
                }
                if !(tolerance_sec.is_finite() && tolerance_sec > 0.0) {
                    return Err(err("quantization.tolerance_sec", "must be positive".to_string()));
                }
            }
            QuantizationMethod::IntervalResidual { tolerance_sec } => {
                if !(tolerance_sec.is_finite() && tolerance_sec > 0.0) {
                    return Err(err("quantization.tolerance_sec", "must be positive".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Timing class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RhythmTiming {
    Clicktrack,
    Human,
    Uncertain,
}

impl RhythmTiming {
    pub fn as_str(&self) -> &'static str {
        match self {
            RhythmTiming::Clicktrack => "clicktrack",
            RhythmTiming::Human => "human",
            RhythmTiming::Uncertain => "uncertain",
        }
    }
}

impl fmt::Display for RhythmTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one classification
#[derive(Debug, Clone, PartialEq)]
pub struct RhythmAssessment {
    pub timing: RhythmTiming,
    pub confidence: f64,
    /// Short machine-readable reason
    pub reason: String,
    /// Robust coefficient of variation of inter-beat intervals
    pub beat_cv: Option<f64>,
    /// Quantization score in [0, 1]
    pub quant_score: Option<f64>,
    pub n_beats: usize,
}

/// Classify a beat sequence
pub fn classify_beats(
    beats: &[f64],
    config: &RhythmConfig,
    estimator: &RobustEstimator,
) -> RhythmAssessment {
    let too_few = |reason: &str| RhythmAssessment {
        timing: RhythmTiming::Uncertain,
        confidence: 0.0,
        reason: reason.to_string(),
        beat_cv: None,
        quant_score: None,
        n_beats: beats.len(),
    };

    if beats.len() < config.min_beats {
        return too_few("too_few_beats");
    }

    let intervals: Vec<f64> = beats.windows(2).map(|w| w[1] - w[0]).collect();
    let mean_ibi = match mean(&intervals) {
        Some(m) if m > 0.0 => m,
        _ => return too_few("non_increasing_beats"),
    };

    let spread = estimator.spread(&intervals).unwrap_or(f64::INFINITY);
    let cv = spread / mean_ibi;
    let quant = quantization_score(beats, &intervals, mean_ibi, &config.quantization);

    let (timing, confidence) = if cv < config.cv_low && quant >= config.quant_min {
        let cv_margin = (config.cv_low - cv) / config.cv_low;
        let quant_margin = (quant - config.quant_min) / (1.0 - config.quant_min);
        let margin = cv_margin.min(quant_margin).clamp(0.0, 1.0);
        (RhythmTiming::Clicktrack, 0.5 + 0.5 * margin)
    } else if cv > config.cv_high {
        let margin = ((cv - config.cv_high) / config.cv_high).min(1.0);
        (RhythmTiming::Human, 0.5 + 0.5 * margin)
    } else {
        let distance = if cv < config.cv_low {
            // Steady but off-grid: distance below the quantization boundary
            (config.quant_min - quant) / config.quant_min
        } else {
            let half_band = (config.cv_high - config.cv_low) / 2.0;
            (cv - config.cv_low).min(config.cv_high - cv) / half_band
        };
        (
            RhythmTiming::Uncertain,
            config.uncertain_ceiling * distance.clamp(0.0, 1.0),
        )
    };

    debug!(
        n_beats = beats.len(),
        cv = cv,
        quant = quant,
        timing = %timing,
        confidence = confidence,
        "Rhythm timing classified"
    );

    RhythmAssessment {
        timing,
        confidence,
        reason: format!("cv={:.5},quant={:.3}", cv, quant),
        beat_cv: Some(cv),
        quant_score: Some(quant),
        n_beats: beats.len(),
    }
}

/// Quantization score in [0, 1]
fn quantization_score(
    beats: &[f64],
    intervals: &[f64],
    mean_ibi: f64,
    method: &QuantizationMethod,
) -> f64 {
    match *method {
        QuantizationMethod::GridPhase {
            subdivisions,
            tolerance_sec,
        } => {
            let step = mean_ibi / subdivisions as f64;
            let origin = beats[0];
            let on_grid = beats
                .iter()
                .filter(|&&t| {
                    let offset = (t - origin).rem_euclid(step);
                    // Circular distance to the nearest grid point
                    offset.min(step - offset) <= tolerance_sec
                })
                .count();
            on_grid as f64 / beats.len() as f64
        }
        QuantizationMethod::IntervalResidual { tolerance_sec } => {
            let Some(reference) = median(intervals) else {
                return 0.0;
            };
            let within = intervals
                .iter()
                .filter(|&&ibi| (ibi - reference).abs() <= tolerance_sec)
                .count();
            within as f64 / intervals.len() as f64
        }
    }
}

/// Derive rhythm fields from `rhythm.beats`, if present and well-formed
pub fn derive(
    bundle: &AnalysisBundle,
    config: &RhythmConfig,
    estimator: &RobustEstimator,
) -> Vec<AnalysisField> {
    let Some(input) = bundle.get(BEATS_FIELD) else {
        return Vec::new();
    };
    let Some(beats) = input.value.as_sequence() else {
        debug!(field = BEATS_FIELD, "Beats field is not a sequence, skipping rhythm timing");
        return Vec::new();
    };
    if input.validate().is_err() {
        debug!(field = BEATS_FIELD, "Beats field is malformed, skipping rhythm timing");
        return Vec::new();
    }

    let assessment = classify_beats(beats, config, estimator);

    let provenance = derived_provenance("rhythm_timing", input, estimator)
        .with_param("cv_low", config.cv_low)
        .with_param("cv_high", config.cv_high)
        .with_param("quant_min", config.quant_min)
        .with_param("min_beats", config.min_beats as u64)
        .with_param(
            "quantization",
            serde_json::to_value(config.quantization).unwrap_or_default(),
        )
        .with_param("n_beats", assessment.n_beats as u64)
        .with_param("reason", assessment.reason.clone());

    let score_for = |timing: RhythmTiming| {
        if assessment.timing == timing {
            assessment.confidence
        } else {
            0.0
        }
    };
    let mut fields = vec![
        AnalysisField::new(
            TIMING_FIELD,
            FieldValue::Label(assessment.timing.to_string()),
            assessment.confidence,
            provenance.clone(),
        ),
        AnalysisField::new(
            HUMAN_FIELD,
            FieldValue::Scalar(score_for(RhythmTiming::Human)),
            assessment.confidence,
            provenance.clone(),
        ),
        AnalysisField::new(
            MACHINE_FIELD,
            FieldValue::Scalar(score_for(RhythmTiming::Clicktrack)),
            assessment.confidence,
            provenance.clone(),
        ),
        AnalysisField::new(
            TIMING_REASON_FIELD,
            FieldValue::Label(assessment.reason.clone()),
            assessment.confidence,
            provenance.clone(),
        ),
    ];
    if let Some(cv) = assessment.beat_cv.filter(|v| v.is_finite()) {
        fields.push(AnalysisField::new(
            BEAT_CV_FIELD,
            FieldValue::Scalar(cv),
            assessment.confidence,
            provenance.clone(),
        ));
    }
    if let Some(quant) = assessment.quant_score {
        fields.push(AnalysisField::new(
            QUANT_SCORE_FIELD,
            FieldValue::Scalar(quant),
            assessment.confidence,
            provenance,
        ));
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(beats: &[f64]) -> RhythmAssessment {
        classify_beats(beats, &RhythmConfig::default(), &RobustEstimator::Mad)
    }

    #[test]
    fn test_steady_beats_are_clicktrack() {
        let result = classify(&[0.0, 0.500, 1.001, 1.499, 2.000]);
        assert_eq!(result.timing, RhythmTiming::Clicktrack);
        assert!(result.confidence >= 0.6, "confidence {}", result.confidence);
        assert!(result.beat_cv.unwrap() < 0.005);
        assert_eq!(result.quant_score, Some(1.0));
    }

    #[test]
    fn test_loose_beats_are_human() {
        let result = classify(&[0.0, 0.48, 1.05, 1.41, 2.02]);
        assert_eq!(result.timing, RhythmTiming::Human);
        assert!(result.confidence >= 0.6);
        assert!(result.beat_cv.unwrap() > 0.02);
    }

    #[test]
    fn test_too_few_beats() {
        let result = classify(&[0.0, 0.5, 1.0]);
        assert_eq!(result.timing, RhythmTiming::Uncertain);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.reason, "too_few_beats");
        assert_eq!(result.beat_cv, None);
    }

    #[test]
    fn test_grid_wraparound_counts_as_on_grid() {
        // Beat slightly early relative to the grid still lands on it
        let result = classify(&[10.0, 10.5, 10.999, 11.5, 12.0, 12.5]);
        assert_eq!(result.quant_score, Some(1.0));
    }

    #[test]
    fn test_middle_band_is_uncertain_below_threshold() {
        // Interval jitter around 1%: between cv_low and cv_high
        let beats = [0.0, 0.5, 1.005, 1.5, 2.005, 2.5, 3.005, 3.5];
        let result = classify(&beats);
        assert_eq!(result.timing, RhythmTiming::Uncertain);
        assert!(result.confidence < 0.6);
    }

    #[test]
    fn test_interval_residual_method() {
        let config = RhythmConfig {
            quantization: QuantizationMethod::IntervalResidual { tolerance_sec: 0.005 },
            ..RhythmConfig::default()
        };
        let result = classify_beats(&[0.0, 0.5, 1.0, 1.5, 2.0], &config, &RobustEstimator::Mad);
        assert_eq!(result.timing, RhythmTiming::Clicktrack);
        assert_eq!(result.quant_score, Some(1.0));
    }

    #[test]
    fn test_human_and_machine_scores_follow_timing() {
        let bundle: AnalysisBundle = [AnalysisField::new(
            BEATS_FIELD,
            FieldValue::Sequence(vec![0.0, 0.48, 1.05, 1.41, 2.02]),
            0.9,
            crate::model::Provenance::new("essentia", "2.1b6"),
        )]
        .into_iter()
        .collect();

        let fields = derive(&bundle, &RhythmConfig::default(), &RobustEstimator::Mad);
        let value = |name: &str| {
            fields
                .iter()
                .find(|f| f.name == name)
                .map(|f| (f.value.clone(), f.confidence))
                .unwrap()
        };
        let (timing, confidence) = value(TIMING_FIELD);
        assert_eq!(timing, FieldValue::Label("human".to_string()));
        assert_eq!(value(HUMAN_FIELD).0, FieldValue::Scalar(confidence));
        assert_eq!(value(MACHINE_FIELD), (FieldValue::Scalar(0.0), confidence));
        match value(TIMING_REASON_FIELD).0 {
            FieldValue::Label(reason) => assert!(reason.starts_with("cv="), "{}", reason),
            other => panic!("unexpected reason {:?}", other),
        }
    }

    #[test]
    fn test_uncertain_ceiling_must_stay_below_write_threshold() {
        let config = RhythmConfig {
            uncertain_ceiling: 0.6,
            ..RhythmConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(RhythmConfig::default().validate().is_ok());
    }
}
