//! Chord simplification
//!
//! Segments whose confidence clears `chord_threshold` keep their extended
//! label. Less certain segments are reduced to the base triad parsed from the
//! chord symbol; the extended reading survives only as the segment's
//! alternate, which is never written to a compact tag.

use super::stats::RobustEstimator;
use super::{derived_provenance, ClassifierConfigError};
use crate::model::{AlternateLabel, AnalysisBundle, AnalysisField, FieldValue, Segment};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const SEQUENCE_FIELD: &str = "chords.sequence";
pub const SIMPLIFIED_FIELD: &str = "chords.simplified";

/// Chord simplification parameters (`[classifiers.chords]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChordConfig {
    pub chord_threshold: f64,
}

impl Default for ChordConfig {
    fn default() -> Self {
        Self {
            chord_threshold: 0.6,
        }
    }
}

impl ChordConfig {
    pub fn validate(&self) -> Result<(), ClassifierConfigError> {
        if self.chord_threshold.is_finite() && (0.0..=1.0).contains(&self.chord_threshold) {
            Ok(())
        } else {
            Err(ClassifierConfigError {
                name: "classifiers.chords.chord_threshold".to_string(),
                message: format!("{} must be within [0, 1]", self.chord_threshold),
            })
        }
    }
}

/// Triad quality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriadQuality {
    Major,
    Minor,
    Diminished,
    Augmented,
    Sus2,
    Sus4,
}

impl TriadQuality {
    fn suffix(&self) -> &'static str {
        match self {
            TriadQuality::Major => "",
            TriadQuality::Minor => "m",
            TriadQuality::Diminished => "dim",
            TriadQuality::Augmented => "aug",
            TriadQuality::Sus2 => "sus2",
            TriadQuality::Sus4 => "sus4",
        }
    }
}

/// Split a chord symbol into root and triad quality
///
/// Accepts plain (`Am7`, `C#maj9`, `F/A`) and colon (`A:min7`) spellings.
/// Returns None for no-chord markers and unparsable symbols.
pub fn parse_chord(symbol: &str) -> Option<(String, TriadQuality)> {
    let symbol = symbol.trim();
    let mut chars = symbol.chars();
    let letter = chars.next()?;
    if !('A'..='G').contains(&letter) {
        return None;
    }

    let mut root = letter.to_string();
    let mut rest = chars.as_str();
    if let Some(accidental) = rest.chars().next().filter(|c| *c == '#' || *c == 'b') {
        root.push(accidental);
        rest = &rest[accidental.len_utf8()..];
    }

    // Bass note does not change the triad
    let rest = rest.split('/').next().unwrap_or_default();
    let rest = rest.strip_prefix(':').unwrap_or(rest);

    let quality = if rest.contains("sus2") {
        TriadQuality::Sus2
    } else if rest.contains("sus") {
        TriadQuality::Sus4
    } else if rest.starts_with("dim")
        || rest.starts_with("hdim")
        || rest.starts_with('o')
        || rest.starts_with("m7b5")
        || rest.starts_with("min7b5")
    {
        TriadQuality::Diminished
    } else if rest.starts_with("aug") || rest.starts_with('+') {
        TriadQuality::Augmented
    } else if rest.starts_with("maj") || rest.starts_with('M') {
        TriadQuality::Major
    } else if rest.starts_with("min") || rest.starts_with('m') || rest.starts_with('-') {
        TriadQuality::Minor
    } else {
        TriadQuality::Major
    };

    Some((root, quality))
}

/// Base triad label for a chord symbol, if it parses
pub fn base_triad(symbol: &str) -> Option<String> {
    parse_chord(symbol).map(|(root, quality)| format!("{}{}", root, quality.suffix()))
}

/// Simplify one segment; `default_confidence` applies when the segment has none
pub fn simplify_segment(segment: &Segment, default_confidence: f64, threshold: f64) -> Segment {
    let confidence = segment.confidence.unwrap_or(default_confidence);
    if confidence >= threshold {
        return Segment {
            confidence: Some(confidence),
            ..segment.clone()
        };
    }

    match base_triad(&segment.label) {
        Some(triad) if triad != segment.label => Segment {
            start: segment.start,
            end: segment.end,
            label: triad,
            confidence: Some(confidence),
            alternate: Some(AlternateLabel {
                label: segment.label.clone(),
                confidence,
            }),
        },
        _ => Segment {
            confidence: Some(confidence),
            ..segment.clone()
        },
    }
}

/// Derive `chords.simplified` from `chords.sequence`
pub fn derive(
    bundle: &AnalysisBundle,
    config: &ChordConfig,
    estimator: &RobustEstimator,
) -> Vec<AnalysisField> {
    let Some(input) = bundle.get(SEQUENCE_FIELD) else {
        return Vec::new();
    };
    let Some(segments) = input.value.as_segments() else {
        debug!(field = SEQUENCE_FIELD, "Chord field is not a segment list, skipping");
        return Vec::new();
    };
    if input.validate().is_err() {
        debug!(field = SEQUENCE_FIELD, "Chord field is malformed, skipping");
        return Vec::new();
    }

    let simplified: Vec<Segment> = segments
        .iter()
        .map(|s| simplify_segment(s, input.confidence, config.chord_threshold))
        .collect();

    let demoted = simplified.iter().filter(|s| s.alternate.is_some()).count();
    debug!(
        segments = simplified.len(),
        demoted = demoted,
        "Chord sequence simplified"
    );

    let provenance = derived_provenance("chord_simplification", input, estimator)
        .with_param("chord_threshold", config.chord_threshold)
        .with_param("demoted_segments", demoted as u64);

    vec![AnalysisField::new(
        SIMPLIFIED_FIELD,
        FieldValue::Segments(simplified),
        input.confidence,
        provenance,
    )]
}
