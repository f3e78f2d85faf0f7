//! Extraction result model
//!
//! Typed containers for analysis output. Every measured or derived quantity is
//! an [`AnalysisField`] carrying a value, a confidence in [0, 1] and the
//! provenance of the producer that computed it. Fields for one audio item are
//! collected in an [`AnalysisBundle`].
//!
//! Confidence is monotonic: higher always means more trustworthy. Extractors
//! whose native scale differs are normalized before the field is built (see
//! [`crate::report`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// One labeled, time-stamped segment (chords, sections)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Segment start (seconds)
    pub start: f64,
    /// Segment end (seconds)
    pub end: f64,
    /// Segment label
    pub label: String,
    /// Per-segment confidence, falls back to the field confidence when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Alternate reading kept for the side-record only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate: Option<AlternateLabel>,
}

impl Segment {
    pub fn new(start: f64, end: f64, label: impl Into<String>) -> Self {
        Self {
            start,
            end,
            label: label.into(),
            confidence: None,
            alternate: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Label demoted out of a segment, with the confidence it had
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternateLabel {
    pub label: String,
    pub confidence: f64,
}

/// Closed set of value shapes a field may carry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum FieldValue {
    /// Single number (bpm, loudness, tuning offset)
    Scalar(f64),
    /// Categorical value (key, genre, timing class)
    Label(String),
    /// Ordered numbers (beat times, pitch track, MFCC summary)
    Sequence(Vec<f64>),
    /// Ordered labeled segments (chords, sections)
    Segments(Vec<Segment>),
    /// Label to score mapping (mood, instruments, genre probabilities)
    Scores(BTreeMap<String, f64>),
}

impl FieldValue {
    /// Kind tag of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            FieldValue::Scalar(_) => ValueKind::Scalar,
            FieldValue::Label(_) => ValueKind::Label,
            FieldValue::Sequence(_) => ValueKind::Sequence,
            FieldValue::Segments(_) => ValueKind::Segments,
            FieldValue::Scores(_) => ValueKind::Scores,
        }
    }

    /// True if every number in the value is finite
    pub fn is_finite(&self) -> bool {
        match self {
            FieldValue::Scalar(v) => v.is_finite(),
            FieldValue::Label(_) => true,
            FieldValue::Sequence(values) => values.iter().all(|v| v.is_finite()),
            FieldValue::Segments(segments) => segments.iter().all(|s| {
                s.start.is_finite()
                    && s.end.is_finite()
                    && s.confidence.map_or(true, f64::is_finite)
                    && s.alternate.as_ref().map_or(true, |a| a.confidence.is_finite())
            }),
            FieldValue::Scores(scores) => scores.values().all(|v| v.is_finite()),
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            FieldValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_label(&self) -> Option<&str> {
        match self {
            FieldValue::Label(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[f64]> {
        match self {
            FieldValue::Sequence(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_segments(&self) -> Option<&[Segment]> {
        match self {
            FieldValue::Segments(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_scores(&self) -> Option<&BTreeMap<String, f64>> {
        match self {
            FieldValue::Scores(v) => Some(v),
            _ => None,
        }
    }
}

/// Declared kind of a field value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Scalar,
    Label,
    Sequence,
    Segments,
    Scores,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::Scalar => "scalar",
            ValueKind::Label => "label",
            ValueKind::Sequence => "sequence",
            ValueKind::Segments => "segments",
            ValueKind::Scores => "scores",
        };
        f.write_str(s)
    }
}

/// Who computed a field, with which version and parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Producer name (extractor or classifier)
    pub producer: String,
    /// Producer version
    pub version: String,
    /// Parameter snapshot
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl Provenance {
    pub fn new(producer: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
            version: version.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add one parameter to the snapshot
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Reason a field cannot be rendered
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidFieldValue {
    /// Confidence is NaN or infinite
    #[error("confidence is not finite")]
    NonFiniteConfidence,

    /// Confidence outside [0, 1]
    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),

    /// Value contains NaN or infinity
    #[error("value contains non-finite numbers")]
    NonFiniteValue,

    /// Value kind differs from the declared kind
    #[error("expected {expected} value, found {actual}")]
    KindMismatch { expected: ValueKind, actual: ValueKind },
}

/// One measured or derived quantity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisField {
    /// Stable field identifier (e.g. `rhythm.bpm`, `mood`)
    pub name: String,
    pub value: FieldValue,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub provenance: Provenance,
}

impl AnalysisField {
    /// Build a field, clamping confidence into [0, 1] (NaN becomes 0)
    pub fn new(
        name: impl Into<String>,
        value: FieldValue,
        confidence: f64,
        provenance: Provenance,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            confidence: clamp_confidence(confidence),
            provenance,
        }
    }

    /// Check confidence range and value finiteness
    ///
    /// Fields built with [`AnalysisField::new`] always have a valid
    /// confidence; deserialized fields may not.
    pub fn validate(&self) -> Result<(), InvalidFieldValue> {
        if !self.confidence.is_finite() {
            return Err(InvalidFieldValue::NonFiniteConfidence);
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(InvalidFieldValue::ConfidenceOutOfRange(self.confidence));
        }
        if !self.value.is_finite() {
            return Err(InvalidFieldValue::NonFiniteValue);
        }
        if let FieldValue::Scores(scores) = &self.value {
            if let Some(bad) = scores.values().find(|v| !(0.0..=1.0).contains(*v)) {
                return Err(InvalidFieldValue::ConfidenceOutOfRange(*bad));
            }
        }
        Ok(())
    }

    /// Validate, and additionally require a declared kind
    pub fn validate_as(&self, expected: ValueKind) -> Result<(), InvalidFieldValue> {
        let actual = self.value.kind();
        if actual != expected {
            return Err(InvalidFieldValue::KindMismatch { expected, actual });
        }
        self.validate()
    }
}

/// Clamp a confidence into [0, 1]; NaN maps to 0
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Audio item a bundle describes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleSource {
    /// Audio file path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<PathBuf>,
    /// SHA-256 of the audio content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// All analysis fields for one audio item, keyed by unique field name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisBundle {
    #[serde(default)]
    pub source: BundleSource,
    #[serde(default)]
    fields: BTreeMap<String, AnalysisField>,
}

impl AnalysisBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: BundleSource) -> Self {
        self.source = source;
        self
    }

    /// Add a field while building the bundle; returns the replaced field, if any
    pub fn insert(&mut self, field: AnalysisField) -> Option<AnalysisField> {
        self.fields.insert(field.name.clone(), field)
    }

    pub fn get(&self, name: &str) -> Option<&AnalysisField> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Fields in name order
    pub fn fields(&self) -> impl Iterator<Item = &AnalysisField> {
        self.fields.values()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// New bundle with derived fields added
    ///
    /// A derived field never replaces a field already present in this bundle.
    pub fn extended(&self, derived: impl IntoIterator<Item = AnalysisField>) -> AnalysisBundle {
        let mut next = self.clone();
        for field in derived {
            if next.fields.contains_key(&field.name) {
                debug!(
                    field = %field.name,
                    "Extractor already supplied field, derived value dropped"
                );
                continue;
            }
            next.fields.insert(field.name.clone(), field);
        }
        next
    }

    /// Read a bundle from its JSON document
    pub fn load(path: &Path) -> songshare_common::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the bundle as pretty JSON
    pub fn save(&self, path: &Path) -> songshare_common::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl FromIterator<AnalysisField> for AnalysisBundle {
    fn from_iter<I: IntoIterator<Item = AnalysisField>>(iter: I) -> Self {
        let mut bundle = AnalysisBundle::new();
        for field in iter {
            bundle.insert(field);
        }
        bundle
    }
}
