//! Extractor report importer
//!
//! Converts the JSON report produced by the extraction layer into an
//! [`AnalysisBundle`]. The report groups raw results under `analysis`
//! (DSP descriptors), `semantic` (model classifiers) and `vocals` (vocal stem
//! analysis); `provenance` names the producing tool.
//!
//! Extractors that report no confidence get a documented default:
//! - beat tracker: `beats_confidence / 5.32` (tracker's maximum), else 0.5
//! - key: `key_strength`, else 0.5
//! - raw sequences, segments and loudness: 1.0 (measurements, not decisions)
//! - any other scalar or label: 0.5
//! - score mappings: the highest score
//!
//! A field whose JSON has the wrong shape (a non-number inside a beat list, a
//! segment without a start) is not repaired. It is imported with its raw JSON
//! text as a label so that the decision engine records it as an invalid value
//! instead of acting on a partial copy.

use crate::error::ReportError;
use crate::model::{
    AnalysisBundle, AnalysisField, BundleSource, FieldValue, Provenance, Segment,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Upper end of the multifeature beat tracker's confidence scale
pub const BEATS_CONFIDENCE_SCALE: f64 = 5.32;
/// Confidence for decisions whose producer reports none
pub const DEFAULT_CONFIDENCE: f64 = 0.5;
/// Confidence for raw measurements
pub const MEASUREMENT_CONFIDENCE: f64 = 1.0;
/// Compact JSON of the report's `provenance` object
pub const PROVENANCE_FIELD: &str = "provenance";

/// Read and parse a report file
pub fn load_report(path: &Path) -> Result<Value, ReportError> {
    let content = std::fs::read_to_string(path).map_err(|e| ReportError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// Read a report file and convert it
pub fn import_report(path: &Path, source: BundleSource) -> Result<AnalysisBundle, ReportError> {
    let report = load_report(path)?;
    let bundle = bundle_from_report(&report, source)?;
    info!(report = %path.display(), fields = bundle.len(), "Extractor report imported");
    Ok(bundle)
}

/// Convert a parsed report into a bundle
pub fn bundle_from_report(report: &Value, source: BundleSource) -> Result<AnalysisBundle, ReportError> {
    let root = report.as_object().ok_or(ReportError::NotAnObject)?;
    let provenance = provenance_of(root.get("provenance"), "extractor");

    let mut importer = Importer {
        bundle: AnalysisBundle::new().with_source(source),
    };

    if let Some(raw) = root.get("provenance").filter(|p| p.is_object()) {
        importer.add(
            PROVENANCE_FIELD,
            FieldValue::Label(raw.to_string()),
            MEASUREMENT_CONFIDENCE,
            &provenance,
        );
    }

    if let Some(analysis) = object(root.get("analysis")) {
        importer.analysis(analysis, &provenance);
    }
    if let Some(semantic) = object(root.get("semantic")) {
        importer.semantic(semantic, &provenance);
    }
    if let Some(vocals) = object(root.get("vocals")) {
        importer.vocals(vocals, &provenance);
    }

    Ok(importer.bundle)
}

struct Importer {
    bundle: AnalysisBundle,
}

impl Importer {
    fn add(&mut self, name: &str, value: FieldValue, confidence: f64, provenance: &Provenance) {
        debug!(field = name, confidence = confidence, "Report field imported");
        self.bundle
            .insert(AnalysisField::new(name, value, confidence, provenance.clone()));
    }

    fn add_parsed(
        &mut self,
        name: &str,
        parsed: Parsed<FieldValue>,
        confidence: f64,
        provenance: &Provenance,
    ) {
        let value = match parsed {
            Ok(value) => value,
            Err(Malformed(raw)) => {
                warn!(field = name, "Malformed report value, recorded as invalid");
                FieldValue::Label(raw.to_string())
            }
        };
        self.add(name, value, confidence, provenance);
    }

    fn analysis(&mut self, analysis: &Map<String, Value>, prov: &Provenance) {
        if let Some(rhythm) = object(analysis.get("rhythm")) {
            let beat_conf = number(rhythm.get("beats_confidence"))
                .map(|c| c / BEATS_CONFIDENCE_SCALE)
                .unwrap_or(DEFAULT_CONFIDENCE);
            if let Some(bpm) = scalar(rhythm.get("bpm")) {
                self.add_parsed("rhythm.bpm", bpm.map(FieldValue::Scalar), beat_conf, prov);
            }
            if let Some(beats) = sequence(rhythm.get("beats")) {
                self.add_parsed("rhythm.beats", beats.map(FieldValue::Sequence), beat_conf, prov);
            }
            if let Some(onsets) = sequence(rhythm.get("onsets")) {
                self.add_parsed(
                    "rhythm.onsets",
                    onsets.map(FieldValue::Sequence),
                    MEASUREMENT_CONFIDENCE,
                    prov,
                );
            }
        }

        let loudness = match analysis.get("loudness") {
            Some(Value::Object(l)) => scalar(l.get("integrated")),
            other => scalar(other),
        };
        if let Some(lufs) = loudness {
            self.add_parsed(
                "loudness.integrated",
                lufs.map(FieldValue::Scalar),
                MEASUREMENT_CONFIDENCE,
                prov,
            );
        }

        if let Some(tonal) = object(analysis.get("tonal")) {
            let strength = number(tonal.get("key_strength"));
            if let Some(key) = text(tonal.get("key")) {
                self.add(
                    "tonal.key",
                    FieldValue::Label(key),
                    strength.unwrap_or(DEFAULT_CONFIDENCE),
                    prov,
                );
            }
            if let Some(s) = strength {
                self.add("tonal.key_strength", FieldValue::Scalar(s), MEASUREMENT_CONFIDENCE, prov);
            }
        }

        if let Some(chroma) = scores(analysis.get("chroma")) {
            self.add_parsed("tonal.chroma", chroma.map(FieldValue::Scores), MEASUREMENT_CONFIDENCE, prov);
        }

        if let Some(mfcc) = object(analysis.get("mfcc")) {
            if let Some(mean) = sequence(mfcc.get("mean")) {
                self.add_parsed(
                    "spectral.mfcc_mean",
                    mean.map(FieldValue::Sequence),
                    MEASUREMENT_CONFIDENCE,
                    prov,
                );
            }
            if let Some(std) = sequence(mfcc.get("std")) {
                self.add_parsed(
                    "spectral.mfcc_std",
                    std.map(FieldValue::Sequence),
                    MEASUREMENT_CONFIDENCE,
                    prov,
                );
            }
        }

        if let Some(tuning) = object(analysis.get("tuning")) {
            let conf = number(tuning.get("confidence")).unwrap_or(DEFAULT_CONFIDENCE);
            if let Some(hz) = scalar(tuning.get("reference_hz")) {
                self.add_parsed("tuning.reference_hz", hz.map(FieldValue::Scalar), conf, prov);
            }
            if let Some(cents) = scalar(tuning.get("cents_offset")) {
                self.add_parsed("tuning.cents_offset", cents.map(FieldValue::Scalar), conf, prov);
            }
            if let Some(pitch) = sequence(tuning.get("pitch_hz")) {
                self.add_parsed(
                    "tuning.pitch_hz",
                    pitch.map(FieldValue::Sequence),
                    MEASUREMENT_CONFIDENCE,
                    prov,
                );
            }
            if let Some(salience) = sequence(tuning.get("pitch_salience")) {
                self.add_parsed(
                    "tuning.pitch_salience",
                    salience.map(FieldValue::Sequence),
                    MEASUREMENT_CONFIDENCE,
                    prov,
                );
            }
        }

        if let Some(sections) = segments(analysis.get("sections")) {
            self.add_parsed(
                "structure.sections",
                sections.map(FieldValue::Segments),
                MEASUREMENT_CONFIDENCE,
                prov,
            );
        }
        if let Some(chords) = segments(analysis.get("chords")) {
            self.add_parsed(
                "chords.sequence",
                chords.map(FieldValue::Segments),
                MEASUREMENT_CONFIDENCE,
                prov,
            );
        }
    }

    fn semantic(&mut self, semantic: &Map<String, Value>, prov: &Provenance) {
        if let Some(genre) = object(semantic.get("genre")) {
            let genre_prov = match genre.get("provenance") {
                Some(p) => provenance_of(Some(p), &prov.producer),
                None => prov.clone(),
            };
            let top_conf = number(genre.get("top_confidence"));
            if let Some(top) = text(genre.get("top")) {
                self.add(
                    "genre.top",
                    FieldValue::Label(top),
                    top_conf.unwrap_or(DEFAULT_CONFIDENCE),
                    &genre_prov,
                );
            }
            if let Some(probs) = genre_probabilities(genre) {
                let conf = top_conf.unwrap_or_else(|| parsed_max(&probs));
                self.add_parsed("genre.scores", probs.map(FieldValue::Scores), conf, &genre_prov);
            }
            if let Some(top_k) = ranked_pairs(genre.get("top_k")) {
                let conf = parsed_max(&top_k);
                self.add_parsed("genre.top_k", top_k.map(FieldValue::Scores), conf, &genre_prov);
            }
        }

        for (key, name) in [("mood", "mood"), ("instruments", "instruments")] {
            if let Some(values) = scores(semantic.get(key)) {
                let conf = parsed_max(&values);
                self.add_parsed(name, values.map(FieldValue::Scores), conf, prov);
            }
        }
    }

    fn vocals(&mut self, vocals: &Map<String, Value>, prov: &Provenance) {
        if let Some(role) = text(vocals.get("role")) {
            let conf = number(vocals.get("role_confidence")).unwrap_or(DEFAULT_CONFIDENCE);
            self.add("vocal.role", FieldValue::Label(role), conf, prov);
        }
        if let Some(emotion) = scores(vocals.get("emotion")) {
            let conf = parsed_max(&emotion);
            self.add_parsed("vocal.emotion", emotion.map(FieldValue::Scores), conf, prov);
        }
        if let Some(pitch) = sequence(vocals.get("pitch_hz")) {
            self.add_parsed(
                "vocal.pitch_hz",
                pitch.map(FieldValue::Sequence),
                MEASUREMENT_CONFIDENCE,
                prov,
            );
        }
        if let Some(presence) = scalar(vocals.get("presence")) {
            self.add_parsed(
                "vocal.presence",
                presence.map(FieldValue::Scalar),
                DEFAULT_CONFIDENCE,
                prov,
            );
        }
        if let Some(note) = text(vocals.get("median_note")) {
            self.add("vocal.median_note", FieldValue::Label(note), DEFAULT_CONFIDENCE, prov);
        }
        if let Some(midi) = scalar(vocals.get("median_midi")) {
            self.add_parsed(
                "vocal.median_midi",
                midi.map(FieldValue::Scalar),
                DEFAULT_CONFIDENCE,
                prov,
            );
        }
    }
}

/// `{tool|model, version, ...}` => provenance; remaining keys become params
fn provenance_of(value: Option<&Value>, fallback_producer: &str) -> Provenance {
    let Some(obj) = object(value) else {
        return Provenance::new(fallback_producer, "unknown");
    };
    let producer = text(obj.get("tool"))
        .or_else(|| text(obj.get("model")))
        .unwrap_or_else(|| fallback_producer.to_string());
    let version = text(obj.get("version")).unwrap_or_else(|| "unknown".to_string());

    let mut prov = Provenance::new(producer, version);
    for (key, value) in obj {
        if !matches!(key.as_str(), "tool" | "model" | "version") && !value.is_null() {
            prov.params.insert(key.clone(), value.clone());
        }
    }
    prov
}

/// Raw JSON of a field that does not have the expected shape
struct Malformed(Value);

/// Present field: parsed value, or the raw JSON it came from
type Parsed<T> = Result<T, Malformed>;

/// PANNs-style probabilities: `probs_dict`, or parallel `labels` and `probs`
fn genre_probabilities(genre: &Map<String, Value>) -> Option<Parsed<BTreeMap<String, f64>>> {
    if let Some(probs) = scores(genre.get("probs_dict")) {
        return Some(probs);
    }
    let labels = genre.get("labels")?.as_array()?;
    let probs = genre.get("probs")?.as_array()?;
    if labels.is_empty() || labels.len() != probs.len() {
        return None;
    }
    let parsed = labels
        .iter()
        .zip(probs)
        .map(|(l, p)| Some((l.as_str()?.to_string(), p.as_f64()?)))
        .collect::<Option<BTreeMap<String, f64>>>();
    Some(parsed.ok_or_else(|| {
        Malformed(serde_json::json!({"labels": labels, "probs": probs}))
    }))
}

/// `[[label, score], ...]` as a score mapping
fn ranked_pairs(value: Option<&Value>) -> Option<Parsed<BTreeMap<String, f64>>> {
    let raw = value?;
    let list = raw.as_array()?;
    if list.is_empty() {
        return None;
    }
    let parsed = list
        .iter()
        .map(|pair| match pair.as_array()?.as_slice() {
            [label, score] => Some((label.as_str()?.to_string(), score.as_f64()?)),
            _ => None,
        })
        .collect::<Option<BTreeMap<String, f64>>>();
    Some(parsed.ok_or_else(|| Malformed(raw.clone())))
}

fn object(value: Option<&Value>) -> Option<&Map<String, Value>> {
    value?.as_object()
}

fn number(value: Option<&Value>) -> Option<f64> {
    value?.as_f64()
}

/// Present, non-null measurement; anything but a number is malformed
fn scalar(value: Option<&Value>) -> Option<Parsed<f64>> {
    match value? {
        Value::Null => None,
        raw => Some(raw.as_f64().ok_or_else(|| Malformed(raw.clone()))),
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Non-empty number list; any non-number makes the whole list malformed
fn sequence(value: Option<&Value>) -> Option<Parsed<Vec<f64>>> {
    let raw = value?;
    let list = raw.as_array()?;
    if list.is_empty() {
        return None;
    }
    let parsed = list.iter().map(Value::as_f64).collect::<Option<Vec<f64>>>();
    Some(parsed.ok_or_else(|| Malformed(raw.clone())))
}

/// Non-empty label => number object; any non-number makes it malformed
fn scores(value: Option<&Value>) -> Option<Parsed<BTreeMap<String, f64>>> {
    let raw = value?;
    let map = raw.as_object()?;
    if map.is_empty() {
        return None;
    }
    let parsed = map
        .iter()
        .map(|(k, v)| Some((k.clone(), v.as_f64()?)))
        .collect::<Option<BTreeMap<String, f64>>>();
    Some(parsed.ok_or_else(|| Malformed(raw.clone())))
}

/// Non-empty segment list; a segment without numeric bounds makes it malformed
fn segments(value: Option<&Value>) -> Option<Parsed<Vec<Segment>>> {
    let raw = value?;
    let list = raw.as_array()?;
    if list.is_empty() {
        return None;
    }
    let parsed = list.iter().map(segment).collect::<Option<Vec<Segment>>>();
    Some(parsed.ok_or_else(|| Malformed(raw.clone())))
}

fn segment(value: &Value) -> Option<Segment> {
    let obj = value.as_object()?;
    let confidence = match obj.get("confidence") {
        None | Some(Value::Null) => None,
        Some(c) => Some(c.as_f64()?),
    };
    Some(Segment {
        start: obj.get("start")?.as_f64()?,
        end: obj.get("end")?.as_f64()?,
        label: text(obj.get("label")).unwrap_or_default(),
        confidence,
        alternate: None,
    })
}

/// Highest score of a parsed mapping; a malformed one gets the default
fn parsed_max(scores: &Parsed<BTreeMap<String, f64>>) -> f64 {
    match scores {
        Ok(scores) => scores.values().copied().fold(0.0, f64::max),
        Err(_) => DEFAULT_CONFIDENCE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "provenance": {"tool": "essentia", "version": "2.1b6"},
            "analysis": {
                "rhythm": {
                    "bpm": 120.0,
                    "beats": [0.0, 0.5, 1.0, 1.5],
                    "beats_confidence": 3.99
                },
                "loudness": {"integrated": -9.5},
                "tonal": {"key": "A minor", "key_strength": 0.82},
                "mfcc": {"mean": [1.0, 2.0], "std": []},
                "sections": [{"start": 0.0, "end": 30.0, "label": "full"}],
                "chords": [{"start": 0.0, "end": 2.0, "label": "Am7", "confidence": 0.4}]
            },
            "semantic": {
                "genre": {
                    "provenance": {"model": "panns_cnn14", "version": "1.0"},
                    "top": "Jazz",
                    "top_confidence": 0.71,
                    "labels": ["Jazz", "Music"],
                    "probs": [0.71, 0.9]
                },
                "mood": {"energetic": 0.78, "relaxed": 0.12}
            },
            "vocals": {"role": "lead", "pitch_hz": [0.0, 440.0]}
        })
    }

    #[test]
    fn test_default_confidences_applied() {
        let bundle = bundle_from_report(&sample(), BundleSource::default()).unwrap();

        let bpm = bundle.get("rhythm.bpm").unwrap();
        assert!((bpm.confidence - 3.99 / 5.32).abs() < 1e-12);
        assert_eq!(bpm.provenance.producer, "essentia");

        assert_eq!(bundle.get("tonal.key").unwrap().confidence, 0.82);
        assert_eq!(bundle.get("rhythm.beats").unwrap().confidence, 3.99 / 5.32);
        assert_eq!(bundle.get("structure.sections").unwrap().confidence, 1.0);
        assert_eq!(bundle.get("vocal.role").unwrap().confidence, DEFAULT_CONFIDENCE);
        assert_eq!(bundle.get("mood").unwrap().confidence, 0.78);
    }

    #[test]
    fn test_genre_uses_model_provenance_and_parallel_lists() {
        let bundle = bundle_from_report(&sample(), BundleSource::default()).unwrap();
        let scores = bundle.get("genre.scores").unwrap();
        assert_eq!(scores.provenance.producer, "panns_cnn14");
        assert_eq!(scores.value.as_scores().unwrap().len(), 2);
        assert_eq!(
            bundle.get("genre.top").unwrap().value,
            FieldValue::Label("Jazz".into())
        );
    }

    #[test]
    fn test_empty_and_null_values_skipped() {
        let bundle = bundle_from_report(&sample(), BundleSource::default()).unwrap();
        assert!(bundle.contains("spectral.mfcc_mean"));
        assert!(!bundle.contains("spectral.mfcc_std"));

        let sparse = json!({"analysis": {"rhythm": {"bpm": null}}});
        let bundle = bundle_from_report(&sparse, BundleSource::default()).unwrap();
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_beats_without_confidence_default() {
        let report = json!({"analysis": {"rhythm": {"beats": [0.0, 0.5]}}});
        let bundle = bundle_from_report(&report, BundleSource::default()).unwrap();
        let beats = bundle.get("rhythm.beats").unwrap();
        assert_eq!(beats.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(beats.provenance.producer, "extractor");
    }

    #[test]
    fn test_malformed_beats_kept_as_invalid_not_shortened() {
        let report = json!({"analysis": {"rhythm": {"beats": [0.0, "x", 1.0, null, 2.0]}}});
        let bundle = bundle_from_report(&report, BundleSource::default()).unwrap();
        let beats = bundle.get("rhythm.beats").unwrap();
        assert_eq!(beats.value.as_sequence(), None);
        assert_eq!(
            beats.value,
            FieldValue::Label(r#"[0.0,"x",1.0,null,2.0]"#.to_string())
        );
    }

    #[test]
    fn test_malformed_scores_and_segments_kept_as_invalid() {
        let report = json!({
            "analysis": {
                "rhythm": {"bpm": "fast"},
                "chords": [{"start": 0.0, "end": 2.0, "label": "C"}, {"label": "G"}]
            },
            "semantic": {
                "mood": {"happy": 0.7, "sad": "low"},
                "genre": {"labels": ["Jazz", "Rock"], "probs": [0.7, null]}
            }
        });
        let bundle = bundle_from_report(&report, BundleSource::default()).unwrap();
        for name in ["rhythm.bpm", "chords.sequence", "mood", "genre.scores"] {
            let field = bundle.get(name).unwrap();
            assert_eq!(
                field.value.kind(),
                crate::model::ValueKind::Label,
                "{} should be kept raw",
                name
            );
        }
        assert_eq!(bundle.get("mood").unwrap().confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_top_k_pairs_and_provenance_imported() {
        let report = json!({
            "provenance": {"tool": "essentia", "version": "2.1b6"},
            "semantic": {"genre": {"top_k": [["Jazz", 0.71], ["Blues", 0.2]]}}
        });
        let bundle = bundle_from_report(&report, BundleSource::default()).unwrap();

        let top_k = bundle.get("genre.top_k").unwrap();
        assert_eq!(top_k.value.as_scores().unwrap()["Jazz"], 0.71);
        assert_eq!(top_k.confidence, 0.71);

        let provenance = bundle.get(PROVENANCE_FIELD).unwrap();
        assert_eq!(
            provenance.value,
            FieldValue::Label(r#"{"tool":"essentia","version":"2.1b6"}"#.to_string())
        );
    }

    #[test]
    fn test_non_object_report_rejected() {
        assert!(matches!(
            bundle_from_report(&json!([1, 2]), BundleSource::default()),
            Err(ReportError::NotAnObject)
        ));
    }
}
