//! Vocal pitch summary from the predominant pitch track of a vocal stem

use super::stats::{median, RobustEstimator};
use super::derived_provenance;
use crate::model::{AnalysisBundle, AnalysisField, FieldValue};
use tracing::debug;

pub const PITCH_FIELD: &str = "vocal.pitch_hz";
pub const PRESENCE_FIELD: &str = "vocal.presence";
pub const MEDIAN_MIDI_FIELD: &str = "vocal.median_midi";
pub const MEDIAN_NOTE_FIELD: &str = "vocal.median_note";

const NOTE_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

/// Nearest MIDI note number; 0 for non-positive frequencies
pub fn freq_to_midi(freq_hz: f64) -> i32 {
    if freq_hz <= 0.0 {
        return 0;
    }
    (69.0 + 12.0 * (freq_hz / 440.0).log2()).round() as i32
}

/// Scientific pitch name (`69` => `A4`)
pub fn midi_to_note(midi: i32) -> String {
    let octave = midi.div_euclid(12) - 1;
    let name = NOTE_NAMES[midi.rem_euclid(12) as usize];
    format!("{}{}", name, octave)
}

/// Derive presence and median pitch from `vocal.pitch_hz` (0 = unvoiced frame)
pub fn derive(bundle: &AnalysisBundle, estimator: &RobustEstimator) -> Vec<AnalysisField> {
    let Some(input) = bundle.get(PITCH_FIELD) else {
        return Vec::new();
    };
    let Some(frames) = input.value.as_sequence() else {
        return Vec::new();
    };
    if frames.is_empty() || input.validate().is_err() {
        debug!(field = PITCH_FIELD, "Vocal pitch track empty or malformed, skipping");
        return Vec::new();
    }

    let voiced: Vec<f64> = frames.iter().copied().filter(|f| *f > 0.0).collect();
    let presence = voiced.len() as f64 / frames.len() as f64;
    let provenance = derived_provenance("vocal_pitch_summary", input, estimator)
        .with_param("voiced_frames", voiced.len() as u64)
        .with_param("total_frames", frames.len() as u64);

    let mut fields = vec![AnalysisField::new(
        PRESENCE_FIELD,
        FieldValue::Scalar(presence),
        input.confidence,
        provenance.clone(),
    )];

    if let Some(median_hz) = median(&voiced) {
        let midi = freq_to_midi(median_hz);
        fields.push(AnalysisField::new(
            MEDIAN_MIDI_FIELD,
            FieldValue::Scalar(midi as f64),
            input.confidence,
            provenance.clone(),
        ));
        fields.push(AnalysisField::new(
            MEDIAN_NOTE_FIELD,
            FieldValue::Label(midi_to_note(midi)),
            input.confidence,
            provenance,
        ));
    }

    fields
}
