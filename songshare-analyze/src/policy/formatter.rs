//! Value formatters
//!
//! Pure functions from a field value to compact tag text. `score` renders the
//! gating confidence itself, so fields using it get no confidence companion.

use crate::model::{FieldValue, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Compact text rendering of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Formatter {
    /// Label as-is, scalar in shortest form
    Identity,
    /// Scalar with a fixed number of decimals
    Decimal { places: usize },
    /// Scalar rounded to an integer
    Integer,
    /// The gating confidence (or per-label score) with fixed decimals
    Score { places: usize },
    /// Constant `1` marking presence
    Presence,
    /// Rank of the label's score among all labels, 0..=9
    Decile,
    /// Highest-scoring label of a score mapping
    TopLabel,
    /// JSON list of the `k` best `[label, score]` pairs, best first
    TopK { k: usize },
}

impl Formatter {
    pub fn name(&self) -> &'static str {
        match self {
            Formatter::Identity => "identity",
            Formatter::Decimal { .. } => "decimal",
            Formatter::Integer => "integer",
            Formatter::Score { .. } => "score",
            Formatter::Presence => "presence",
            Formatter::Decile => "decile",
            Formatter::TopLabel => "top_label",
            Formatter::TopK { .. } => "top_k",
        }
    }

    /// True if the rendered text already carries the confidence
    pub fn writes_confidence(&self) -> bool {
        matches!(self, Formatter::Score { .. })
    }

    /// Can render a whole value of `kind` (single cardinality)
    pub fn supports_single(&self, kind: ValueKind) -> bool {
        match self {
            Formatter::Identity => matches!(kind, ValueKind::Scalar | ValueKind::Label),
            Formatter::Decimal { .. } | Formatter::Integer | Formatter::Score { .. } => {
                kind == ValueKind::Scalar
            }
            Formatter::Presence => true,
            Formatter::TopLabel | Formatter::TopK { .. } => kind == ValueKind::Scores,
            Formatter::Decile => false,
        }
    }

    /// Can render one label's score (per_label cardinality)
    pub fn supports_per_label(&self) -> bool {
        matches!(
            self,
            Formatter::Decimal { .. }
                | Formatter::Integer
                | Formatter::Score { .. }
                | Formatter::Presence
                | Formatter::Decile
        )
    }

    /// Render a whole value; None if the value cannot be rendered
    pub fn format_single(&self, value: &FieldValue, confidence: f64) -> Option<String> {
        match (self, value) {
            (Formatter::Identity, FieldValue::Scalar(v)) => Some(format!("{}", v)),
            (Formatter::Identity, FieldValue::Label(s)) => Some(s.trim().to_string()),
            (Formatter::Decimal { places }, FieldValue::Scalar(v)) => {
                Some(format!("{:.*}", places, v))
            }
            (Formatter::Integer, FieldValue::Scalar(v)) => Some(format!("{}", v.round() as i64)),
            (Formatter::Score { places }, FieldValue::Scalar(_)) => {
                Some(format!("{:.*}", places, confidence))
            }
            (Formatter::Presence, _) => Some("1".to_string()),
            (Formatter::TopLabel, FieldValue::Scores(scores)) => top_label(scores).map(str::to_string),
            (Formatter::TopK { k }, FieldValue::Scores(scores)) if *k > 0 => {
                serde_json::to_string(&top_k(scores, *k)).ok()
            }
            _ => None,
        }
    }

    /// Render one label's score given the full mapping
    pub fn format_label(&self, score: f64, scores: &BTreeMap<String, f64>) -> Option<String> {
        match self {
            Formatter::Decimal { places } | Formatter::Score { places } => {
                Some(format!("{:.*}", places, score))
            }
            Formatter::Integer => Some(format!("{}", score.round() as i64)),
            Formatter::Presence => Some("1".to_string()),
            Formatter::Decile => Some(decile(score, scores).to_string()),
            Formatter::Identity | Formatter::TopLabel | Formatter::TopK { .. } => None,
        }
    }

    /// True if this formatter's output is a label that exclusion lists apply to
    pub fn renders_label(&self, kind: ValueKind) -> bool {
        matches!(
            (self, kind),
            (Formatter::Identity, ValueKind::Label) | (Formatter::TopLabel, _)
        )
    }
}

impl fmt::Display for Formatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Highest-scoring label; ties resolve to the first label in name order
pub fn top_label(scores: &BTreeMap<String, f64>) -> Option<&str> {
    let mut best: Option<(&str, f64)> = None;
    for (label, score) in scores {
        match best {
            Some((_, s)) if *score <= s => {}
            _ => best = Some((label, *score)),
        }
    }
    best.map(|(label, _)| label)
}

/// The `k` best labels, score descending then name ascending
///
/// Scores are rounded to three decimals.
pub fn top_k(scores: &BTreeMap<String, f64>, k: usize) -> Vec<(&str, f64)> {
    let mut ranked: Vec<(&str, f64)> = scores
        .iter()
        .map(|(label, score)| (label.as_str(), (score * 1000.0).round() / 1000.0))
        .collect();
    // stable sort keeps name order among equal scores
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(k);
    ranked
}

/// Rank-based decile of `score` among all scores, 0..=9
///
/// Rank is the index of the last value `<= score` in ascending order. A
/// single-label mapping is decile 0.
pub fn decile(score: f64, scores: &BTreeMap<String, f64>) -> u8 {
    let n = scores.len();
    if n <= 1 {
        return 0;
    }
    let at_or_below = scores.values().filter(|v| **v <= score).count();
    let rank = at_or_below.saturating_sub(1);
    ((rank * 10) / n).min(9) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_scalar_formatting() {
        let v = FieldValue::Scalar(120.04);
        assert_eq!(Formatter::Identity.format_single(&v, 0.9).as_deref(), Some("120.04"));
        assert_eq!(
            Formatter::Decimal { places: 1 }.format_single(&v, 0.9).as_deref(),
            Some("120.0")
        );
        assert_eq!(Formatter::Integer.format_single(&v, 0.9).as_deref(), Some("120"));
        assert_eq!(
            Formatter::Score { places: 2 }.format_single(&v, 0.876).as_deref(),
            Some("0.88")
        );
    }

    #[test]
    fn test_kind_mismatch_does_not_render() {
        let v = FieldValue::Label("C major".into());
        assert_eq!(Formatter::Decimal { places: 1 }.format_single(&v, 0.9), None);
        assert!(!Formatter::Decimal { places: 1 }.supports_single(ValueKind::Label));
    }

    #[test]
    fn test_top_label() {
        let s = scores(&[("jazz", 0.7), ("rock", 0.2), ("blues", 0.7)]);
        assert_eq!(top_label(&s), Some("blues"));
        assert_eq!(top_label(&BTreeMap::new()), None);
    }

    #[test]
    fn test_top_k_renders_best_pairs() {
        let s = scores(&[("jazz", 0.7123), ("rock", 0.2), ("blues", 0.7123), ("pop", 0.05)]);
        let v = FieldValue::Scores(s);
        assert_eq!(
            Formatter::TopK { k: 3 }.format_single(&v, 0.9).as_deref(),
            Some(r#"[["blues",0.712],["jazz",0.712],["rock",0.2]]"#)
        );
        assert_eq!(
            Formatter::TopK { k: 9 }.format_single(&FieldValue::Scores(BTreeMap::new()), 0.9).as_deref(),
            Some("[]")
        );
        assert_eq!(Formatter::TopK { k: 0 }.format_single(&v, 0.9), None);
        assert!(!Formatter::TopK { k: 3 }.supports_single(ValueKind::Label));
        assert!(!Formatter::TopK { k: 3 }.supports_per_label());
    }

    #[test]
    fn test_deciles_follow_rank() {
        let s = scores(&[
            ("a", 0.1),
            ("b", 0.2),
            ("c", 0.3),
            ("d", 0.4),
            ("e", 0.5),
        ]);
        assert_eq!(decile(0.1, &s), 0);
        assert_eq!(decile(0.3, &s), 4);
        assert_eq!(decile(0.5, &s), 8);
        assert_eq!(decile(0.9, &scores(&[("solo", 0.9)])), 0);
    }

    #[test]
    fn test_score_carries_confidence() {
        assert!(Formatter::Score { places: 2 }.writes_confidence());
        assert!(!Formatter::Presence.writes_confidence());
        assert!(!Formatter::Decile.writes_confidence());
    }

    #[test]
    fn test_formatter_from_toml() {
        #[derive(Deserialize)]
        struct Row {
            formatter: Formatter,
        }
        let row: Row = toml::from_str(r#"formatter = { type = "decimal", places = 2 }"#).unwrap();
        assert_eq!(row.formatter, Formatter::Decimal { places: 2 });
        let row: Row = toml::from_str(r#"formatter = { type = "top_label" }"#).unwrap();
        assert_eq!(row.formatter, Formatter::TopLabel);
        let row: Row = toml::from_str(r#"formatter = { type = "top_k", k = 3 }"#).unwrap();
        assert_eq!(row.formatter, Formatter::TopK { k: 3 });
    }
}
