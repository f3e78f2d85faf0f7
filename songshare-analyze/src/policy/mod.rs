//! Field policy registry
//!
//! Declarative table mapping each logical field to its destinations,
//! threshold, formatter and cardinality. The default table ships embedded as
//! `default_fields.toml`; `[[fields]]` entries in the configuration file
//! override rows by name or append new ones. The merged table is validated
//! once at load and is immutable for the run.

pub mod formatter;

pub use formatter::Formatter;

use crate::constraints::TagConstraints;
use crate::engine::companion_key;
use crate::error::ConfigurationError;
use crate::model::ValueKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Embedded default field table
const DEFAULT_FIELDS: &str = include_str!("default_fields.toml");

/// Where a field may be persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    CompactTag,
    SideRecord,
}

/// One tag per field, or one tag per label of a score mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    #[default]
    Single,
    PerLabel,
}

/// Field policy row as written in TOML
///
/// Every attribute except `name` is optional so that override rows may name
/// only what they change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldRowSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ValueKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destinations: Option<Vec<Destination>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatter: Option<Formatter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<Cardinality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authoritative: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub companion: Option<bool>,
}

impl FieldRowSpec {
    /// Apply the attributes `over` sets on top of this row
    fn overlay(mut self, over: &FieldRowSpec) -> FieldRowSpec {
        if over.kind.is_some() {
            self.kind = over.kind;
        }
        if over.destinations.is_some() {
            self.destinations = over.destinations.clone();
        }
        if over.threshold.is_some() {
            self.threshold = over.threshold;
        }
        if over.formatter.is_some() {
            self.formatter = over.formatter;
        }
        if over.cardinality.is_some() {
            self.cardinality = over.cardinality;
        }
        if over.tag_key.is_some() {
            self.tag_key = over.tag_key.clone();
        }
        if over.authoritative.is_some() {
            self.authoritative = over.authoritative;
        }
        if over.exclude_labels.is_some() {
            self.exclude_labels = over.exclude_labels.clone();
        }
        if over.companion.is_some() {
            self.companion = over.companion;
        }
        self
    }
}

#[derive(Debug, Deserialize)]
struct FieldTable {
    #[serde(default)]
    fields: Vec<FieldRowSpec>,
}

/// Validated policy row
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPolicy {
    pub name: String,
    pub kind: ValueKind,
    pub compact_tag: bool,
    pub side_record: bool,
    /// Inclusive confidence threshold for compact tags
    pub threshold: f64,
    /// None only for rows that never write a compact tag
    pub formatter: Option<Formatter>,
    pub cardinality: Cardinality,
    /// Compact key, or per-label prefix
    pub tag_key: String,
    /// Absence may delete a tag this tool wrote earlier
    pub authoritative: bool,
    /// Lowercased labels never written as compact tags
    pub exclude_labels: Vec<String>,
    /// Written tags get a `<key>_confidence` companion (default on)
    pub companion: bool,
}

impl FieldPolicy {
    fn from_spec(
        spec: FieldRowSpec,
        default_threshold: f64,
        constraints: &TagConstraints,
    ) -> Result<Self, ConfigurationError> {
        let name = spec.name;
        let kind = spec
            .kind
            .ok_or_else(|| ConfigurationError::MissingKind(name.clone()))?;

        let destinations: HashSet<Destination> =
            spec.destinations.unwrap_or_default().into_iter().collect();
        if destinations.is_empty() {
            return Err(ConfigurationError::NoDestinations(name));
        }
        let compact_tag = destinations.contains(&Destination::CompactTag);
        let side_record = destinations.contains(&Destination::SideRecord);

        let threshold = spec.threshold.unwrap_or(default_threshold);
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigurationError::InvalidThreshold {
                field: name,
                value: threshold,
            });
        }

        let cardinality = spec.cardinality.unwrap_or_default();
        if cardinality == Cardinality::PerLabel && kind != ValueKind::Scores {
            return Err(ConfigurationError::PerLabelRequiresScores {
                field: name,
                kind: kind.to_string(),
            });
        }

        let formatter = match spec.formatter {
            Some(f) => Some(f),
            None if cardinality == Cardinality::Single
                && matches!(kind, ValueKind::Scalar | ValueKind::Label) =>
            {
                Some(Formatter::Identity)
            }
            None if compact_tag => {
                return Err(ConfigurationError::MissingFormatter {
                    field: name,
                    kind: kind.to_string(),
                })
            }
            None => None,
        };

        if let Some(Formatter::TopK { k: 0 }) = formatter {
            return Err(ConfigurationError::InvalidParameter {
                name: format!("fields.{}.formatter.k", name),
                message: "must be positive".to_string(),
            });
        }

        if let Some(f) = formatter {
            let compatible = match cardinality {
                Cardinality::Single => f.supports_single(kind),
                Cardinality::PerLabel => f.supports_per_label(),
            };
            if !compatible {
                return Err(ConfigurationError::FormatterKindMismatch {
                    field: name,
                    formatter: f.to_string(),
                    kind: kind.to_string(),
                });
            }
        }

        let tag_key = spec.tag_key.unwrap_or_else(|| name.replace('.', "_"));
        if compact_tag && !constraints.key_ok(&tag_key) {
            return Err(ConfigurationError::InvalidTagKey {
                field: name,
                key: tag_key,
            });
        }

        Ok(FieldPolicy {
            name,
            kind,
            compact_tag,
            side_record,
            threshold,
            formatter,
            cardinality,
            tag_key,
            authoritative: spec.authoritative.unwrap_or(false),
            exclude_labels: spec
                .exclude_labels
                .unwrap_or_default()
                .iter()
                .map(|l| l.trim().to_lowercase())
                .collect(),
            companion: spec.companion.unwrap_or(true),
        })
    }

    /// True if a written tag of this row is paired with a confidence companion
    pub fn has_companion(&self) -> bool {
        self.companion && !self.formatter.map_or(false, |f| f.writes_confidence())
    }

    /// True if `label` is on the exclusion list (case-insensitive)
    pub fn excludes(&self, label: &str) -> bool {
        let needle = label.trim().to_lowercase();
        self.exclude_labels.iter().any(|l| *l == needle)
    }
}

/// Ordered, validated set of field policies
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    rows: Vec<FieldPolicy>,
    index: HashMap<String, usize>,
}

impl PolicyRegistry {
    /// Embedded defaults with the given overrides applied
    pub fn load(
        overrides: &[FieldRowSpec],
        default_threshold: f64,
        constraints: &TagConstraints,
    ) -> Result<Self, ConfigurationError> {
        let table: FieldTable = toml::from_str(DEFAULT_FIELDS)
            .map_err(|e| ConfigurationError::DefaultTable(e.to_string()))?;
        Self::from_rows(table.fields, overrides, default_threshold, constraints)
    }

    /// Embedded defaults only
    pub fn with_defaults() -> Result<Self, ConfigurationError> {
        Self::load(&[], DEFAULT_THRESHOLD, &TagConstraints::default())
    }

    /// Build from explicit base rows plus overrides
    pub fn from_rows(
        base: Vec<FieldRowSpec>,
        overrides: &[FieldRowSpec],
        default_threshold: f64,
        constraints: &TagConstraints,
    ) -> Result<Self, ConfigurationError> {
        if !default_threshold.is_finite() || !(0.0..=1.0).contains(&default_threshold) {
            return Err(ConfigurationError::InvalidThreshold {
                field: "engine.default_threshold".to_string(),
                value: default_threshold,
            });
        }

        let mut specs: Vec<FieldRowSpec> = Vec::with_capacity(base.len() + overrides.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        for row in base {
            if positions.insert(row.name.clone(), specs.len()).is_some() {
                return Err(ConfigurationError::DuplicateField(row.name));
            }
            specs.push(row);
        }

        let mut overridden: HashSet<&str> = HashSet::new();
        for row in overrides {
            if !overridden.insert(row.name.as_str()) {
                return Err(ConfigurationError::DuplicateField(row.name.clone()));
            }
            match positions.get(&row.name) {
                Some(&pos) => {
                    debug!(field = %row.name, "Field policy overridden");
                    let base_row = std::mem::take(&mut specs[pos]);
                    specs[pos] = base_row.overlay(row);
                }
                None => {
                    debug!(field = %row.name, "Field policy appended");
                    positions.insert(row.name.clone(), specs.len());
                    specs.push(row.clone());
                }
            }
        }

        let mut rows = Vec::with_capacity(specs.len());
        let mut index = HashMap::with_capacity(specs.len());
        for spec in specs {
            let policy = FieldPolicy::from_spec(spec, default_threshold, constraints)?;
            index.insert(policy.name.clone(), rows.len());
            rows.push(policy);
        }
        check_tag_keys(&rows)?;

        debug!(rows = rows.len(), "Field policy registry loaded");
        Ok(Self { rows, index })
    }

    pub fn get(&self, name: &str) -> Option<&FieldPolicy> {
        self.index.get(name).map(|&i| &self.rows[i])
    }

    /// Rows in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &FieldPolicy> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Write threshold used by rows that do not set one
pub const DEFAULT_THRESHOLD: f64 = 0.6;

/// Reject rows whose compact keys can coincide
///
/// Single rows claim their key and, with a companion, `<key>_confidence`.
/// Per-label rows claim their bare prefix and every key under `<prefix>_`.
fn check_tag_keys(rows: &[FieldPolicy]) -> Result<(), ConfigurationError> {
    let collision = |field: &str, other: &str, key: &str| ConfigurationError::TagKeyCollision {
        field: field.to_string(),
        other: other.to_string(),
        key: key.to_string(),
    };

    let mut exact: BTreeMap<String, &str> = BTreeMap::new();
    let mut prefixes: Vec<(String, &str)> = Vec::new();
    for row in rows.iter().filter(|r| r.compact_tag) {
        let mut keys = vec![row.tag_key.clone()];
        match row.cardinality {
            Cardinality::Single if row.has_companion() => keys.push(companion_key(&row.tag_key)),
            Cardinality::Single => {}
            Cardinality::PerLabel => prefixes.push((format!("{}_", row.tag_key), row.name.as_str())),
        }
        for key in keys {
            if let Some(other) = exact.insert(key.clone(), row.name.as_str()) {
                return Err(collision(&row.name, other, &key));
            }
        }
    }

    for (i, (prefix, name)) in prefixes.iter().enumerate() {
        if let Some((key, other)) = exact
            .iter()
            .find(|(key, other)| key.starts_with(prefix.as_str()) && **other != *name)
        {
            return Err(collision(name, other, key));
        }
        for (other_prefix, other) in &prefixes[i + 1..] {
            if prefix.starts_with(other_prefix.as_str()) || other_prefix.starts_with(prefix.as_str()) {
                let shorter = if prefix.len() <= other_prefix.len() { prefix } else { other_prefix };
                return Err(collision(name, other, &format!("{}*", shorter)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str) -> FieldRowSpec {
        FieldRowSpec {
            name: name.to_string(),
            kind: Some(ValueKind::Scalar),
            destinations: Some(vec![Destination::CompactTag, Destination::SideRecord]),
            ..Default::default()
        }
    }

    fn build(rows: Vec<FieldRowSpec>) -> Result<PolicyRegistry, ConfigurationError> {
        PolicyRegistry::from_rows(rows, &[], DEFAULT_THRESHOLD, &TagConstraints::default())
    }

    #[test]
    fn test_default_table_loads() {
        let registry = PolicyRegistry::with_defaults().unwrap();
        let bpm = registry.get("rhythm.bpm").unwrap();
        assert_eq!(bpm.tag_key, "bpm");
        assert_eq!(bpm.threshold, DEFAULT_THRESHOLD);
        assert_eq!(bpm.formatter, Some(Formatter::Integer));

        let timing = registry.get("rhythm.timing").unwrap();
        assert!(timing.authoritative);
        assert_eq!(timing.formatter, Some(Formatter::Identity));

        let mood = registry.get("mood").unwrap();
        assert_eq!(mood.cardinality, Cardinality::PerLabel);
        assert_eq!(mood.tag_key, "mood");
        assert_eq!(mood.threshold, 0.5);

        let beats = registry.get("rhythm.beats").unwrap();
        assert!(!beats.compact_tag);
        assert!(beats.formatter.is_none());

        assert!(registry.get("genre.top").unwrap().excludes("Vocal Music"));
    }

    #[test]
    fn test_declaration_order_preserved() {
        let registry = PolicyRegistry::with_defaults().unwrap();
        let names: Vec<&str> = registry.iter().map(|p| p.name.as_str()).take(2).collect();
        assert_eq!(names, vec!["rhythm.bpm", "rhythm.timing"]);
    }

    #[test]
    fn test_override_replaces_only_named_attributes() {
        let overrides = vec![FieldRowSpec {
            name: "rhythm.bpm".to_string(),
            threshold: Some(0.8),
            ..Default::default()
        }];
        let registry =
            PolicyRegistry::load(&overrides, DEFAULT_THRESHOLD, &TagConstraints::default()).unwrap();
        let bpm = registry.get("rhythm.bpm").unwrap();
        assert_eq!(bpm.threshold, 0.8);
        assert_eq!(bpm.tag_key, "bpm");
        assert_eq!(bpm.formatter, Some(Formatter::Integer));
    }

    #[test]
    fn test_override_appends_new_row() {
        let overrides = vec![row("danceability")];
        let registry =
            PolicyRegistry::load(&overrides, DEFAULT_THRESHOLD, &TagConstraints::default()).unwrap();
        let last = registry.iter().last().unwrap();
        assert_eq!(last.name, "danceability");
        assert_eq!(last.tag_key, "danceability");
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut bad = row("x");
        bad.threshold = Some(1.2);
        assert!(matches!(
            build(vec![bad]),
            Err(ConfigurationError::InvalidThreshold { .. })
        ));

        let mut nan = row("y");
        nan.threshold = Some(f64::NAN);
        assert!(matches!(
            build(vec![nan]),
            Err(ConfigurationError::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn test_no_destinations_rejected() {
        let mut bad = row("x");
        bad.destinations = Some(vec![]);
        assert!(matches!(
            build(vec![bad]),
            Err(ConfigurationError::NoDestinations(_))
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        assert!(matches!(
            build(vec![row("x"), row("x")]),
            Err(ConfigurationError::DuplicateField(_))
        ));
    }

    #[test]
    fn test_non_scalar_compact_row_needs_formatter() {
        let mut seq = row("rhythm.beats");
        seq.kind = Some(ValueKind::Sequence);
        assert!(matches!(
            build(vec![seq.clone()]),
            Err(ConfigurationError::MissingFormatter { .. })
        ));

        // Side-record only rows never format
        seq.destinations = Some(vec![Destination::SideRecord]);
        assert!(build(vec![seq]).is_ok());
    }

    #[test]
    fn test_per_label_requires_scores() {
        let mut bad = row("x");
        bad.cardinality = Some(Cardinality::PerLabel);
        bad.formatter = Some(Formatter::Presence);
        assert!(matches!(
            build(vec![bad]),
            Err(ConfigurationError::PerLabelRequiresScores { .. })
        ));
    }

    #[test]
    fn test_formatter_kind_mismatch_rejected() {
        let mut bad = row("x");
        bad.kind = Some(ValueKind::Label);
        bad.formatter = Some(Formatter::Decimal { places: 2 });
        assert!(matches!(
            build(vec![bad]),
            Err(ConfigurationError::FormatterKindMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_tag_key_rejected() {
        let mut bad = row("x");
        bad.tag_key = Some("genre top".to_string());
        assert!(matches!(
            build(vec![bad]),
            Err(ConfigurationError::InvalidTagKey { .. })
        ));
    }

    #[test]
    fn test_colliding_tag_keys_rejected() {
        let mut a = row("a");
        a.tag_key = Some("tempo".to_string());
        let mut b = row("b");
        b.tag_key = Some("tempo".to_string());
        assert!(matches!(
            build(vec![a.clone(), b]),
            Err(ConfigurationError::TagKeyCollision { .. })
        ));

        // Key taken by another row's confidence companion
        let mut c = row("c");
        c.tag_key = Some("tempo_confidence".to_string());
        assert!(matches!(
            build(vec![a.clone(), c.clone()]),
            Err(ConfigurationError::TagKeyCollision { .. })
        ));
        // Fine once the first row writes no companion
        a.companion = Some(false);
        assert!(build(vec![a, c]).is_ok());
    }

    #[test]
    fn test_per_label_prefix_collisions_rejected() {
        let per_label = |name: &str, prefix: &str| FieldRowSpec {
            name: name.to_string(),
            kind: Some(ValueKind::Scores),
            destinations: Some(vec![Destination::CompactTag]),
            cardinality: Some(Cardinality::PerLabel),
            formatter: Some(Formatter::Presence),
            tag_key: Some(prefix.to_string()),
            ..Default::default()
        };

        let mut single = row("x");
        single.tag_key = Some("mood_happy".to_string());
        assert!(matches!(
            build(vec![per_label("mood", "mood"), single]),
            Err(ConfigurationError::TagKeyCollision { .. })
        ));

        assert!(matches!(
            build(vec![per_label("mood", "mood"), per_label("mood.vocal", "mood_vocal")]),
            Err(ConfigurationError::TagKeyCollision { .. })
        ));

        assert!(build(vec![per_label("mood", "mood"), per_label("moods", "moods")]).is_ok());
    }

    #[test]
    fn test_companion_flag() {
        let registry = PolicyRegistry::with_defaults().unwrap();
        assert!(registry.get("rhythm.bpm").unwrap().has_companion());
        assert!(!registry.get("rhythm.timing_reason").unwrap().has_companion());
        // score formatter carries the confidence itself
        assert!(!registry.get("mood").unwrap().has_companion());
    }

    #[test]
    fn test_top_k_needs_positive_k() {
        let mut bad = row("genre.top_k");
        bad.kind = Some(ValueKind::Scores);
        bad.formatter = Some(Formatter::TopK { k: 0 });
        assert!(matches!(
            build(vec![bad]),
            Err(ConfigurationError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_default_threshold_applies() {
        let registry = PolicyRegistry::from_rows(
            vec![row("x")],
            &[],
            0.75,
            &TagConstraints::default(),
        )
        .unwrap();
        assert_eq!(registry.get("x").unwrap().threshold, 0.75);
    }
}
