//! Tag decision engine
//!
//! [`decide`] turns an analysis bundle into a [`WritePlan`]: for each field it
//! decides whether a compact tag may be written, how it is formatted, and what
//! goes to the side-record. The function is pure; equal bundles produce
//! byte-identical plans regardless of insertion order.
//!
//! Visiting order is registry declaration order, then fields without a policy
//! row in name order. Within a per_label field, labels are visited in name
//! order. Every compact destination that is not written gets an explicit
//! absence entry so the merge step can tell "decided not to write" from
//! "never considered".
//!
//! A compact key belongs to the first entry that claims it. Later labels (or
//! their companions) normalizing to a claimed key are left out of `entries`
//! and listed in [`WritePlan::suppressed`] instead.

use crate::constraints::{key_fragment, TagConstraints};
use crate::model::{AnalysisBundle, AnalysisField, BundleSource, FieldValue};
use crate::policy::{Cardinality, FieldPolicy, PolicyRegistry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

/// Suffix of the confidence companion key
pub const CONFIDENCE_SUFFIX: &str = "_confidence";

/// Decimal places of companion confidence values
const COMPANION_PLACES: usize = 3;

/// Why an entry is in the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// Confidence cleared the threshold
    Written,
    /// Side-record copy of the full value
    FullFidelity,
    /// Confidence below the threshold
    BelowThreshold,
    /// Malformed value or confidence
    InvalidValue,
    /// Formatted key or value breaks the tag constraints
    FormatViolation,
    /// Label on the row's exclusion list
    ExcludedLabel,
    /// No policy row; side-record only
    UnknownField,
    /// Companion carrying the gating confidence of a written tag
    ConfidenceCompanion,
    /// Ownership bookkeeping kept by the merge step
    Ownership,
    /// Compact key already claimed by an earlier entry
    KeyCollision,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::Written => "written",
            Reason::FullFidelity => "full_fidelity",
            Reason::BelowThreshold => "below_threshold",
            Reason::InvalidValue => "invalid_value",
            Reason::FormatViolation => "format_violation",
            Reason::ExcludedLabel => "excluded_label",
            Reason::UnknownField => "unknown_field",
            Reason::ConfidenceCompanion => "confidence_companion",
            Reason::Ownership => "ownership",
            Reason::KeyCollision => "key_collision",
        };
        f.write_str(s)
    }
}

/// Destination of one plan entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "store", rename_all = "snake_case")]
pub enum PlanTarget {
    /// Compact tag key
    CompactTag { key: String },
    /// Side-record field inside the producer's block
    SideRecord { producer: String, field: String },
}

/// Side-record copy of a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideRecordEntry {
    pub value: FieldValue,
    pub confidence: f64,
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl From<&AnalysisField> for SideRecordEntry {
    fn from(field: &AnalysisField) -> Self {
        Self {
            value: field.value.clone(),
            confidence: field.confidence,
            version: field.provenance.version.clone(),
            params: field.provenance.params.clone(),
        }
    }
}

/// Planned value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PlanValue {
    /// Compact tag text
    Text(String),
    /// Side-record entry
    Entry(SideRecordEntry),
    /// Explicit decision not to write
    Absent,
}

/// One decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// Field the decision is about
    pub field: String,
    pub target: PlanTarget,
    pub value: PlanValue,
    pub reason: Reason,
    /// Absence may delete a tag this tool wrote earlier
    #[serde(default)]
    pub authoritative: bool,
}

impl PlanEntry {
    pub fn is_absent(&self) -> bool {
        self.value == PlanValue::Absent
    }

    pub fn tag_key(&self) -> Option<&str> {
        match &self.target {
            PlanTarget::CompactTag { key } => Some(key),
            PlanTarget::SideRecord { .. } => None,
        }
    }
}

/// Compact tag left out of the plan because its key was already claimed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressedEntry {
    pub field: String,
    pub key: String,
    pub reason: Reason,
}

/// Ordered decisions for one audio item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WritePlan {
    /// Audio item the plan was computed for
    #[serde(default)]
    pub source: BundleSource,
    pub entries: Vec<PlanEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suppressed: Vec<SuppressedEntry>,
}

impl WritePlan {
    pub fn tag_entries(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.target, PlanTarget::CompactTag { .. }))
    }

    pub fn side_record_entries(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.target, PlanTarget::SideRecord { .. }))
    }

    /// Compact tags with a concrete value, in plan order
    pub fn written_tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|e| match (&e.target, &e.value) {
            (PlanTarget::CompactTag { key }, PlanValue::Text(text)) => {
                Some((key.as_str(), text.as_str()))
            }
            _ => None,
        })
    }
}

/// Compute the write plan for one bundle
pub fn decide(
    bundle: &AnalysisBundle,
    registry: &PolicyRegistry,
    constraints: &TagConstraints,
) -> WritePlan {
    let mut planner = Planner {
        constraints,
        entries: Vec::new(),
        claimed: HashSet::new(),
        suppressed: Vec::new(),
    };

    for policy in registry.iter() {
        if let Some(field) = bundle.get(&policy.name) {
            planner.field(field, policy);
        }
    }

    for field in bundle.fields() {
        if registry.get(&field.name).is_none() {
            planner.unknown(field);
        }
    }

    let plan = WritePlan {
        source: bundle.source.clone(),
        entries: planner.entries,
        suppressed: planner.suppressed,
    };
    debug!(
        entries = plan.entries.len(),
        tags = plan.written_tags().count(),
        suppressed = plan.suppressed.len(),
        "Write plan computed"
    );
    plan
}

struct Planner<'a> {
    constraints: &'a TagConstraints,
    entries: Vec<PlanEntry>,
    /// Compact keys already used by an entry
    claimed: HashSet<String>,
    suppressed: Vec<SuppressedEntry>,
}

impl Planner<'_> {
    fn field(&mut self, field: &AnalysisField, policy: &FieldPolicy) {
        if let Err(e) = field.validate_as(policy.kind) {
            warn!(field = %field.name, error = %e, "Invalid field value");
            self.invalid(field, policy);
            return;
        }

        if policy.compact_tag {
            match policy.cardinality {
                Cardinality::Single => self.single_tag(field, policy),
                Cardinality::PerLabel => self.per_label_tags(field, policy),
            }
        }
        if policy.side_record {
            self.side_record(field, Reason::FullFidelity);
        }
    }

    fn unknown(&mut self, field: &AnalysisField) {
        if let Err(e) = field.validate() {
            warn!(field = %field.name, error = %e, "Invalid value in unregistered field");
            self.push_side_absent(field, Reason::InvalidValue);
            return;
        }
        debug!(field = %field.name, "No policy row, side-record only");
        self.side_record(field, Reason::UnknownField);
    }

    fn invalid(&mut self, field: &AnalysisField, policy: &FieldPolicy) {
        if policy.compact_tag {
            match (policy.cardinality, field.value.as_scores()) {
                (Cardinality::Single, _) => {
                    self.push_absent_pair(field, policy, &policy.tag_key, Reason::InvalidValue)
                }
                (Cardinality::PerLabel, Some(scores)) => {
                    for label in scores.keys() {
                        let key = label_key(&policy.tag_key, label);
                        self.push_absent_pair(field, policy, &key, Reason::InvalidValue);
                    }
                }
                (Cardinality::PerLabel, None) => {
                    // No labels to fan out over; record the decision on the prefix
                    if self.claim(field, &[policy.tag_key.clone()]) {
                        self.entries.push(PlanEntry {
                            field: field.name.clone(),
                            target: PlanTarget::CompactTag {
                                key: policy.tag_key.clone(),
                            },
                            value: PlanValue::Absent,
                            reason: Reason::InvalidValue,
                            authoritative: policy.authoritative,
                        });
                    }
                }
            }
        }
        if policy.side_record {
            self.push_side_absent(field, Reason::InvalidValue);
        }
    }

    fn single_tag(&mut self, field: &AnalysisField, policy: &FieldPolicy) {
        let key = policy.tag_key.as_str();
        if field.confidence < policy.threshold {
            self.push_absent_pair(field, policy, key, Reason::BelowThreshold);
            return;
        }

        let Some(formatter) = policy.formatter else {
            self.push_absent_pair(field, policy, key, Reason::InvalidValue);
            return;
        };
        let Some(text) = formatter.format_single(&field.value, field.confidence) else {
            self.push_absent_pair(field, policy, key, Reason::InvalidValue);
            return;
        };

        if formatter.renders_label(policy.kind) && policy.excludes(&text) {
            debug!(field = %field.name, label = %text, "Label excluded from compact tags");
            self.push_absent_pair(field, policy, key, Reason::ExcludedLabel);
            return;
        }

        self.push_written(field, policy, key, text, field.confidence);
    }

    fn per_label_tags(&mut self, field: &AnalysisField, policy: &FieldPolicy) {
        let Some(scores) = field.value.as_scores() else {
            return;
        };
        let Some(formatter) = policy.formatter else {
            return;
        };

        for (label, &score) in scores {
            let key = label_key(&policy.tag_key, label);
            if policy.excludes(label) {
                self.push_absent_pair(field, policy, &key, Reason::ExcludedLabel);
            } else if score < policy.threshold {
                self.push_absent_pair(field, policy, &key, Reason::BelowThreshold);
            } else {
                match formatter.format_label(score, scores) {
                    Some(text) => self.push_written(field, policy, &key, text, score),
                    None => self.push_absent_pair(field, policy, &key, Reason::InvalidValue),
                }
            }
        }
    }

    fn side_record(&mut self, field: &AnalysisField, reason: Reason) {
        self.entries.push(PlanEntry {
            field: field.name.clone(),
            target: side_target(field),
            value: PlanValue::Entry(SideRecordEntry::from(field)),
            reason,
            authoritative: false,
        });
    }

    fn push_side_absent(&mut self, field: &AnalysisField, reason: Reason) {
        self.entries.push(PlanEntry {
            field: field.name.clone(),
            target: side_target(field),
            value: PlanValue::Absent,
            reason,
            authoritative: false,
        });
    }

    /// Claim `keys` for `field`; false (and a suppression) if any is taken
    fn claim(&mut self, field: &AnalysisField, keys: &[String]) -> bool {
        if let Some(taken) = keys.iter().find(|k| self.claimed.contains(k.as_str())) {
            warn!(field = %field.name, key = %taken, "Tag key already claimed, entry suppressed");
            self.suppressed.push(SuppressedEntry {
                field: field.name.clone(),
                key: keys[0].clone(),
                reason: Reason::KeyCollision,
            });
            return false;
        }
        self.claimed.extend(keys.iter().cloned());
        true
    }

    /// The tag key and, if the row has one, its companion key
    fn keys_for(policy: &FieldPolicy, key: &str) -> Vec<String> {
        if policy.has_companion() {
            vec![key.to_string(), companion_key(key)]
        } else {
            vec![key.to_string()]
        }
    }

    /// Written tag plus its confidence companion
    fn push_written(
        &mut self,
        field: &AnalysisField,
        policy: &FieldPolicy,
        key: &str,
        text: String,
        confidence: f64,
    ) {
        if !self.constraints.key_ok(key) || !self.constraints.value_ok(&text) {
            debug!(field = %field.name, key = %key, "Tag violates constraints, suppressed");
            self.push_absent_pair(field, policy, key, Reason::FormatViolation);
            return;
        }
        if !self.claim(field, &Self::keys_for(policy, key)) {
            return;
        }

        self.entries.push(PlanEntry {
            field: field.name.clone(),
            target: PlanTarget::CompactTag {
                key: key.to_string(),
            },
            value: PlanValue::Text(text),
            reason: Reason::Written,
            authoritative: policy.authoritative,
        });

        if !policy.has_companion() {
            return;
        }
        let companion = companion_key(key);
        let value = if self.constraints.key_ok(&companion) {
            PlanValue::Text(format!("{:.*}", COMPANION_PLACES, confidence))
        } else {
            PlanValue::Absent
        };
        let reason = match value {
            PlanValue::Absent => Reason::FormatViolation,
            _ => Reason::ConfidenceCompanion,
        };
        self.entries.push(PlanEntry {
            field: field.name.clone(),
            target: PlanTarget::CompactTag { key: companion },
            value,
            reason,
            authoritative: true,
        });
    }

    /// Absence for a tag and, if the row has one, its companion
    fn push_absent_pair(&mut self, field: &AnalysisField, policy: &FieldPolicy, key: &str, reason: Reason) {
        if !self.claim(field, &Self::keys_for(policy, key)) {
            return;
        }
        self.entries.push(PlanEntry {
            field: field.name.clone(),
            target: PlanTarget::CompactTag {
                key: key.to_string(),
            },
            value: PlanValue::Absent,
            reason,
            authoritative: policy.authoritative,
        });

        if !policy.has_companion() {
            return;
        }
        self.entries.push(PlanEntry {
            field: field.name.clone(),
            target: PlanTarget::CompactTag {
                key: companion_key(key),
            },
            value: PlanValue::Absent,
            reason,
            authoritative: true,
        });
    }
}

fn side_target(field: &AnalysisField) -> PlanTarget {
    PlanTarget::SideRecord {
        producer: field.provenance.producer.clone(),
        field: field.name.clone(),
    }
}

/// Per-label tag key (`mood` + `Energetic` => `mood_energetic`)
pub fn label_key(prefix: &str, label: &str) -> String {
    format!("{}_{}", prefix, key_fragment(label))
}

/// Confidence companion key for a tag key
pub fn companion_key(key: &str) -> String {
    format!("{}{}", key, CONFIDENCE_SUFFIX)
}
