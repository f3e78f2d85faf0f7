//! Merge of a write plan against persisted state
//!
//! [`merge`] is pure: it takes the plan and the current tag set and
//! side-record and returns the merged state, the diff and any warnings. The
//! coordinator writes the merged state only when the diff is non-empty.
//!
//! Compact tags:
//! - a concrete plan value overwrites the existing tag
//! - an absence deletes a tag only when the entry is authoritative and the
//!   side-record shows this tool wrote the tag with its current value
//! - a blocked authoritative deletion is a merge conflict (warning, no-op)
//!
//! Side-record: one block per producer. A block present in the plan fully
//! replaces the stored block of that producer; other blocks and unknown
//! top-level fields are kept verbatim. The diff lists each changed, added or
//! removed field of a replaced block, plus one block-level entry when the
//! stored block carried keys besides `fields` that the replacement drops.
//!
//! The engine block tracks which tags this tool owns. It carries no
//! timestamps so that re-applying a plan is a no-op.

use crate::engine::{PlanTarget, PlanValue, Reason, SideRecordEntry, WritePlan};
use crate::ENGINE_PRODUCER;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Side-record document version
pub const SCHEMA_VERSION: u32 = 1;

/// Compact tag set, key => text
pub type TagSet = BTreeMap<String, String>;

/// Bookkeeping kept by this tool in the side-record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineBlock {
    pub producer: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_sha256: Option<String>,
    /// Tags this tool wrote, with the value it wrote
    #[serde(default)]
    pub written_tags: BTreeMap<String, String>,
}

/// Fields of one producer, as stored in the side-record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerBlock {
    pub fields: BTreeMap<String, SideRecordEntry>,
}

/// Full-fidelity side-record document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineBlock>,
    /// Producer name => block; foreign blocks are kept as opaque JSON
    #[serde(default)]
    pub producers: BTreeMap<String, serde_json::Value>,
    /// Top-level fields this version does not know
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for SideRecord {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            engine: None,
            producers: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl SideRecord {
    /// Tags this tool owns according to the engine block
    pub fn owned_tags(&self) -> BTreeMap<String, String> {
        self.engine
            .as_ref()
            .map(|e| e.written_tags.clone())
            .unwrap_or_default()
    }
}

/// Tag set plus side-record of one audio item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub tags: TagSet,
    pub side_record: SideRecord,
}

/// What a diff entry changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "store", rename_all = "snake_case")]
pub enum DiffTarget {
    Tag { key: String },
    /// One field inside a producer block
    SideRecordField { producer: String, field: String },
    /// Block-level data outside `fields`
    ProducerBlock { producer: String },
    EngineBlock,
}

/// One change between existing and merged state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub target: DiffTarget,
    pub old: Option<serde_json::Value>,
    pub new: Option<serde_json::Value>,
    pub reason: Reason,
}

impl DiffEntry {
    pub fn touches_tags(&self) -> bool {
        matches!(self.target, DiffTarget::Tag { .. })
    }
}

/// Authoritative deletion blocked because the tag is not owned by this tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub key: String,
    pub existing: String,
    pub reason: Reason,
}

/// Merged state with the changes that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub state: PersistedState,
    pub diff: Vec<DiffEntry>,
    pub warnings: Vec<MergeConflict>,
}

impl MergeOutcome {
    /// Nothing to write
    pub fn is_noop(&self) -> bool {
        self.diff.is_empty()
    }

    pub fn tags_changed(&self) -> bool {
        self.diff.iter().any(DiffEntry::touches_tags)
    }

    pub fn side_record_changed(&self) -> bool {
        self.diff.iter().any(|d| !d.touches_tags())
    }
}

/// Merge a plan into existing state
pub fn merge(plan: &WritePlan, existing: &PersistedState) -> MergeOutcome {
    let mut tags = existing.tags.clone();
    let mut side_record = existing.side_record.clone();
    let mut diff = Vec::new();
    let mut warnings = Vec::new();

    if plan.entries.is_empty() {
        return MergeOutcome {
            state: existing.clone(),
            diff,
            warnings,
        };
    }

    // Ownership only holds while the tag still has the value this tool wrote
    let mut owned = side_record.owned_tags();
    owned.retain(|key, value| existing.tags.get(key) == Some(value));

    for entry in plan.tag_entries() {
        let Some(key) = entry.tag_key() else {
            continue;
        };
        match &entry.value {
            PlanValue::Text(text) => {
                let old = tags.get(key).cloned();
                if old.as_deref() != Some(text.as_str()) {
                    diff.push(DiffEntry {
                        target: DiffTarget::Tag {
                            key: key.to_string(),
                        },
                        old: old.map(serde_json::Value::String),
                        new: Some(serde_json::Value::String(text.clone())),
                        reason: entry.reason,
                    });
                    tags.insert(key.to_string(), text.clone());
                }
                owned.insert(key.to_string(), text.clone());
            }
            PlanValue::Absent => {
                let Some(current) = tags.get(key).cloned() else {
                    continue;
                };
                let owned_same = owned.get(key) == Some(&current);
                if entry.authoritative && owned_same {
                    diff.push(DiffEntry {
                        target: DiffTarget::Tag {
                            key: key.to_string(),
                        },
                        old: Some(serde_json::Value::String(current)),
                        new: None,
                        reason: entry.reason,
                    });
                    tags.remove(key);
                    owned.remove(key);
                } else if entry.authoritative {
                    warn!(
                        key = %key,
                        existing = %current,
                        reason = %entry.reason,
                        "Merge conflict: tag not written by this tool, kept"
                    );
                    warnings.push(MergeConflict {
                        key: key.to_string(),
                        existing: current,
                        reason: entry.reason,
                    });
                } else {
                    debug!(key = %key, reason = %entry.reason, "Absence kept existing tag");
                }
            }
            PlanValue::Entry(_) => {}
        }
    }

    // Side-record: group plan entries into producer blocks
    let mut blocks: BTreeMap<&str, ProducerBlock> = BTreeMap::new();
    for entry in plan.side_record_entries() {
        if let (PlanTarget::SideRecord { producer, field }, PlanValue::Entry(value)) =
            (&entry.target, &entry.value)
        {
            blocks
                .entry(producer.as_str())
                .or_insert_with(|| ProducerBlock {
                    fields: BTreeMap::new(),
                })
                .fields
                .insert(field.clone(), value.clone());
        }
    }

    side_record.schema_version = SCHEMA_VERSION;
    for (producer, block) in blocks {
        let Some(new_value) = canonical_json(&block) else {
            warn!(producer = %producer, "Producer block could not be encoded, skipped");
            continue;
        };
        let old = side_record.producers.get(producer);
        if old != Some(&new_value) {
            diff.extend(block_diff(producer, old, &new_value));
            side_record.producers.insert(producer.to_string(), new_value);
        }
    }

    let engine = EngineBlock {
        producer: ENGINE_PRODUCER.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        source_sha256: plan
            .source
            .sha256
            .clone()
            .or_else(|| side_record.engine.as_ref().and_then(|e| e.source_sha256.clone())),
        written_tags: owned,
    };
    if side_record.engine.as_ref() != Some(&engine) {
        diff.push(DiffEntry {
            target: DiffTarget::EngineBlock,
            old: side_record.engine.as_ref().and_then(canonical_json),
            new: canonical_json(&engine),
            reason: Reason::Ownership,
        });
        side_record.engine = Some(engine);
    }

    debug!(
        changes = diff.len(),
        conflicts = warnings.len(),
        "Merge computed"
    );

    MergeOutcome {
        state: PersistedState { tags, side_record },
        diff,
        warnings,
    }
}

/// Field-level changes between a stored producer block and its replacement
fn block_diff(producer: &str, old: Option<&Value>, new: &Value) -> Vec<DiffEntry> {
    let no_fields = serde_json::Map::new();
    let old_fields = fields_of(old).unwrap_or(&no_fields);
    let new_fields = fields_of(Some(new)).unwrap_or(&no_fields);

    let names: BTreeSet<&String> = old_fields.keys().chain(new_fields.keys()).collect();
    let mut diff: Vec<DiffEntry> = names
        .into_iter()
        .filter_map(|name| {
            let (before, after) = (old_fields.get(name), new_fields.get(name));
            (before != after).then(|| DiffEntry {
                target: DiffTarget::SideRecordField {
                    producer: producer.to_string(),
                    field: name.clone(),
                },
                old: before.cloned(),
                new: after.cloned(),
                reason: Reason::FullFidelity,
            })
        })
        .collect();

    let dropped = match old {
        Some(Value::Object(block)) => {
            let rest: serde_json::Map<String, Value> = block
                .iter()
                .filter(|(key, _)| key.as_str() != "fields")
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            (!rest.is_empty()).then(|| Value::Object(rest))
        }
        Some(other) => Some(other.clone()),
        None => None,
    };
    if let Some(dropped) = dropped {
        diff.push(DiffEntry {
            target: DiffTarget::ProducerBlock {
                producer: producer.to_string(),
            },
            old: Some(dropped),
            new: None,
            reason: Reason::FullFidelity,
        });
    }
    diff
}

fn fields_of(block: Option<&Value>) -> Option<&serde_json::Map<String, Value>> {
    block?.get("fields")?.as_object()
}

/// JSON value in the form it takes after a write and read back
///
/// Floats are compared after the same text round trip the side-record file
/// goes through, so an unchanged block compares equal to its stored copy.
fn canonical_json<T: Serialize>(value: &T) -> Option<serde_json::Value> {
    let text = serde_json::to_string(value).ok()?;
    serde_json::from_str(&text).ok()
}
