//! Error types for songshare-analyze
//!
//! Only configuration and persistence failures propagate out of the engine.
//! Malformed field values are local to the plan (see [`crate::model::InvalidFieldValue`])
//! and merge conflicts are warnings (see [`crate::merge::MergeConflict`]).

use std::path::PathBuf;
use thiserror::Error;

/// Fatal configuration problem, raised before any item is processed
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Config file could not be read or parsed
    #[error("Failed to load configuration: {0}")]
    Load(#[from] songshare_common::Error),

    /// Embedded default field table failed to parse
    #[error("Default field table is malformed: {0}")]
    DefaultTable(String),

    /// Threshold not finite or outside [0, 1]
    #[error("Field '{field}': threshold {value} must be within [0, 1]")]
    InvalidThreshold { field: String, value: f64 },

    /// Row has no destinations
    #[error("Field '{0}': at least one destination is required")]
    NoDestinations(String),

    /// Two rows share a name
    #[error("Field '{0}' is declared more than once")]
    DuplicateField(String),

    /// Override introduces a row without a declared kind
    #[error("Field '{0}': kind is required for new rows")]
    MissingKind(String),

    /// Non-scalar row writes a compact tag but names no formatter
    #[error("Field '{field}': kind '{kind}' targets a compact tag and needs a formatter")]
    MissingFormatter { field: String, kind: String },

    /// per_label cardinality on a kind other than scores
    #[error("Field '{field}': per_label cardinality requires kind 'scores', found '{kind}'")]
    PerLabelRequiresScores { field: String, kind: String },

    /// Formatter cannot render this kind
    #[error("Field '{field}': formatter '{formatter}' is not compatible with kind '{kind}'")]
    FormatterKindMismatch {
        field: String,
        formatter: String,
        kind: String,
    },

    /// Tag key fails the tag store's key constraints
    #[error("Field '{field}': tag key '{key}' is not a valid compact tag key")]
    InvalidTagKey { field: String, key: String },

    /// Two rows could write the same compact tag key
    #[error("Fields '{field}' and '{other}' can both write compact tag '{key}'")]
    TagKeyCollision {
        field: String,
        other: String,
        key: String,
    },

    /// Classifier or engine parameter out of range
    #[error("Invalid parameter {name}: {message}")]
    InvalidParameter { name: String, message: String },
}

/// Per-item persistence failure; the batch continues with the next item
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem operation failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Compact tag container could not be read or written
    #[error("Tag store error on {path}: {message}")]
    TagStore { path: PathBuf, message: String },

    /// Side-record document could not be read or written
    #[error("Side-record error on {path}: {message}")]
    SideRecord { path: PathBuf, message: String },

    /// Transaction journal could not be written or replayed
    #[error("Journal error on {path}: {message}")]
    Journal { path: PathBuf, message: String },

    /// Another process holds the item's lock file
    #[error("{path} is locked by another run")]
    Locked { path: PathBuf },

    /// Merged tag set exceeds the tag store capacity
    #[error("Merged tag set holds {count} tags, capacity is {max}")]
    CapacityExceeded { count: usize, max: usize },

    /// Blocking task panicked or was aborted
    #[error("Internal persistence error: {0}")]
    Internal(String),
}

impl PersistenceError {
    /// Wrap an I/O error with the path it concerns
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Extractor report could not be converted into a bundle
#[derive(Debug, Error)]
pub enum ReportError {
    /// Report file unreadable
    #[error("Failed to read report {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Report is not valid JSON
    #[error("Report is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Report top level is not an object
    #[error("Report must be a JSON object")]
    NotAnObject,
}
