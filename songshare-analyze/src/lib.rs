//! songshare-analyze library interface
//!
//! Aggregates per-track analysis results, derives higher-level descriptors
//! and decides which values reach the audio file's compact tags and which
//! stay in the full-fidelity side-record.
//!
//! Pipeline per audio item:
//! 1. [`report`] / [`model::AnalysisBundle::load`]: analysis input => bundle
//! 2. [`classifiers::derive`]: rhythm timing, chord simplification, tuning, vocal pitch
//! 3. [`engine::decide`]: bundle + [`policy::PolicyRegistry`] => [`engine::WritePlan`]
//! 4. [`persistence::Coordinator`]: merge with existing state, atomic write
//!
//! [`batch::BatchRunner`] runs the pipeline over many items.

pub mod batch;
pub mod classifiers;
pub mod config;
pub mod constraints;
pub mod engine;
pub mod error;
pub mod merge;
pub mod model;
pub mod persistence;
pub mod policy;
pub mod report;
pub mod scanner;

pub use crate::config::EngineConfig;
pub use crate::engine::{decide, WritePlan};
pub use crate::error::{ConfigurationError, PersistenceError, ReportError};
pub use crate::merge::{merge, MergeOutcome};
pub use crate::model::{AnalysisBundle, AnalysisField, FieldValue, Provenance};
pub use crate::policy::PolicyRegistry;

/// Producer name recorded for derived fields and the side-record engine block
pub const ENGINE_PRODUCER: &str = "songshare-analyze";
