//! # songshare common library
//!
//! Shared code for the songshare tools:
//! - Error and result types
//! - Configuration file resolution and TOML loading
//! - Content checksums used to key analysis results to audio files

pub mod checksum;
pub mod config;
pub mod error;

pub use error::{Error, Result};
