//! # segloop common library
//!
//! Shared code for the segloop server and its tooling:
//! - Error and result types
//! - Root folder resolution and TOML bootstrap configuration
//! - Dataset descriptors (label tables, channel counts, case naming)
//! - Database initialisation and row models
//! - Time helpers

pub mod config;
pub mod dataset;
pub mod db;
pub mod error;
pub mod time;

pub use dataset::{CaseNaming, DatasetDescriptor, DatasetRegistry};
pub use error::{Error, Result};
