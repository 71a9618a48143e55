//! # MPT Engine - Fixity Library
//!
//! A headless engine for checking the integrity of preserved files.
//! Designed as the foundation for the `mpt` command line tool and for automation.
//!
//! ## Overview
//!
//! The engine records checksums for files and later proves the files have not changed.
//! It features:
//! - Checksum trees (one sidecar per file) and flat manifests
//! - Validation of files against either kind of record
//! - Comparison of records held by independent copies
//! - Transactional staging of new files into several destinations at once
//! - A worker pool that stops after too many consecutive failures
//! - Result reporting via a sink trait (decoupled from output format)
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{create_checksums, validate_tree, CollectingSink, RunOptions};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = RunOptions {
//!     recursive: true,
//!     ..RunOptions::default()
//! };
//!
//! // Record checksums for every file in the collection
//! let mut sink = CollectingSink::new();
//! create_checksums(Path::new("/data"), Path::new("/checksums"), None, &options, &mut sink)?;
//!
//! // Later: prove nothing has changed
//! let mut sink = CollectingSink::new();
//! let summary = validate_tree(Path::new("/data"), Path::new("/checksums"), &options, &mut sink)?;
//! println!("{}", summary);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **checksums**: Algorithm registry and streaming digests
//! - **tree** / **manifest**: The two checksum record formats
//! - **validate** / **compare**: Checking files and records
//! - **staging**: All-or-nothing copies into multiple destinations
//! - **pool**: Worker pool and failure threshold
//! - **job**: Run orchestration (one entry point per action)
//! - **report**: Result sink trait

pub mod checksums;
pub mod compare;
pub mod config;
pub mod error;
pub mod fs_ops;
pub mod job;
pub mod manifest;
pub mod model;
pub mod pool;
pub mod report;
pub mod staging;
pub mod tree;
pub mod validate;

// Re-export main types and functions
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use compare::{ChecksumSource, ComparisonRecord, PeerStatus};
pub use config::{RunOptions, StagingPlan};
pub use error::EngineError;
pub use job::{
    compare_manifests, compare_trees, create_checksums, stage_files, validate_manifest,
    validate_tree,
};
pub use manifest::Manifest;
pub use model::{Action, CategoryTotals, CreationStatus, FileRecord, ResultRecord, RunState, RunSummary};
pub use pool::ThresholdBoundary;
pub use report::{CollectingSink, ReportSink};
pub use staging::{DestinationStatus, FailureKind, StagingOutcome};
pub use tree::ChecksumTree;
pub use validate::ValidationStatus;
