//! Validation of files against recorded checksums.

use crate::checksums::{compute_file_checksum, digests_match};
use crate::error::EngineError;
use crate::model::{FileRecord, ResultRecord};
use std::fmt;
use std::path::Path;

/// Outcome of validating one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationStatus {
    Matched,
    Mismatched { expected: String, actual: String },
    /// A record exists but the data file does not
    SourceMissing,
    /// The data file or its record could not be read
    Unreadable(String),
    /// The data file exists but nothing records a checksum for it
    Unrecorded,
}

impl ValidationStatus {
    pub fn category(&self) -> &'static str {
        match self {
            ValidationStatus::Matched => "valid",
            ValidationStatus::Mismatched { .. } => "invalid",
            ValidationStatus::SourceMissing => "missing",
            ValidationStatus::Unreadable(_) => "oserror",
            ValidationStatus::Unrecorded => "unrecorded",
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStatus::Matched => f.write_str("checksum matches"),
            ValidationStatus::Mismatched { expected, actual } => {
                write!(f, "expected {}, found {}", expected, actual)
            }
            ValidationStatus::SourceMissing => f.write_str("file missing"),
            ValidationStatus::Unreadable(reason) => f.write_str(reason),
            ValidationStatus::Unrecorded => f.write_str("no checksum recorded"),
        }
    }
}

/// Recompute the checksum of `file_path` and compare it with `expected`.
///
/// Comparison is case-insensitive. Neither the file nor the record is modified.
pub fn validate(file_path: &Path, expected: &FileRecord, blocksize: usize) -> ValidationStatus {
    check(file_path, expected, blocksize).0
}

fn check(file_path: &Path, expected: &FileRecord, blocksize: usize) -> (ValidationStatus, Option<u64>) {
    match compute_file_checksum(file_path, expected.algorithm, blocksize) {
        Ok(actual) if digests_match(actual.hex(), &expected.checksum) => {
            (ValidationStatus::Matched, Some(actual.size()))
        }
        Ok(actual) => (
            ValidationStatus::Mismatched {
                expected: expected.checksum.clone(),
                actual: actual.hex().to_string(),
            },
            Some(actual.size()),
        ),
        Err(EngineError::SourceNotFound { .. }) => (ValidationStatus::SourceMissing, None),
        Err(e) => (ValidationStatus::Unreadable(e.detailed()), None),
    }
}

/// Validate the data file for `expected` beneath `data_root` as a result record.
pub fn validate_file(data_root: &Path, expected: &FileRecord, blocksize: usize) -> ResultRecord {
    let path = data_root.join(&expected.relative_path);
    let (status, size) = check(&path, expected, blocksize);
    ResultRecord::Validation {
        relative_path: expected.relative_path.clone(),
        status,
        size,
    }
}
