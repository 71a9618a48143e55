//! Error types for the preservation engine.
//!
//! The primary error type is `EngineError`. Run-level errors (bad configuration,
//! unknown algorithm, missing input directories) are returned from the run entry
//! points before any file is touched. File-level errors are folded into the
//! per-file result records instead of aborting the run.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by engine operations.
///
/// Per-file variants (`ReadError`, `WriteError`, ...) are produced by the low-level
/// helpers and then captured by the workers as result records. The configuration
/// variants are fatal and stop a run before it starts.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Input directory or file does not exist
    #[error("Source not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Failed to read from a file
    #[error("Failed to read file: {}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write to a file
    #[error("Failed to write file: {}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to remove a file written earlier
    #[error("Failed to remove file: {}", path.display())]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Path is unusable for the requested operation
    #[error("Invalid path: {} ({reason})", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// Failed to enumerate a directory
    #[error("Failed to enumerate directory: {}", path.display())]
    EnumerationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to create a directory
    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Requested checksum algorithm is not in the registry
    #[error("Unsupported checksum algorithm '{name}'")]
    UnsupportedAlgorithm { name: String },

    /// Run options or the staging plan are inconsistent
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// A sidecar or manifest line could not be parsed
    #[error("Malformed checksum record in {}: {reason}", path.display())]
    MalformedRecord { path: PathBuf, reason: String },

    /// The single writer owning a manifest has shut down
    #[error("Manifest writer for {} is no longer running", path.display())]
    ManifestWriterGone { path: PathBuf },
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<u32> {
        match self {
            Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::RemoveFailed { source, .. }
            | Self::EnumerationFailed { source, .. }
            | Self::DirectoryCreationFailed { source, .. } => {
                source.raw_os_error().map(|e| e as u32)
            }
            _ => None,
        }
    }

    /// True for errors that must stop a run before any file is processed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::UnsupportedAlgorithm { .. }
                | Self::SourceNotFound { .. }
                | Self::InvalidPath { .. }
        )
    }

    /// Error message including the underlying cause, suitable for reports.
    pub fn detailed(&self) -> String {
        match std::error::Error::source(self) {
            Some(cause) => format!("{}: {}", self, cause),
            None => self.to_string(),
        }
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }
}
