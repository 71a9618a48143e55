//! Run configuration and defaults.

use crate::checksums::ChecksumAlgorithm;
use crate::error::EngineError;
use crate::pool::ThresholdBoundary;
use std::path::{Component, Path, PathBuf};

pub const DEFAULT_ALGORITHM: ChecksumAlgorithm = ChecksumAlgorithm::Sha256;

/// Read/copy chunk size (2 MiB)
pub const DEFAULT_BLOCKSIZE: usize = 2 * 1024 * 1024;

pub const DEFAULT_WORKERS: usize = 2;

/// Consecutive per-file failures tolerated before a run aborts
pub const DEFAULT_MAX_FAILURES: usize = 10;

/// Abort on the Nth consecutive failure, not after it.
pub const DEFAULT_THRESHOLD_BOUNDARY: ThresholdBoundary = ThresholdBoundary::Reached;

/// Result records buffered by the report writer before flushing
pub const DEFAULT_CACHE_SIZE: usize = 1000;

/// Options shared by every run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub algorithm: ChecksumAlgorithm,
    pub blocksize: usize,
    /// Number of concurrent workers
    pub workers: usize,
    /// Consecutive-failure maximum; `None` disables the threshold
    pub max_failures: Option<usize>,
    pub threshold_boundary: ThresholdBoundary,
    /// Descend into sub-folders when enumerating input directories
    pub recursive: bool,
    /// Only process files whose names end with one of these suffixes
    pub formats: Option<Vec<String>>,
    /// Keep emptied folders in the staging directory
    pub keep_staging_folders: bool,
    /// Count input files before processing so progress has a total
    pub count_files: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            algorithm: DEFAULT_ALGORITHM,
            blocksize: DEFAULT_BLOCKSIZE,
            workers: DEFAULT_WORKERS,
            max_failures: Some(DEFAULT_MAX_FAILURES),
            threshold_boundary: DEFAULT_THRESHOLD_BOUNDARY,
            recursive: false,
            formats: None,
            keep_staging_folders: false,
            count_files: true,
        }
    }
}

impl RunOptions {
    /// Reject option combinations that cannot run.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::configuration("number of workers must be at least 1"));
        }
        if self.blocksize == 0 {
            return Err(EngineError::configuration("block size must be at least 1 byte"));
        }
        if self.max_failures == Some(0) {
            return Err(EngineError::configuration("maximum failures must be at least 1"));
        }
        Ok(())
    }

    /// True if `file_name` passes the formats filter.
    pub fn accepts(&self, file_name: &str) -> bool {
        match &self.formats {
            None => true,
            Some(formats) => formats.iter().any(|suffix| file_name.ends_with(suffix.as_str())),
        }
    }
}

/// Destinations for a staging run, with positional tree and manifest mapping.
///
/// `trees` and `manifests` are either empty or exactly as long as
/// `destinations`; entry `i` belongs to destination `i`.
#[derive(Debug, Clone)]
pub struct StagingPlan {
    pub staging_root: PathBuf,
    pub destinations: Vec<PathBuf>,
    pub trees: Vec<PathBuf>,
    pub manifests: Vec<PathBuf>,
}

impl StagingPlan {
    pub fn new(staging_root: impl Into<PathBuf>, destinations: Vec<PathBuf>) -> Self {
        StagingPlan {
            staging_root: staging_root.into(),
            destinations,
            trees: Vec::new(),
            manifests: Vec::new(),
        }
    }

    pub fn with_trees(mut self, trees: Vec<PathBuf>) -> Self {
        self.trees = trees;
        self
    }

    pub fn with_manifests(mut self, manifests: Vec<PathBuf>) -> Self {
        self.manifests = manifests;
        self
    }

    /// Lay each destination out as `<dest>/files` plus a `<dest>/checksums` tree.
    pub fn with_default_layout(staging_root: impl Into<PathBuf>, roots: &[PathBuf]) -> Self {
        StagingPlan {
            staging_root: staging_root.into(),
            destinations: roots.iter().map(|root| root.join("files")).collect(),
            trees: roots.iter().map(|root| root.join("checksums")).collect(),
            manifests: Vec::new(),
        }
    }

    /// Check the positional mapping before any file is touched.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.destinations.is_empty() {
            return Err(EngineError::configuration("at least one destination is required"));
        }
        if !self.trees.is_empty() && self.trees.len() != self.destinations.len() {
            return Err(EngineError::configuration(format!(
                "number of destination directories ({}) does not match number of tree directories ({})",
                self.destinations.len(),
                self.trees.len()
            )));
        }
        if !self.manifests.is_empty() && self.manifests.len() != self.destinations.len() {
            return Err(EngineError::configuration(format!(
                "number of destination directories ({}) does not match number of manifest files ({})",
                self.destinations.len(),
                self.manifests.len()
            )));
        }
        let staging_root = resolve(&self.staging_root);
        let nested = |paths: &[PathBuf], reason: &str| {
            match paths.iter().find(|path| resolve(path).starts_with(&staging_root)) {
                Some(path) => Err(EngineError::InvalidPath {
                    path: path.clone(),
                    reason: reason.to_string(),
                }),
                None => Ok(()),
            }
        };
        nested(&self.destinations, "destination lies inside the staging directory")?;
        nested(&self.trees, "tree lies inside the staging directory")?;
        nested(&self.manifests, "manifest lies inside the staging directory")
    }

    /// Tree root for destination `index`, if trees are configured
    pub fn tree(&self, index: usize) -> Option<&Path> {
        self.trees.get(index).map(PathBuf::as_path)
    }

    /// Manifest for destination `index`, if manifests are configured
    pub fn manifest(&self, index: usize) -> Option<&Path> {
        self.manifests.get(index).map(PathBuf::as_path)
    }
}

/// Absolute form of `path`. The longest existing prefix is canonicalized and the
/// rest is normalized lexically, so paths that do not exist yet still compare.
fn resolve(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let (base, mut resolved) = absolute
        .ancestors()
        .find_map(|dir| dir.canonicalize().ok().map(|canonical| (dir, canonical)))
        .unwrap_or((Path::new(""), PathBuf::new()));

    for component in absolute.strip_prefix(base).unwrap_or(&absolute).components() {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            other => resolved.push(other),
        }
    }
    resolved
}
