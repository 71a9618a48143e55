//! Transactional staging of one file into several destinations.
//!
//! A file is either committed to every destination (data copy, sidecar and
//! manifest entry) or to none of them. Destinations are processed in order;
//! the first failure rolls back everything this task wrote and leaves the
//! source file where it was.

use crate::checksums::{compute_file_checksum, digests_match, ChecksumAlgorithm};
use crate::config::StagingPlan;
use crate::error::EngineError;
use crate::fs_ops;
use crate::manifest::{ManifestHandle, ManifestWriters};
use crate::model::FileRecord;
use crate::tree::ChecksumTree;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Why a destination failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A data file already exists at the destination
    DuplicateFile,
    /// A sidecar already exists in the destination's tree
    DuplicateChecksum,
    DataWriteFailure,
    /// The copy does not hash like the source, or the source changed mid-task
    ChecksumMismatch,
    ChecksumWriteFailure,
    ManifestWriteFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::DuplicateFile => "duplicate file",
            FailureKind::DuplicateChecksum => "duplicate checksum",
            FailureKind::DataWriteFailure => "data write failure",
            FailureKind::ChecksumMismatch => "checksum mismatch",
            FailureKind::ChecksumWriteFailure => "checksum write failure",
            FailureKind::ManifestWriteFailure => "manifest write failure",
        })
    }
}

/// Final state of one destination for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationStatus {
    Staged,
    /// Not written, or written and rolled back
    Unstaged,
    Failed { kind: FailureKind, reason: String },
    /// Rollback could not remove something this task wrote
    CouldNotRemove(String),
}

impl fmt::Display for DestinationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationStatus::Staged => f.write_str("staged"),
            DestinationStatus::Unstaged => f.write_str("unstaged"),
            DestinationStatus::Failed { kind, reason } => write!(f, "{} ({})", kind, reason),
            DestinationStatus::CouldNotRemove(reason) => write!(f, "could not remove ({})", reason),
        }
    }
}

/// One file to stage, with its per-destination tree and manifest.
#[derive(Debug, Clone)]
pub struct StagingTask {
    pub source_file: PathBuf,
    /// Path of the file relative to the staging root, `/`-separated
    pub relative_path: String,
    pub destinations: Vec<PathBuf>,
    pub trees: Vec<Option<PathBuf>>,
    pub manifests: Vec<Option<PathBuf>>,
}

impl StagingTask {
    pub fn from_plan(plan: &StagingPlan, source_file: PathBuf, relative_path: String) -> Self {
        let count = plan.destinations.len();
        StagingTask {
            source_file,
            relative_path,
            destinations: plan.destinations.clone(),
            trees: (0..count).map(|i| plan.tree(i).map(Path::to_path_buf)).collect(),
            manifests: (0..count)
                .map(|i| plan.manifest(i).map(Path::to_path_buf))
                .collect(),
        }
    }

    fn tree(&self, index: usize, algorithm: ChecksumAlgorithm) -> Option<ChecksumTree> {
        self.trees
            .get(index)
            .and_then(Option::as_ref)
            .map(|root| ChecksumTree::new(root, algorithm))
    }

    fn manifest(&self, index: usize) -> Option<&Path> {
        self.manifests.get(index).and_then(Option::as_deref)
    }

    fn data_path(&self, index: usize) -> PathBuf {
        self.destinations[index].join(&self.relative_path)
    }
}

/// Result of staging one file.
#[derive(Debug, Clone)]
pub struct StagingOutcome {
    pub source_file: PathBuf,
    pub relative_path: String,
    /// Source digest, once at least one copy completed
    pub checksum: Option<String>,
    pub size: Option<u64>,
    pub destinations: Vec<PathBuf>,
    /// One status per destination, in destination order
    pub statuses: Vec<DestinationStatus>,
    pub source_removed: bool,
}

impl StagingOutcome {
    /// True iff every destination is staged.
    pub fn is_committed(&self) -> bool {
        self.statuses.iter().all(|s| *s == DestinationStatus::Staged)
    }

    /// True if rollback left something behind.
    pub fn is_incomplete(&self) -> bool {
        self.statuses
            .iter()
            .any(|s| matches!(s, DestinationStatus::CouldNotRemove(_)))
    }

    pub fn category(&self) -> &'static str {
        if self.is_committed() {
            "staged"
        } else if self.is_incomplete() {
            "incomplete"
        } else {
            "failed"
        }
    }

    /// The destination that failed, with its status
    pub fn failure(&self) -> Option<(&Path, &DestinationStatus)> {
        self.destinations
            .iter()
            .zip(&self.statuses)
            .find(|(_, s)| !matches!(s, DestinationStatus::Staged | DestinationStatus::Unstaged))
            .map(|(d, s)| (d.as_path(), s))
    }

    pub fn describe_destinations(&self) -> String {
        self.destinations
            .iter()
            .zip(&self.statuses)
            .map(|(d, s)| format!("{}: {}", d.display(), s))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Shared state for every staging task in a run.
pub struct StagingContext<'a> {
    pub algorithm: ChecksumAlgorithm,
    pub blocksize: usize,
    pub staging_root: &'a Path,
    pub keep_staging_folders: bool,
    pub manifests: &'a ManifestWriters,
}

/// Artifacts written for one destination, removed again on rollback
#[derive(Default)]
struct Written {
    data: Option<PathBuf>,
    sidecar: Option<ChecksumTree>,
    /// File path and the outermost directory created to hold it
    new_dirs: Vec<(PathBuf, PathBuf)>,
    /// Writer handle and the checksum the manifest held for the path before this task
    manifest: Option<(ManifestHandle, Option<String>)>,
}

struct Failure {
    kind: FailureKind,
    reason: String,
}

impl Failure {
    fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Failure {
            kind,
            reason: reason.into(),
        }
    }

    fn from_error(kind: FailureKind, error: &EngineError) -> Self {
        Failure::new(kind, error.detailed())
    }
}

/// Stage `task` into all of its destinations, or into none.
pub fn stage_file(task: &StagingTask, ctx: &StagingContext<'_>) -> StagingOutcome {
    let count = task.destinations.len();
    let mut outcome = StagingOutcome {
        source_file: task.source_file.clone(),
        relative_path: task.relative_path.clone(),
        checksum: None,
        size: fs::metadata(&task.source_file).map(|m| m.len()).ok(),
        destinations: task.destinations.clone(),
        statuses: vec![DestinationStatus::Unstaged; count],
        source_removed: false,
    };

    if let Some((index, failure)) = precheck(task, ctx.algorithm) {
        warn!(
            file = %task.relative_path,
            destination = %task.destinations[index].display(),
            kind = %failure.kind,
            "staging refused"
        );
        outcome.statuses[index] = DestinationStatus::Failed {
            kind: failure.kind,
            reason: failure.reason,
        };
        return outcome;
    }

    let mut written: Vec<Written> = Vec::with_capacity(count);
    for index in 0..count {
        written.push(Written::default());
        match stage_destination(task, index, ctx, &mut outcome, &mut written[index]) {
            Ok(()) => outcome.statuses[index] = DestinationStatus::Staged,
            Err(failure) => {
                warn!(
                    file = %task.relative_path,
                    destination = %task.destinations[index].display(),
                    kind = %failure.kind,
                    reason = %failure.reason,
                    "staging failed, rolling back"
                );
                outcome.statuses[index] = DestinationStatus::Failed {
                    kind: failure.kind,
                    reason: failure.reason,
                };
                roll_back(task, &written, &mut outcome.statuses);
                return outcome;
            }
        }
    }

    match fs_ops::remove_file(&task.source_file) {
        Ok(()) => {
            outcome.source_removed = true;
            if !ctx.keep_staging_folders {
                if let Some(parent) = task.source_file.parent() {
                    fs_ops::prune_empty_dirs(parent, ctx.staging_root);
                }
            }
        }
        Err(e) => warn!(file = %task.source_file.display(), error = %e, "staged file could not be removed from staging"),
    }
    debug!(file = %task.relative_path, destinations = count, "staged");
    outcome
}

/// Refuse the task before anything is written if a destination already holds the file.
fn precheck(task: &StagingTask, algorithm: ChecksumAlgorithm) -> Option<(usize, Failure)> {
    (0..task.destinations.len()).find_map(|index| {
        let data_path = task.data_path(index);
        if data_path.exists() {
            return Some((
                index,
                Failure::new(
                    FailureKind::DuplicateFile,
                    format!("{} already exists", data_path.display()),
                ),
            ));
        }
        let tree = task.tree(index, algorithm)?;
        let sidecar = tree.sidecar_path(&task.relative_path);
        if sidecar.exists() {
            return Some((
                index,
                Failure::new(
                    FailureKind::DuplicateChecksum,
                    format!("{} already exists", sidecar.display()),
                ),
            ));
        }
        None
    })
}

fn stage_destination(
    task: &StagingTask,
    index: usize,
    ctx: &StagingContext<'_>,
    outcome: &mut StagingOutcome,
    written: &mut Written,
) -> Result<(), Failure> {
    let data_path = task.data_path(index);

    if let Some(dir) = fs_ops::create_missing_parents(&data_path)
        .map_err(|e| Failure::from_error(FailureKind::DataWriteFailure, &e))?
    {
        written.new_dirs.push((data_path.clone(), dir));
    }
    let file = fs_ops::create_new_file(&data_path)
        .map_err(|e| Failure::from_error(FailureKind::DataWriteFailure, &e))?;
    written.data = Some(data_path.clone());

    let copied = fs_ops::copy_hashed(&task.source_file, file, &data_path, ctx.algorithm, ctx.blocksize)
        .map_err(|e| Failure::from_error(FailureKind::DataWriteFailure, &e))?;

    if let Some(source) = &outcome.checksum {
        if !digests_match(source, copied.hex()) {
            return Err(Failure::new(
                FailureKind::ChecksumMismatch,
                format!(
                    "source changed during staging (expected {}, read {})",
                    source,
                    copied.hex()
                ),
            ));
        }
    } else {
        outcome.checksum = Some(copied.hex().to_string());
        outcome.size = Some(copied.size());
    }

    verify_copy(&data_path, copied.hex(), ctx.algorithm, ctx.blocksize)?;

    let record = FileRecord::new(
        task.relative_path.clone(),
        ctx.algorithm,
        copied.hex(),
        Some(copied.size()),
    );

    if let Some(tree) = task.tree(index, ctx.algorithm) {
        let sidecar_path = tree.sidecar_path(&task.relative_path);
        if let Some(dir) = fs_ops::create_missing_parents(&sidecar_path)
            .map_err(|e| Failure::from_error(FailureKind::ChecksumWriteFailure, &e))?
        {
            written.new_dirs.push((sidecar_path, dir));
        }
        tree.write(&record)
            .map_err(|e| Failure::from_error(FailureKind::ChecksumWriteFailure, &e))?;
        written.sidecar = Some(tree);
    }

    if let Some(path) = task.manifest(index) {
        let handle = ctx
            .manifests
            .handle(path)
            .map_err(|e| Failure::from_error(FailureKind::ManifestWriteFailure, &e))?;
        let previous = handle
            .upsert(vec![record])
            .map_err(|e| Failure::from_error(FailureKind::ManifestWriteFailure, &e))?;
        written.manifest = Some((handle, previous.into_iter().next().flatten()));
    }

    Ok(())
}

/// Re-read the copy and compare it with the digest taken while copying.
fn verify_copy(
    data_path: &Path,
    expected: &str,
    algorithm: ChecksumAlgorithm,
    blocksize: usize,
) -> Result<(), Failure> {
    let verified = compute_file_checksum(data_path, algorithm, blocksize)
        .map_err(|e| Failure::from_error(FailureKind::ChecksumMismatch, &e))?;
    if !digests_match(verified.hex(), expected) {
        return Err(Failure::new(
            FailureKind::ChecksumMismatch,
            format!("copy reads back as {}, expected {}", verified.hex(), expected),
        ));
    }
    Ok(())
}

/// Undo everything recorded in `written`, newest first.
///
/// Manifest entries go back to what they held before the task. Only
/// directories the task created are pruned. Destinations cleaned up completely
/// become `Unstaged` (the failing one keeps its failure); any that could not be
/// cleaned become `CouldNotRemove`.
fn roll_back(task: &StagingTask, written: &[Written], statuses: &mut [DestinationStatus]) {
    for (index, artifacts) in written.iter().enumerate().rev() {
        let mut errors = Vec::new();

        if let Some((handle, previous)) = &artifacts.manifest {
            if let Err(e) = handle.restore(vec![(task.relative_path.clone(), previous.clone())]) {
                errors.push(e.detailed());
            }
        }
        if let Some(tree) = &artifacts.sidecar {
            if let Err(e) = tree.remove(&task.relative_path) {
                errors.push(e.detailed());
            }
        }
        if let Some(data) = &artifacts.data {
            if let Err(e) = fs_ops::remove_file(data) {
                errors.push(e.detailed());
            }
        }
        for (file, outermost) in artifacts.new_dirs.iter().rev() {
            if let (Some(parent), Some(stop_at)) = (file.parent(), outermost.parent()) {
                fs_ops::prune_empty_dirs(parent, stop_at);
            }
        }

        if !errors.is_empty() {
            let previous = match &statuses[index] {
                DestinationStatus::Failed { kind, reason } => format!("{}: {}; ", kind, reason),
                _ => String::new(),
            };
            statuses[index] = DestinationStatus::CouldNotRemove(format!("{}{}", previous, errors.join("; ")));
        } else if statuses[index] == DestinationStatus::Staged {
            statuses[index] = DestinationStatus::Unstaged;
        }
        debug!(
            file = %task.relative_path,
            destination = %task.destinations[index].display(),
            "rolled back"
        );
    }
}
