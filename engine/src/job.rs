//! Run orchestration module.
//!
//! This module provides one entry point per action:
//! - Creating checksums for a directory (tree, optionally manifest)
//! - Validating a directory against a tree or a manifest
//! - Comparing trees or manifests held by independent copies
//! - Staging files from an inbox into one or more destinations
//!
//! Every entry point checks its configuration before touching any file and
//! returns `Err` only for those checks. Per-file problems become result records
//! handed to the `ReportSink`; the returned `RunSummary` says whether the run
//! completed or was stopped by the consecutive-failure threshold.

use crate::checksums::{compute_record, ChecksumAlgorithm};
use crate::compare::{self, ChecksumSource};
use crate::config::{RunOptions, StagingPlan};
use crate::error::EngineError;
use crate::fs_ops;
use crate::manifest::{Manifest, ManifestHandle, ManifestWriters};
use crate::model::{Action, CreationStatus, FileRecord, ResultRecord, RunSummary};
use crate::pool::{CancellationToken, FailureCounter, WorkerPool};
use crate::report::ReportSink;
use crate::staging::{stage_file, StagingContext, StagingTask};
use crate::tree::{self, ChecksumTree, Sidecar};
use crate::validate::{validate_file, ValidationStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, info_span, warn};
use uuid::Uuid;

/// Dispatch `tasks` through the worker pool and fold the results into a summary.
fn drive<T, W>(
    action: Action,
    primary: &Path,
    algorithm: Option<ChecksumAlgorithm>,
    options: &RunOptions,
    tasks: Vec<T>,
    sink: &mut dyn ReportSink,
    work: W,
) -> RunSummary
where
    T: Send,
    W: Fn(T) -> ResultRecord + Sync,
{
    let id = Uuid::new_v4();
    let span = info_span!("run", %id, action = ?action);
    let _guard = span.enter();

    let mut summary = RunSummary::new(
        id,
        action,
        primary.display().to_string(),
        algorithm,
        options.max_failures,
    );
    let total = options.count_files.then_some(tasks.len());
    info!(files = tasks.len(), workers = options.workers, "run started");
    sink.on_run_started(&summary, total);

    let counter = FailureCounter::new(options.max_failures, options.threshold_boundary);
    let cancel = CancellationToken::new();
    let report = WorkerPool::new(options.workers).run(
        tasks,
        &counter,
        &cancel,
        |task| span.in_scope(|| work(task)),
        |record| {
            summary.tally(&record);
            sink.record(&record);
        },
    );

    summary.finish(counter.is_tripped());
    if summary.is_aborted() {
        warn!(
            processed = report.completed,
            max_failures = ?options.max_failures,
            "run aborted after consecutive failures"
        );
    } else {
        info!(processed = report.completed, "run completed");
    }
    sink.on_run_finished(&summary);
    summary
}

/// Data files beneath `dir` as relative keys, leaving out anything under `exclude`.
fn data_files(dir: &Path, options: &RunOptions, exclude: &[&Path]) -> Result<Vec<String>, EngineError> {
    let mut keys = Vec::new();
    for path in fs_ops::list_files(dir, options)? {
        if exclude.iter().any(|ex| path.starts_with(ex)) {
            continue;
        }
        keys.push(fs_ops::relative_key(dir, &path)?);
    }
    Ok(keys)
}

fn ensure_directory(path: &Path) -> Result<(), EngineError> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::InvalidPath {
            path: path.to_path_buf(),
            reason: "not a directory".to_string(),
        }),
        Err(_) => Err(EngineError::SourceNotFound {
            path: path.to_path_buf(),
        }),
    }
}

/// Reject a manifest that exists but cannot take `algorithm` records.
fn check_manifest_target(path: &Path, algorithm: ChecksumAlgorithm) -> Result<(), EngineError> {
    let contents = Manifest::new(path).read_or_default()?;
    match contents.algorithm {
        Some(existing) if existing != algorithm => Err(EngineError::configuration(format!(
            "manifest {} records {} checksums, not {}",
            path.display(),
            existing,
            algorithm
        ))),
        _ => Ok(()),
    }
}

/// Compute and store checksums for every file beneath `dir`.
///
/// Files that already have a sidecar in `tree_root` are skipped, not rehashed.
/// New records go to the tree and, when given, are merged into `manifest`.
pub fn create_checksums(
    dir: &Path,
    tree_root: &Path,
    manifest: Option<&Path>,
    options: &RunOptions,
    sink: &mut dyn ReportSink,
) -> Result<RunSummary, EngineError> {
    options.validate()?;
    if tree_root.is_file() {
        return Err(EngineError::InvalidPath {
            path: tree_root.to_path_buf(),
            reason: "checksum tree root is a file".to_string(),
        });
    }
    if let Some(path) = manifest {
        check_manifest_target(path, options.algorithm)?;
    }
    let mut exclude = vec![tree_root];
    exclude.extend(manifest);
    let files = data_files(dir, options, &exclude)?;

    let tree = ChecksumTree::new(tree_root, options.algorithm);
    let writers = ManifestWriters::new(options.algorithm);
    let handle = manifest.map(|path| writers.handle(path)).transpose()?;

    let summary = drive(
        Action::Create,
        dir,
        Some(options.algorithm),
        options,
        files,
        sink,
        |relative_path| {
            let status = if tree.exists(&relative_path) {
                CreationStatus::Skipped
            } else {
                create_one(dir, &relative_path, &tree, handle.as_ref(), options)
            };
            ResultRecord::Creation {
                relative_path,
                status,
            }
        },
    );

    drop(handle);
    writers.shutdown();
    Ok(summary)
}

fn create_one(
    dir: &Path,
    relative_path: &str,
    tree: &ChecksumTree,
    manifest: Option<&ManifestHandle>,
    options: &RunOptions,
) -> CreationStatus {
    let record = match compute_record(dir, relative_path, options.algorithm, options.blocksize) {
        Ok(record) => record,
        Err(e) => {
            warn!(file = relative_path, error = %e, "could not hash file");
            return CreationStatus::Failed(e.detailed());
        }
    };
    if let Err(e) = tree.write(&record) {
        warn!(file = relative_path, error = %e, "could not write checksum");
        return CreationStatus::Failed(e.detailed());
    }
    if let Some(handle) = manifest {
        if let Err(e) = handle.upsert(vec![record.clone()]) {
            warn!(file = relative_path, error = %e, "could not update manifest");
            return CreationStatus::Failed(e.detailed());
        }
    }
    CreationStatus::Added(record)
}

enum ValidationTask {
    Sidecar(Sidecar),
    Manifest(FileRecord),
    Unrecorded(String),
}

fn run_validation(
    action: Action,
    dir: &Path,
    algorithm: Option<ChecksumAlgorithm>,
    primary: &Path,
    tasks: Vec<ValidationTask>,
    options: &RunOptions,
    sink: &mut dyn ReportSink,
) -> RunSummary {
    drive(action, primary, algorithm, options, tasks, sink, |task| match task {
        ValidationTask::Sidecar(sidecar) => {
            match tree::read_sidecar(&sidecar.path, &sidecar.relative_path, sidecar.algorithm) {
                Ok(record) => validate_file(dir, &record, options.blocksize),
                Err(e) => ResultRecord::Validation {
                    relative_path: sidecar.relative_path,
                    status: ValidationStatus::Unreadable(e.detailed()),
                    size: None,
                },
            }
        }
        ValidationTask::Manifest(record) => validate_file(dir, &record, options.blocksize),
        ValidationTask::Unrecorded(relative_path) => {
            let size = fs::metadata(dir.join(&relative_path)).map(|m| m.len()).ok();
            ResultRecord::Validation {
                relative_path,
                status: ValidationStatus::Unrecorded,
                size,
            }
        }
    })
}

/// Validate every file beneath `dir` against the checksum tree at `tree_root`.
///
/// Sidecars of any registered algorithm are used; when a file has several,
/// the one for `options.algorithm` is preferred. Files with no sidecar are
/// reported as unrecorded, sidecars with no file as missing.
pub fn validate_tree(
    dir: &Path,
    tree_root: &Path,
    options: &RunOptions,
    sink: &mut dyn ReportSink,
) -> Result<RunSummary, EngineError> {
    options.validate()?;
    ensure_directory(tree_root)?;
    let files = data_files(dir, options, &[tree_root])?;

    let mut chosen: BTreeMap<String, Sidecar> = BTreeMap::new();
    for sidecar in tree::scan_sidecars(tree_root, options.recursive)? {
        let replace = match chosen.get(&sidecar.relative_path) {
            None => true,
            Some(current) => {
                current.algorithm != options.algorithm && sidecar.algorithm == options.algorithm
            }
        };
        if replace {
            chosen.insert(sidecar.relative_path.clone(), sidecar);
        }
    }

    let mut tasks: Vec<ValidationTask> = files
        .into_iter()
        .filter(|rel| !chosen.contains_key(rel))
        .map(ValidationTask::Unrecorded)
        .collect();
    tasks.extend(chosen.into_values().map(ValidationTask::Sidecar));

    Ok(run_validation(
        Action::ValidateTree,
        dir,
        None,
        tree_root,
        tasks,
        options,
        sink,
    ))
}

/// Validate every file beneath `dir` against `manifest`.
///
/// The algorithm named in the manifest header wins; `options.algorithm` is used
/// for manifests without one.
pub fn validate_manifest(
    dir: &Path,
    manifest: &Path,
    options: &RunOptions,
    sink: &mut dyn ReportSink,
) -> Result<RunSummary, EngineError> {
    options.validate()?;
    let contents = Manifest::new(manifest).read_all()?;
    let algorithm = contents.algorithm.unwrap_or(options.algorithm);
    let files = data_files(dir, options, &[manifest])?;

    let recorded: BTreeSet<&str> = contents.entries.keys().map(String::as_str).collect();
    let mut tasks: Vec<ValidationTask> = files
        .iter()
        .filter(|rel| !recorded.contains(rel.as_str()))
        .cloned()
        .map(ValidationTask::Unrecorded)
        .collect();
    tasks.extend(contents.entries.iter().map(|(path, checksum)| {
        ValidationTask::Manifest(FileRecord::new(path.clone(), algorithm, checksum.clone(), None))
    }));

    Ok(run_validation(
        Action::ValidateManifest,
        dir,
        Some(algorithm),
        manifest,
        tasks,
        options,
        sink,
    ))
}

fn run_comparison(
    action: Action,
    primary: &Path,
    algorithm: Option<ChecksumAlgorithm>,
    master: &ChecksumSource,
    peers: &[ChecksumSource],
    options: &RunOptions,
    sink: &mut dyn ReportSink,
) -> RunSummary {
    let records = compare::compare(master, peers);
    drive(action, primary, algorithm, options, records, sink, ResultRecord::Comparison)
}

/// Compare the checksum tree at `master` against each tree in `others`.
pub fn compare_trees(
    master: &Path,
    others: &[PathBuf],
    options: &RunOptions,
    sink: &mut dyn ReportSink,
) -> Result<RunSummary, EngineError> {
    options.validate()?;
    if others.is_empty() {
        return Err(EngineError::configuration("at least one other tree is required"));
    }
    let master_source = ChecksumSource::from_tree(master, options.recursive)?;
    let peers = others
        .iter()
        .map(|root| {
            ensure_directory(root)?;
            ChecksumSource::from_tree(root, options.recursive)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(run_comparison(
        Action::CompareTrees,
        master,
        None,
        &master_source,
        &peers,
        options,
        sink,
    ))
}

/// Compare the manifest at `master` against each manifest in `others`.
///
/// All manifests must declare the same algorithm, or none.
pub fn compare_manifests(
    master: &Path,
    others: &[PathBuf],
    options: &RunOptions,
    sink: &mut dyn ReportSink,
) -> Result<RunSummary, EngineError> {
    options.validate()?;
    if others.is_empty() {
        return Err(EngineError::configuration("at least one other manifest is required"));
    }
    let master_source = ChecksumSource::from_manifest(master)?;
    let peers = others
        .iter()
        .map(|path| ChecksumSource::from_manifest(path))
        .collect::<Result<Vec<_>, _>>()?;

    let algorithms: BTreeSet<ChecksumAlgorithm> = std::iter::once(&master_source)
        .chain(&peers)
        .filter_map(|source| source.algorithm)
        .collect();
    if algorithms.len() > 1 {
        let names: Vec<&str> = algorithms.iter().map(ChecksumAlgorithm::name).collect();
        return Err(EngineError::configuration(format!(
            "manifests use different algorithms: {}",
            names.join(", ")
        )));
    }

    Ok(run_comparison(
        Action::CompareManifests,
        master,
        algorithms.into_iter().next(),
        &master_source,
        &peers,
        options,
        sink,
    ))
}

/// Stage every file beneath `plan.staging_root` into all of `plan`'s destinations.
///
/// Each file is committed to every destination or to none. Committed files are
/// removed from the staging directory; unless `options.keep_staging_folders`
/// is set, folders left empty are removed at the end of the run.
pub fn stage_files(
    plan: &StagingPlan,
    options: &RunOptions,
    sink: &mut dyn ReportSink,
) -> Result<RunSummary, EngineError> {
    options.validate()?;
    plan.validate()?;
    for path in &plan.manifests {
        check_manifest_target(path, options.algorithm)?;
    }
    let files = fs_ops::list_files(&plan.staging_root, options)?;
    let tasks = files
        .into_iter()
        .map(|path| {
            let relative_path = fs_ops::relative_key(&plan.staging_root, &path)?;
            Ok(StagingTask::from_plan(plan, path, relative_path))
        })
        .collect::<Result<Vec<_>, EngineError>>()?;

    let writers = ManifestWriters::new(options.algorithm);
    let ctx = StagingContext {
        algorithm: options.algorithm,
        blocksize: options.blocksize,
        staging_root: &plan.staging_root,
        keep_staging_folders: options.keep_staging_folders,
        manifests: &writers,
    };

    let summary = drive(
        Action::Stage,
        &plan.staging_root,
        Some(options.algorithm),
        options,
        tasks,
        sink,
        |task| ResultRecord::Staging(stage_file(&task, &ctx)),
    );

    writers.shutdown();
    if !options.keep_staging_folders {
        fs_ops::remove_empty_folders(&plan.staging_root);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ThresholdBoundary;
    use crate::report::CollectingSink;

    fn write(path: &Path, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent");
        }
        fs::write(path, contents).expect("Failed to write file");
    }

    fn recursive() -> RunOptions {
        RunOptions {
            recursive: true,
            ..RunOptions::default()
        }
    }

    fn populate(dir: &Path) {
        write(&dir.join("file1.txt"), b"test data 1");
        write(&dir.join("file2.tif"), b"test data 2");
        write(&dir.join("sub").join("file3.txt"), b"nested");
    }

    #[test]
    fn test_create_then_validate_tree_round_trip() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data = temp_dir.path().join("data");
        let tree = temp_dir.path().join("tree");
        populate(&data);

        for algorithm in ChecksumAlgorithm::all() {
            let options = RunOptions {
                algorithm,
                ..recursive()
            };
            let mut sink = CollectingSink::new();
            let created = create_checksums(&data, &tree, None, &options, &mut sink)
                .expect("Failed to create checksums");
            assert_eq!(created.count("added"), 3, "{}", algorithm);

            let mut sink = CollectingSink::new();
            let summary = validate_tree(&data, &tree, &options, &mut sink).expect("Failed to validate");
            assert_eq!(summary.count("valid"), 3, "{}", algorithm);
            assert!(!summary.has_problems(), "{}", summary);
        }
    }

    #[test]
    fn test_create_then_validate_manifest_round_trip() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data = temp_dir.path().join("data");
        let manifest = temp_dir.path().join("manifest.txt");
        populate(&data);

        let options = RunOptions {
            algorithm: ChecksumAlgorithm::Md5,
            ..recursive()
        };
        create_checksums(&data, &temp_dir.path().join("tree"), Some(&manifest), &options, &mut CollectingSink::new())
            .expect("Failed to create checksums");

        // The header, not the default algorithm, decides how to validate
        let mut sink = CollectingSink::new();
        let summary = validate_manifest(&data, &manifest, &recursive(), &mut sink)
            .expect("Failed to validate");
        assert_eq!(summary.algorithm, Some(ChecksumAlgorithm::Md5));
        assert_eq!(summary.count("valid"), 3);
        assert_eq!(sink.records.len(), 3);
    }

    #[test]
    fn test_create_skips_existing_sidecars() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data = temp_dir.path().join("data");
        let tree = temp_dir.path().join("tree");
        populate(&data);

        create_checksums(&data, &tree, None, &recursive(), &mut CollectingSink::new())
            .expect("Failed to create checksums");
        write(&data.join("file4.txt"), b"late arrival");

        let mut sink = CollectingSink::new();
        let summary = create_checksums(&data, &tree, None, &recursive(), &mut sink)
            .expect("Failed to create checksums");
        assert_eq!(summary.count("skipped"), 3);
        assert_eq!(summary.count("added"), 1);
        assert!(matches!(
            sink.find("file4.txt"),
            Some(ResultRecord::Creation {
                status: CreationStatus::Added(_),
                ..
            })
        ));
    }

    #[test]
    fn test_validate_tree_reports_problems() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data = temp_dir.path().join("data");
        let tree = temp_dir.path().join("tree");
        populate(&data);
        create_checksums(&data, &tree, None, &recursive(), &mut CollectingSink::new())
            .expect("Failed to create checksums");

        write(&data.join("file1.txt"), b"tampered");
        fs::remove_file(data.join("file2.tif")).expect("Failed to remove file");
        write(&data.join("new.txt"), b"unrecorded");

        let mut sink = CollectingSink::new();
        let summary = validate_tree(&data, &tree, &recursive(), &mut sink).expect("Failed to validate");

        assert_eq!(summary.count("invalid"), 1);
        assert_eq!(summary.count("missing"), 1);
        assert_eq!(summary.count("unrecorded"), 1);
        assert_eq!(summary.count("valid"), 1);
        assert!(summary.has_problems());
        assert!(!summary.is_aborted(), "mismatches never trip the threshold");
    }

    #[test]
    fn test_validate_missing_tree_is_configuration_error() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = validate_tree(
            temp_dir.path(),
            &temp_dir.path().join("no-tree"),
            &RunOptions::default(),
            &mut CollectingSink::new(),
        );
        assert!(result.expect_err("missing tree must fail").is_configuration());
    }

    #[test]
    fn test_compare_trees_after_create() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data = temp_dir.path().join("data");
        let t1 = temp_dir.path().join("t1");
        let t2 = temp_dir.path().join("t2");
        populate(&data);
        create_checksums(&data, &t1, None, &recursive(), &mut CollectingSink::new())
            .expect("Failed to create t1");
        create_checksums(&data, &t2, None, &recursive(), &mut CollectingSink::new())
            .expect("Failed to create t2");

        let mut sink = CollectingSink::new();
        let summary = compare_trees(&t1, &[t2.clone()], &recursive(), &mut sink).expect("Failed to compare");
        assert_eq!(summary.count("matched"), 3);

        ChecksumTree::new(&t2, ChecksumAlgorithm::Sha256)
            .write(&FileRecord::new("file1.txt", ChecksumAlgorithm::Sha256, "00", None))
            .expect("Failed to tamper sidecar");
        let summary = compare_trees(&t1, &[t2], &recursive(), &mut CollectingSink::new())
            .expect("Failed to compare");
        assert_eq!(summary.count("unmatched"), 1);
        assert_eq!(summary.count("matched"), 2);
    }

    #[test]
    fn test_compare_manifests_rejects_mixed_algorithms() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let m1 = temp_dir.path().join("m1.txt");
        let m2 = temp_dir.path().join("m2.txt");
        Manifest::new(&m1)
            .merge_write(ChecksumAlgorithm::Md5, &[FileRecord::new("a", ChecksumAlgorithm::Md5, "01", None)])
            .expect("Failed to write m1");
        Manifest::new(&m2)
            .merge_write(ChecksumAlgorithm::Sha1, &[FileRecord::new("a", ChecksumAlgorithm::Sha1, "01", None)])
            .expect("Failed to write m2");

        let result = compare_manifests(&m1, &[m2], &RunOptions::default(), &mut CollectingSink::new());
        assert!(result.expect_err("mixed algorithms must fail").is_configuration());
    }

    #[test]
    fn test_compare_manifests_reports_extra_and_missing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let m1 = temp_dir.path().join("m1.txt");
        let m2 = temp_dir.path().join("m2.txt");
        let rec = |p: &str| FileRecord::new(p, ChecksumAlgorithm::Sha256, "ab", None);
        Manifest::new(&m1)
            .merge_write(ChecksumAlgorithm::Sha256, &[rec("a"), rec("b")])
            .expect("Failed to write m1");
        Manifest::new(&m2)
            .merge_write(ChecksumAlgorithm::Sha256, &[rec("a"), rec("c")])
            .expect("Failed to write m2");

        let summary = compare_manifests(&m1, &[m2], &RunOptions::default(), &mut CollectingSink::new())
            .expect("Failed to compare");
        assert_eq!(summary.count("matched"), 1);
        assert_eq!(summary.count("missing"), 1);
        assert_eq!(summary.count("extra"), 1);
    }

    #[test]
    fn test_stage_files_default_layout() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let inbox = temp_dir.path().join("inbox");
        populate(&inbox);
        fs::create_dir_all(inbox.join("empty").join("folder")).expect("Failed to create empty dirs");
        let stores = [temp_dir.path().join("s1"), temp_dir.path().join("s2")];
        let plan = StagingPlan::with_default_layout(&inbox, &stores);

        let mut sink = CollectingSink::new();
        let summary = stage_files(&plan, &recursive(), &mut sink).expect("Failed to stage");

        assert_eq!(summary.count("staged"), 3);
        assert!(!summary.has_problems());
        assert!(!inbox.join("sub").exists());
        assert!(!inbox.join("empty").exists(), "empty folders are swept");
        assert!(inbox.exists());

        for store in &stores {
            let summary = validate_tree(
                &store.join("files"),
                &store.join("checksums"),
                &recursive(),
                &mut CollectingSink::new(),
            )
            .expect("Failed to validate store");
            assert_eq!(summary.count("valid"), 3);
        }
    }

    #[test]
    fn test_stage_misaligned_plan_fails_before_io() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let inbox = temp_dir.path().join("inbox");
        write(&inbox.join("a.txt"), b"a");
        let plan = StagingPlan::new(&inbox, vec![temp_dir.path().join("d1"), temp_dir.path().join("d2")])
            .with_trees(vec![temp_dir.path().join("t1")]);

        let mut sink = CollectingSink::new();
        let result = stage_files(&plan, &RunOptions::default(), &mut sink);

        assert!(result.expect_err("misaligned plan must fail").is_configuration());
        assert!(inbox.join("a.txt").exists());
        assert!(!temp_dir.path().join("d1").exists());
        assert!(sink.records.is_empty());
    }

    fn stage_with_duplicates(boundary: ThresholdBoundary) -> (RunSummary, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        let inbox = root.join("inbox");
        let dest = root.join("dest");
        for n in 1..=6 {
            write(&inbox.join(format!("f{}.txt", n)), b"payload");
        }
        // The first four files are already present at the destination
        for n in 1..=4 {
            write(&dest.join(format!("f{}.txt", n)), b"existing");
        }
        let plan = StagingPlan::new(&inbox, vec![dest]);
        let options = RunOptions {
            workers: 1,
            max_failures: Some(3),
            threshold_boundary: boundary,
            ..RunOptions::default()
        };
        let summary = stage_files(&plan, &options, &mut CollectingSink::new()).expect("Failed to stage");
        (summary, temp_dir)
    }

    #[test]
    fn test_stage_aborts_on_third_consecutive_failure() {
        let (summary, temp_dir) = stage_with_duplicates(ThresholdBoundary::Reached);
        let root = temp_dir.path();

        assert!(summary.is_aborted());
        assert_eq!(summary.count("failed"), 3);
        assert_eq!(summary.files_processed, 3);
        for n in 4..=6 {
            assert!(root.join("inbox").join(format!("f{}.txt", n)).exists(), "f{} must not be processed", n);
        }
        assert!(!root.join("dest").join("f5.txt").exists());
        assert!(summary.to_string().contains("RUN INCOMPLETE"));
    }

    #[test]
    fn test_stage_aborts_after_threshold_when_exceeded() {
        let (summary, temp_dir) = stage_with_duplicates(ThresholdBoundary::Exceeded);
        let root = temp_dir.path();

        assert!(summary.is_aborted());
        assert_eq!(summary.count("failed"), 4);
        assert_eq!(summary.files_processed, 4);
        assert!(root.join("inbox").join("f5.txt").exists());
        assert!(!root.join("dest").join("f5.txt").exists());
    }

    #[test]
    fn test_stage_success_resets_failure_count() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let inbox = temp_dir.path().join("inbox");
        let dest = temp_dir.path().join("dest");
        for n in 1..=6 {
            write(&inbox.join(format!("f{}.txt", n)), b"payload");
        }
        // Failures at f1, f2, f4, f5 never reach three in a row
        for n in [1, 2, 4, 5] {
            write(&dest.join(format!("f{}.txt", n)), b"existing");
        }
        let options = RunOptions {
            workers: 1,
            max_failures: Some(3),
            ..RunOptions::default()
        };

        let summary = stage_files(&StagingPlan::new(&inbox, vec![dest]), &options, &mut CollectingSink::new())
            .expect("Failed to stage");

        assert!(!summary.is_aborted());
        assert_eq!(summary.count("staged"), 2);
        assert_eq!(summary.count("failed"), 4);
    }
}
