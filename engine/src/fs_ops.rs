//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Enumerating input directories (optionally recursive, with a formats filter)
//! - Copying a file while hashing it in the same pass
//! - Creating parent directories, tolerating concurrent creation
//! - Pruning directories emptied by staging or rollback

use crate::checksums::{hash_stream, ChecksumAlgorithm, ChecksumValue};
use crate::config::RunOptions;
use crate::error::EngineError;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Enumerate the files beneath `root`.
///
/// Honors `options.recursive` and `options.formats`. Entries that cannot be read
/// are logged and skipped; only a failure at the root itself is an error.
/// Results are sorted by path so runs are reproducible.
///
/// # Errors
/// Returns `SourceNotFound` if `root` does not exist, or `EnumerationFailed` if
/// it cannot be listed.
pub fn list_files(root: &Path, options: &RunOptions) -> Result<Vec<PathBuf>, EngineError> {
    match fs::metadata(root) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            return Err(EngineError::InvalidPath {
                path: root.to_path_buf(),
                reason: "not a directory".to_string(),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(EngineError::SourceNotFound {
                path: root.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(EngineError::EnumerationFailed {
                path: root.to_path_buf(),
                source: e,
            })
        }
    }

    let mut walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
    if !options.recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.depth() == 0 {
                    return Err(EngineError::EnumerationFailed {
                        path: root.to_path_buf(),
                        source: e.into(),
                    });
                }
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if options.accepts(&name) {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}

/// Express `path` relative to `root` with `/` separators.
///
/// # Errors
/// Returns `InvalidPath` if `path` is not beneath `root`.
pub fn relative_key(root: &Path, path: &Path) -> Result<String, EngineError> {
    let relative = path.strip_prefix(root).map_err(|_| EngineError::InvalidPath {
        path: path.to_path_buf(),
        reason: format!("not beneath {}", root.display()),
    })?;

    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Ok(parts.join("/"))
}

/// Normalize a recorded path (either separator, optional `*` and leading
/// separator prefix) to a `/`-separated relative key.
pub fn normalize_key(recorded: &str) -> String {
    let trimmed = recorded.trim_start_matches('*');
    trimmed
        .split(|c| c == '/' || c == '\\')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// Creating a directory that another worker created concurrently is not an error.
///
/// # Errors
/// Returns `DirectoryCreationFailed` if the parent cannot be created or exists
/// but is not a directory.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    create_missing_parents(path).map(|_| ())
}

/// Like [`ensure_parent_dir_exists`], returning the outermost directory this
/// call created, or `None` if the parent was already there.
pub fn create_missing_parents(path: &Path) -> Result<Option<PathBuf>, EngineError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(None),
    };

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(None),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let outermost = parent
                .ancestors()
                .take_while(|dir| !dir.as_os_str().is_empty() && fs::symlink_metadata(dir).is_err())
                .last()
                .map(Path::to_path_buf);
            // create_dir_all tolerates directories created by a racing worker
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
            Ok(outermost)
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}

/// Create `path` exclusively, creating parent directories as needed.
///
/// # Errors
/// Returns `WriteError` if the file already exists or cannot be created.
pub fn create_new_file(path: &Path) -> Result<fs::File, EngineError> {
    ensure_parent_dir_exists(path)?;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| EngineError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Copy `src` into the already-open `dst_file`, hashing the bytes in the same pass.
///
/// The destination is flushed and synced before returning, and the source
/// modification time is carried over.
///
/// # Errors
/// Returns `ReadError` for source failures and `WriteError` for destination failures.
pub fn copy_hashed(
    src: &Path,
    dst_file: fs::File,
    dst: &Path,
    algorithm: ChecksumAlgorithm,
    blocksize: usize,
) -> Result<ChecksumValue, EngineError> {
    let mut src_file = fs::File::open(src).map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;
    let src_mtime = src_file.metadata().and_then(|m| m.modified()).ok();

    let mut writer = io::BufWriter::new(dst_file);
    let mut write_failed = false;

    let result = hash_stream(&mut src_file, algorithm, blocksize, |chunk| {
        writer.write_all(chunk).map_err(|e| {
            write_failed = true;
            e
        })
    });

    let (hex, size) = result.map_err(|e| {
        if write_failed {
            EngineError::WriteError {
                path: dst.to_path_buf(),
                source: e,
            }
        } else {
            EngineError::ReadError {
                path: src.to_path_buf(),
                source: e,
            }
        }
    })?;

    let dst_file = writer.into_inner().map_err(|e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e.into_error(),
    })?;
    dst_file.sync_all().map_err(|e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e,
    })?;
    drop(dst_file);

    // Preserve modification time if available
    if let Some(mtime) = src_mtime {
        if let Err(e) = filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(mtime)) {
            debug!(path = %dst.display(), error = %e, "could not preserve modification time");
        }
    }

    Ok(ChecksumValue::new(algorithm, hex, size))
}

/// Write `contents` to `path` via a temporary sibling and rename.
pub fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), EngineError> {
    ensure_parent_dir_exists(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    fs::write(&tmp, contents).map_err(|e| EngineError::WriteError {
        path: tmp.clone(),
        source: e,
    })?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        EngineError::WriteError {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

/// Remove a file. A file that is already gone counts as removed.
pub fn remove_file(path: &Path) -> Result<(), EngineError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::RemoveFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Remove `start` and its ancestors while they are empty, stopping at `stop_at`.
///
/// `stop_at` itself is never removed, and nothing outside it is touched.
/// Non-empty or busy directories end the walk silently.
pub fn prune_empty_dirs(start: &Path, stop_at: &Path) {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir == stop_at || !dir.starts_with(stop_at) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        debug!(path = %dir.display(), "removed empty directory");
        current = dir.parent();
    }
}

/// Delete empty directories beneath `root`, keeping `root` itself.
pub fn remove_empty_folders(root: &Path) {
    // Deepest entries first so parents empty out before they are visited
    let dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect();

    for dir in dirs {
        if fs::remove_dir(&dir).is_ok() {
            debug!(path = %dir.display(), "removed empty staging folder");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent");
        }
        fs::write(path, contents).expect("Failed to write file");
    }

    #[test]
    fn test_list_files_flat_and_recursive() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path();
        write(&src.join("file1.txt"), b"test data 1");
        write(&src.join("file2.tif"), b"test data 2");
        write(&src.join("sub").join("file3.txt"), b"nested");

        let flat = list_files(src, &RunOptions::default()).expect("Failed to enumerate");
        assert_eq!(flat.len(), 2, "non-recursive listing must skip sub-folders");

        let options = RunOptions {
            recursive: true,
            ..RunOptions::default()
        };
        let all = list_files(src, &options).expect("Failed to enumerate");
        assert_eq!(all.len(), 3);
        assert!(all.contains(&src.join("sub").join("file3.txt")));
    }

    #[test]
    fn test_list_files_applies_formats() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        write(&temp_dir.path().join("a.tif"), b"1");
        write(&temp_dir.path().join("b.txt"), b"2");

        let options = RunOptions {
            formats: Some(vec![".tif".to_string()]),
            ..RunOptions::default()
        };
        let files = list_files(temp_dir.path(), &options).expect("Failed to enumerate");
        assert_eq!(files, vec![temp_dir.path().join("a.tif")]);
    }

    #[test]
    fn test_list_files_nonexistent_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = list_files(&temp_dir.path().join("nonexistent"), &RunOptions::default());
        assert!(matches!(result, Err(EngineError::SourceNotFound { .. })));
    }

    #[test]
    fn test_relative_key_uses_forward_slashes() {
        let root = Path::new("/data");
        let key = relative_key(root, &root.join("a").join("b.txt")).expect("Failed to relativize");
        assert_eq!(key, "a/b.txt");
        assert!(relative_key(root, Path::new("/other/b.txt")).is_err());
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("*/a/b.txt"), "a/b.txt");
        assert_eq!(normalize_key("*\\a\\b.txt"), "a/b.txt");
        assert_eq!(normalize_key("a/b.txt"), "a/b.txt");
    }

    #[test]
    fn test_copy_hashed_single_pass() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("source.txt");
        let dst = temp_dir.path().join("out").join("dest.txt");
        write(&src, b"hello");

        let file = create_new_file(&dst).expect("Failed to create destination");
        let value = copy_hashed(&src, file, &dst, ChecksumAlgorithm::Md5, 2).expect("Failed to copy");

        assert_eq!(value.hex(), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(value.size(), 5);
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), b"hello");
    }

    #[test]
    fn test_create_new_file_refuses_existing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("exists.txt");
        write(&path, b"x");
        assert!(matches!(create_new_file(&path), Err(EngineError::WriteError { .. })));
    }

    #[test]
    fn test_ensure_parent_dir_exists() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("subdir").join("file.txt");

        ensure_parent_dir_exists(&path).expect("Failed to create parent");
        assert!(path.parent().unwrap().exists());

        // Second call on an existing directory is fine
        ensure_parent_dir_exists(&path).expect("Existing parent should be accepted");
    }

    #[test]
    fn test_create_missing_parents_reports_outermost_new_dir() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let existing = temp_dir.path().join("existing");
        fs::create_dir(&existing).expect("Failed to create dir");

        let created = create_missing_parents(&existing.join("a").join("b").join("f.txt"))
            .expect("Failed to create parents");
        assert_eq!(created, Some(existing.join("a")));
        assert!(existing.join("a").join("b").is_dir());

        let again = create_missing_parents(&existing.join("a").join("b").join("g.txt"))
            .expect("Failed to create parents");
        assert_eq!(again, None);
    }

    #[test]
    fn test_ensure_parent_dir_rejects_file_parent() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let blocker = temp_dir.path().join("blocker");
        write(&blocker, b"not a dir");
        let result = ensure_parent_dir_exists(&blocker.join("file.txt"));
        assert!(matches!(result, Err(EngineError::DirectoryCreationFailed { .. })));
    }

    #[test]
    fn test_prune_empty_dirs_stops_at_root() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("root");
        let deep = root.join("a").join("b");
        fs::create_dir_all(&deep).expect("Failed to create dirs");
        write(&root.join("keep.txt"), b"k");

        prune_empty_dirs(&deep, &root);

        assert!(!root.join("a").exists());
        assert!(root.exists());
    }

    #[test]
    fn test_prune_empty_dirs_keeps_non_empty() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        write(&root.join("a").join("other.txt"), b"o");
        fs::create_dir_all(root.join("a").join("b")).expect("Failed to create dirs");

        prune_empty_dirs(&root.join("a").join("b"), root);

        assert!(!root.join("a").join("b").exists());
        assert!(root.join("a").exists());
    }

    #[test]
    fn test_remove_empty_folders_sweep() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        fs::create_dir_all(root.join("x").join("y").join("z")).expect("Failed to create dirs");
        write(&root.join("w").join("f.txt"), b"f");

        remove_empty_folders(root);

        assert!(!root.join("x").exists());
        assert!(root.join("w").join("f.txt").exists());
        assert!(root.exists());
    }

    #[test]
    fn test_write_atomically_replaces() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("m").join("manifest.txt");
        write_atomically(&path, b"one").expect("Failed to write");
        write_atomically(&path, b"two").expect("Failed to rewrite");
        assert_eq!(fs::read(&path).expect("Failed to read"), b"two");
    }
}
