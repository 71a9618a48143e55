//! Checksum trees.
//!
//! A checksum tree mirrors a data directory: for every data file `rel/path` there
//! is a sidecar `rel/path.<algorithm>` beneath the tree root holding that file's
//! record. Sidecars are written as a single line
//!
//! ```text
//! sha256 2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824 5
//! ```
//!
//! Readers also accept the older `<hex> *<sep><name>` form, taking the algorithm
//! from the sidecar extension.

use crate::checksums::ChecksumAlgorithm;
use crate::config::RunOptions;
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::FileRecord;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A checksum tree rooted at a directory, for one algorithm.
#[derive(Debug, Clone)]
pub struct ChecksumTree {
    root: PathBuf,
    algorithm: ChecksumAlgorithm,
}

/// A sidecar found while scanning a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sidecar {
    /// Relative path of the data file the sidecar describes
    pub relative_path: String,
    pub algorithm: ChecksumAlgorithm,
    pub path: PathBuf,
}

impl ChecksumTree {
    pub fn new(root: impl Into<PathBuf>, algorithm: ChecksumAlgorithm) -> Self {
        ChecksumTree {
            root: root.into(),
            algorithm,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Sidecar location for a data file: root + relative path + `.<algorithm>`.
    pub fn sidecar_path(&self, relative_path: &str) -> PathBuf {
        sidecar_path_for(&self.root, relative_path, self.algorithm)
    }

    /// Write (or overwrite) the sidecar for `record`.
    ///
    /// # Errors
    /// Returns `DirectoryCreationFailed` or `WriteError` on I/O failure.
    pub fn write(&self, record: &FileRecord) -> Result<PathBuf, EngineError> {
        let path = self.sidecar_path(&record.relative_path);
        fs_ops::ensure_parent_dir_exists(&path)?;
        fs::write(&path, format_sidecar(record)).map_err(|e| EngineError::WriteError {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }

    /// Read the record for `relative_path`; `Ok(None)` if no sidecar exists.
    pub fn read(&self, relative_path: &str) -> Result<Option<FileRecord>, EngineError> {
        let path = self.sidecar_path(relative_path);
        match read_sidecar(&path, relative_path, self.algorithm) {
            Ok(record) => Ok(Some(record)),
            Err(EngineError::ReadError { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self, relative_path: &str) -> bool {
        self.sidecar_path(relative_path).is_file()
    }

    /// Remove the sidecar for `relative_path`.
    ///
    /// Directories are left alone; callers prune the ones they created.
    pub fn remove(&self, relative_path: &str) -> Result<(), EngineError> {
        fs_ops::remove_file(&self.sidecar_path(relative_path))
    }
}

/// Sidecar location for a data file under any tree root and algorithm.
pub fn sidecar_path_for(root: &Path, relative_path: &str, algorithm: ChecksumAlgorithm) -> PathBuf {
    let mut path = root.join(relative_path).into_os_string();
    path.push(".");
    path.push(algorithm.name());
    PathBuf::from(path)
}

/// True if a sidecar for `relative_path` exists under `root` for any registered algorithm.
pub fn has_any_sidecar(root: &Path, relative_path: &str) -> bool {
    ChecksumAlgorithm::all().any(|algorithm| sidecar_path_for(root, relative_path, algorithm).is_file())
}

/// Render a record in sidecar form.
pub fn format_sidecar(record: &FileRecord) -> String {
    match record.size {
        Some(size) => format!("{} {} {}\n", record.algorithm, record.checksum, size),
        None => format!("{} {}\n", record.algorithm, record.checksum),
    }
}

/// Parse sidecar text. `fallback` is used for the legacy form that omits the algorithm.
pub fn parse_sidecar(
    text: &str,
    relative_path: &str,
    fallback: ChecksumAlgorithm,
) -> Result<FileRecord, String> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| "empty sidecar".to_string())?;
    let mut tokens = line.split_whitespace();
    let first = tokens.next().ok_or_else(|| "empty sidecar".to_string())?;

    if let Ok(algorithm) = ChecksumAlgorithm::from_name(first) {
        let checksum = tokens
            .next()
            .ok_or_else(|| format!("missing checksum after algorithm '{}'", first))?;
        check_hex(checksum)?;
        let size = match tokens.next() {
            Some(token) => Some(
                token
                    .parse::<u64>()
                    .map_err(|_| format!("invalid size '{}'", token))?,
            ),
            None => None,
        };
        return Ok(FileRecord::new(relative_path, algorithm, checksum, size));
    }

    // Legacy "<hex> *<sep><name>" line
    check_hex(first)?;
    Ok(FileRecord::new(relative_path, fallback, first, None))
}

fn check_hex(value: &str) -> Result<(), String> {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(format!("'{}' is not a hex digest", value))
    }
}

/// Read and parse a sidecar file.
pub fn read_sidecar(
    path: &Path,
    relative_path: &str,
    fallback: ChecksumAlgorithm,
) -> Result<FileRecord, EngineError> {
    let text = fs::read_to_string(path).map_err(|e| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_sidecar(&text, relative_path, fallback).map_err(|reason| EngineError::MalformedRecord {
        path: path.to_path_buf(),
        reason,
    })
}

/// Enumerate all sidecars beneath `root`.
///
/// Files whose extension is not a registered algorithm are ignored.
pub fn scan_sidecars(root: &Path, recursive: bool) -> Result<Vec<Sidecar>, EngineError> {
    let options = RunOptions {
        recursive,
        ..RunOptions::default()
    };
    let mut sidecars = Vec::new();
    for path in fs_ops::list_files(root, &options)? {
        let algorithm = match path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ChecksumAlgorithm::from_name(ext).ok())
        {
            Some(algorithm) => algorithm,
            None => continue,
        };
        let key = fs_ops::relative_key(root, &path)?;
        let relative_path = key
            .strip_suffix(&format!(".{}", algorithm.name()))
            .unwrap_or(&key)
            .to_string();
        sidecars.push(Sidecar {
            relative_path,
            algorithm,
            path,
        });
    }
    Ok(sidecars)
}
