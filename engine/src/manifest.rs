//! Flat checksum manifests.
//!
//! A manifest is a single text file recording one checksum per relative path,
//! all under one algorithm:
//!
//! ```text
//! ; Algorithm: sha256
//! 2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824 */docs/hello.txt
//! ```
//!
//! Writes always replace the whole file atomically. Concurrent writers to the
//! same manifest must go through a [`ManifestHandle`] so that every update to
//! one path is applied by a single owner thread.

use crate::checksums::ChecksumAlgorithm;
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::FileRecord;
use crossbeam_channel::{Receiver, Sender};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use tracing::{debug, warn};

/// Parsed manifest contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestContents {
    /// Algorithm named in the header, if any
    pub algorithm: Option<ChecksumAlgorithm>,
    /// Relative path -> lowercase hex checksum
    pub entries: BTreeMap<String, String>,
}

impl ManifestContents {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, relative_path: &str) -> Option<&str> {
        self.entries.get(relative_path).map(String::as_str)
    }

    /// Overlay `records` onto the entries; new values win.
    ///
    /// # Errors
    /// Returns `Configuration` if the manifest already records a different algorithm.
    pub fn merge(
        &mut self,
        algorithm: ChecksumAlgorithm,
        records: &[FileRecord],
    ) -> Result<(), EngineError> {
        match self.algorithm {
            Some(existing) if existing != algorithm => {
                return Err(EngineError::configuration(format!(
                    "manifest records {} checksums, cannot add {} checksums",
                    existing, algorithm
                )))
            }
            _ => self.algorithm = Some(algorithm),
        }
        for record in records {
            self.entries
                .insert(record.relative_path.clone(), record.checksum.to_lowercase());
        }
        Ok(())
    }

    /// Drop entries for `paths`, returning how many were present.
    pub fn remove(&mut self, paths: &[String]) -> usize {
        paths
            .iter()
            .filter(|path| self.entries.remove(path.as_str()).is_some())
            .count()
    }

    /// Reinstate earlier values: `Some` puts the checksum back, `None` drops
    /// the entry. Returns how many entries changed.
    pub fn restore(&mut self, entries: &[(String, Option<String>)]) -> usize {
        let mut changed = 0;
        for (path, previous) in entries {
            let differs = match previous {
                Some(checksum) => {
                    self.entries.insert(path.clone(), checksum.clone()).as_ref() != Some(checksum)
                }
                None => self.entries.remove(path).is_some(),
            };
            if differs {
                changed += 1;
            }
        }
        changed
    }

    /// Render in manifest text form.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(algorithm) = self.algorithm {
            let _ = writeln!(out, "; Algorithm: {}", algorithm);
        }
        for (path, checksum) in &self.entries {
            let _ = writeln!(out, "{} */{}", checksum, path);
        }
        out
    }
}

/// Parse manifest text. The first entry for a duplicated path wins.
pub fn parse_manifest(text: &str) -> Result<ManifestContents, String> {
    let mut contents = ManifestContents::default();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix(';') {
            if let Some(name) = comment.trim().strip_prefix("Algorithm:") {
                let algorithm = ChecksumAlgorithm::from_name(name.trim())
                    .map_err(|e| format!("line {}: {}", index + 1, e))?;
                contents.algorithm = Some(algorithm);
            }
            continue;
        }

        let (checksum, path) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| format!("line {}: expected '<checksum> <path>'", index + 1))?;
        if !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("line {}: '{}' is not a hex digest", index + 1, checksum));
        }
        let key = fs_ops::normalize_key(path.trim());
        if key.is_empty() {
            return Err(format!("line {}: empty path", index + 1));
        }
        if key.split('/').any(|part| part == "..") {
            return Err(format!("line {}: '{}' points outside the data directory", index + 1, path.trim()));
        }
        contents
            .entries
            .entry(key)
            .or_insert_with(|| checksum.to_lowercase());
    }

    Ok(contents)
}

/// A manifest file on disk.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
}

impl Manifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Manifest { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read every entry.
    ///
    /// # Errors
    /// Returns `SourceNotFound` if the manifest does not exist, `ReadError` on
    /// I/O failure, or `MalformedRecord` if a line cannot be parsed.
    pub fn read_all(&self) -> Result<ManifestContents, EngineError> {
        let text = fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                EngineError::SourceNotFound {
                    path: self.path.clone(),
                }
            } else {
                EngineError::ReadError {
                    path: self.path.clone(),
                    source: e,
                }
            }
        })?;
        parse_manifest(&text).map_err(|reason| EngineError::MalformedRecord {
            path: self.path.clone(),
            reason,
        })
    }

    /// Like [`Manifest::read_all`], but a missing manifest reads as empty.
    pub fn read_or_default(&self) -> Result<ManifestContents, EngineError> {
        match self.read_all() {
            Err(EngineError::SourceNotFound { .. }) => Ok(ManifestContents::default()),
            other => other,
        }
    }

    /// Replace the file with `contents`.
    pub fn write(&self, contents: &ManifestContents) -> Result<(), EngineError> {
        fs_ops::write_atomically(&self.path, contents.render().as_bytes())
    }

    /// Merge `records` into the manifest on disk, keeping entries not mentioned.
    ///
    /// Not safe for concurrent callers on the same path; use a
    /// [`ManifestHandle`] when several workers write.
    pub fn merge_write(
        &self,
        algorithm: ChecksumAlgorithm,
        records: &[FileRecord],
    ) -> Result<(), EngineError> {
        let mut contents = self.read_or_default()?;
        contents.merge(algorithm, records)?;
        self.write(&contents)
    }
}

enum Command {
    Upsert {
        records: Vec<FileRecord>,
        reply: Sender<Result<Vec<Option<String>>, EngineError>>,
    },
    Remove {
        paths: Vec<String>,
        reply: Sender<Result<(), EngineError>>,
    },
    Restore {
        entries: Vec<(String, Option<String>)>,
        reply: Sender<Result<(), EngineError>>,
    },
}

/// Cloneable handle to the single writer that owns one manifest file.
#[derive(Clone)]
pub struct ManifestHandle {
    path: PathBuf,
    commands: Sender<Command>,
}

impl ManifestHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge `records` and wait until the manifest has been rewritten.
    ///
    /// Returns, per record, the checksum its path held before the merge.
    pub fn upsert(&self, records: Vec<FileRecord>) -> Result<Vec<Option<String>>, EngineError> {
        self.request(|reply| Command::Upsert { records, reply })
    }

    /// Remove entries for `paths` and wait until the manifest has been rewritten.
    pub fn remove(&self, paths: Vec<String>) -> Result<(), EngineError> {
        self.request(|reply| Command::Remove { paths, reply })
    }

    /// Put back values returned by [`ManifestHandle::upsert`]: `Some` reinstates
    /// the old checksum, `None` drops the entry.
    pub fn restore(&self, entries: Vec<(String, Option<String>)>) -> Result<(), EngineError> {
        self.request(|reply| Command::Restore { entries, reply })
    }

    fn request<T>(
        &self,
        build: impl FnOnce(Sender<Result<T, EngineError>>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let gone = || EngineError::ManifestWriterGone {
            path: self.path.clone(),
        };
        self.commands.send(build(reply_tx)).map_err(|_| gone())?;
        reply_rx.recv().map_err(|_| gone())?
    }
}

fn run_writer(manifest: Manifest, algorithm: ChecksumAlgorithm, commands: Receiver<Command>) {
    // A manifest that cannot be loaded is reported on every request rather than overwritten
    let mut loaded = manifest.read_or_default();

    for command in commands.iter() {
        match command {
            Command::Upsert { records, reply } => {
                let result = apply(&manifest, &mut loaded, |contents| {
                    let previous: Vec<Option<String>> = records
                        .iter()
                        .map(|record| contents.get(&record.relative_path).map(str::to_string))
                        .collect();
                    contents.merge(algorithm, &records)?;
                    Ok((previous, true))
                });
                respond(&manifest, reply, result);
            }
            Command::Remove { paths, reply } => {
                let result = apply(&manifest, &mut loaded, |contents| {
                    Ok(((), contents.remove(&paths) > 0))
                });
                respond(&manifest, reply, result);
            }
            Command::Restore { entries, reply } => {
                let result = apply(&manifest, &mut loaded, |contents| {
                    Ok(((), contents.restore(&entries) > 0))
                });
                respond(&manifest, reply, result);
            }
        }
    }

    debug!(manifest = %manifest.path().display(), "manifest writer finished");
}

/// Run `change` on a copy of the writer's contents and rewrite the file if it
/// reports a change. The in-memory copy only moves forward once the write lands.
fn apply<T>(
    manifest: &Manifest,
    loaded: &mut Result<ManifestContents, EngineError>,
    change: impl FnOnce(&mut ManifestContents) -> Result<(T, bool), EngineError>,
) -> Result<T, EngineError> {
    let contents = match loaded {
        Ok(contents) => contents,
        Err(e) => {
            return Err(EngineError::MalformedRecord {
                path: manifest.path().to_path_buf(),
                reason: e.detailed(),
            })
        }
    };
    let mut updated = contents.clone();
    let (value, changed) = change(&mut updated)?;
    if changed {
        manifest.write(&updated)?;
        *contents = updated;
    }
    Ok(value)
}

fn respond<T>(manifest: &Manifest, reply: Sender<Result<T, EngineError>>, result: Result<T, EngineError>) {
    if let Err(e) = &result {
        warn!(manifest = %manifest.path().display(), error = %e, "manifest update failed");
    }
    // The requester may have gone away; nothing left to tell it
    let _ = reply.send(result);
}

/// Registry of manifest writers for one run, one owner thread per manifest path.
pub struct ManifestWriters {
    algorithm: ChecksumAlgorithm,
    writers: Mutex<HashMap<PathBuf, (ManifestHandle, thread::JoinHandle<()>)>>,
}

impl ManifestWriters {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        ManifestWriters {
            algorithm,
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// Handle for the writer owning `path`, starting it on first use.
    pub fn handle(&self, path: &Path) -> Result<ManifestHandle, EngineError> {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((handle, _)) = writers.get(path) {
            return Ok(handle.clone());
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let manifest = Manifest::new(path);
        let algorithm = self.algorithm;
        let join = thread::Builder::new()
            .name("manifest-writer".to_string())
            .spawn(move || run_writer(manifest, algorithm, rx))
            .map_err(|e| EngineError::WriteError {
                path: path.to_path_buf(),
                source: e,
            })?;

        let handle = ManifestHandle {
            path: path.to_path_buf(),
            commands: tx,
        };
        writers.insert(path.to_path_buf(), (handle.clone(), join));
        Ok(handle)
    }

    /// Stop every writer and wait for pending updates to land.
    ///
    /// Handles still held elsewhere keep their writer alive until dropped.
    pub fn shutdown(self) {
        let writers = self.writers.into_inner().unwrap_or_else(|e| e.into_inner());
        for (path, (handle, join)) in writers {
            drop(handle);
            if join.join().is_err() {
                warn!(manifest = %path.display(), "manifest writer panicked");
            }
        }
    }
}
