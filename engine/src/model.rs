//! Core data model for preservation runs.
//!
//! This module defines the records that flow between the engine and its callers:
//! - FileRecord: one file's checksum under one algorithm
//! - ResultRecord: the per-file result event handed to a `ReportSink`
//! - RunSummary: counts and timing for a whole run

use crate::checksums::ChecksumAlgorithm;
use crate::compare::ComparisonRecord;
use crate::staging::StagingOutcome;
use crate::validate::ValidationStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A checksum computed for one file.
///
/// `relative_path` always uses `/` separators regardless of platform, and
/// `checksum` is stored as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub relative_path: String,
    pub algorithm: ChecksumAlgorithm,
    pub checksum: String,
    /// Size of the hashed file in bytes, when known
    pub size: Option<u64>,
}

impl FileRecord {
    pub fn new(
        relative_path: impl Into<String>,
        algorithm: ChecksumAlgorithm,
        checksum: impl Into<String>,
        size: Option<u64>,
    ) -> Self {
        FileRecord {
            relative_path: relative_path.into(),
            algorithm,
            checksum: checksum.into().to_lowercase(),
            size,
        }
    }
}

/// The operation carried out by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    ValidateTree,
    ValidateManifest,
    CompareTrees,
    CompareManifests,
    Stage,
}

impl Action {
    /// Human-readable description used in summaries
    pub fn description(&self) -> &'static str {
        match self {
            Action::Create => "Checksum creation",
            Action::ValidateTree => "Checksum tree validation",
            Action::ValidateManifest => "Manifest validation",
            Action::CompareTrees => "Checksum tree comparison",
            Action::CompareManifests => "Manifest comparison",
            Action::Stage => "File staging",
        }
    }

    /// Directory name for this action's reports
    pub fn report_category(&self) -> &'static str {
        match self {
            Action::Create => "creation_reports",
            Action::ValidateTree | Action::ValidateManifest => "validation_reports",
            Action::CompareTrees | Action::CompareManifests => "comparison_reports",
            Action::Stage => "staging_reports",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Outcome of checksum creation for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationStatus {
    /// Checksum computed and written to the tree (and manifest, if configured)
    Added(FileRecord),
    /// A sidecar already existed; the file was not rehashed
    Skipped,
    /// Hashing or writing the record failed
    Failed(String),
}

/// A per-file result event.
#[derive(Debug, Clone)]
pub enum ResultRecord {
    Creation {
        relative_path: String,
        status: CreationStatus,
    },
    Validation {
        relative_path: String,
        status: ValidationStatus,
        size: Option<u64>,
    },
    Comparison(ComparisonRecord),
    Staging(StagingOutcome),
}

impl ResultRecord {
    /// Relative path of the file this record describes
    pub fn relative_path(&self) -> &str {
        match self {
            ResultRecord::Creation { relative_path, .. }
            | ResultRecord::Validation { relative_path, .. } => relative_path,
            ResultRecord::Comparison(record) => &record.relative_path,
            ResultRecord::Staging(outcome) => &outcome.relative_path,
        }
    }

    /// Report categories this record belongs to.
    ///
    /// A comparison record lands in one category per distinct non-matching peer
    /// status, so it can appear in several reports at once.
    pub fn categories(&self) -> Vec<&'static str> {
        match self {
            ResultRecord::Creation { status, .. } => vec![match status {
                CreationStatus::Added(_) => "added",
                CreationStatus::Skipped => "skipped",
                CreationStatus::Failed(_) => "failed",
            }],
            ResultRecord::Validation { status, .. } => vec![status.category()],
            ResultRecord::Comparison(record) => record.categories(),
            ResultRecord::Staging(outcome) => vec![outcome.category()],
        }
    }

    /// True when this record counts towards the consecutive-failure threshold.
    ///
    /// Checksum mismatches are reported but never count.
    pub fn is_failure(&self) -> bool {
        match self {
            ResultRecord::Creation { status, .. } => matches!(status, CreationStatus::Failed(_)),
            ResultRecord::Validation { status, .. } => {
                matches!(status, ValidationStatus::Unreadable(_))
            }
            ResultRecord::Comparison(_) => false,
            ResultRecord::Staging(outcome) => !outcome.is_committed(),
        }
    }

    /// Bytes attributed to this record in summary totals
    pub fn size(&self) -> Option<u64> {
        match self {
            ResultRecord::Creation {
                status: CreationStatus::Added(record),
                ..
            } => record.size,
            ResultRecord::Validation { size, .. } => *size,
            ResultRecord::Staging(outcome) => outcome.size,
            _ => None,
        }
    }

    /// Short status text for reports
    pub fn detail(&self) -> String {
        match self {
            ResultRecord::Creation { status, .. } => match status {
                CreationStatus::Added(record) => record.checksum.clone(),
                CreationStatus::Skipped => String::new(),
                CreationStatus::Failed(reason) => reason.clone(),
            },
            ResultRecord::Validation { status, .. } => status.to_string(),
            ResultRecord::Comparison(record) => record.describe_peers(),
            ResultRecord::Staging(outcome) => outcome.describe_destinations(),
        }
    }
}

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Every dispatched file reached a terminal state
    Completed,
    /// The consecutive-failure threshold stopped dispatching early
    Aborted,
}

/// Count and byte total for one report category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryTotals {
    pub count: usize,
    pub bytes: u64,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub action: Action,
    /// Directory, tree or manifest the run was pointed at
    pub primary_path: String,
    pub algorithm: Option<ChecksumAlgorithm>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub files_processed: usize,
    pub totals: BTreeMap<&'static str, CategoryTotals>,
    /// Failure threshold that was in force
    pub max_failures: Option<usize>,
}

impl RunSummary {
    pub fn new(
        id: Uuid,
        action: Action,
        primary_path: impl Into<String>,
        algorithm: Option<ChecksumAlgorithm>,
        max_failures: Option<usize>,
    ) -> Self {
        RunSummary {
            id,
            action,
            primary_path: primary_path.into(),
            algorithm,
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Completed,
            files_processed: 0,
            totals: BTreeMap::new(),
            max_failures,
        }
    }

    /// Fold one result record into the totals.
    pub fn tally(&mut self, record: &ResultRecord) {
        self.files_processed += 1;
        let size = record.size().unwrap_or(0);
        for category in record.categories() {
            let totals = self.totals.entry(category).or_default();
            totals.count += 1;
            totals.bytes += size;
        }
    }

    pub fn count(&self, category: &str) -> usize {
        self.totals.get(category).map(|t| t.count).unwrap_or(0)
    }

    pub fn is_aborted(&self) -> bool {
        self.state == RunState::Aborted
    }

    /// True if anything needs attention: mismatches, missing or failed files.
    pub fn has_problems(&self) -> bool {
        const PROBLEMS: &[&str] = &[
            "failed",
            "invalid",
            "missing",
            "unrecorded",
            "oserror",
            "unmatched",
            "extra",
            "incomplete",
        ];
        PROBLEMS.iter().any(|category| self.count(category) > 0)
    }

    pub(crate) fn finish(&mut self, aborted: bool) {
        self.finished_at = Some(Utc::now());
        if aborted {
            self.state = RunState::Aborted;
        }
    }

    fn headline(&self) -> String {
        match self.action {
            Action::CompareTrees | Action::CompareManifests => {
                if self.count("unmatched") + self.count("missing") + self.count("extra") == 0 {
                    "All checksums matched.".to_string()
                } else {
                    "Checksums do not match on all nodes.".to_string()
                }
            }
            Action::Create => {
                if self.count("failed") > 0 {
                    "Checksums could not be generated for some files.".to_string()
                } else if self.count("added") > 0 {
                    "New files detected.".to_string()
                } else {
                    "No new files detected.".to_string()
                }
            }
            Action::ValidateTree | Action::ValidateManifest => {
                let reference = if self.action == Action::ValidateTree {
                    "checksum tree"
                } else {
                    "manifest"
                };
                if self.count("missing") + self.count("invalid") + self.count("oserror") == 0 {
                    format!("All files in {} correct.", reference)
                } else {
                    format!("Some files could not be validated against {}.", reference)
                }
            }
            Action::Stage => {
                if self.count("staged") == 0 {
                    "No new files staged.".to_string()
                } else {
                    format!("New files added to storage: {}", self.count("staged"))
                }
            }
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} results for {}", self.action, self.primary_path)?;
        if let Some(algorithm) = self.algorithm {
            writeln!(f, "Algorithm: {}", algorithm)?;
        }
        writeln!(f)?;

        if self.is_aborted() {
            writeln!(
                f,
                "RUN INCOMPLETE: processing stopped after {} consecutive failures; \
                 remaining files were not processed.",
                self.max_failures.unwrap_or(0)
            )?;
            writeln!(f)?;
        }

        writeln!(f, "{}", self.headline())?;
        for (category, totals) in &self.totals {
            if totals.bytes == 0 {
                writeln!(f, "  {}: {}", category, totals.count)?;
            } else {
                writeln!(f, "  {}: {} ({} bytes)", category, totals.count, totals.bytes)?;
            }
        }
        writeln!(f)?;

        match self.finished_at {
            Some(finished) => {
                let elapsed = finished.signed_duration_since(self.started_at);
                writeln!(f, "Time taken: {}s", elapsed.num_seconds())
            }
            None => writeln!(
                f,
                "Processing still ongoing, started at: {}",
                self.started_at.format("%Y-%m-%d %H:%M")
            ),
        }
    }
}
