//! Result reporting trait.
//!
//! This module defines the ReportSink trait, which decouples the engine from
//! whatever persists or displays results (CSV reports, a terminal, tests).
//!
//! Records arrive in completion order, which need not match enumeration order.

use crate::model::{ResultRecord, RunSummary};

/// Receives per-file results from a run.
///
/// All methods are called on the thread that started the run. Batching and
/// flushing are the sink's concern; the engine hands over each record as soon
/// as a worker produces it.
pub trait ReportSink {
    /// Called once before any file is processed.
    ///
    /// `total` is the number of files to process, when it was counted.
    fn on_run_started(&mut self, _summary: &RunSummary, _total: Option<usize>) {}

    /// Called once per processed file.
    fn record(&mut self, record: &ResultRecord);

    /// Called once after the last record, with the final summary.
    fn on_run_finished(&mut self, _summary: &RunSummary) {}
}

impl<S: ReportSink + ?Sized> ReportSink for &mut S {
    fn on_run_started(&mut self, summary: &RunSummary, total: Option<usize>) {
        (**self).on_run_started(summary, total)
    }

    fn record(&mut self, record: &ResultRecord) {
        (**self).record(record)
    }

    fn on_run_finished(&mut self, summary: &RunSummary) {
        (**self).on_run_finished(summary)
    }
}

/// Sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub total: Option<usize>,
    pub records: Vec<ResultRecord>,
    pub summary: Option<RunSummary>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records in a given report category
    pub fn in_category(&self, category: &str) -> Vec<&ResultRecord> {
        self.records
            .iter()
            .filter(|r| r.categories().contains(&category))
            .collect()
    }

    /// Find the record for a relative path.
    pub fn find(&self, relative_path: &str) -> Option<&ResultRecord> {
        self.records
            .iter()
            .find(|r| r.relative_path() == relative_path)
    }
}

impl ReportSink for CollectingSink {
    fn on_run_started(&mut self, _summary: &RunSummary, total: Option<usize>) {
        self.total = total;
    }

    fn record(&mut self, record: &ResultRecord) {
        self.records.push(record.clone());
    }

    fn on_run_finished(&mut self, summary: &RunSummary) {
        self.summary = Some(summary.clone());
    }
}
