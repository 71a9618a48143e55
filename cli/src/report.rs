//! CSV reports and terminal progress for runs.
//!
//! Each run gets its own directory under
//! `<output>/<action>_reports/<YYYY-mm-ddTHHMM>/` holding one CSV file per
//! result category plus `summary.txt` and `summary.json`.

use chrono::Local;
use engine::{ReportSink, ResultRecord, RunSummary};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const CSV_HEADER: &str = "path,size,detail\n";

/// Where and how a run's reports are written.
#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Root output directory
    pub output: PathBuf,
    /// Records buffered before a flush
    pub cache_size: usize,
    /// Prefix for report paths when absolute paths were requested
    pub absolute_base: Option<PathBuf>,
    /// E-mail recipients; listed in the summary only
    pub recipients: Vec<String>,
    /// Show a progress line on stderr
    pub show_progress: bool,
}

/// Report sink writing CSV files and a summary for one run.
pub struct CsvReportSink {
    config: ReportConfig,
    directory: Option<PathBuf>,
    buffer: Vec<ResultRecord>,
    running: Option<RunSummary>,
    total: Option<usize>,
    processed: usize,
    bytes: u64,
    write_failures: usize,
    start_time: Instant,
    last_progress_update: Instant,
}

impl CsvReportSink {
    pub fn new(config: ReportConfig) -> Self {
        let now = Instant::now();
        CsvReportSink {
            config,
            directory: None,
            buffer: Vec::new(),
            running: None,
            total: None,
            processed: 0,
            bytes: 0,
            write_failures: 0,
            start_time: now,
            last_progress_update: now,
        }
    }

    /// Directory this run's reports are written to, once the run has started.
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Number of report writes that failed.
    pub fn write_failures(&self) -> usize {
        self.write_failures
    }

    fn open_directory(&mut self, summary: &RunSummary) -> std::io::Result<PathBuf> {
        let parent = self.config.output.join(summary.action.report_category());
        let stamp = Local::now().format("%Y-%m-%dT%H%M").to_string();
        let mut directory = parent.join(&stamp);
        let mut attempt = 1;
        while directory.exists() {
            attempt += 1;
            directory = parent.join(format!("{}_{}", stamp, attempt));
        }
        fs::create_dir_all(&directory)?;
        Ok(directory)
    }

    fn display_path(&self, record: &ResultRecord) -> String {
        match &self.config.absolute_base {
            Some(base) => base.join(record.relative_path()).display().to_string(),
            None => record.relative_path().to_string(),
        }
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let records = std::mem::take(&mut self.buffer);
        if let Err(e) = self.append_rows(&records) {
            self.write_failures += 1;
            warn!(error = %e, "failed to write report rows");
        }
        if let Some(summary) = self.running.clone() {
            if let Err(e) = self.write_summary_text(&summary) {
                self.write_failures += 1;
                warn!(error = %e, "failed to write summary");
            }
        }
    }

    fn append_rows(&self, records: &[ResultRecord]) -> std::io::Result<()> {
        let directory = match &self.directory {
            Some(directory) => directory,
            None => return Ok(()),
        };
        let mut rows: BTreeMap<&'static str, String> = BTreeMap::new();
        for record in records {
            let path = self.display_path(record);
            let size = record.size().map(|s| s.to_string()).unwrap_or_default();
            let detail = record.detail();
            let row = csv_row(&[path.as_str(), size.as_str(), detail.as_str()]);
            for category in record.categories() {
                rows.entry(category).or_default().push_str(&row);
            }
        }

        for (category, text) in rows {
            let path = directory.join(format!("{}.csv", category));
            let is_new = !path.exists();
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            if is_new {
                file.write_all(CSV_HEADER.as_bytes())?;
            }
            file.write_all(text.as_bytes())?;
        }
        debug!(records = records.len(), "flushed report rows");
        Ok(())
    }

    fn write_summary_text(&self, summary: &RunSummary) -> std::io::Result<()> {
        let directory = match &self.directory {
            Some(directory) => directory,
            None => return Ok(()),
        };
        fs::write(directory.join("summary.txt"), self.summary_text(summary))
    }

    fn summary_text(&self, summary: &RunSummary) -> String {
        let mut text = summary.to_string();
        if !self.config.recipients.is_empty() {
            text.push_str(&format!(
                "\nResults were not e-mailed (delivery not supported): {}\n",
                self.config.recipients.join(", ")
            ));
        }
        text
    }

    fn write_summary_json(&self, summary: &RunSummary) -> std::io::Result<()> {
        let directory = match &self.directory {
            Some(directory) => directory,
            None => return Ok(()),
        };
        let json = serde_json::to_string_pretty(summary).map_err(std::io::Error::other)?;
        fs::write(directory.join("summary.json"), json)
    }

    fn print_progress(&mut self, force: bool) {
        if !self.config.show_progress {
            return;
        }
        // Throttle progress updates to avoid spam (max once per 200ms)
        if !force && self.last_progress_update.elapsed().as_millis() < 200 {
            return;
        }
        self.last_progress_update = Instant::now();

        let counted = match self.total {
            Some(total) => {
                let percent = (self.processed as f64 / total.max(1) as f64 * 100.0) as u32;
                format!("{} {}/{} files", progress_bar(percent.min(100)), self.processed, total)
            }
            None => format!("{} files", self.processed),
        };
        eprint!("\rProgress: {} | {}", counted, format_bytes(self.bytes));
        let _ = std::io::stderr().flush();
    }
}

impl ReportSink for CsvReportSink {
    fn on_run_started(&mut self, summary: &RunSummary, total: Option<usize>) {
        self.total = total;
        self.running = Some(summary.clone());
        self.start_time = Instant::now();
        match self.open_directory(summary) {
            Ok(directory) => self.directory = Some(directory),
            Err(e) => {
                self.write_failures += 1;
                warn!(output = %self.config.output.display(), error = %e, "cannot create report directory");
            }
        }
        for recipient in &self.config.recipients {
            warn!(recipient = %recipient, "e-mail delivery is not supported; results stay on disk");
        }
        if self.config.show_progress {
            eprintln!("{} of {}", summary.action, summary.primary_path);
            if let Some(total) = total {
                eprintln!("  Files to process: {}", total);
            }
        }
    }

    fn record(&mut self, record: &ResultRecord) {
        self.processed += 1;
        self.bytes += record.size().unwrap_or(0);
        if let Some(running) = self.running.as_mut() {
            running.tally(record);
        }
        self.buffer.push(record.clone());
        if self.buffer.len() >= self.config.cache_size.max(1) {
            self.flush();
        }
        self.print_progress(false);
    }

    fn on_run_finished(&mut self, summary: &RunSummary) {
        self.running = Some(summary.clone());
        self.flush();
        self.print_progress(true);
        if self.config.show_progress {
            eprintln!();
            eprintln!("Elapsed: {}", format_duration(self.start_time.elapsed()));
        }

        if let Err(e) = self.write_summary_text(summary) {
            self.write_failures += 1;
            warn!(error = %e, "failed to write summary");
        }
        if let Err(e) = self.write_summary_json(summary) {
            self.write_failures += 1;
            warn!(error = %e, "failed to write summary json");
        }
        if let Some(directory) = &self.directory {
            println!("Reports written to {}", directory.display());
        }
    }
}

/// Quote a field when it holds a separator, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_row(fields: &[&str]) -> String {
    let mut row = fields.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(",");
    row.push('\n');
    row
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

fn progress_bar(percent: u32) -> String {
    let filled = (percent / 5) as usize;
    let empty = 20 - filled;
    format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
}
