//! mpt - Command-line interface for the fixity engine.
//!
//! Parses arguments into engine options, runs one action, writes reports
//! and maps the outcome to the process exit code.

mod logging;
mod report;

use clap::{ArgAction, Parser, Subcommand};
use engine::config::{DEFAULT_CACHE_SIZE, DEFAULT_MAX_FAILURES, DEFAULT_WORKERS};
use engine::{
    compare_manifests, compare_trees, create_checksums, stage_files, validate_manifest,
    validate_tree, ChecksumAlgorithm, EngineError, RunOptions, RunSummary, StagingPlan,
};
use report::{CsvReportSink, ReportConfig};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Exit code for a run with nothing to report
const EXIT_OK: i32 = 0;
/// Exit code for a run that found mismatches, missing files or failures
const EXIT_PROBLEMS: i32 = 1;
/// Exit code for invalid arguments or configuration
const EXIT_CONFIG: i32 = 2;
/// Exit code for a run stopped by the consecutive-failure threshold
const EXIT_ABORTED: i32 = 3;

/// mpt - Checksum creation, validation, comparison and staging
#[derive(Parser, Debug)]
#[command(name = "mpt")]
#[command(version)]
#[command(about = "Create, validate and compare checksums, and stage files into storage")]
struct Args {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Number of worker threads
    #[arg(short = 'p', long = "num-processes", value_name = "N", default_value_t = DEFAULT_WORKERS, global = true)]
    num_processes: usize,

    /// Addresses to send results to
    #[arg(short = 'e', long = "email-results", value_name = "ADDR", num_args = 1.., global = true)]
    email_results: Vec<String>,

    /// Directory for reports (default: $HOME/mpt)
    #[arg(short, long, value_name = "DIR", global = true)]
    output: Option<PathBuf>,

    /// Do not count files before processing
    #[arg(long, global = true)]
    no_count: bool,

    /// Write absolute paths in reports
    #[arg(long, global = true)]
    absolute_path: bool,

    /// Results buffered before reports are written
    #[arg(long, value_name = "N", default_value_t = DEFAULT_CACHE_SIZE, global = true)]
    cache_size: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute checksums and store them in a checksum tree
    #[command(name = "create")]
    Create {
        /// Directory holding the files
        dir: PathBuf,
        /// Checksum tree root
        #[arg(short = 't', long = "tree", value_name = "TREE")]
        tree: PathBuf,
        /// Checksum algorithm
        #[arg(short, long, default_value = "sha256")]
        algorithm: String,
        /// Only process files ending with these extensions
        #[arg(long, value_name = "EXT", num_args = 1..)]
        formats: Vec<String>,
        /// Also record checksums in this manifest
        #[arg(short, long, value_name = "MANIFEST")]
        manifest: Option<PathBuf>,
        /// Descend into sub-folders
        #[arg(short, long)]
        recursive: bool,
    },

    /// Validate files against a checksum tree
    #[command(name = "validate_tree")]
    ValidateTree {
        dir: PathBuf,
        #[arg(short = 't', long = "tree", value_name = "TREE")]
        tree: PathBuf,
        #[arg(short, long)]
        recursive: bool,
    },

    /// Validate files against a manifest
    #[command(name = "validate_manifest")]
    ValidateManifest {
        dir: PathBuf,
        #[arg(short, long, value_name = "MANIFEST")]
        manifest: PathBuf,
        #[arg(short, long)]
        recursive: bool,
        /// Algorithm for manifests without an algorithm header
        #[arg(short, long, default_value = "sha256")]
        algorithm: String,
    },

    /// Compare a checksum tree against other copies
    #[command(name = "compare_trees")]
    CompareTrees {
        tree: PathBuf,
        #[arg(short = 't', long = "trees", value_name = "TREE", num_args = 1.., required = true)]
        others: Vec<PathBuf>,
    },

    /// Compare a manifest against other copies
    #[command(name = "compare_manifests")]
    CompareManifests {
        manifest: PathBuf,
        #[arg(short = 'm', long = "manifests", value_name = "MANIFEST", num_args = 1.., required = true)]
        others: Vec<PathBuf>,
    },

    /// Move files from a staging directory into one or more destinations
    #[command(name = "stage")]
    Stage {
        /// Staging directory
        dir: PathBuf,
        #[arg(short, long = "destinations", value_name = "DIR", num_args = 1.., required = true)]
        destinations: Vec<PathBuf>,
        #[arg(short, long, default_value = "sha256")]
        algorithm: String,
        /// One checksum tree per destination (default: <dest>/checksums)
        #[arg(short = 't', long = "trees", value_name = "TREE", num_args = 1..)]
        trees: Vec<PathBuf>,
        /// One manifest per destination
        #[arg(short = 'm', long = "manifests", value_name = "MANIFEST", num_args = 1..)]
        manifests: Vec<PathBuf>,
        /// Stop after this many consecutive failures
        #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_FAILURES)]
        max_failures: usize,
        /// Do not ask before staging
        #[arg(long)]
        no_confirm: bool,
        /// Keep emptied folders in the staging directory
        #[arg(long)]
        keep_staging_folders: bool,
    },
}

fn main() {
    let args = Args::parse();

    if let Err(msg) = logging::init_logging(args.verbose) {
        eprintln!("Warning: {}", msg);
    }

    let code = match run_cli(&args) {
        Ok(Some(summary)) => {
            println!();
            print!("{}", summary);
            exit_code(&summary)
        }
        Ok(None) => EXIT_OK,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            EXIT_CONFIG
        }
    };

    std::process::exit(code);
}

/// Map a finished run to the process exit code.
fn exit_code(summary: &RunSummary) -> i32 {
    if summary.is_aborted() {
        EXIT_ABORTED
    } else if summary.has_problems() {
        EXIT_PROBLEMS
    } else {
        EXIT_OK
    }
}

fn parse_algorithm(name: &str) -> Result<ChecksumAlgorithm, String> {
    ChecksumAlgorithm::from_name(name).map_err(|e| e.to_string())
}

fn default_output() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join("mpt"),
        None => PathBuf::from("mpt"),
    }
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn report_config(args: &Args, base: &Path) -> ReportConfig {
    ReportConfig {
        output: args.output.clone().unwrap_or_else(default_output),
        cache_size: args.cache_size,
        absolute_base: args.absolute_path.then(|| absolute(base)),
        recipients: args.email_results.clone(),
        show_progress: true,
    }
}

fn engine_error(e: EngineError) -> String {
    if e.is_configuration() {
        e.to_string()
    } else {
        e.detailed()
    }
}

/// Ask a yes/no question; anything but `y`/`yes` is a no.
fn confirm(question: &str, input: &mut impl BufRead) -> bool {
    eprint!("{} [y/N] ", question);
    let _ = io::stderr().flush();
    let mut answer = String::new();
    if input.read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn describe_plan(plan: &StagingPlan) -> String {
    let mut text = format!("Staging files from {}\n", plan.staging_root.display());
    for (i, destination) in plan.destinations.iter().enumerate() {
        text.push_str(&format!("  -> {}", destination.display()));
        if let Some(tree) = plan.tree(i) {
            text.push_str(&format!(" (tree {})", tree.display()));
        }
        if let Some(manifest) = plan.manifest(i) {
            text.push_str(&format!(" (manifest {})", manifest.display()));
        }
        text.push('\n');
    }
    text
}

/// Main CLI logic - separated for testability
///
/// Returns `None` when the user declined to stage.
fn run_cli(args: &Args) -> Result<Option<RunSummary>, String> {
    run_cli_with_input(args, &mut io::stdin().lock())
}

fn run_cli_with_input(args: &Args, input: &mut impl BufRead) -> Result<Option<RunSummary>, String> {
    let mut options = RunOptions {
        workers: args.num_processes,
        count_files: !args.no_count,
        ..RunOptions::default()
    };

    let (summary, sink) = match &args.command {
        Command::Create {
            dir,
            tree,
            algorithm,
            formats,
            manifest,
            recursive,
        } => {
            options.algorithm = parse_algorithm(algorithm)?;
            options.recursive = *recursive;
            if !formats.is_empty() {
                options.formats = Some(formats.clone());
            }
            let mut sink = CsvReportSink::new(report_config(args, dir));
            let summary = create_checksums(dir, tree, manifest.as_deref(), &options, &mut sink)
                .map_err(engine_error)?;
            (summary, sink)
        }
        Command::ValidateTree { dir, tree, recursive } => {
            options.recursive = *recursive;
            let mut sink = CsvReportSink::new(report_config(args, dir));
            let summary = validate_tree(dir, tree, &options, &mut sink).map_err(engine_error)?;
            (summary, sink)
        }
        Command::ValidateManifest {
            dir,
            manifest,
            recursive,
            algorithm,
        } => {
            options.algorithm = parse_algorithm(algorithm)?;
            options.recursive = *recursive;
            let mut sink = CsvReportSink::new(report_config(args, dir));
            let summary = validate_manifest(dir, manifest, &options, &mut sink).map_err(engine_error)?;
            (summary, sink)
        }
        Command::CompareTrees { tree, others } => {
            options.recursive = true;
            let mut sink = CsvReportSink::new(report_config(args, tree));
            let summary = compare_trees(tree, others, &options, &mut sink).map_err(engine_error)?;
            (summary, sink)
        }
        Command::CompareManifests { manifest, others } => {
            let base = manifest.parent().unwrap_or_else(|| Path::new("."));
            let mut sink = CsvReportSink::new(report_config(args, base));
            let summary = compare_manifests(manifest, others, &options, &mut sink).map_err(engine_error)?;
            (summary, sink)
        }
        Command::Stage {
            dir,
            destinations,
            algorithm,
            trees,
            manifests,
            max_failures,
            no_confirm,
            keep_staging_folders,
        } => {
            options.algorithm = parse_algorithm(algorithm)?;
            options.recursive = true;
            options.max_failures = Some(*max_failures);
            options.keep_staging_folders = *keep_staging_folders;

            let plan = if trees.is_empty() {
                StagingPlan::with_default_layout(dir, destinations)
            } else {
                StagingPlan::new(dir, destinations.clone()).with_trees(trees.clone())
            }
            .with_manifests(manifests.clone());
            options.validate().map_err(engine_error)?;
            plan.validate().map_err(engine_error)?;

            if !*no_confirm {
                eprint!("{}", describe_plan(&plan));
                if !confirm("Proceed?", input) {
                    eprintln!("Staging cancelled.");
                    return Ok(None);
                }
            }

            let mut sink = CsvReportSink::new(report_config(args, dir));
            let summary = stage_files(&plan, &options, &mut sink).map_err(engine_error)?;
            (summary, sink)
        }
    };

    if sink.write_failures() > 0 {
        warn!(failures = sink.write_failures(), "some reports could not be written");
    }
    Ok(Some(summary))
}
