//! AlphaLake CLI — update, status and plan commands.
//!
//! Commands:
//! - `update`: run full or incremental partition rebuilds for the selected tasks
//! - `status`: report datasets, partition counts and sizes under the lake root
//! - `plan`: dry run: show each asset's partitions and fetch window

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use alphalake_core::data::{PartitionPlanner, PartitionWriter, Universe, SCHEMA_VERSION};
use alphalake_core::domain::{PartitionKey, RunMode};
use alphalake_runner::{
    resolve_tasks, AssetOutcome, AssetStatus, LakeConfig, Orchestrator, RunManifest, RunProgress,
    RunReport, SourceBreakers, Task, TaskSelector, TaskSpec,
};

#[derive(Parser)]
#[command(name = "lake", about = "AlphaLake: A-share data lake partition-overwrite updater")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild partitions for the selected tasks.
    Update {
        /// full: every year since listing. update: the current year only.
        #[arg(long, default_value = "update")]
        mode: RunMode,

        /// all, stock, index, etf, concept, finance, alt or alt_<series>.
        #[arg(long, default_value = "all")]
        task: String,

        /// Lake config file.
        #[arg(long, default_value = "lake.toml")]
        config: PathBuf,

        /// Run date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        as_of: Option<String>,

        /// Worker pool size. Overrides the config file.
        #[arg(long)]
        workers: Option<usize>,

        /// Write the run manifest and report as JSON to this path.
        #[arg(long)]
        report: Option<PathBuf>,

        /// Debug logging.
        #[arg(long, short, default_value_t = false)]
        verbose: bool,
    },
    /// Report datasets, partitions and sizes under the lake root.
    Status {
        /// Lake config file.
        #[arg(long, default_value = "lake.toml")]
        config: PathBuf,
    },
    /// Show what an update would rebuild, without fetching or writing.
    Plan {
        #[arg(long, default_value = "update")]
        mode: RunMode,

        #[arg(long, default_value = "all")]
        task: String,

        #[arg(long)]
        as_of: Option<String>,

        #[arg(long, default_value = "lake.toml")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Update {
            mode,
            task,
            config,
            as_of,
            workers,
            report,
            verbose,
        } => {
            init_logging(verbose);
            run_update(mode, &task, &config, as_of.as_deref(), workers, report.as_deref())
        }
        Commands::Status { config } => {
            init_logging(false);
            run_status(&config)
        }
        Commands::Plan {
            mode,
            task,
            as_of,
            config,
        } => {
            init_logging(false);
            run_plan(mode, &task, as_of.as_deref(), &config)
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config file, or fall back to defaults when the default path is absent.
fn load_config(path: &Path) -> Result<LakeConfig> {
    if !path.exists() && path == Path::new("lake.toml") {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(LakeConfig::default());
    }
    LakeConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

fn load_universe(config: &LakeConfig) -> Result<Universe> {
    let path = config.universe_path();
    Universe::from_file(&path).with_context(|| format!("loading universe {}", path.display()))
}

fn parse_as_of(as_of: Option<&str>) -> Result<NaiveDate> {
    Ok(as_of
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()
        .context("--as-of must be YYYY-MM-DD")?
        .unwrap_or_else(|| chrono::Local::now().date_naive()))
}

fn resolve(config: &LakeConfig, task: &str) -> Result<Vec<TaskSpec>> {
    let selector: TaskSelector = task.parse()?;
    let universe = load_universe(config)?;
    Ok(resolve_tasks(config, &universe, &selector)?)
}

fn run_update(
    mode: RunMode,
    task: &str,
    config_path: &Path,
    as_of: Option<&str>,
    workers: Option<usize>,
    report_path: Option<&Path>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(n) = workers {
        config.workers = n.max(1);
    }
    let today = parse_as_of(as_of)?;
    let specs = resolve(&config, task)?;

    let mut breakers = SourceBreakers::default();
    let tasks: Vec<Task> = specs
        .iter()
        .map(|spec| spec.connect(&mut breakers))
        .collect::<Result<_, _>>()
        .context("opening sources")?;

    info!(data_dir = %config.data_dir().display(), "lake root");
    let orchestrator = Orchestrator::from_config(&config);
    install_interrupt_handler(orchestrator.cancel_flag())?;
    let manifest = orchestrator.run(mode, &tasks, today, &StdoutProgress::default())?;
    let report = manifest.report();

    print_summary(&report);
    print_failures(&manifest);

    if let Some(path) = report_path {
        write_report(path, &manifest, &report)?;
        println!("Report saved to: {}", path.display());
    }

    if config.failure_policy.should_fail(&report) {
        eprintln!(
            "{} of {} assets failed (policy: max_failed={}, max_failed_ratio={:?})",
            report.failed, report.total, config.failure_policy.max_failed, config.failure_policy.max_failed_ratio
        );
        std::process::exit(1);
    }
    Ok(())
}

/// First Ctrl-C stops the run between assets; a second one exits at once.
fn install_interrupt_handler(cancel: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        if request_cancel(&cancel) {
            eprintln!("Interrupted again, exiting");
            std::process::exit(130);
        }
        eprintln!("Interrupt received: finishing in-flight assets, skipping the rest (Ctrl-C again to abort)");
    })
    .context("installing Ctrl-C handler")
}

/// Raise the cancel flag. Returns true if it was already raised.
fn request_cancel(cancel: &AtomicBool) -> bool {
    cancel.swap(true, Ordering::Relaxed)
}

fn write_report(path: &Path, manifest: &RunManifest, report: &RunReport) -> Result<()> {
    let json = serde_json::json!({
        "report": report,
        "manifest": manifest,
    });
    let content = serde_json::to_string_pretty(&json)?;
    std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))
}

fn print_summary(report: &RunReport) {
    println!();
    println!("Run: {} as of {} ({} ms)", report.mode.as_str(), report.as_of, report.elapsed_ms);
    println!(
        "{:<20} {:>7} {:>9} {:>7} {:>8} {:>11} {:>10}",
        "Task", "Assets", "Succeeded", "Failed", "Skipped", "Partitions", "Rows"
    );
    println!("{}", "-".repeat(78));
    for t in &report.tasks {
        println!(
            "{:<20} {:>7} {:>9} {:>7} {:>8} {:>11} {:>10}",
            t.task, t.total, t.succeeded, t.failed, t.skipped, t.partitions_written, t.rows_written
        );
    }
    println!("{}", "-".repeat(78));
    println!(
        "{:<20} {:>7} {:>9} {:>7} {:>8}",
        "Total", report.total, report.succeeded, report.failed, report.skipped
    );
}

fn print_failures(manifest: &RunManifest) {
    let failures: Vec<&AssetOutcome> = manifest.failures().collect();
    if failures.is_empty() {
        return;
    }
    println!();
    println!("Failed assets:");
    for o in failures {
        if let AssetStatus::Failed { stage, error } = &o.status {
            println!("  {:<16} {:<12} [{stage}] {error}", o.task, o.code);
        }
    }
}

/// Prints one line per finished asset.
#[derive(Default)]
struct StdoutProgress {
    total: AtomicUsize,
    done: AtomicUsize,
}

impl RunProgress for StdoutProgress {
    fn on_task_start(&self, task: &str, assets: usize) {
        self.total.store(assets, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
        println!("Task {task}: {assets} assets");
    }

    fn on_asset_complete(&self, outcome: &AssetOutcome) {
        let n = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.total.load(Ordering::Relaxed);
        let status = match &outcome.status {
            AssetStatus::Succeeded => format!(
                "OK ({} rows, {} partitions)",
                outcome.rows_written,
                outcome.partitions_written.len()
            ),
            AssetStatus::Failed { stage, .. } => format!("FAILED at {stage}"),
            AssetStatus::Skipped { reason } => format!("skipped: {reason}"),
        };
        println!("  [{n}/{total}] {:<14} {status}", outcome.code);
    }
}

fn run_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let root = config.data_dir();
    if !root.exists() {
        println!("Lake directory does not exist: {}", root.display());
        return Ok(());
    }

    let writer = PartitionWriter::new(&root);
    let stats = writer.stats()?;
    if stats.is_empty() {
        println!("Lake is empty: {}", root.display());
        return Ok(());
    }

    let total_size: u64 = stats.iter().map(|s| s.bytes).sum();
    println!("Lake: {}", root.display());
    println!("Schema version: {SCHEMA_VERSION}");
    println!("Datasets: {}", stats.len());
    println!("Total size: {}", format_size(total_size));
    println!();
    println!(
        "{:<24} {:<12} {:>10} {:>8} {:>10}",
        "Dataset", "Years", "Partitions", "Files", "Size"
    );
    println!("{}", "-".repeat(68));
    for s in &stats {
        let years = match (s.first_year, s.last_year) {
            (Some(a), Some(b)) => format!("{a}-{b}"),
            _ => "-".to_string(),
        };
        println!(
            "{:<24} {:<12} {:>10} {:>8} {:>10}",
            s.name,
            years,
            s.partitions,
            s.files,
            format_size(s.bytes)
        );
        if s.quarantined > 0 {
            println!("  {} quarantined file(s)", s.quarantined);
        }
    }
    Ok(())
}

fn run_plan(mode: RunMode, task: &str, as_of: Option<&str>, config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let today = parse_as_of(as_of)?;
    let specs = resolve(&config, task)?;
    let planner = PartitionPlanner::new(config.full_start_date);

    println!("Plan: {} as of {today}", mode.as_str());
    for spec in &specs {
        println!();
        println!("Task {} → {} ({} assets)", spec.name(), spec.dataset, spec.assets.len());
        for (i, source) in spec.sources.iter().enumerate() {
            println!("  pass {}: {}", i + 1, source.describe());
        }
        println!("  {:<16} {:<24} {}", "Code", "Window", "Partitions");
        for asset in &spec.assets {
            let plan = planner.plan(mode, spec.dataset.data_type(), asset, today);
            let keys: Vec<PartitionKey> = plan.keys.iter().copied().collect();
            let window = if plan.is_empty() {
                "-".to_string()
            } else {
                plan.window.to_string()
            };
            println!("  {:<16} {:<24} {}", asset.code, window, describe_keys(&keys));
        }
    }
    Ok(())
}

/// `year=2025`, or `year=2012..2025 (14)` for a contiguous run.
fn describe_keys(keys: &[PartitionKey]) -> String {
    match keys {
        [] => "(none)".to_string(),
        [only] => only.dir_name(),
        [first, .., last] if last.year() - first.year() + 1 == keys.len() as i32 => {
            format!("year={}..{} ({})", first.year(), last.year(), keys.len())
        }
        _ => keys.iter().map(PartitionKey::dir_name).collect::<Vec<_>>().join(","),
    }
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
