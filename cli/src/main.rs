//! restore - Command-line interface for the restore engine.
//!
//! Thin glue over the engine: argument parsing, logging setup and printing.
//! `restore restore` exits 0 when the restore succeeded and verified, 1
//! otherwise.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use restore_engine::{
    format_bytes, ChecksumAlgorithm, RestoreConfig, RestoreEngine, RestoreObserver,
    RestoreOperation, RestoreStatus, RetentionManager,
};
use tracing_subscriber::EnvFilter;

/// Restore build targets from verified backups
#[derive(Parser, Debug)]
#[command(name = "restore")]
#[command(version)]
#[command(about = "Restore build target directories from verified backups")]
struct Cli {
    /// Directory holding restoration points and target locks
    #[arg(
        long,
        value_name = "PATH",
        env = "RESTORE_POINTS_DIR",
        default_value = ".restore-points",
        global = true
    )]
    points_dir: PathBuf,

    /// Directory receiving JSON report artifacts
    #[arg(long, value_name = "PATH", env = "RESTORE_REPORTS_DIR", global = true)]
    reports_dir: Option<PathBuf>,

    /// Digest algorithm for new restoration points: md5, sha256, blake3
    #[arg(
        long,
        value_name = "ALGORITHM",
        default_value = "sha256",
        value_parser = parse_algorithm,
        global = true
    )]
    algorithm: ChecksumAlgorithm,

    /// Gzip level (0-9) for restoration point archives
    #[arg(
        long,
        value_name = "LEVEL",
        default_value_t = 6,
        value_parser = clap::value_parser!(u32).range(0..=9),
        global = true
    )]
    compression_level: u32,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify a backup, checkpoint the target, restore and verify the result
    Restore {
        /// Backup directory
        backup: PathBuf,

        /// Directory to restore into
        target: PathBuf,
    },

    /// List restoration points, oldest first
    List,

    /// Delete restoration points older than the given age
    Cleanup {
        /// Maximum age in days
        #[arg(long, value_name = "DAYS")]
        max_age_days: u32,
    },

    /// Compare a target with what a backup restores to, without restoring
    Report {
        /// Backup directory
        backup: PathBuf,

        /// Directory to compare
        target: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Restore a target from a restoration point
    Rollback {
        /// Restoration point id (see `list`)
        #[arg(required_unless_present = "latest", conflicts_with = "latest")]
        point: Option<String>,

        /// Roll back this target to its newest restoration point
        #[arg(long, value_name = "TARGET")]
        latest: Option<PathBuf>,
    },
}

fn parse_algorithm(s: &str) -> Result<ChecksumAlgorithm, String> {
    ChecksumAlgorithm::parse(s).ok_or_else(|| {
        format!(
            "Invalid hash algorithm '{}'. Must be 'md5', 'sha256', or 'blake3'",
            s
        )
    })
}

/// CLI implementation of RestoreObserver printing stage progress to stderr
struct CliProgress {
    verbose: bool,
    start_time: Instant,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
        }
    }

    fn format_duration(elapsed: std::time::Duration) -> String {
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
}

impl RestoreObserver for CliProgress {
    fn on_stage(&self, operation: &RestoreOperation, stage: RestoreStatus) {
        match stage {
            RestoreStatus::Verifying => {
                eprintln!("Restoring {}", operation.backup_path.display());
                eprintln!("  Target: {}", operation.target_dir.display());
                eprintln!("Verifying backup...");
            }
            RestoreStatus::Checkpointing => {
                if let Some(backup_type) = &operation.backup_type {
                    eprintln!("  Type: {}", backup_type);
                }
                eprintln!("Creating restoration point...");
            }
            RestoreStatus::Applying => {
                if let Some(point) = &operation.restoration_point {
                    eprintln!("  Restoration point: {}", point);
                }
                eprintln!("Applying backup...");
            }
            RestoreStatus::VerifyingResult => {
                eprintln!("Verifying restored tree...");
            }
            _ => {}
        }
        if self.verbose {
            eprintln!("  [{}]", stage);
        }
    }

    fn on_completed(&self, operation: &RestoreOperation) {
        eprintln!();
        if operation.succeeded() {
            eprintln!("Restore complete!");
            eprintln!(
                "Restored: {} files, {}",
                operation.files_restored,
                format_bytes(operation.bytes_restored)
            );
        } else {
            eprintln!(
                "Restore failed at stage {}",
                operation
                    .failed_stage
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );
            if let Some(point) = &operation.restoration_point {
                eprintln!("Target was modified. Roll back with: restore rollback {}", point);
            }
        }
        eprintln!("Verification: {}", operation.verification);
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Parse arguments, then run the selected command
fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let exit_code = match run_cli(&cli) {
        Ok(()) => 0,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            1
        }
    };

    std::process::exit(exit_code);
}

fn build_config(cli: &Cli) -> RestoreConfig {
    let mut config = RestoreConfig::new(&cli.points_dir)
        .with_algorithm(cli.algorithm)
        .with_compression_level(cli.compression_level);
    if let Some(reports_dir) = &cli.reports_dir {
        config = config.with_reports_dir(reports_dir);
    }
    config
}

/// Main CLI logic - separated for testability
fn run_cli(cli: &Cli) -> Result<(), String> {
    let config = build_config(cli);

    match &cli.command {
        Command::Restore { backup, target } => run_restore(&config, backup, target, cli.verbose),
        Command::List => run_list(&config),
        Command::Cleanup { max_age_days } => run_cleanup(&config, *max_age_days),
        Command::Report {
            backup,
            target,
            json,
        } => run_report(&config, backup, target, *json),
        Command::Rollback { point, latest } => {
            run_rollback(&config, point.as_deref(), latest.as_deref())
        }
    }
}

fn run_restore(
    config: &RestoreConfig,
    backup: &Path,
    target: &Path,
    verbose: bool,
) -> Result<(), String> {
    let engine = RestoreEngine::new(config.clone());
    let progress = CliProgress::new(verbose);

    let mut operation = RestoreOperation::new(backup, target);
    let result = engine.run(&mut operation, Some(&progress));

    match engine.reporter().emit(&operation) {
        Ok(report) => {
            if let Some(path) = engine.reporter().artifact_path(report.operation_id) {
                eprintln!("Report: {}", path.display());
            }
        }
        Err(e) => eprintln!("Warning: could not write report: {}", e),
    }

    result.map_err(|e| e.to_string())
}

fn run_list(config: &RestoreConfig) -> Result<(), String> {
    let engine = RestoreEngine::new(config.clone());
    let points = engine
        .points()
        .list_sorted()
        .map_err(|e| format!("Listing failed: {}", e))?;

    if points.is_empty() {
        println!("No restoration points in {}", config.points_dir.display());
        return Ok(());
    }

    println!("{:<28} {:<24} {:>12}  TARGET", "ID", "TIMESTAMP", "SIZE");
    for point in &points {
        println!(
            "{:<28} {:<24} {:>12}  {}",
            point.id,
            point.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            format_bytes(point.size_on_disk),
            point.target.display()
        );
    }
    let total: u64 = points.iter().map(|p| p.size_on_disk).sum();
    println!();
    println!("{} restoration points, {}", points.len(), format_bytes(total));
    Ok(())
}

fn run_cleanup(config: &RestoreConfig, max_age_days: u32) -> Result<(), String> {
    let summary = RetentionManager::new(config.clone())
        .prune(max_age_days)
        .map_err(|e| format!("Cleanup failed: {}", e))?;

    for point in &summary.removed {
        println!("Removed {} ({})", point.id, point.target.display());
    }
    for path in &summary.orphans_removed {
        println!("Removed orphaned {}", path.display());
    }
    println!(
        "Removed {} restoration points ({}), kept {}",
        summary.removed.len(),
        format_bytes(summary.bytes_freed()),
        summary.kept.len()
    );

    if summary.is_clean() {
        Ok(())
    } else {
        for failure in &summary.failed {
            eprintln!("  {}: {}", failure.point.id, failure.reason);
        }
        Err(format!("{} restoration points could not be removed", summary.failed.len()))
    }
}

fn run_report(
    config: &RestoreConfig,
    backup: &Path,
    target: &Path,
    json: bool,
) -> Result<(), String> {
    let engine = RestoreEngine::new(config.clone());
    let report = engine
        .reporter()
        .inspect(backup, target)
        .map_err(|e| format!("Report failed: {}", e))?;

    if json {
        let text = report
            .to_json()
            .map_err(|e| format!("Report serialization failed: {}", e))?;
        println!("{}", text);
    } else {
        print!("{}", report);
    }
    Ok(())
}

fn run_rollback(
    config: &RestoreConfig,
    point: Option<&str>,
    latest: Option<&Path>,
) -> Result<(), String> {
    let engine = RestoreEngine::new(config.clone());
    let outcome = match (point, latest) {
        (Some(id), _) => engine.points().rollback(id),
        (None, Some(target)) => engine.points().rollback_latest(target),
        (None, None) => {
            return Err("Either a point id or --latest <TARGET> is required".to_string())
        }
    }
    .map_err(|e| e.to_string())?;

    println!(
        "Rolled back {} to {} ({} files, {})",
        outcome.point.target.display(),
        outcome.point.id,
        outcome.stats.files,
        format_bytes(outcome.stats.bytes)
    );
    Ok(())
}
