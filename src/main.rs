//! treemirror - one-way directory tree mirroring.
//!
//! Usage:
//!   treemirror mirror SOURCE TARGET   Make TARGET an exact copy of SOURCE
//!   treemirror config FILE            Run every job of a JSON job file
//!   treemirror --help                 Show help

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use treemirror_core::{IgnoreFilter, JobConfig, QueueKind, SyncJob};
use treemirror_engine::{ReplicationEngine, StatsSnapshot};
use treemirror_fs::LocalFs;

#[derive(Parser)]
#[command(
    name = "treemirror",
    version,
    about = "One-way directory tree mirroring",
    long_about = "treemirror makes a target directory an exact copy of a source directory.\n\n\
                  Files and directories only in the source are created, files that differ \
                  are overwritten and everything only in the target is deleted. Both roots \
                  must contain an identical sync.txt starting with \"SyncID:\"."
)]
struct Cli {
    /// Log filter, e.g. "debug" or "treemirror_engine=trace" (overrides RUST_LOG)
    #[arg(long, global = true, value_name = "FILTER")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mirror a source directory onto a target directory
    Mirror {
        /// Directory to copy from
        source: PathBuf,

        /// Directory to make identical to the source
        target: PathBuf,

        /// Ignore files with this exact name (case-insensitive, repeatable)
        #[arg(long, value_name = "NAME")]
        ignore_file: Vec<String>,

        /// Ignore files whose whole name matches this regex (repeatable)
        #[arg(long, value_name = "REGEX")]
        ignore_file_regex: Vec<String>,

        /// Ignore directories with this exact name (case-insensitive, repeatable)
        #[arg(long, value_name = "NAME")]
        ignore_dir: Vec<String>,

        /// Ignore directories whose whole name matches this regex (repeatable)
        #[arg(long, value_name = "REGEX")]
        ignore_dir_regex: Vec<String>,

        /// Copy attribute changes onto otherwise unchanged files
        #[arg(short = 'a', long)]
        sync_attributes: bool,

        /// Print every change as it happens
        #[arg(short, long)]
        verbose: bool,

        /// Run everything on a single thread
        #[arg(long)]
        sequential: bool,

        /// Number of worker threads (0 = one per CPU)
        #[arg(short = 'j', long, default_value = "0")]
        threads: usize,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Run every source/target pair of a JSON job file
    Config {
        /// Path to the job file
        file: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Result of one job, as printed in JSON output.
#[derive(Serialize)]
struct JobReport {
    source: PathBuf,
    target: PathBuf,
    stats: StatsSnapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref())?;

    match cli.command {
        Command::Mirror {
            source,
            target,
            ignore_file,
            ignore_file_regex,
            ignore_dir,
            ignore_dir_regex,
            sync_attributes,
            verbose,
            sequential,
            threads,
            format,
        } => {
            let mut ignore = IgnoreFilter::new();
            for name in &ignore_file {
                ignore.ignore_file_name(name);
            }
            for pattern in &ignore_file_regex {
                ignore.ignore_file_regex(pattern)?;
            }
            for name in &ignore_dir {
                ignore.ignore_dir_name(name);
            }
            for pattern in &ignore_dir_regex {
                ignore.ignore_dir_regex(pattern)?;
            }

            let job = SyncJob::builder()
                .source(source)
                .target(target)
                .ignore(ignore)
                .sync_attributes(sync_attributes)
                .verbose(verbose)
                .queue(if sequential {
                    QueueKind::Inline
                } else {
                    QueueKind::Pooled
                })
                .threads(threads)
                .build()
                .context("Invalid job")?;

            run_jobs(vec![job], format).await?;
        }
        Command::Config { file, format } => {
            let config = JobConfig::load(&file)
                .with_context(|| format!("Failed to load job file {}", file.display()))?;
            let jobs = config.jobs().context("Invalid job file")?;
            run_jobs(jobs, format).await?;
        }
    }

    Ok(())
}

/// Install the stderr log subscriber.
fn init_logging(filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(filter) => EnvFilter::try_new(filter).context("Invalid log filter")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}

/// Run jobs one after another, stopping at the first failure.
async fn run_jobs(jobs: Vec<SyncJob>, format: OutputFormat) -> Result<()> {
    let mut reports = Vec::with_capacity(jobs.len());

    for job in jobs {
        let (source, target) = (job.source.clone(), job.target.clone());
        eprintln!("Mirroring {} -> {}", source.display(), target.display());

        let stats = run_job(job, format).await?;
        if format == OutputFormat::Text {
            println!("{stats}");
            println!();
        }
        reports.push(JobReport {
            source,
            target,
            stats,
        });
    }

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    Ok(())
}

/// Run one job on a blocking thread while forwarding its progress to the console.
async fn run_job(job: SyncJob, format: OutputFormat) -> Result<StatsSnapshot> {
    let (source, target) = (job.source.clone(), job.target.clone());
    let engine = ReplicationEngine::new(job, LocalFs::new()).context("Failed to start replication")?;

    let mut changes = engine.subscribe_changes();
    let changes_task = tokio::spawn(async move {
        while let Some(change) = changes.recv().await {
            match format {
                OutputFormat::Text => println!("{change}"),
                OutputFormat::Json => eprintln!("{change}"),
            }
        }
    });

    let live = std::io::stderr().is_terminal();
    let mut progress = engine.subscribe_progress();
    let progress_task = tokio::spawn(async move {
        loop {
            match progress.recv().await {
                Ok(snapshot) if live => eprint!(
                    "\r{} changed, {} skipped, {} queued, {:.0} items/s   ",
                    snapshot.changed(),
                    snapshot.skipped(),
                    snapshot.queue_depth,
                    snapshot.rate(snapshot.total())
                ),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
        if live {
            eprint!("\r\x1b[2K");
        }
    });

    let outcome = tokio::task::spawn_blocking(move || engine.run())
        .await
        .context("Replication task panicked")?;

    // The channels close once the engine is gone
    let _ = changes_task.await;
    let _ = progress_task.await;

    match outcome {
        Ok(stats) => Ok(stats),
        Err(failure) => {
            if !failure.stats.is_empty() {
                eprintln!("{}", failure.stats);
            }
            Err(failure).with_context(|| {
                format!("Mirroring {} to {} failed", source.display(), target.display())
            })
        }
    }
}
