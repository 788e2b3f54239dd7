//! Job configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::ignore::IgnoreFilter;

/// Default period of the progress reporter.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// How work units are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Run every unit immediately on the submitting thread.
    Inline,
    /// Run units on a shared worker pool.
    #[default]
    Pooled,
}

/// A single source → target mirroring job. Immutable once a run starts.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct SyncJob {
    /// Root of the tree to copy from.
    pub source: PathBuf,

    /// Root of the tree to converge onto the source.
    pub target: PathBuf,

    /// Names excluded from every operation.
    #[builder(default)]
    pub ignore: IgnoreFilter,

    /// Copy attribute changes onto otherwise unchanged files.
    #[builder(default = "false")]
    pub sync_attributes: bool,

    /// Publish every change as it happens.
    #[builder(default = "false")]
    pub verbose: bool,

    /// Queue strategy.
    #[builder(default)]
    pub queue: QueueKind,

    /// Number of pool threads (0 = auto-detect). Ignored for inline queues.
    #[builder(default = "0")]
    pub threads: usize,

    /// Period of progress snapshots.
    #[builder(default = "DEFAULT_REPORT_INTERVAL")]
    pub report_interval: Duration,
}

impl SyncJobBuilder {
    fn validate(&self) -> Result<(), String> {
        let source = match self.source {
            Some(ref source) if !source.as_os_str().is_empty() => source,
            Some(_) => return Err("Source path cannot be empty".to_string()),
            None => return Err("Source path is required".to_string()),
        };
        let target = match self.target {
            Some(ref target) if !target.as_os_str().is_empty() => target,
            Some(_) => return Err("Target path cannot be empty".to_string()),
            None => return Err("Target path is required".to_string()),
        };
        if source == target {
            return Err("Source and target must be different paths".to_string());
        }
        if self.report_interval.is_some_and(|d| d.is_zero()) {
            return Err("Report interval must be positive".to_string());
        }
        Ok(())
    }
}

impl SyncJob {
    /// Create a new job builder.
    pub fn builder() -> SyncJobBuilder {
        SyncJobBuilder::default()
    }
}

/// JSON job file: every source is mirrored into every target base.
///
/// ```json
/// {
///   "Source": ["/data/photos", "/data/docs"],
///   "Target": ["/mnt/backup"],
///   "Ignore": ["desktop.ini", "bin/", "obj/"],
///   "SyncAttributes": true,
///   "ReportEveryFile": false,
///   "ThreadPoolQueue": true
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobConfig {
    /// Source roots.
    pub source: Vec<PathBuf>,

    /// Target base directories; each source lands in `<base>/<source name>`.
    pub target: Vec<PathBuf>,

    /// Literal ignore rules; a trailing `/` or `\` marks a directory rule.
    #[serde(default)]
    pub ignore: Vec<String>,

    /// Regex rules for file names.
    #[serde(default)]
    pub ignore_file_regex: Vec<String>,

    /// Regex rules for directory names.
    #[serde(default)]
    pub ignore_dir_regex: Vec<String>,

    /// Sync attribute changes.
    #[serde(default)]
    pub sync_attributes: bool,

    /// Report every change as it happens.
    #[serde(default)]
    pub report_every_file: bool,

    /// Use the pooled queue instead of inline execution.
    #[serde(default)]
    pub thread_pool_queue: bool,

    /// Pool size (0 = auto-detect).
    #[serde(default)]
    pub threads: usize,
}

impl JobConfig {
    /// Parse a job file from JSON text.
    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        serde_json::from_str(json).map_err(|e| SyncError::config(e.to_string()))
    }

    /// Load a job file from disk.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let json = std::fs::read_to_string(path).map_err(|e| SyncError::io(path, e))?;
        Self::from_json(&json)
    }

    /// Compile the ignore rules shared by every job of this file.
    pub fn ignore_filter(&self) -> Result<IgnoreFilter, SyncError> {
        let mut filter = IgnoreFilter::new();
        for rule in &self.ignore {
            filter.add_rule(rule);
        }
        for pattern in &self.ignore_file_regex {
            filter.ignore_file_regex(pattern)?;
        }
        for pattern in &self.ignore_dir_regex {
            filter.ignore_dir_regex(pattern)?;
        }
        Ok(filter)
    }

    /// Expand into one job per (target base, source) pair, targets outermost.
    pub fn jobs(&self) -> Result<Vec<SyncJob>, SyncError> {
        if self.source.is_empty() || self.target.is_empty() {
            return Err(SyncError::config("Job file needs at least one source and one target"));
        }

        let ignore = self.ignore_filter()?;
        let queue = if self.thread_pool_queue {
            QueueKind::Pooled
        } else {
            QueueKind::Inline
        };

        let mut jobs = Vec::with_capacity(self.source.len() * self.target.len());
        for base in &self.target {
            for source in &self.source {
                let name = source.file_name().ok_or_else(|| {
                    SyncError::config(format!("Source {} has no directory name", source.display()))
                })?;

                let job = SyncJob::builder()
                    .source(source.clone())
                    .target(base.join(name))
                    .ignore(ignore.clone())
                    .sync_attributes(self.sync_attributes)
                    .verbose(self.report_every_file)
                    .queue(queue)
                    .threads(self.threads)
                    .build()
                    .map_err(|e| SyncError::config(e.to_string()))?;
                jobs.push(job);
            }
        }

        Ok(jobs)
    }
}
