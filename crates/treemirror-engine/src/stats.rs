//! Change statistics.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use strum::{Display, EnumIter, IntoEnumIterator};
use tokio::sync::{broadcast, mpsc};
use treemirror_core::relativize;

use crate::queue::TaskQueue;

/// Capacity of the progress channel. Slow subscribers only miss intermediate snapshots.
const PROGRESS_CAPACITY: usize = 256;

/// Outcome of comparing one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize)]
pub enum ChangeKind {
    New,
    Modified,
    Deleted,
    #[strum(to_string = "Attribute")]
    AttributeOnly,
    #[strum(to_string = "Unmodified")]
    Unchanged,
}

impl ChangeKind {
    fn index(self) -> usize {
        self as usize
    }
}

/// What kind of entry a change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
pub enum EntryKind {
    File,
    #[strum(to_string = "Dir")]
    Directory,
}

/// A single change, published when the job is verbose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entry: EntryKind,
    /// Path relative to the target root.
    pub path: PathBuf,
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self.entry {
            EntryKind::Directory => std::path::MAIN_SEPARATOR_STR,
            EntryKind::File => "",
        };
        write!(
            f,
            "{:<4} {:<9} {}{}",
            self.entry.to_string(),
            format!("{}:", self.kind),
            self.path.display(),
            suffix
        )
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub new: u64,
    pub modified: u64,
    pub deleted: u64,
    pub attribute_only: u64,
    pub unchanged: u64,
    /// Bytes written by file copies.
    pub bytes_copied: u64,
    /// Time since the run started.
    pub elapsed: Duration,
    /// Units not yet finished when the snapshot was taken.
    pub queue_depth: usize,
}

impl StatsSnapshot {
    /// Count for one category.
    pub fn get(&self, kind: ChangeKind) -> u64 {
        match kind {
            ChangeKind::New => self.new,
            ChangeKind::Modified => self.modified,
            ChangeKind::Deleted => self.deleted,
            ChangeKind::AttributeOnly => self.attribute_only,
            ChangeKind::Unchanged => self.unchanged,
        }
    }

    /// Every entry looked at.
    pub fn total(&self) -> u64 {
        self.changed() + self.skipped()
    }

    /// Entries whose content or existence changed.
    pub fn changed(&self) -> u64 {
        self.new + self.modified + self.deleted
    }

    /// Entries whose content was left alone.
    pub fn skipped(&self) -> u64 {
        self.attribute_only + self.unchanged
    }

    /// Average rate of `count` per second over the elapsed time.
    pub fn rate(&self, count: u64) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { count as f64 / secs } else { 0.0 }
    }

    /// Whether nothing was counted.
    pub fn is_empty(&self) -> bool {
        self.total() == 0 && self.bytes_copied == 0
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let row = |f: &mut fmt::Formatter<'_>, title: &str, value: u64| {
            writeln!(f, "{title:<11} {value:>8} {:>8.2}/s", self.rate(value))
        };

        writeln!(f, "Runtime     {:.2?}", self.elapsed)?;
        writeln!(f, "Queue       {:>8}", self.queue_depth)?;
        row(f, "Changed", self.changed())?;
        for kind in [ChangeKind::New, ChangeKind::Modified, ChangeKind::Deleted] {
            row(f, &kind.to_string(), self.get(kind))?;
        }
        writeln!(f)?;
        row(f, "Skipped", self.skipped())?;
        for kind in [ChangeKind::AttributeOnly, ChangeKind::Unchanged] {
            row(f, &kind.to_string(), self.get(kind))?;
        }
        write!(
            f,
            "Copied      {:>8}",
            humansize::format_size(self.bytes_copied, humansize::BINARY)
        )
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Stopwatch {
    started: Option<Instant>,
    frozen: Option<Duration>,
}

impl Stopwatch {
    fn elapsed(&self) -> Duration {
        match (self.frozen, self.started) {
            (Some(frozen), _) => frozen,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }
}

/// Thread-safe change counters for one run.
///
/// The engine records every comparison outcome here. Snapshots are
/// broadcast by [`StatsCollector::publish`]; when verbose, changes other
/// than [`ChangeKind::Unchanged`] go to every change subscriber as they
/// happen, none dropped.
pub struct StatsCollector {
    counters: [AtomicU64; 5],
    bytes_copied: AtomicU64,
    stopwatch: Mutex<Stopwatch>,
    queue: Arc<dyn TaskQueue>,
    root: PathBuf,
    verbose: bool,
    progress_tx: broadcast::Sender<StatsSnapshot>,
    change_subscribers: Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
}

impl StatsCollector {
    /// Create a collector. Change paths are reported relative to `root`.
    pub fn new(queue: Arc<dyn TaskQueue>, root: impl Into<PathBuf>, verbose: bool) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            counters: Default::default(),
            bytes_copied: AtomicU64::new(0),
            stopwatch: Mutex::new(Stopwatch::default()),
            queue,
            root: root.into(),
            verbose,
            progress_tx,
            change_subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to periodic snapshots.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<StatsSnapshot> {
        self.progress_tx.subscribe()
    }

    /// Subscribe to individual changes. Only fed when verbose.
    ///
    /// The channel is unbounded and closes when the collector is dropped.
    pub fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.change_subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Start (or restart) the stopwatch.
    pub fn start(&self) {
        let mut stopwatch = self.stopwatch.lock().unwrap_or_else(PoisonError::into_inner);
        *stopwatch = Stopwatch {
            started: Some(Instant::now()),
            frozen: None,
        };
    }

    /// Freeze the stopwatch.
    pub fn stop(&self) {
        let mut stopwatch = self.stopwatch.lock().unwrap_or_else(PoisonError::into_inner);
        stopwatch.frozen = Some(stopwatch.elapsed());
    }

    /// Time since [`start`](Self::start), frozen by [`stop`](Self::stop).
    pub fn elapsed(&self) -> Duration {
        self.stopwatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Count one outcome for the entry at `path`.
    pub fn record(&self, kind: ChangeKind, entry: EntryKind, path: &Path) {
        self.counters[kind.index()].fetch_add(1, Ordering::Relaxed);
        tracing::debug!(change = %kind, entry = %entry, path = %path.display(), "recorded");

        if self.verbose && kind != ChangeKind::Unchanged {
            let path = relativize(path, &self.root).unwrap_or_else(|_| path.to_path_buf());
            let event = ChangeEvent { kind, entry, path };
            self.change_subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Add to the copied byte count.
    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Current count for one category.
    pub fn count(&self, kind: ChangeKind) -> u64 {
        self.counters[kind.index()].load(Ordering::Relaxed)
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            new: self.count(ChangeKind::New),
            modified: self.count(ChangeKind::Modified),
            deleted: self.count(ChangeKind::Deleted),
            attribute_only: self.count(ChangeKind::AttributeOnly),
            unchanged: self.count(ChangeKind::Unchanged),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            queue_depth: self.queue.outstanding(),
        }
    }

    /// Take a snapshot and broadcast it to progress subscribers.
    pub fn publish(&self) -> StatsSnapshot {
        let snapshot = self.snapshot();
        let _ = self.progress_tx.send(snapshot);
        snapshot
    }
}

impl fmt::Debug for StatsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("StatsCollector");
        for kind in ChangeKind::iter() {
            s.field(&kind.to_string(), &self.count(kind));
        }
        s.field("root", &self.root).field("verbose", &self.verbose).finish()
    }
}
