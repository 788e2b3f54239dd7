//! Recursive diff-and-replicate engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use treemirror_core::{
    name_key, DirEntry, FileEntry, FileSystem, SyncError, SyncJob, MARKER_FILE, MARKER_TAG,
};

use crate::queue::{build_queue, Join, TaskQueue, Ticket, UnitHandle, WorkUnit};
use crate::reporter::RateReporter;
use crate::stats::{ChangeEvent, ChangeKind, EntryKind, StatsCollector, StatsSnapshot};

/// A run that did not complete, with the statistics gathered up to the failure.
#[derive(Debug, Error)]
#[error("Replication failed")]
pub struct SyncFailure {
    /// Counters at the time the run ended. All zero for validation failures.
    pub stats: StatsSnapshot,
    #[source]
    pub error: SyncError,
}

impl SyncFailure {
    fn before_start(error: SyncError) -> Self {
        Self {
            stats: StatsSnapshot::default(),
            error,
        }
    }
}

/// Mirrors a source tree onto a target tree through a [`FileSystem`].
///
/// ```rust,no_run
/// use treemirror_core::SyncJob;
/// use treemirror_engine::ReplicationEngine;
/// use treemirror_fs::LocalFs;
///
/// let job = SyncJob::builder().source("/data").target("/backup/data").build().unwrap();
/// let engine = ReplicationEngine::new(job, LocalFs::new()).unwrap();
/// let stats = engine.run().unwrap();
/// println!("{stats}");
/// ```
pub struct ReplicationEngine<F: FileSystem + 'static> {
    shared: Arc<Shared<F>>,
}

impl<F: FileSystem + 'static> ReplicationEngine<F> {
    /// Prepare a run. Starts the worker pool for pooled jobs.
    pub fn new(job: SyncJob, fs: F) -> Result<Self, SyncError> {
        let queue = build_queue(job.queue, job.threads)?;
        let stats = Arc::new(StatsCollector::new(
            Arc::clone(&queue),
            job.target.clone(),
            job.verbose,
        ));

        Ok(Self {
            shared: Arc::new(Shared {
                job,
                fs,
                queue,
                stats,
            }),
        })
    }

    /// The job this engine runs.
    pub fn job(&self) -> &SyncJob {
        &self.shared.job
    }

    /// Live statistics of the run.
    pub fn stats(&self) -> Arc<StatsCollector> {
        Arc::clone(&self.shared.stats)
    }

    /// Subscribe to periodic progress snapshots.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<StatsSnapshot> {
        self.shared.stats.subscribe_progress()
    }

    /// Subscribe to individual changes (verbose jobs only).
    pub fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        self.shared.stats.subscribe_changes()
    }

    /// Validate the pair, replicate, and wait for every unit to finish.
    pub fn run(self) -> Result<StatsSnapshot, SyncFailure> {
        let shared = self.shared;
        shared.validate().map_err(SyncFailure::before_start)?;

        tracing::debug!(
            source = %shared.job.source.display(),
            target = %shared.job.target.display(),
            queue = ?shared.job.queue,
            "starting replication"
        );

        shared.stats.start();
        let reporter = match RateReporter::start(Arc::clone(&shared.stats), shared.job.report_interval)
        {
            Ok(reporter) => reporter,
            Err(error) => {
                shared.stats.stop();
                return Err(SyncFailure {
                    stats: shared.stats.snapshot(),
                    error,
                });
            }
        };

        let (source, target) = (shared.job.source.clone(), shared.job.target.clone());
        shared.spawn(move |this| this.replicate_dirs(&source, &target));
        let outcome = shared.queue.wait();

        reporter.stop();
        shared.stats.stop();
        let stats = shared.stats.publish();

        match outcome {
            Ok(()) => {
                tracing::debug!(changed = stats.changed(), total = stats.total(), "replication finished");
                Ok(stats)
            }
            Err(error) => Err(SyncFailure { stats, error }),
        }
    }
}

impl<F: FileSystem + 'static> std::fmt::Debug for ReplicationEngine<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("job", &self.shared.job)
            .field("stats", &self.shared.stats)
            .finish()
    }
}

/// Run `job` against `fs` to completion.
pub fn replicate<F: FileSystem + 'static>(job: SyncJob, fs: F) -> Result<StatsSnapshot, SyncFailure> {
    ReplicationEngine::new(job, fs)
        .map_err(SyncFailure::before_start)?
        .run()
}

/// State shared by every unit of one run.
struct Shared<F> {
    job: SyncJob,
    fs: F,
    queue: Arc<dyn TaskQueue>,
    stats: Arc<StatsCollector>,
}

impl<F: FileSystem + 'static> Shared<F> {
    fn spawn(
        self: &Arc<Self>,
        work: impl FnOnce(&Arc<Self>) -> Result<(), SyncError> + Send + 'static,
    ) -> UnitHandle {
        let this = Arc::clone(self);
        self.queue.submit(Box::new(move || work(&this)))
    }

    /// Both roots must carry the same identity marker.
    fn validate(&self) -> Result<(), SyncError> {
        let source_marker = self.read_marker(&self.job.source)?;
        let target_marker = self.read_marker(&self.job.target)?;

        if !source_marker.starts_with(MARKER_TAG) {
            return Err(SyncError::InvalidMarker {
                path: self.job.source.join(MARKER_FILE),
                tag: MARKER_TAG,
            });
        }
        if source_marker != target_marker {
            return Err(SyncError::MarkerMismatch {
                source_root: self.job.source.clone(),
                target_root: self.job.target.clone(),
            });
        }
        Ok(())
    }

    fn read_marker(&self, root: &Path) -> Result<String, SyncError> {
        let path = root.join(MARKER_FILE);
        self.fs.read_small_text(&path).map_err(|err| match err {
            SyncError::NotFound { .. } => SyncError::MissingMarker { path },
            // Not text, or too large to be a marker
            SyncError::Io { source, .. } if source.kind() == std::io::ErrorKind::InvalidData => {
                SyncError::InvalidMarker {
                    path,
                    tag: MARKER_TAG,
                }
            }
            other => other,
        })
    }

    /// Non-ignored target subdirectories keyed by name.
    fn target_dirs(&self, target: &Path) -> Result<IndexMap<String, DirEntry>, SyncError> {
        Ok(self
            .fs
            .list_dirs(target)?
            .into_iter()
            .filter(|dir| !self.job.ignore.test_dir(&dir.name))
            .map(|dir| (name_key(&dir.name), dir))
            .collect())
    }

    /// Non-ignored target files keyed by name.
    fn target_files(&self, target: &Path) -> Result<IndexMap<String, FileEntry>, SyncError> {
        Ok(self
            .fs
            .list_files(target)?
            .into_iter()
            .filter(|file| !self.job.ignore.test_file(&file.name))
            .map(|file| (name_key(&file.name), file))
            .collect())
    }

    /// Non-ignored source files. The marker is left out at the root.
    fn source_files(&self, source: &Path) -> Result<Vec<FileEntry>, SyncError> {
        let at_root = source == self.job.source;
        Ok(self
            .fs
            .list_files(source)?
            .into_iter()
            .filter(|file| !self.job.ignore.test_file(&file.name))
            .filter(|file| !(at_root && is_marker(&file.name)))
            .collect())
    }

    /// Diff one directory pair and schedule whatever makes target match.
    ///
    /// Both kinds of entries are listed here so a name that is a file on
    /// one side and a directory on the other is replaced in order.
    fn replicate_dirs(self: &Arc<Self>, source: &Path, target: &Path) -> Result<(), SyncError> {
        tracing::trace!(source = %source.display(), "diffing directory");

        let mut source_files = self.source_files(source)?;
        let mut target_files = self.target_files(target)?;
        if source == self.job.source {
            // The markers were already compared by validation
            target_files.shift_remove(&name_key(MARKER_FILE));
        }
        let mut target_dirs = self.target_dirs(target)?;

        for dir in self.fs.list_dirs(source)? {
            if self.job.ignore.test_dir(&dir.name) {
                continue;
            }

            let key = name_key(&dir.name);
            if let Some(existing) = target_dirs.shift_remove(&key) {
                self.spawn(move |this| this.replicate_dirs(&dir.path, &existing.path));
                continue;
            }

            let dst = child_of(target, &dir.path, &dir.name);
            let claimed = source_files.iter().any(|file| name_key(&file.name) == key);
            let in_the_way = if claimed {
                None
            } else {
                target_files.shift_remove(&key)
            };
            match in_the_way {
                // A target file stands where the directory goes
                Some(file) => {
                    self.spawn(move |this| {
                        this.fs.delete_file(&file.path)?;
                        this.stats.record(ChangeKind::Deleted, EntryKind::File, &file.path);
                        this.create_and_copy(&dir.path, &dst)
                    });
                }
                None => self.spawn_create_dir(dir.path, dst),
            }
        }

        for (key, orphan) in target_dirs {
            let position = if target_files.contains_key(&key) {
                None
            } else {
                source_files.iter().position(|file| name_key(&file.name) == key)
            };
            let Some(position) = position else {
                self.delete_all(orphan.path, None);
                continue;
            };

            // A target directory stands where the file goes
            let file = source_files.remove(position);
            let dst = child_of(target, &file.path, &file.name);
            let copy: WorkUnit = {
                let this = Arc::clone(self);
                Box::new(move || this.copy_one(&file.path, &dst, ChangeKind::New))
            };
            let join = Join::new(Arc::clone(&self.queue), copy);
            self.delete_all(orphan.path, Some(join.ticket()));
            join.seal();
        }

        let target = target.to_path_buf();
        self.spawn(move |this| this.replicate_files(source_files, target_files, &target));
        Ok(())
    }

    /// Compare the files of one directory pair, as listed by [`replicate_dirs`](Self::replicate_dirs).
    fn replicate_files(
        self: &Arc<Self>,
        source_files: Vec<FileEntry>,
        mut targets: IndexMap<String, FileEntry>,
        target: &Path,
    ) -> Result<(), SyncError> {
        for file in source_files {
            let Some(existing) = targets.shift_remove(&name_key(&file.name)) else {
                let dst = child_of(target, &file.path, &file.name);
                self.spawn_copy(file.path, dst, ChangeKind::New);
                continue;
            };

            if file.needs_copy_over(&existing) {
                self.spawn_copy(file.path, existing.path, ChangeKind::Modified);
            } else if self.job.sync_attributes && file.attributes != existing.attributes {
                let attributes = file.attributes;
                self.spawn(move |this| {
                    this.fs.set_attributes(&existing.path, attributes)?;
                    this.stats
                        .record(ChangeKind::AttributeOnly, EntryKind::File, &existing.path);
                    Ok(())
                });
            } else {
                self.stats
                    .record(ChangeKind::Unchanged, EntryKind::File, &existing.path);
            }
        }

        for (_, orphan) in targets {
            self.spawn(move |this| {
                this.fs.delete_file(&orphan.path)?;
                this.stats.record(ChangeKind::Deleted, EntryKind::File, &orphan.path);
                Ok(())
            });
        }
        Ok(())
    }

    /// Copy a directory that does not exist in target yet, without comparing.
    fn copy_all(self: &Arc<Self>, source: &Path, target: &Path) -> Result<(), SyncError> {
        let (files_source, files_target) = (source.to_path_buf(), target.to_path_buf());
        self.spawn(move |this| this.copy_files(&files_source, &files_target));

        for dir in self.fs.list_dirs(source)? {
            if self.job.ignore.test_dir(&dir.name) {
                continue;
            }
            let dst = child_of(target, &dir.path, &dir.name);
            self.spawn_create_dir(dir.path, dst);
        }
        Ok(())
    }

    fn copy_files(self: &Arc<Self>, source: &Path, target: &Path) -> Result<(), SyncError> {
        for file in self.fs.list_files(source)? {
            if self.job.ignore.test_file(&file.name) {
                continue;
            }
            let dst = child_of(target, &file.path, &file.name);
            self.spawn_copy(file.path, dst, ChangeKind::New);
        }
        Ok(())
    }

    fn spawn_copy(self: &Arc<Self>, src: PathBuf, dst: PathBuf, kind: ChangeKind) {
        self.spawn(move |this| this.copy_one(&src, &dst, kind));
    }

    fn copy_one(&self, src: &Path, dst: &Path, kind: ChangeKind) -> Result<(), SyncError> {
        let bytes = self.fs.copy_file(src, dst)?;
        self.stats.add_bytes(bytes);
        self.stats.record(kind, EntryKind::File, dst);
        Ok(())
    }

    fn spawn_create_dir(self: &Arc<Self>, source: PathBuf, target: PathBuf) {
        self.spawn(move |this| this.create_and_copy(&source, &target));
    }

    fn create_and_copy(self: &Arc<Self>, source: &Path, target: &Path) -> Result<(), SyncError> {
        self.fs.create_dir(target)?;
        self.stats.record(ChangeKind::New, EntryKind::Directory, target);
        self.copy_all(source, target)
    }

    /// Remove a target-only subtree, children first.
    ///
    /// `done` arrives once `dir` itself has been removed.
    fn delete_all(self: &Arc<Self>, dir: PathBuf, done: Option<Ticket>) {
        self.spawn(move |this| this.delete_tree(dir, done));
    }

    fn delete_tree(self: &Arc<Self>, dir: PathBuf, done: Option<Ticket>) -> Result<(), SyncError> {
        let remove_self: WorkUnit = {
            let this = Arc::clone(self);
            let dir = dir.clone();
            Box::new(move || {
                this.fs.delete_empty_dir(&dir)?;
                this.stats.record(ChangeKind::Deleted, EntryKind::Directory, &dir);
                if let Some(done) = done {
                    done.arrive();
                }
                Ok(())
            })
        };
        let join = Join::new(Arc::clone(&self.queue), remove_self);

        for sub in self.fs.list_dirs(&dir)? {
            self.delete_all(sub.path, Some(join.ticket()));
        }

        for file in self.fs.list_files(&dir)? {
            let ticket = join.ticket();
            self.spawn(move |this| {
                this.fs.delete_file(&file.path)?;
                this.stats.record(ChangeKind::Deleted, EntryKind::File, &file.path);
                ticket.arrive();
                Ok(())
            });
        }

        join.seal();
        Ok(())
    }
}

fn is_marker(name: &str) -> bool {
    name_key(name) == name_key(MARKER_FILE)
}

/// Path under `parent` named like the entry at `path`.
///
/// Uses the raw final component so names that are not valid UTF-8 survive.
fn child_of(parent: &Path, path: &Path, name: &str) -> PathBuf {
    match path.file_name() {
        Some(raw) => parent.join(raw),
        None => parent.join(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use treemirror_core::QueueKind;
    use treemirror_fs::{FsOp, MemoryFs};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn paired_fs() -> Arc<MemoryFs> {
        let fs = Arc::new(MemoryFs::new());
        fs.add_file("/src/sync.txt", "SyncID:1", t(0));
        fs.add_file("/dst/sync.txt", "SyncID:1", t(0));
        fs
    }

    fn job() -> SyncJob {
        SyncJob::builder()
            .source("/src")
            .target("/dst")
            .queue(QueueKind::Inline)
            .build()
            .unwrap()
    }

    #[test]
    fn test_marker_is_not_counted() {
        let fs = paired_fs();
        let stats = replicate(job(), Arc::clone(&fs)).unwrap();

        assert_eq!(stats.total(), 0);
        assert!(fs.ops().is_empty());
    }

    #[test]
    fn test_nested_delete_order() {
        let fs = paired_fs();
        fs.add_file("/dst/old/a.txt", "a", t(1));
        fs.add_file("/dst/old/deep/b.txt", "b", t(1));

        let stats = replicate(job(), Arc::clone(&fs)).unwrap();
        assert_eq!(stats.deleted, 4);

        let ops = fs.ops();
        let position = |op: &FsOp| ops.iter().position(|o| o == op).unwrap();
        let root = position(&FsOp::DeleteDir("/dst/old".into()));
        assert!(position(&FsOp::DeleteDir("/dst/old/deep".into())) < root);
        assert!(position(&FsOp::DeleteFile("/dst/old/a.txt".into())) < root);
        assert!(position(&FsOp::DeleteFile("/dst/old/deep/b.txt".into())) < root);
        assert!(!fs.exists("/dst/old"));
    }

    #[test]
    fn test_failed_child_keeps_parent_directory() {
        let fs = paired_fs();
        fs.add_file("/dst/old/locked.txt", "x", t(1));
        fs.fail_on("/dst/old/locked.txt");

        let failure = replicate(job(), Arc::clone(&fs)).unwrap_err();
        assert!(matches!(failure.error, SyncError::Aborted { failures: 1, .. }));
        assert!(fs.exists("/dst/old"));
        assert!(!fs.ops().contains(&FsOp::DeleteDir("/dst/old".into())));
    }

    #[test]
    fn test_binary_marker_fails_validation() {
        let fs = Arc::new(MemoryFs::new());
        fs.add_file("/src/sync.txt", "SyncID:1", t(0));
        fs.add_file("/dst/sync.txt", [0xff, 0xfe, 0x00], t(0));
        fs.add_file("/src/a.txt", "a", t(1));

        let failure = replicate(job(), Arc::clone(&fs)).unwrap_err();
        assert!(failure.error.is_validation());
        assert!(matches!(
            failure.error,
            SyncError::InvalidMarker { ref path, .. } if path == Path::new("/dst/sync.txt")
        ));
        assert!(fs.ops().is_empty());
    }

    #[test]
    fn test_engine_exposes_job() {
        let engine = ReplicationEngine::new(job(), paired_fs()).unwrap();
        assert_eq!(engine.job().target, PathBuf::from("/dst"));
        assert_eq!(engine.stats().snapshot().total(), 0);
    }
}
