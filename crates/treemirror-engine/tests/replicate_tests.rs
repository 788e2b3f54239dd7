//! End-to-end replication runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use treemirror_core::{FileAttributes, IgnoreFilter, QueueKind, SyncError, SyncJob};
use treemirror_engine::{replicate, ChangeKind, EntryKind, ReplicationEngine};
use treemirror_fs::{FsOp, LocalFs, MemoryFs};

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn paired_fs() -> Arc<MemoryFs> {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/a/sync.txt", "SyncID:ABC", t(0));
    fs.add_file("/b/sync.txt", "SyncID:ABC", t(0));
    fs
}

fn job() -> SyncJob {
    job_on(QueueKind::Inline)
}

fn job_on(queue: QueueKind) -> SyncJob {
    SyncJob::builder()
        .source("/a")
        .target("/b")
        .queue(queue)
        .threads(4usize)
        .build()
        .unwrap()
}

fn job_with(ignore: IgnoreFilter, sync_attributes: bool) -> SyncJob {
    SyncJob::builder()
        .source("/a")
        .target("/b")
        .ignore(ignore)
        .sync_attributes(sync_attributes)
        .queue(QueueKind::Inline)
        .build()
        .unwrap()
}

fn check_mixed_scenario(queue: QueueKind) {
    let fs = paired_fs();
    fs.add_file("/a/f1", "12345", t(10));
    fs.add_file("/a/sub/f2", "two", t(10));
    fs.add_file("/b/f1", "123", t(10));
    fs.add_dir("/b/old");

    let stats = replicate(job_on(queue), Arc::clone(&fs)).unwrap();

    assert_eq!(stats.new, 2);
    assert_eq!(stats.modified, 1);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.unchanged, 0);
    assert_eq!(stats.attribute_only, 0);
    assert_eq!(stats.bytes_copied, 8);
    assert_eq!(stats.queue_depth, 0);

    assert_eq!(fs.snapshot("/b"), fs.snapshot("/a"));
}

#[test]
fn test_mixed_scenario() {
    check_mixed_scenario(QueueKind::Inline);
}

#[test]
fn test_mixed_scenario_pooled() {
    check_mixed_scenario(QueueKind::Pooled);
}

#[test]
fn test_marker_mismatch_is_fatal() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/a/sync.txt", "SyncID:ABC", t(0));
    fs.add_file("/b/sync.txt", "SyncID:XYZ", t(0));
    fs.add_file("/a/new.txt", "x", t(0));
    fs.add_dir("/b/old");

    let failure = replicate(job(), Arc::clone(&fs)).unwrap_err();

    assert!(matches!(failure.error, SyncError::MarkerMismatch { .. }));
    assert!(failure.error.is_validation());
    assert!(failure.stats.is_empty());
    assert!(fs.ops().is_empty());
    assert!(fs.listed().is_empty());
}

#[test]
fn test_missing_marker_is_fatal() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/a/sync.txt", "SyncID:ABC", t(0));
    fs.add_dir("/b");

    let failure = replicate(job(), Arc::clone(&fs)).unwrap_err();
    match failure.error {
        SyncError::MissingMarker { path } => assert_eq!(path, PathBuf::from("/b/sync.txt")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(fs.ops().is_empty());
}

#[test]
fn test_marker_without_tag_is_fatal() {
    let fs = Arc::new(MemoryFs::new());
    fs.add_file("/a/sync.txt", "hello", t(0));
    fs.add_file("/b/sync.txt", "hello", t(0));

    let failure = replicate(job(), Arc::clone(&fs)).unwrap_err();
    assert!(matches!(failure.error, SyncError::InvalidMarker { .. }));
    assert!(fs.ops().is_empty());
}

#[test]
fn test_second_run_is_idempotent() {
    let fs = paired_fs();
    fs.add_file("/a/f1", "one", t(1));
    fs.add_file("/a/d/f2", "two", t(2));
    fs.add_file("/a/d/e/f3", "three", t(3));

    let first = replicate(job(), Arc::clone(&fs)).unwrap();
    assert_eq!(first.new, 5);

    fs.clear_log();
    let second = replicate(job(), Arc::clone(&fs)).unwrap();

    assert_eq!(second.changed(), 0);
    assert_eq!(second.unchanged, 3);
    assert!(fs.ops().is_empty());
}

#[test]
fn test_ignored_target_directory_is_untouched() {
    let fs = paired_fs();
    fs.add_file("/b/bin/tool.exe", "x", t(0));
    fs.add_file("/a/bin/other.exe", "y", t(0));
    fs.add_file("/b/desktop.ini", "z", t(0));

    let mut ignore = IgnoreFilter::new();
    ignore.add_rule("bin/").add_rule("desktop.ini");
    let stats = replicate(job_with(ignore, false), Arc::clone(&fs)).unwrap();

    assert_eq!(stats.total(), 0);
    assert!(fs.exists("/b/bin/tool.exe"));
    assert!(!fs.exists("/b/bin/other.exe"));
    assert!(fs.exists("/b/desktop.ini"));
    assert!(!fs.listed().iter().any(|p| p.starts_with("/b/bin") || p.starts_with("/a/bin")));
}

#[test]
fn test_ignore_regex_applies_inside_new_directories() {
    let fs = paired_fs();
    fs.add_file("/a/new/keep.txt", "k", t(0));
    fs.add_file("/a/new/~$lock.docx", "l", t(0));
    fs.add_file("/a/new/.vs/state", "s", t(0));

    let mut ignore = IgnoreFilter::new();
    ignore.ignore_file_regex(r"~\$.*").unwrap();
    ignore.ignore_dir_name(".VS");
    replicate(job_with(ignore, false), Arc::clone(&fs)).unwrap();

    assert!(fs.exists("/b/new/keep.txt"));
    assert!(!fs.exists("/b/new/~$lock.docx"));
    assert!(!fs.exists("/b/new/.vs"));
}

#[test]
fn test_change_detection_boundary() {
    let fs = paired_fs();
    fs.add_file("/a/older.txt", "same", t(5));
    fs.add_file("/b/older.txt", "SAME", t(9));
    fs.add_file("/a/equal.txt", "same", t(5));
    fs.add_file("/b/equal.txt", "SAME", t(5));
    fs.add_file("/a/newer.txt", "same", t(10));
    fs.add_file("/b/newer.txt", "SAME", t(9));

    let stats = replicate(job(), Arc::clone(&fs)).unwrap();

    assert_eq!(stats.modified, 1);
    assert_eq!(stats.unchanged, 2);
    assert_eq!(fs.read("/b/older.txt").unwrap(), b"SAME");
    assert_eq!(fs.read("/b/newer.txt").unwrap(), b"same");
}

#[test]
fn test_attribute_only_change() {
    let fs = paired_fs();
    fs.add_file_with_attributes("/a/f", "data", t(1), FileAttributes::READ_ONLY);
    fs.add_file("/b/f", "data", t(1));

    let stats = replicate(job_with(IgnoreFilter::new(), true), Arc::clone(&fs)).unwrap();

    assert_eq!(stats.attribute_only, 1);
    assert_eq!(stats.changed(), 0);
    assert_eq!(stats.bytes_copied, 0);
    assert_eq!(
        fs.ops(),
        vec![FsOp::SetAttributes("/b/f".into(), FileAttributes::READ_ONLY)]
    );
}

#[test]
fn test_attributes_ignored_without_flag() {
    let fs = paired_fs();
    fs.add_file_with_attributes("/a/f", "data", t(1), FileAttributes::READ_ONLY);
    fs.add_file("/b/f", "data", t(1));

    let stats = replicate(job(), Arc::clone(&fs)).unwrap();
    assert_eq!(stats.unchanged, 1);
    assert!(fs.ops().is_empty());
}

fn check_deletion_order(queue: QueueKind, width: usize) {
    let fs = paired_fs();
    for i in 0..width {
        fs.add_file(format!("/b/gone/x{i}.txt"), "x", t(0));
        fs.add_file(format!("/b/gone/nested/y{i}.txt"), "y", t(0));
    }
    fs.add_dir("/b/gone/nested/empty");

    let stats = replicate(job_on(queue), Arc::clone(&fs)).unwrap();
    assert_eq!(stats.deleted, 2 * width as u64 + 3);
    assert!(!fs.exists("/b/gone"));

    let ops = fs.ops();
    let last = ops.last().unwrap();
    assert_eq!(last, &FsOp::DeleteDir("/b/gone".into()));

    // Every removal inside a directory comes before that directory's removal
    for (i, op) in ops.iter().enumerate() {
        if let FsOp::DeleteDir(dir) = op {
            assert!(ops[i + 1..].iter().all(|later| !later.path().starts_with(dir)));
        }
    }
}

#[test]
fn test_deletion_order() {
    check_deletion_order(QueueKind::Inline, 1);
}

#[test]
fn test_deletion_order_pooled() {
    check_deletion_order(QueueKind::Pooled, 40);
}

#[test]
fn test_names_match_case_insensitively() {
    let fs = paired_fs();
    fs.add_file("/a/Report.TXT", "data", t(1));
    fs.add_file("/b/report.txt", "data", t(1));
    fs.add_file("/a/Docs/a.txt", "a", t(1));
    fs.add_file("/b/docs/a.txt", "a", t(1));

    let stats = replicate(job(), Arc::clone(&fs)).unwrap();

    assert_eq!(stats.unchanged, 2);
    assert_eq!(stats.changed(), 0);
    assert!(fs.ops().is_empty());
}

#[test]
fn test_rename_is_delete_plus_new() {
    let fs = paired_fs();
    fs.add_file("/a/after.txt", "data", t(1));
    fs.add_file("/b/before.txt", "data", t(1));

    let stats = replicate(job(), Arc::clone(&fs)).unwrap();

    assert_eq!(stats.new, 1);
    assert_eq!(stats.deleted, 1);
    assert!(fs.exists("/b/after.txt"));
    assert!(!fs.exists("/b/before.txt"));
}

fn check_type_changes(queue: QueueKind) {
    let fs = paired_fs();
    // File becomes a directory
    fs.add_file("/a/x/inner.txt", "in", t(1));
    fs.add_file("/b/x", "was a file", t(1));
    // Directory becomes a file
    fs.add_file("/a/y", "now a file", t(1));
    fs.add_file("/b/y/old.txt", "old", t(1));

    let stats = replicate(job_on(queue), Arc::clone(&fs)).unwrap();

    assert_eq!(stats.deleted, 3);
    assert_eq!(stats.new, 3);
    assert!(fs.is_dir("/b/x"));
    assert_eq!(fs.read("/b/x/inner.txt").unwrap(), b"in");
    assert_eq!(fs.read("/b/y").unwrap(), b"now a file");
    assert_eq!(fs.snapshot("/b"), fs.snapshot("/a"));

    let ops = fs.ops();
    let position = |op: &FsOp| ops.iter().position(|o| o == op).unwrap();
    assert!(position(&FsOp::DeleteFile("/b/x".into())) < position(&FsOp::CreateDir("/b/x".into())));
    let copy_y = FsOp::Copy {
        src: "/a/y".into(),
        dst: "/b/y".into(),
    };
    assert!(position(&FsOp::DeleteDir("/b/y".into())) < position(&copy_y));
}

#[test]
fn test_type_changes_replace_entries() {
    check_type_changes(QueueKind::Inline);
}

#[test]
fn test_type_changes_replace_entries_pooled() {
    check_type_changes(QueueKind::Pooled);
}

#[test]
fn test_failure_aborts_run() {
    let fs = paired_fs();
    fs.add_file("/a/bad.txt", "x", t(1));
    fs.add_file("/a/good.txt", "y", t(1));
    fs.fail_on("/b/bad.txt");

    let failure = replicate(job(), Arc::clone(&fs)).unwrap_err();

    match &failure.error {
        SyncError::Aborted { failures, first } => {
            assert_eq!(*failures, 1);
            assert!(matches!(**first, SyncError::Io { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // Units after the failure are skipped
    assert!(!fs.exists("/b/good.txt"));
    assert_eq!(failure.stats.new, 0);
}

#[test]
fn test_verbose_run_streams_changes() {
    let fs = paired_fs();
    fs.add_file("/a/d/f.txt", "f", t(1));
    fs.add_file("/a/same.txt", "s", t(1));
    fs.add_file("/b/same.txt", "s", t(1));

    let job = SyncJob::builder()
        .source("/a")
        .target("/b")
        .verbose(true)
        .queue(QueueKind::Inline)
        .build()
        .unwrap();
    let engine = ReplicationEngine::new(job, Arc::clone(&fs)).unwrap();
    let mut changes = engine.subscribe_changes();
    let mut progress = engine.subscribe_progress();

    let stats = engine.run().unwrap();

    let mut events = Vec::new();
    while let Ok(event) = changes.try_recv() {
        events.push((event.kind, event.entry, event.path));
    }
    assert_eq!(
        events,
        vec![
            (ChangeKind::New, EntryKind::Directory, PathBuf::from("d")),
            (ChangeKind::New, EntryKind::File, Path::new("d").join("f.txt")),
        ]
    );

    // The final snapshot is always published
    let mut last = None;
    while let Ok(snapshot) = progress.try_recv() {
        last = Some(snapshot);
    }
    assert_eq!(last, Some(stats));
}

fn verbose_job(queue: QueueKind) -> SyncJob {
    SyncJob::builder()
        .source("/a")
        .target("/b")
        .verbose(true)
        .queue(queue)
        .threads(4usize)
        .build()
        .unwrap()
}

fn check_every_change_is_streamed(queue: QueueKind) {
    let fs = paired_fs();
    for i in 0..300 {
        fs.add_file(format!("/a/f{i:03}.txt"), "x", t(1));
    }

    let engine = ReplicationEngine::new(verbose_job(queue), Arc::clone(&fs)).unwrap();
    let mut changes = engine.subscribe_changes();
    let stats = engine.run().unwrap();
    assert_eq!(stats.new, 300);

    let mut names = Vec::new();
    while let Ok(event) = changes.try_recv() {
        assert_eq!(event.kind, ChangeKind::New);
        names.push(event.path);
    }
    names.sort();
    let expected: Vec<_> = (0..300).map(|i| PathBuf::from(format!("f{i:03}.txt"))).collect();
    assert_eq!(names, expected);
}

#[test]
fn test_every_change_is_streamed() {
    check_every_change_is_streamed(QueueKind::Inline);
}

#[test]
fn test_every_change_is_streamed_pooled() {
    check_every_change_is_streamed(QueueKind::Pooled);
}

fn disk_pair() -> (TempDir, TempDir) {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    fs::write(src.path().join("sync.txt"), "SyncID:disk").unwrap();
    fs::write(dst.path().join("sync.txt"), "SyncID:disk").unwrap();
    (src, dst)
}

fn disk_job(src: &TempDir, dst: &TempDir) -> SyncJob {
    SyncJob::builder()
        .source(src.path())
        .target(dst.path())
        .queue(QueueKind::Inline)
        .build()
        .unwrap()
}

#[cfg(unix)]
#[test]
fn test_target_symlinks_are_removed() {
    use std::os::unix::fs::symlink;

    let (src, dst) = disk_pair();
    fs::create_dir(dst.path().join("stale")).unwrap();
    fs::write(dst.path().join("stale/a.txt"), "a").unwrap();
    symlink("/nonexistent", dst.path().join("stale/link")).unwrap();
    symlink(src.path(), dst.path().join("toplink")).unwrap();

    let stats = replicate(disk_job(&src, &dst), LocalFs::new()).unwrap();

    assert_eq!(stats.deleted, 4);
    assert!(fs::symlink_metadata(dst.path().join("stale")).is_err());
    assert!(fs::symlink_metadata(dst.path().join("toplink")).is_err());
    // The link was removed, not followed
    assert!(src.path().join("sync.txt").exists());
}

#[cfg(unix)]
#[test]
fn test_source_symlinks_are_copied_as_links() {
    use std::os::unix::fs::symlink;

    let (src, dst) = disk_pair();
    fs::write(src.path().join("data.txt"), "data").unwrap();
    symlink("data.txt", src.path().join("alias")).unwrap();

    let stats = replicate(disk_job(&src, &dst), LocalFs::new()).unwrap();
    assert_eq!(stats.new, 2);
    assert_eq!(fs::read_link(dst.path().join("alias")).unwrap(), Path::new("data.txt"));

    let again = replicate(disk_job(&src, &dst), LocalFs::new()).unwrap();
    assert_eq!(again.changed(), 0);
    assert_eq!(again.unchanged, 2);
}

#[cfg(target_os = "linux")]
#[test]
fn test_non_utf8_names_are_mirrored() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let (src, dst) = disk_pair();
    let raw = OsStr::from_bytes(b"caf\xe9");
    fs::create_dir(src.path().join(raw)).unwrap();
    fs::write(src.path().join(raw).join(raw), "x").unwrap();
    fs::create_dir(dst.path().join(OsStr::from_bytes(b"old\xff"))).unwrap();

    let stats = replicate(disk_job(&src, &dst), LocalFs::new()).unwrap();

    assert_eq!(stats.new, 2);
    assert_eq!(stats.deleted, 1);
    assert_eq!(fs::read_to_string(dst.path().join(raw).join(raw)).unwrap(), "x");
    assert!(!dst.path().join(OsStr::from_bytes(b"old\xff")).exists());
}

#[test]
fn test_pooled_run_on_disk_converges() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    fs::write(src.path().join("sync.txt"), "SyncID:disk").unwrap();
    fs::write(dst.path().join("sync.txt"), "SyncID:disk").unwrap();

    for d in 0..4 {
        let dir = src.path().join(format!("dir{d}")).join("inner");
        fs::create_dir_all(&dir).unwrap();
        for f in 0..5 {
            fs::write(dir.join(format!("file{f}.txt")), format!("{d}-{f}")).unwrap();
        }
    }
    fs::create_dir_all(dst.path().join("stale/deeper")).unwrap();
    fs::write(dst.path().join("stale/deeper/old.txt"), "old").unwrap();
    fs::write(dst.path().join("stale/old.txt"), "old").unwrap();

    let job = SyncJob::builder()
        .source(src.path())
        .target(dst.path())
        .queue(QueueKind::Pooled)
        .threads(4usize)
        .build()
        .unwrap();

    let stats = replicate(job.clone(), LocalFs::new()).unwrap();
    assert_eq!(stats.new, 4 * 2 + 4 * 5);
    assert_eq!(stats.deleted, 4);
    assert!(!dst.path().join("stale").exists());
    assert_eq!(
        fs::read_to_string(dst.path().join("dir3/inner/file4.txt")).unwrap(),
        "3-4"
    );

    let again = replicate(job, LocalFs::new()).unwrap();
    assert_eq!(again.changed(), 0);
    assert_eq!(again.unchanged, 20);
}
