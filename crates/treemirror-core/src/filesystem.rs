//! The filesystem port consumed by the replication engine.

use std::path::Path;

use crate::entry::{DirEntry, FileAttributes, FileEntry};
use crate::error::SyncError;

/// Name of the identity marker expected at the top of both roots.
pub const MARKER_FILE: &str = "sync.txt";

/// Literal the identity marker content must start with.
pub const MARKER_TAG: &str = "SyncID:";

/// Filesystem operations needed to mirror one tree onto another.
///
/// Implementations own their retry policy for transient errors; an error
/// returned from here is final.
pub trait FileSystem: Send + Sync {
    /// List the subdirectories directly under `path`.
    fn list_dirs(&self, path: &Path) -> Result<Vec<DirEntry>, SyncError>;

    /// List the entries directly under `path` that are not directories.
    ///
    /// Whatever is listed here must be removable with [`delete_file`](Self::delete_file).
    fn list_files(&self, path: &Path) -> Result<Vec<FileEntry>, SyncError>;

    /// Create a directory. The parent must exist.
    fn create_dir(&self, path: &Path) -> Result<(), SyncError>;

    /// Delete a single file, read-only or not.
    fn delete_file(&self, path: &Path) -> Result<(), SyncError>;

    /// Remove a directory that has no children. Fails otherwise.
    fn delete_empty_dir(&self, path: &Path) -> Result<(), SyncError>;

    /// Copy `src` over `dst`, overwriting it. Returns the number of bytes copied.
    fn copy_file(&self, src: &Path, dst: &Path) -> Result<u64, SyncError>;

    /// Replace the attribute bitset of a file.
    fn set_attributes(&self, path: &Path, attributes: FileAttributes) -> Result<(), SyncError>;

    /// Read a small text file into a string.
    fn read_small_text(&self, path: &Path) -> Result<String, SyncError>;
}

impl<F: FileSystem + ?Sized> FileSystem for std::sync::Arc<F> {
    fn list_dirs(&self, path: &Path) -> Result<Vec<DirEntry>, SyncError> {
        (**self).list_dirs(path)
    }

    fn list_files(&self, path: &Path) -> Result<Vec<FileEntry>, SyncError> {
        (**self).list_files(path)
    }

    fn create_dir(&self, path: &Path) -> Result<(), SyncError> {
        (**self).create_dir(path)
    }

    fn delete_file(&self, path: &Path) -> Result<(), SyncError> {
        (**self).delete_file(path)
    }

    fn delete_empty_dir(&self, path: &Path) -> Result<(), SyncError> {
        (**self).delete_empty_dir(path)
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> Result<u64, SyncError> {
        (**self).copy_file(src, dst)
    }

    fn set_attributes(&self, path: &Path, attributes: FileAttributes) -> Result<(), SyncError> {
        (**self).set_attributes(path, attributes)
    }

    fn read_small_text(&self, path: &Path) -> Result<String, SyncError> {
        (**self).read_small_text(path)
    }
}
