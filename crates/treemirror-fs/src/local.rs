//! Local disk backend built on `std::fs`.

use std::fs::{self, File, Metadata};
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use treemirror_core::{DirEntry, FileAttributes, FileEntry, FileSystem, SyncError};

use crate::retry::RetryPolicy;

/// Largest file accepted by [`FileSystem::read_small_text`].
pub const MAX_SMALL_TEXT_LEN: u64 = 64 * 1024;

/// [`FileSystem`] implementation for the local disk.
///
/// Everything that is not a directory is reported by
/// [`list_files`](FileSystem::list_files), symbolic links included (a link
/// to a directory too). Links are compared by their own metadata and copied
/// as links. Names that are not valid UTF-8 are reported lossily while the
/// entry keeps its real path.
#[derive(Debug, Clone, Default)]
pub struct LocalFs {
    retry: RetryPolicy,
}

impl LocalFs {
    /// Create a backend with the default retry policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend with a custom retry policy.
    pub fn with_retry(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// The retry policy in use.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Read a directory, returning `(name, entry)` pairs sorted by name.
    fn read_entries(&self, path: &Path) -> Result<Vec<(String, fs::DirEntry)>, SyncError> {
        let entries = self
            .retry
            .run(path, || fs::read_dir(path)?.collect::<io::Result<Vec<_>>>())?;

        let mut named: Vec<(String, fs::DirEntry)> = entries
            .into_iter()
            .map(|entry| match entry.file_name().into_string() {
                Ok(name) => (name, entry),
                Err(raw) => {
                    tracing::debug!(path = %path.display(), name = ?raw, "name is not valid UTF-8");
                    (raw.to_string_lossy().into_owned(), entry)
                }
            })
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }
}

impl FileSystem for LocalFs {
    fn list_dirs(&self, path: &Path) -> Result<Vec<DirEntry>, SyncError> {
        let mut dirs = Vec::new();
        for (name, entry) in self.read_entries(path)? {
            let entry_path = entry.path();
            let file_type = entry.file_type().map_err(|e| SyncError::io(&entry_path, e))?;
            if file_type.is_dir() {
                dirs.push(DirEntry::new(name, entry_path));
            }
        }
        Ok(dirs)
    }

    fn list_files(&self, path: &Path) -> Result<Vec<FileEntry>, SyncError> {
        let mut files = Vec::new();
        for (name, entry) in self.read_entries(path)? {
            let entry_path = entry.path();
            let file_type = entry.file_type().map_err(|e| SyncError::io(&entry_path, e))?;
            if file_type.is_dir() {
                continue;
            }

            // Does not follow links
            let metadata = entry.metadata().map_err(|e| SyncError::io(&entry_path, e))?;
            let modified = metadata.modified().map_err(|e| SyncError::io(&entry_path, e))?;
            files.push(FileEntry::new(
                name,
                entry_path,
                metadata.len(),
                DateTime::<Utc>::from(modified),
                attributes_of(&metadata),
            ));
        }
        Ok(files)
    }

    fn create_dir(&self, path: &Path) -> Result<(), SyncError> {
        self.retry.run(path, || match fs::create_dir(path) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
            other => other,
        })
    }

    fn delete_file(&self, path: &Path) -> Result<(), SyncError> {
        self.retry.run(path, || {
            clear_read_only(path)?;
            remove_non_dir(path)
        })
    }

    fn delete_empty_dir(&self, path: &Path) -> Result<(), SyncError> {
        self.retry.run(path, || fs::remove_dir(path))
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> Result<u64, SyncError> {
        self.retry.run(dst, || {
            let metadata = fs::symlink_metadata(src)?;
            let file_type = metadata.file_type();

            if file_type.is_symlink() {
                remove_existing(dst)?;
                copy_symlink(src, dst)?;
                return Ok(metadata.len());
            }
            if !file_type.is_file() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is not a regular file or symlink", src.display()),
                ));
            }

            // Never write through a link sitting at the destination
            if fs::symlink_metadata(dst).is_ok_and(|m| m.file_type().is_symlink()) {
                remove_non_dir(dst)?;
            }
            clear_read_only(dst)?;
            let bytes = fs::copy(src, dst)?;

            // Keep the source timestamp so the next run sees the pair as unchanged
            open_for_times(dst)?.set_modified(metadata.modified()?)?;

            Ok(bytes)
        })
    }

    fn set_attributes(&self, path: &Path, attributes: FileAttributes) -> Result<(), SyncError> {
        self.retry
            .run(path, || set_read_only(path, attributes.is_read_only()))
    }

    fn read_small_text(&self, path: &Path) -> Result<String, SyncError> {
        self.retry.run(path, || {
            let len = fs::metadata(path)?.len();
            if len > MAX_SMALL_TEXT_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("file is {len} bytes, limit is {MAX_SMALL_TEXT_LEN}"),
                ));
            }
            fs::read_to_string(path)
        })
    }
}

/// Extract the attribute bitset from metadata.
#[cfg(windows)]
fn attributes_of(metadata: &Metadata) -> FileAttributes {
    use std::os::windows::fs::MetadataExt;
    FileAttributes(metadata.file_attributes())
}

#[cfg(not(windows))]
fn attributes_of(metadata: &Metadata) -> FileAttributes {
    FileAttributes::NONE.with_read_only(metadata.permissions().readonly())
}

/// Make a file writable if it exists and is read-only.
fn clear_read_only(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_file() && metadata.permissions().readonly() => {
            set_read_only(path, false)
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove whatever non-directory entry sits at `path`, if any.
fn remove_existing(path: &Path) -> io::Result<()> {
    clear_read_only(path)?;
    match remove_non_dir(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Remove a file or a symbolic link.
#[cfg(windows)]
fn remove_non_dir(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        // Directory links are removed like directories there
        Err(e) if fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink()) => {
            fs::remove_dir(path).map_err(|_| e)
        }
        other => other,
    }
}

#[cfg(not(windows))]
fn remove_non_dir(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}

/// Recreate the link at `src` as `dst`, with the same link text.
#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(src)?, dst)
}

#[cfg(windows)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};

    let link = fs::read_link(src)?;
    if fs::metadata(src).is_ok_and(|m| m.is_dir()) {
        symlink_dir(link, dst)
    } else {
        symlink_file(link, dst)
    }
}

#[cfg(not(any(unix, windows)))]
fn copy_symlink(src: &Path, _dst: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot copy symlink {}", src.display()),
    ))
}

/// Toggle the read-only state of a file.
#[cfg(unix)]
fn set_read_only(path: &Path, read_only: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    let mode = permissions.mode();
    let mode = if read_only { mode & !0o222 } else { mode | 0o200 };
    permissions.set_mode(mode);
    fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
fn set_read_only(path: &Path, read_only: bool) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(read_only);
    fs::set_permissions(path, permissions)
}

/// Open a file with enough access to change its timestamps.
#[cfg(windows)]
fn open_for_times(path: &Path) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;

    // FILE_WRITE_ATTRIBUTES
    fs::OpenOptions::new().access_mode(0x100).open(path)
}

#[cfg(not(windows))]
fn open_for_times(path: &Path) -> io::Result<File> {
    File::open(path)
}
