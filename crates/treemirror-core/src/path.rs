//! Path helpers.

use std::path::{Path, PathBuf};

use crate::error::SyncError;

/// Express `path` relative to `root`.
///
/// Fails with [`SyncError::NotRooted`] if `path` is not located under `root`.
/// The root itself relativizes to an empty path.
pub fn relativize(path: &Path, root: &Path) -> Result<PathBuf, SyncError> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| SyncError::NotRooted {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        })
}

/// Move `path` from under `from` to the same relative location under `to`.
pub fn rebase(path: &Path, from: &Path, to: &Path) -> Result<PathBuf, SyncError> {
    let rel = relativize(path, from)?;
    Ok(if rel.as_os_str().is_empty() {
        to.to_path_buf()
    } else {
        to.join(rel)
    })
}

/// Key under which entry names are compared. Matching is case-insensitive.
pub fn name_key(name: &str) -> String {
    name.to_lowercase()
}
