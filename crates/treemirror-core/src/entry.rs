//! File and directory entry types.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Attribute bitset of a file.
///
/// Bit values follow the Windows attribute word so the raw value can be
/// carried over unchanged on that platform. Elsewhere only
/// [`FileAttributes::READ_ONLY`] is populated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileAttributes(pub u32);

impl FileAttributes {
    /// No attributes set.
    pub const NONE: Self = Self(0);
    /// File cannot be written.
    pub const READ_ONLY: Self = Self(0x1);
    /// File is hidden.
    pub const HIDDEN: Self = Self(0x2);
    /// File is used by the operating system.
    pub const SYSTEM: Self = Self(0x4);
    /// File is marked for backup.
    pub const ARCHIVE: Self = Self(0x20);

    /// Check whether every bit in `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether the read-only bit is set.
    pub fn is_read_only(self) -> bool {
        self.contains(Self::READ_ONLY)
    }

    /// Return a copy with the read-only bit set or cleared.
    pub fn with_read_only(self, read_only: bool) -> Self {
        if read_only {
            self | Self::READ_ONLY
        } else {
            self & !Self::READ_ONLY
        }
    }
}

impl BitOr for FileAttributes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for FileAttributes {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for FileAttributes {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Display for FileAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// A regular file as reported by a [`FileSystem`](crate::FileSystem) listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// File name (not full path).
    pub name: CompactString,
    /// Absolute path.
    pub path: PathBuf,
    /// Size in bytes.
    pub len: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
    /// Attribute bitset.
    pub attributes: FileAttributes,
}

impl FileEntry {
    /// Create a new file entry.
    pub fn new(
        name: impl Into<CompactString>,
        path: impl Into<PathBuf>,
        len: u64,
        modified: DateTime<Utc>,
        attributes: FileAttributes,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            len,
            modified,
            attributes,
        }
    }

    /// Whether `self` (a source file) has to be copied over `target`.
    ///
    /// True when the lengths differ or the source is strictly newer.
    pub fn needs_copy_over(&self, target: &FileEntry) -> bool {
        self.len != target.len || self.modified > target.modified
    }
}

/// A directory as reported by a [`FileSystem`](crate::FileSystem) listing.
///
/// Children are listed on demand and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Directory name (not full path).
    pub name: CompactString,
    /// Absolute path.
    pub path: PathBuf,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(name: impl Into<CompactString>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}
