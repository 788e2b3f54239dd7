//! Filesystem backends for treemirror.
//!
//! Both backends implement the [`FileSystem`] port from `treemirror-core`:
//!
//! - [`LocalFs`] works on the real disk through `std::fs`, retrying
//!   transient I/O errors according to a [`RetryPolicy`].
//! - [`MemoryFs`] keeps a tree in memory and logs every mutation, which
//!   makes replication runs observable and deterministic in tests.
//!
//! ```rust,no_run
//! use std::path::Path;
//! use treemirror_fs::{FileSystem, LocalFs};
//!
//! let fs = LocalFs::new();
//! for file in fs.list_files(Path::new("/tmp")).unwrap() {
//!     println!("{} ({} bytes)", file.name, file.len);
//! }
//! ```

mod local;
mod memory;
mod retry;

pub use local::{LocalFs, MAX_SMALL_TEXT_LEN};
pub use memory::{FsOp, MemoryFs};
pub use retry::{is_transient, RetryPolicy};

// Re-export the port for convenience
pub use treemirror_core::{DirEntry, FileAttributes, FileEntry, FileSystem, SyncError};
