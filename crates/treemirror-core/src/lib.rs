//! Core types and traits for treemirror.
//!
//! This crate provides the data structures shared by the replication
//! engine and its filesystem backends: directory entries, job
//! configuration, ignore rules, path helpers and the [`FileSystem`] port.

mod config;
mod entry;
mod error;
mod filesystem;
mod ignore;
mod path;

pub use config::{
    JobConfig, QueueKind, SyncJob, SyncJobBuilder, SyncJobBuilderError, DEFAULT_REPORT_INTERVAL,
};
pub use entry::{DirEntry, FileAttributes, FileEntry};
pub use error::SyncError;
pub use filesystem::{FileSystem, MARKER_FILE, MARKER_TAG};
pub use ignore::{IgnoreFilter, NamePattern};
pub use path::{name_key, rebase, relativize};
