//! Concurrent diff-and-replicate engine for treemirror.
//!
//! # Overview
//!
//! `treemirror-engine` makes a target directory tree converge onto a
//! source tree. Key features:
//!
//! - **Recursive diff** with case-insensitive name matching
//! - **Fan-out** of independent copy/delete/create units onto a
//!   [`TaskQueue`], either inline or on a rayon worker pool
//! - **Fail fast**: the first failed unit aborts the run
//! - **Statistics** per change kind, with progress via broadcast channels
//!
//! # Example
//!
//! ```rust,no_run
//! use treemirror_core::{QueueKind, SyncJob};
//! use treemirror_engine::replicate;
//! use treemirror_fs::LocalFs;
//!
//! let job = SyncJob::builder()
//!     .source("/data/photos")
//!     .target("/mnt/backup/photos")
//!     .queue(QueueKind::Pooled)
//!     .build()
//!     .unwrap();
//!
//! match replicate(job, LocalFs::new()) {
//!     Ok(stats) => println!("{stats}"),
//!     Err(failure) => eprintln!("{}: {}", failure, failure.error),
//! }
//! ```
//!
//! # Progress Monitoring
//!
//! ```rust,no_run
//! use treemirror_core::SyncJob;
//! use treemirror_engine::ReplicationEngine;
//! use treemirror_fs::LocalFs;
//!
//! let job = SyncJob::builder().source("/a").target("/b").build().unwrap();
//! let engine = ReplicationEngine::new(job, LocalFs::new()).unwrap();
//! let mut progress_rx = engine.subscribe_progress();
//!
//! tokio::spawn(async move {
//!     while let Ok(progress) = progress_rx.recv().await {
//!         println!("{} changed so far", progress.changed());
//!     }
//! });
//! ```

mod queue;
mod replicator;
mod reporter;
mod stats;

pub use queue::{
    build_queue, InlineQueue, Join, PooledQueue, TaskQueue, Ticket, UnitHandle, UnitState,
    WorkUnit,
};
pub use replicator::{replicate, ReplicationEngine, SyncFailure};
pub use reporter::RateReporter;
pub use stats::{ChangeEvent, ChangeKind, EntryKind, StatsCollector, StatsSnapshot};

// Re-export core types for convenience
pub use treemirror_core::{IgnoreFilter, QueueKind, SyncError, SyncJob};
