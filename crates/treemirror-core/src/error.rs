//! Error types for replication runs.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while validating or replicating a tree pair.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The identity marker is missing from one of the roots.
    #[error("Missing identity marker: {path}")]
    MissingMarker { path: PathBuf },

    /// The identity marker does not start with the expected tag.
    #[error("Identity marker {path} must start with \"{tag}\"")]
    InvalidMarker { path: PathBuf, tag: &'static str },

    /// The identity markers of source and target differ.
    #[error("Identity marker does not match in {source_root} and {target_root}")]
    MarkerMismatch {
        source_root: PathBuf,
        target_root: PathBuf,
    },

    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// Path not found.
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A path was expected to live under a root but does not.
    #[error("{path} is not located under {root}")]
    NotRooted { path: PathBuf, root: PathBuf },

    /// An ignore rule could not be compiled.
    #[error("Invalid ignore pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The worker pool failed or could not be started.
    #[error("Worker pool error: {message}")]
    Pool { message: String },

    /// A work unit panicked.
    #[error("Work unit panicked: {message}")]
    UnitPanicked { message: String },

    /// The run was aborted after one or more units failed.
    #[error("Replication aborted after {failures} failed unit(s): {first}")]
    Aborted {
        failures: usize,
        #[source]
        first: Box<SyncError>,
    },
}

impl SyncError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }

    /// Create an invalid configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Whether this error was raised by identity-marker validation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingMarker { .. } | Self::InvalidMarker { .. } | Self::MarkerMismatch { .. }
        )
    }
}
