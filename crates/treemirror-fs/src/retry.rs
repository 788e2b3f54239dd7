//! Bounded retry for transient I/O errors.

use std::io;
use std::path::Path;
use std::time::Duration;

use treemirror_core::SyncError;

/// How often and how patiently an operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Try exactly once.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op`, retrying transient failures until attempts run out.
    pub fn run<T>(&self, path: &Path, mut op: impl FnMut() -> io::Result<T>) -> Result<T, SyncError> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.attempts && is_transient(&err) => {
                    tracing::warn!(
                        path = %path.display(),
                        attempt,
                        error = %err,
                        "transient I/O error, retrying"
                    );
                    std::thread::sleep(self.delay);
                    attempt += 1;
                }
                Err(err) => return Err(SyncError::io(path, err)),
            }
        }
    }
}

/// Check whether an I/O error is worth retrying.
pub fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ResourceBusy
    ) {
        return true;
    }

    // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
    cfg!(windows) && matches!(err.raw_os_error(), Some(32 | 33))
}
