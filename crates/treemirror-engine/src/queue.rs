//! Work-unit scheduling.
//!
//! A [`TaskQueue`] runs independent [`WorkUnit`]s and fails fast: the first
//! unit that returns an error (or panics) sets a permanent abort flag, and
//! every unit started after that is skipped. [`TaskQueue::wait`] blocks
//! until every submitted unit has finished and then reports the failure.
//!
//! Two implementations exist:
//!
//! - [`InlineQueue`] runs each unit on the submitting thread, immediately.
//! - [`PooledQueue`] runs units on a dedicated rayon thread pool.
//!
//! [`Join`] provides fan-in on top of any queue without blocking a worker.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use rayon::{ThreadPool, ThreadPoolBuilder};
use treemirror_core::{QueueKind, SyncError};

/// A deferred action. Units scheduled together must not depend on each other.
pub type WorkUnit = Box<dyn FnOnce() -> Result<(), SyncError> + Send + 'static>;

/// Lifecycle of a submitted unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnitState {
    /// Submitted but not finished.
    Pending = 0,
    /// Ran to completion.
    Completed = 1,
    /// Returned an error or panicked.
    Failed = 2,
    /// Never ran because the queue was aborted.
    Skipped = 3,
}

impl UnitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Completed,
            2 => Self::Failed,
            3 => Self::Skipped,
            _ => Self::Pending,
        }
    }
}

/// Observes the state of one submitted unit.
#[derive(Debug, Clone)]
pub struct UnitHandle {
    state: Arc<AtomicU8>,
}

impl UnitHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(UnitState::Pending as u8)),
        }
    }

    fn set(&self, state: UnitState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Current state of the unit.
    pub fn state(&self) -> UnitState {
        UnitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the unit has left the pending state.
    pub fn is_finished(&self) -> bool {
        self.state() != UnitState::Pending
    }
}

/// Schedules work units.
pub trait TaskQueue: Send + Sync {
    /// Schedule `unit` for execution.
    fn submit(&self, unit: WorkUnit) -> UnitHandle;

    /// Number of submitted units that have not finished yet.
    fn outstanding(&self) -> usize;

    /// Block until every unit submitted so far has finished.
    ///
    /// Returns [`SyncError::Aborted`] if any unit failed.
    fn wait(&self) -> Result<(), SyncError>;

    /// Whether a unit has failed and later units are being skipped.
    fn is_aborted(&self) -> bool;
}

/// Create the queue selected by a job.
pub fn build_queue(kind: QueueKind, threads: usize) -> Result<Arc<dyn TaskQueue>, SyncError> {
    Ok(match kind {
        QueueKind::Inline => Arc::new(InlineQueue::new()),
        QueueKind::Pooled => Arc::new(PooledQueue::new(threads)?),
    })
}

/// Abort flag plus the first error, shared by both queue kinds.
#[derive(Debug, Default)]
struct AbortState {
    aborted: AtomicBool,
    failures: AtomicUsize,
    first: Mutex<Option<SyncError>>,
}

impl AbortState {
    fn is_set(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn record(&self, err: SyncError) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.aborted.store(true, Ordering::Release);

        let mut first = self.first.lock().unwrap_or_else(PoisonError::into_inner);
        if failures == 1 {
            tracing::error!(error = %err, "work unit failed, aborting queue");
            *first = Some(err);
        } else {
            tracing::debug!(error = %err, "work unit failed after abort");
        }
    }

    /// The aggregate outcome. The first error is handed out once.
    fn outcome(&self) -> Result<(), SyncError> {
        if !self.is_set() {
            return Ok(());
        }

        let first = self
            .first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| SyncError::Pool {
                message: "queue was aborted by an earlier failure".to_string(),
            });
        Err(SyncError::Aborted {
            failures: self.failures.load(Ordering::Acquire),
            first: Box::new(first),
        })
    }

    /// Run `unit` unless aborted, updating `handle` with the result.
    fn execute(&self, unit: WorkUnit, handle: &UnitHandle) {
        if self.is_set() {
            handle.set(UnitState::Skipped);
            return;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(unit)).unwrap_or_else(|payload| {
            Err(SyncError::UnitPanicked {
                message: panic_message(payload.as_ref()),
            })
        });

        match outcome {
            Ok(()) => handle.set(UnitState::Completed),
            Err(err) => {
                handle.set(UnitState::Failed);
                self.record(err);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs every unit immediately on the submitting thread.
///
/// Units submitted from inside a running unit execute depth-first before
/// `submit` returns, so nothing is ever outstanding.
#[derive(Debug, Default)]
pub struct InlineQueue {
    abort: AbortState,
}

impl InlineQueue {
    /// Create an inline queue.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskQueue for InlineQueue {
    fn submit(&self, unit: WorkUnit) -> UnitHandle {
        let handle = UnitHandle::new();
        self.abort.execute(unit, &handle);
        handle
    }

    fn outstanding(&self) -> usize {
        0
    }

    fn wait(&self) -> Result<(), SyncError> {
        self.abort.outcome()
    }

    fn is_aborted(&self) -> bool {
        self.abort.is_set()
    }
}

/// Outstanding counter with an "empty" signal.
#[derive(Debug, Default)]
struct Tracker {
    pending: Mutex<usize>,
    drained: Condvar,
    abort: AbortState,
}

impl Tracker {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_one(&self) {
        *self.lock() += 1;
    }

    fn finish_one(&self) {
        let mut pending = self.lock();
        assert!(*pending > 0, "outstanding unit count underflow");
        *pending -= 1;
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self) {
        let mut pending = self.lock();
        while *pending > 0 {
            pending = self
                .drained
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Runs units on a dedicated rayon thread pool.
pub struct PooledQueue {
    pool: ThreadPool,
    tracker: Arc<Tracker>,
}

impl PooledQueue {
    /// Start a pool with `threads` workers (0 = one per CPU).
    pub fn new(threads: usize) -> Result<Self, SyncError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("treemirror-worker-{i}"))
            .build()
            .map_err(|e| SyncError::Pool {
                message: e.to_string(),
            })?;

        tracing::debug!(threads = pool.current_num_threads(), "worker pool started");
        Ok(Self {
            pool,
            tracker: Arc::new(Tracker::default()),
        })
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl std::fmt::Debug for PooledQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledQueue")
            .field("threads", &self.threads())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl TaskQueue for PooledQueue {
    fn submit(&self, unit: WorkUnit) -> UnitHandle {
        let handle = UnitHandle::new();
        self.tracker.start_one();

        let tracker = Arc::clone(&self.tracker);
        let unit_handle = handle.clone();
        self.pool.spawn(move || {
            tracker.abort.execute(unit, &unit_handle);
            tracker.finish_one();
        });

        handle
    }

    fn outstanding(&self) -> usize {
        *self.tracker.lock()
    }

    fn wait(&self) -> Result<(), SyncError> {
        self.tracker.wait_drained();
        self.tracker.abort.outcome()
    }

    fn is_aborted(&self) -> bool {
        self.tracker.abort.is_set()
    }
}

struct JoinInner {
    queue: Arc<dyn TaskQueue>,
    pending: AtomicUsize,
    then: Mutex<Option<WorkUnit>>,
}

impl JoinInner {
    fn arrive(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let then = self.then.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(then) = then {
                self.queue.submit(then);
            }
        }
    }
}

/// Submits a continuation once a set of units has finished.
///
/// Every unit that has to finish first takes a [`Ticket`] and calls
/// [`Ticket::arrive`] as its last action. Once all tickets have arrived and
/// the join has been [sealed](Join::seal), the continuation is submitted
/// to the queue. Nobody blocks while waiting.
///
/// A ticket that is dropped without arriving keeps the continuation from
/// ever running; this is what happens when its unit fails or is skipped.
pub struct Join {
    inner: Arc<JoinInner>,
}

impl Join {
    /// Prepare `then` to run after every ticket handed out by this join.
    pub fn new(queue: Arc<dyn TaskQueue>, then: WorkUnit) -> Self {
        Self {
            inner: Arc::new(JoinInner {
                queue,
                // Released by `seal`
                pending: AtomicUsize::new(1),
                then: Mutex::new(Some(then)),
            }),
        }
    }

    /// Hand out one arrival obligation.
    pub fn ticket(&self) -> Ticket {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        Ticket {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Stop handing out tickets. Fires immediately if every ticket has arrived.
    pub fn seal(self) {
        self.inner.arrive();
    }
}

/// One outstanding arrival for a [`Join`].
#[must_use = "a ticket that never arrives blocks its join forever"]
pub struct Ticket {
    inner: Arc<JoinInner>,
}

impl Ticket {
    /// Mark this obligation as fulfilled.
    pub fn arrive(self) {
        self.inner.arrive();
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("pending", &self.inner.pending.load(Ordering::Acquire))
            .finish()
    }
}
