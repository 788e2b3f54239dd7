//! Periodic progress reporting.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use treemirror_core::SyncError;

use crate::stats::StatsCollector;

/// Publishes a [`StatsSnapshot`](crate::StatsSnapshot) every `period` on its
/// own thread until stopped.
#[derive(Debug)]
pub struct RateReporter {
    token: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl RateReporter {
    /// Spawn the reporter thread.
    pub fn start(stats: Arc<StatsCollector>, period: Duration) -> Result<Self, SyncError> {
        let token = CancellationToken::new();
        let child = token.clone();

        let thread = std::thread::Builder::new()
            .name("treemirror-reporter".to_string())
            .spawn(move || report_loop(stats, period, child))
            .map_err(|e| SyncError::Pool {
                message: format!("failed to start rate reporter: {e}"),
            })?;

        Ok(Self {
            token,
            thread: Some(thread),
        })
    }

    /// Stop reporting and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.token.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("rate reporter thread panicked");
            }
        }
    }
}

impl Drop for RateReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn report_loop(stats: Arc<StatsCollector>, period: Duration, token: CancellationToken) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to build reporter runtime");
            return;
        }
    };

    runtime.block_on(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    stats.publish();
                }
            }
        }
    });
}
