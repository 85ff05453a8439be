//! Background dispatcher feeding due indications to the worker pool.
//!
//! ```text
//!            ┌──────────── signal (enqueue, attempt finished) ───────────┐
//!            ▼                                                           │
//!   ┌─────────────────┐  lease_due()  ┌──────────────┐  submit()  ┌──────┴──────┐
//!   │ wait ≤ next_wake│ ────────────▶ │ queue table  │ ─────────▶ │ worker pool │
//!   └─────────────────┘   per queue   └──────────────┘            └─────────────┘
//! ```
//!
//! The dispatcher sleeps until it is signalled or until the earliest retry
//! it knows about falls due, bounded by the current minimum retry interval.
//! Each wake scans every live queue once. A stop request is only observed
//! at the top of the loop, so a scan that has started always completes.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use tidings_core::Clock;
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    config::QueueSettings,
    error::{DeliveryError, Result},
    table::DestinationQueueTable,
    worker_pool::DeliveryWorkerPool,
};

const MIN_WAIT: Duration = Duration::from_millis(1);

/// Lifecycle state published by a running dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Scanning queues and waiting for work.
    Running,
    /// Stop observed, leaving the loop.
    Stopping,
    /// Loop exited.
    Stopped,
}

/// Scans destination queues and hands due indications to the worker pool.
#[derive(Debug)]
pub struct Dispatcher {
    table: Arc<DestinationQueueTable>,
    pool: Arc<DeliveryWorkerPool>,
    settings: Arc<RwLock<QueueSettings>>,
    wake: Arc<Notify>,
    idle_cleanup_interval: Duration,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    state: watch::Sender<DispatcherState>,
}

/// Control handle for a spawned dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    join: JoinHandle<()>,
    wake: Arc<Notify>,
    cancellation_token: CancellationToken,
    state: watch::Receiver<DispatcherState>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    ///
    /// `settings` is read on every cycle for the maximum wait, so runtime
    /// changes to the retry interval take effect on the next wake. `wake`
    /// must be the same signal the worker pool notifies.
    pub fn new(
        table: Arc<DestinationQueueTable>,
        pool: Arc<DeliveryWorkerPool>,
        settings: Arc<RwLock<QueueSettings>>,
        wake: Arc<Notify>,
        idle_cleanup_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(DispatcherState::Running);
        Self {
            table,
            pool,
            settings,
            wake,
            idle_cleanup_interval,
            clock,
            cancellation_token: CancellationToken::new(),
            state,
        }
    }

    /// Runs the dispatch loop on the tokio runtime.
    pub fn spawn(self) -> DispatcherHandle {
        let wake = self.wake.clone();
        let cancellation_token = self.cancellation_token.clone();
        let state = self.state.subscribe();
        let join = tokio::spawn(self.run());

        DispatcherHandle { join, wake, cancellation_token, state }
    }

    async fn run(self) {
        info!(
            max_workers = self.pool.max_workers(),
            idle_cleanup_secs = self.idle_cleanup_interval.as_secs(),
            "indication dispatcher started"
        );

        let mut wait = self.max_wait();
        let mut last_cleanup = tokio::time::Instant::now();

        loop {
            tokio::select! {
                () = self.wake.notified() => {},
                () = self.cancellation_token.cancelled() => {},
                () = tokio::time::sleep(wait) => {},
            }

            if self.cancellation_token.is_cancelled() {
                self.state.send_replace(DispatcherState::Stopping);
                break;
            }

            wait = self.dispatch_due();

            if last_cleanup.elapsed() >= self.idle_cleanup_interval {
                self.pool.cleanup_idle();
                last_cleanup = tokio::time::Instant::now();
            }
        }

        self.state.send_replace(DispatcherState::Stopped);
        info!("indication dispatcher stopped");
    }

    /// Runs one scan over all live queues and returns how long to wait
    /// before the next one.
    pub fn dispatch_due(&self) -> Duration {
        let now = self.clock.now();
        let max_wait = self.max_wait();
        let mut next_wake: Option<Instant> = None;
        let mut submitted = 0_usize;
        let queues = self.table.snapshot();

        for queue in &queues {
            let scan = queue.lease_due(now);
            if let Some(lease) = scan.lease {
                self.pool.submit(lease);
                submitted += 1;
            }
            if let Some(wake_at) = scan.next_wake {
                next_wake = Some(next_wake.map_or(wake_at, |current| current.min(wake_at)));
            }
        }

        let wait = next_wake
            .map_or(max_wait, |wake_at| wake_at.saturating_duration_since(now).min(max_wait))
            .max(MIN_WAIT);

        if submitted > 0 {
            debug!(
                queues = queues.len(),
                submitted,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "dispatched due indications"
            );
        }
        wait
    }

    fn max_wait(&self) -> Duration {
        self.settings.read().retry.min_retry_interval.max(MIN_WAIT)
    }
}

impl DispatcherHandle {
    /// Wakes the dispatcher for an immediate scan.
    pub fn signal(&self) {
        self.wake.notify_one();
    }

    /// Returns the most recently published state.
    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Requests a cooperative stop. The current scan, if any, completes.
    pub fn request_stop(&self) {
        self.cancellation_token.cancel();
    }

    /// Requests a stop and waits until the loop has exited.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownTimeout`] if the dispatcher has not
    /// stopped within `timeout`, or [`DeliveryError::InternalError`] if its
    /// task panicked.
    pub async fn stop(self, timeout: Duration) -> Result<()> {
        self.request_stop();

        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_error)) => {
                error!(error = %join_error, "dispatcher task ended abnormally");
                Err(DeliveryError::internal(format!("dispatcher task failed: {join_error}")))
            },
            Err(_elapsed) => {
                error!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "dispatcher did not stop in time"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Returns a receiver that observes every state change, for callers
    /// that need to wait for [`DispatcherState::Stopped`] without owning
    /// the handle.
    pub fn subscribe_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.clone()
    }
}
