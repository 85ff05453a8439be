//! Bounded pool of delivery workers.
//!
//! The dispatcher submits leases to a shared work list. A worker is spawned
//! for each submission while fewer than `max_workers` are running. Each
//! worker performs one delivery attempt per lease, settles the lease with
//! its originating queue, publishes the outcome as events, signals the
//! dispatcher and takes the next lease. A worker that finds the list empty
//! exits.
//!
//! The running count is changed under the same lock as the work list, so a
//! submitted lease is never left behind without a worker to take it.

use std::{
    any::Any,
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::FutureExt;
use parking_lot::Mutex;
use tidings_core::{
    AttemptFailedEvent, Clock, DeliveredEvent, DeliveryEvent, DiscardedEvent, EventHandler,
    SubscriptionRemovalDueEvent,
};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, ErrorCategory, Result},
    plugin::DeliveryPlugin,
    queue::{FailureDisposition, Lease, Settlement},
};

/// Point-in-time worker pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers currently running.
    pub running_workers: usize,
    /// Highest number of workers that ever ran at once.
    pub peak_workers: usize,
    /// Leases waiting for a worker.
    pub pending_work: usize,
    /// Successful delivery attempts.
    pub delivered: u64,
    /// Failed delivery attempts.
    pub failed_attempts: u64,
}

/// Bounded set of workers performing delivery attempts.
pub struct DeliveryWorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    max_workers: usize,
    work: Mutex<WorkState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    plugin: Arc<dyn DeliveryPlugin>,
    events: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    dispatcher_wake: Arc<Notify>,
    cancellation_token: CancellationToken,
    next_worker_id: AtomicUsize,
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
}

#[derive(Default)]
struct WorkState {
    items: VecDeque<Lease>,
    running: usize,
    peak: usize,
}

impl DeliveryWorkerPool {
    /// Creates a pool that runs at most `max_workers` workers at once.
    ///
    /// `dispatcher_wake` is signalled after every attempt so the dispatcher
    /// can rescan the queue that just became free.
    pub fn new(
        max_workers: usize,
        plugin: Arc<dyn DeliveryPlugin>,
        events: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
        dispatcher_wake: Arc<Notify>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                max_workers: max_workers.max(1),
                work: Mutex::new(WorkState::default()),
                handles: Mutex::new(Vec::new()),
                plugin,
                events,
                clock,
                dispatcher_wake,
                cancellation_token: CancellationToken::new(),
                next_worker_id: AtomicUsize::new(0),
                delivered: AtomicU64::new(0),
                failed_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Adds a lease to the work list and starts a worker if the pool is
    /// below its bound.
    ///
    /// After shutdown the lease is handed straight back to its queue.
    pub fn submit(&self, lease: Lease) {
        // Checked under the work lock so that shutdown's drain sees every
        // lease pushed before cancellation.
        let mut work = self.inner.work.lock();
        if self.inner.cancellation_token.is_cancelled() {
            drop(work);
            lease.release();
            return;
        }

        work.items.push_back(lease);
        let spawn = work.running < self.inner.max_workers;
        if spawn {
            work.running += 1;
            work.peak = work.peak.max(work.running);
        }
        drop(work);

        if spawn {
            let worker_id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
            let inner = self.inner.clone();
            let handle = tokio::spawn(async move { inner.run_worker(worker_id).await });
            self.inner.handles.lock().push(handle);
        }
    }

    /// Forgets workers that have exited. Returns how many were reclaimed.
    pub fn cleanup_idle(&self) -> usize {
        let mut handles = self.inner.handles.lock();
        let before = handles.len();
        handles.retain(|handle| !handle.is_finished());
        let reclaimed = before - handles.len();

        if reclaimed > 0 {
            debug!(reclaimed, remaining = handles.len(), "reclaimed idle delivery workers");
        }
        reclaimed
    }

    /// Returns current statistics.
    pub fn stats(&self) -> PoolStats {
        let work = self.inner.work.lock();
        PoolStats {
            running_workers: work.running,
            peak_workers: work.peak,
            pending_work: work.items.len(),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            failed_attempts: self.inner.failed_attempts.load(Ordering::Relaxed),
        }
    }

    /// Number of workers currently running.
    pub fn running(&self) -> usize {
        self.inner.work.lock().running
    }

    /// Maximum number of concurrent workers.
    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Stops taking new work and waits for in-flight attempts to finish.
    ///
    /// Leases still waiting in the work list are handed back to their
    /// queues unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownTimeout`] if workers are still
    /// running after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.inner.cancellation_token.cancel();

        let handles = std::mem::take(&mut *self.inner.handles.lock());
        info!(
            workers = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "shutting down delivery workers"
        );

        let joined = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;

        let leftover: Vec<Lease> = self.inner.work.lock().items.drain(..).collect();
        let returned = leftover.len();
        for lease in leftover {
            lease.release();
        }

        match joined {
            Ok(results) => {
                let panicked = results.iter().filter(|result| result.is_err()).count();
                if panicked > 0 {
                    warn!(panicked, "delivery workers ended abnormally during shutdown");
                }
                info!(returned, "delivery worker pool stopped");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "delivery worker shutdown timed out, attempts may still be in flight"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl std::fmt::Debug for DeliveryWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryWorkerPool")
            .field("max_workers", &self.inner.max_workers)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for DeliveryWorkerPool {
    fn drop(&mut self) {
        if self.inner.cancellation_token.is_cancelled() {
            return;
        }
        let running = self.inner.work.lock().running;
        if running > 0 {
            warn!(
                running,
                "DeliveryWorkerPool dropped with running workers; call shutdown() first"
            );
        }
        self.inner.cancellation_token.cancel();
    }
}

impl PoolInner {
    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "delivery worker started");

        loop {
            let lease = {
                let mut work = self.work.lock();
                let next = if self.cancellation_token.is_cancelled() {
                    None
                } else {
                    work.items.pop_front()
                };
                match next {
                    Some(lease) => lease,
                    None => {
                        work.running -= 1;
                        break;
                    },
                }
            };

            self.attempt(worker_id, lease).await;
            self.dispatcher_wake.notify_one();
        }

        debug!(worker_id, "delivery worker idle, exiting");
    }

    async fn attempt(&self, worker_id: usize, mut lease: Lease) {
        let destination = lease.destination().clone();
        let indication_id = lease.indication.id;
        let key = lease.indication.destination.clone();
        let subscription = lease.indication.subscription.clone();
        let sequence_number = lease.indication.sequence_number();
        let attempt_number = lease.indication.attempt_number();

        let outcome = match AssertUnwindSafe(self.plugin.deliver(
            &destination,
            &lease.indication,
            &mut lease.connection,
        ))
        .catch_unwind()
        .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    worker_id,
                    destination = %key,
                    panic = %message,
                    "delivery plugin panicked"
                );
                Err(DeliveryError::internal(format!("delivery plugin panicked: {message}")))
            },
        };

        let settlement = lease.settle(&outcome);
        let now = self.clock.now_utc();

        let (error, report) = match (outcome, settlement) {
            (Ok(()), _) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                self.events
                    .handle_event(DeliveryEvent::Delivered(DeliveredEvent {
                        indication_id,
                        destination: key,
                        subscription,
                        sequence_number,
                        attempt_number,
                        delivered_at: now,
                    }))
                    .await;
                return;
            },
            (Err(error), Settlement::Failed(report)) => (error, report),
            (Err(error), Settlement::Delivered) => {
                error!(
                    worker_id,
                    destination = %key,
                    error = %error,
                    "failed attempt settled as delivered"
                );
                return;
            },
        };

        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
        debug!(
            worker_id,
            destination = %key,
            attempt_number,
            category = %ErrorCategory::from(&error),
            error = %error,
            "delivery attempt failed"
        );

        self.events
            .handle_event(DeliveryEvent::AttemptFailed(AttemptFailedEvent {
                indication_id,
                destination: key.clone(),
                subscription: subscription.clone(),
                sequence_number,
                attempt_number,
                failed_at: now,
                error_message: error.to_string(),
                is_retryable: error.is_retryable(),
            }))
            .await;

        if report.subscription_removal_due {
            self.events
                .handle_event(DeliveryEvent::SubscriptionRemovalDue(SubscriptionRemovalDueEvent {
                    destination: key.clone(),
                    subscription: subscription.clone(),
                    last_successful_delivery: report.last_successful_delivery,
                    detected_at: now,
                }))
                .await;
        }

        if let FailureDisposition::Discarded(reason) = report.disposition {
            self.events
                .handle_event(DeliveryEvent::Discarded(DiscardedEvent {
                    indication_id,
                    destination: key,
                    subscription,
                    sequence_number,
                    reason,
                    discarded_at: now,
                }))
                .await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
