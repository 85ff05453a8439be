//! Reliable delivery service.
//!
//! Ties the queue table, dispatcher and worker pool together and exposes the
//! operations the rest of the server uses: enqueueing, subscription and
//! listener deactivation, runtime configuration changes and queue
//! introspection.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tidings_core::{
    Clock, DeliveryContext, Destination, DestinationKey, EventHandler, NoOpEventHandler,
    RealClock, SequenceNumber, SubscriptionRef,
};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{
    config::{ConfigUpdate, DeliveryConfig, QueueSettings},
    dispatcher::{Dispatcher, DispatcherHandle},
    error::{EnqueueError, Result},
    plugin::DeliveryPlugin,
    queue::QueueInfo,
    table::DestinationQueueTable,
    worker_pool::DeliveryWorkerPool,
};

/// Aggregate statistics across all queues and workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Live destination queues.
    pub live_queues: usize,
    /// Indications waiting in all queues, not counting leased ones.
    pub queued_indications: usize,
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

/// Per-destination queueing with bounded retry and background dispatch.
///
/// ```no_run
/// use std::sync::Arc;
///
/// use tidings_delivery::{DeliveryConfig, PluginRegistry, ReliableDeliveryService};
///
/// # async fn example() -> tidings_delivery::Result<()> {
/// let service = ReliableDeliveryService::with_defaults(
///     DeliveryConfig::default(),
///     Arc::new(PluginRegistry::new()),
/// );
/// service.start()?;
/// // ... enqueue indications ...
/// service.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ReliableDeliveryService {
    config: DeliveryConfig,
    settings: Arc<RwLock<QueueSettings>>,
    table: Arc<DestinationQueueTable>,
    pool: Arc<DeliveryWorkerPool>,
    wake: Arc<Notify>,
    clock: Arc<dyn Clock>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
}

impl ReliableDeliveryService {
    /// Creates a service. Nothing is dispatched until
    /// [`ReliableDeliveryService::start`] is called.
    pub fn new(
        config: DeliveryConfig,
        plugin: Arc<dyn DeliveryPlugin>,
        events: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let table = Arc::new(DestinationQueueTable::new(
            &config.indication_service_name,
            &config.object_manager_name,
            clock.clone(),
        ));
        let pool = Arc::new(DeliveryWorkerPool::new(
            config.max_delivery_threads,
            plugin,
            events,
            clock.clone(),
            wake.clone(),
        ));

        Self {
            settings: Arc::new(RwLock::new(config.queue.clone())),
            config,
            table,
            pool,
            wake,
            clock,
            dispatcher: Mutex::new(None),
        }
    }

    /// Creates a service using the system clock and discarding events.
    pub fn with_defaults(config: DeliveryConfig, plugin: Arc<dyn DeliveryPlugin>) -> Self {
        Self::new(config, plugin, Arc::new(NoOpEventHandler::new()), Arc::new(RealClock::new()))
    }

    /// Spawns the dispatcher. Calling it again while running has no effect.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Currently never returns an error; the signature leaves room for
    /// startup validation.
    pub fn start(&self) -> Result<()> {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            warn!("reliable delivery service already started");
            return Ok(());
        }

        let handle = Dispatcher::new(
            self.table.clone(),
            self.pool.clone(),
            self.settings.clone(),
            self.wake.clone(),
            self.config.idle_cleanup_interval,
            self.clock.clone(),
        )
        .spawn();
        *dispatcher = Some(handle);

        info!(
            max_delivery_threads = self.config.max_delivery_threads,
            max_retry_attempts = self.settings.read().retry.max_retry_attempts,
            "reliable delivery service started"
        );
        Ok(())
    }

    /// Returns true while new indications should be queued rather than
    /// delivered once.
    pub fn reliable_delivery_enabled(&self) -> bool {
        self.settings.read().retry.is_reliable()
    }

    /// Returns the settings new queues are created with.
    pub fn settings(&self) -> QueueSettings {
        self.settings.read().clone()
    }

    /// Queues an indication for `destination` and wakes the dispatcher.
    ///
    /// The destination's queue is created on first use. A queue that was
    /// closed by a concurrent listener removal is replaced once.
    ///
    /// # Errors
    ///
    /// - [`EnqueueError::ReliableDeliveryDisabled`] if the retry limit is
    ///   zero; no queue is created
    /// - [`EnqueueError::QueueFull`] if the queue is at its maximum length
    /// - [`EnqueueError::Closed`] if the replacement queue was closed too
    pub fn enqueue(
        &self,
        destination: &Destination,
        payload: Bytes,
        subscription: SubscriptionRef,
        context: DeliveryContext,
    ) -> std::result::Result<SequenceNumber, EnqueueError> {
        let settings = self.settings.read().clone();
        if !settings.retry.is_reliable() {
            return Err(EnqueueError::ReliableDeliveryDisabled { key: destination.key() });
        }

        let queue = self.table.get_or_create(destination, &settings);
        let sequence_number =
            match queue.enqueue(payload.clone(), subscription.clone(), context.clone()) {
                Err(EnqueueError::Closed { key }) => {
                    debug!(destination = %key, "queue closed during enqueue, using a fresh queue");
                    self.table.remove_closed(&queue);
                    self.table
                        .get_or_create(destination, &settings)
                        .enqueue(payload, subscription, context)?
                },
                result => result?,
            };

        self.wake.notify_one();
        Ok(sequence_number)
    }

    /// Drops every queued indication of a subscription that was disabled or
    /// deleted. Returns the number of indications dropped.
    pub fn notify_subscription_inactive(&self, subscription: &SubscriptionRef) -> usize {
        let mut dropped = 0;
        self.table.for_each(|queue| dropped += queue.purge_subscription(subscription));

        info!(
            subscription = %subscription,
            dropped,
            "subscription inactive, purged queued indications"
        );
        dropped
    }

    /// Removes and drains the queue of a listener that was deleted.
    ///
    /// Returns the number of indications dropped, or `None` if the listener
    /// had no queue.
    pub fn notify_listener_inactive(&self, key: &DestinationKey) -> Option<usize> {
        let queue = self.table.remove(key)?;
        Some(queue.drain_and_close())
    }

    /// Applies a runtime configuration change.
    ///
    /// The change applies to queues created from now on and to every
    /// existing queue, except that setting the retry limit to zero leaves
    /// existing queues on their current limit so that what they hold is
    /// still delivered.
    pub fn update_config(&self, update: ConfigUpdate) {
        update.apply(&mut self.settings.write());

        if update != ConfigUpdate::MaxRetryAttempts(0) {
            self.table.for_each(|queue| queue.update_settings(update));
        }

        info!(?update, "delivery configuration updated");
        self.wake.notify_one();
    }

    /// Returns the snapshot of one queue.
    pub fn queue_info(&self, key: &DestinationKey) -> Option<QueueInfo> {
        self.table.lookup(key).map(|queue| queue.snapshot_info())
    }

    /// Returns snapshots of every live queue, ordered by name.
    pub fn queue_infos(&self) -> Vec<QueueInfo> {
        let mut infos: Vec<_> =
            self.table.snapshot().iter().map(|queue| queue.snapshot_info()).collect();
        infos.sort_by(|left, right| left.name.cmp(&right.name));
        infos
    }

    /// Returns the keys of every live queue, ordered by name.
    pub fn queue_names(&self) -> Vec<DestinationKey> {
        self.table.keys()
    }

    /// Returns the queue table.
    pub fn table(&self) -> &Arc<DestinationQueueTable> {
        &self.table
    }

    /// Returns aggregate statistics.
    pub fn stats(&self) -> ServiceStats {
        let queues = self.table.snapshot();
        let pool = self.pool.stats();
        ServiceStats {
            live_queues: queues.len(),
            queued_indications: queues.iter().map(|queue| queue.len()).sum(),
            running_workers: pool.running_workers,
            peak_workers: pool.peak_workers,
            pending_work: pool.pending_work,
            delivered: pool.delivered,
            failed_attempts: pool.failed_attempts,
        }
    }

    /// Stops the service within the configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// See [`ReliableDeliveryService::shutdown_with_timeout`].
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(self.config.shutdown_timeout).await
    }

    /// Stops the dispatcher, lets in-flight attempts finish and drains every
    /// queue.
    ///
    /// Queues are drained even when stopping times out.
    ///
    /// # Errors
    ///
    /// Returns [`crate::DeliveryError::ShutdownTimeout`] if the dispatcher
    /// or the workers did not stop within `timeout`.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        let started = tokio::time::Instant::now();
        let dispatcher = self.dispatcher.lock().take();

        let dispatcher_result = match dispatcher {
            Some(handle) => handle.stop(timeout).await,
            None => Ok(()),
        };
        let remaining = timeout.saturating_sub(started.elapsed());
        let pool_result = self.pool.shutdown(remaining).await;
        let dropped = self.table.clear_all();

        info!(dropped, "reliable delivery service stopped");
        dispatcher_result.and(pool_result)
    }
}
