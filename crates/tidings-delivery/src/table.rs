//! Registry of live destination queues.
//!
//! The table is the only owner of [`DestinationQueue`] handles that outlives
//! a single operation. Membership changes take the write lock. Readers take
//! the read lock just long enough to clone the handles they need and then
//! work on each queue under that queue's own lock.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tidings_core::{Clock, Destination, DestinationKey};
use tracing::{debug, info};

use crate::{config::QueueSettings, queue::DestinationQueue};

/// Concurrent map from destination key to its queue.
#[derive(Debug)]
pub struct DestinationQueueTable {
    queues: RwLock<HashMap<DestinationKey, Arc<DestinationQueue>>>,
    context_prefix: String,
    started_at: DateTime<Utc>,
    clock: Arc<dyn Clock>,
}

impl DestinationQueueTable {
    /// Creates an empty table.
    ///
    /// The service and object manager names together with the current time
    /// form the prefix of every sequence context this table hands out, so
    /// contexts differ across server restarts.
    pub fn new(
        indication_service_name: &str,
        object_manager_name: &str,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let started_at = clock.now_utc();
        let context_prefix = format!(
            "{indication_service_name}-{object_manager_name}-{}",
            started_at.timestamp_micros()
        );

        Self { queues: RwLock::new(HashMap::new()), context_prefix, started_at, clock }
    }

    /// Returns the sequence context a queue for `destination` would use.
    pub fn sequence_context_for(&self, destination: &Destination) -> String {
        let created = destination.creation_time.unwrap_or(self.started_at);
        format!("{}-{}", self.context_prefix, created.timestamp_micros())
    }

    /// Returns the queue for `destination`, creating it on first use.
    ///
    /// A newly created queue captures `destination` and `settings` as its
    /// snapshots. An existing queue keeps the snapshots it was created with.
    pub fn get_or_create(
        &self,
        destination: &Destination,
        settings: &QueueSettings,
    ) -> Arc<DestinationQueue> {
        let key = destination.key();

        if let Some(queue) = self.queues.read().get(&key) {
            return queue.clone();
        }

        let mut queues = self.queues.write();
        if let Some(queue) = queues.get(&key) {
            return queue.clone();
        }

        let queue = Arc::new(DestinationQueue::new(
            destination.clone(),
            settings.clone(),
            self.sequence_context_for(destination),
            self.clock.clone(),
        ));
        queues.insert(key.clone(), queue.clone());

        debug!(
            destination = %key,
            sequence_context = queue.sequence_context(),
            live_queues = queues.len(),
            "created destination queue"
        );
        queue
    }

    /// Returns the queue for `key`, if one exists.
    pub fn lookup(&self, key: &DestinationKey) -> Option<Arc<DestinationQueue>> {
        self.queues.read().get(key).cloned()
    }

    /// Unregisters the queue for `key` and returns it.
    ///
    /// The caller is expected to drain the returned queue.
    pub fn remove(&self, key: &DestinationKey) -> Option<Arc<DestinationQueue>> {
        self.queues.write().remove(key)
    }

    /// Unregisters `queue` if it is closed and still registered under its
    /// key. Returns true if it was removed.
    pub fn remove_closed(&self, queue: &Arc<DestinationQueue>) -> bool {
        let mut queues = self.queues.write();
        let registered = queues.get(queue.key()).is_some_and(|current| Arc::ptr_eq(current, queue));
        if registered && queue.is_closed() {
            queues.remove(queue.key());
            return true;
        }
        false
    }

    /// Clones the handles of all live queues.
    pub fn snapshot(&self) -> Vec<Arc<DestinationQueue>> {
        self.queues.read().values().cloned().collect()
    }

    /// Calls `f` for every live queue without holding the table lock.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<DestinationQueue>)) {
        for queue in self.snapshot() {
            f(&queue);
        }
    }

    /// Drains and removes every queue. Returns the number of indications
    /// discarded.
    pub fn clear_all(&self) -> usize {
        let removed: Vec<_> = self.queues.write().drain().map(|(_, queue)| queue).collect();
        let queue_count = removed.len();
        let dropped: usize = removed.iter().map(|queue| queue.drain_and_close()).sum();

        info!(queues = queue_count, dropped, "cleared all destination queues");
        dropped
    }

    /// Returns the keys of all live queues in sorted order.
    pub fn keys(&self) -> Vec<DestinationKey> {
        let mut keys: Vec<_> = self.queues.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of live queues.
    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    /// Returns true if no queue exists.
    pub fn is_empty(&self) -> bool {
        self.queues.read().is_empty()
    }
}
