//! Event recording for assertions on worker outcomes.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tidings_core::{DeliveryEvent, DestinationKey, DiscardReason, EventHandler};
use tokio::sync::Notify;

/// Event handler that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<DeliveryEvent>>,
    notify: Notify,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All events received so far.
    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().clone()
    }

    /// Number of events received so far.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing was received.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `Delivered` events for one destination.
    pub fn delivered_count(&self, destination: &DestinationKey) -> usize {
        self.count(|event| {
            matches!(event, DeliveryEvent::Delivered(e) if &e.destination == destination)
        })
    }

    /// Number of `AttemptFailed` events for one destination.
    pub fn failed_attempt_count(&self, destination: &DestinationKey) -> usize {
        self.count(|event| {
            matches!(event, DeliveryEvent::AttemptFailed(e) if &e.destination == destination)
        })
    }

    /// Reasons of every `Discarded` event for one destination.
    pub fn discard_reasons(&self, destination: &DestinationKey) -> Vec<DiscardReason> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                DeliveryEvent::Discarded(e) if &e.destination == destination => Some(e.reason),
                _ => None,
            })
            .collect()
    }

    /// Number of `SubscriptionRemovalDue` events for one destination.
    pub fn removal_due_count(&self, destination: &DestinationKey) -> usize {
        self.count(|event| {
            matches!(
                event,
                DeliveryEvent::SubscriptionRemovalDue(e) if &e.destination == destination
            )
        })
    }

    /// Waits until at least `count` events were received.
    ///
    /// # Panics
    ///
    /// Panics if the count is not reached within `timeout`.
    pub async fn wait_for_events(&self, count: usize, timeout: Duration) {
        let result = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;

        assert!(
            result.is_ok(),
            "events not received in time. Expected: {count}, Actual: {}, Timeout: {timeout:?}",
            self.len()
        );
    }

    fn count(&self, predicate: impl Fn(&DeliveryEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }
}
