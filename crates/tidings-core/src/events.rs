//! Event system for observing delivery outcomes.
//!
//! Delivery workers publish an event for every attempt outcome and every
//! indication they drop. Subscribers such as monitoring, audit logging or
//! the subscription manager (which applies the on-fatal-error policy)
//! implement [`EventHandler`] and are registered with the delivery service.
//!
//! ```text
//! ┌─────────────────┐   Delivered / AttemptFailed   ┌────────────────────┐
//! │ Delivery worker │ ─────────────────────────────▶│ MulticastHandler   │
//! │ (producer)      │   Discarded / RemovalDue      │ (fan-out)          │
//! └─────────────────┘                               └────────────────────┘
//!                                                             │
//!                                         ┌───────────────────┼──────────────┐
//!                                         ▼                   ▼              ▼
//!                                   metrics/audit     subscription mgr   test recorder
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DestinationKey, IndicationId, SequenceNumber, SubscriptionRef};

/// Events emitted by the delivery subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// An indication reached its destination.
    Delivered(DeliveredEvent),

    /// A delivery attempt failed; the indication may still be retried.
    AttemptFailed(AttemptFailedEvent),

    /// An indication left its queue without being delivered.
    Discarded(DiscardedEvent),

    /// A destination has not accepted anything for the subscription removal
    /// interval.
    SubscriptionRemovalDue(SubscriptionRemovalDueEvent),
}

impl DeliveryEvent {
    /// Returns the destination the event concerns.
    pub fn destination(&self) -> &DestinationKey {
        match self {
            Self::Delivered(event) => &event.destination,
            Self::AttemptFailed(event) => &event.destination,
            Self::Discarded(event) => &event.destination,
            Self::SubscriptionRemovalDue(event) => &event.destination,
        }
    }
}

/// Emitted when a delivery attempt succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveredEvent {
    /// Indication that was delivered.
    pub indication_id: IndicationId,
    /// Destination it was delivered to.
    pub destination: DestinationKey,
    /// Subscription that produced it.
    pub subscription: SubscriptionRef,
    /// Sequence number, if it was reliably delivered.
    pub sequence_number: Option<SequenceNumber>,
    /// Attempt that succeeded (1-based).
    pub attempt_number: u32,
    /// When the delivery completed.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted when a delivery attempt fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFailedEvent {
    /// Indication whose attempt failed.
    pub indication_id: IndicationId,
    /// Destination that was attempted.
    pub destination: DestinationKey,
    /// Subscription that produced the indication.
    pub subscription: SubscriptionRef,
    /// Sequence number, if it was reliably delivered.
    pub sequence_number: Option<SequenceNumber>,
    /// Attempt that failed (1-based).
    pub attempt_number: u32,
    /// When the failure was observed.
    pub failed_at: DateTime<Utc>,
    /// Error reported by the delivery plugin.
    pub error_message: String,
    /// Whether the error class allows another attempt.
    pub is_retryable: bool,
}

/// Why an indication was dropped after leaving the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// Every allowed attempt failed.
    RetryAttemptsExceeded,
    /// The queue had no room to take the indication back for a retry.
    QueueFull,
    /// The queue was drained while the attempt was in flight.
    QueueClosed,
}

/// Emitted when an indication is dropped by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscardedEvent {
    /// Indication that was dropped.
    pub indication_id: IndicationId,
    /// Destination it was meant for.
    pub destination: DestinationKey,
    /// Subscription that produced it.
    pub subscription: SubscriptionRef,
    /// Sequence number, if it was reliably delivered.
    pub sequence_number: Option<SequenceNumber>,
    /// Why it was dropped.
    pub reason: DiscardReason,
    /// When it was dropped.
    pub discarded_at: DateTime<Utc>,
}

/// Emitted when a destination has been failing for longer than the
/// subscription removal interval.
///
/// The subscription manager reacts by applying the subscription's
/// on-fatal-error policy (ignore, disable or remove).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRemovalDueEvent {
    /// Destination that keeps failing.
    pub destination: DestinationKey,
    /// Subscription whose indication just failed.
    pub subscription: SubscriptionRef,
    /// Last successful delivery, or `None` if there never was one.
    pub last_successful_delivery: Option<DateTime<Utc>>,
    /// When the condition was detected.
    pub detected_at: DateTime<Utc>,
}

/// Trait for handling delivery events.
///
/// Implementations must not block delivery processing. If event handling
/// fails it should be logged by the handler and never propagated back into
/// the delivery subsystem.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a delivery event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Event handler that forwards every event to several subscribers
/// concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber to receive delivery events.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let deliveries = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(deliveries).await;
    }
}
