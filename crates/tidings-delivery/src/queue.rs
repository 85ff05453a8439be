//! Per-destination indication queue.
//!
//! A [`DestinationQueue`] owns every pending indication for one destination
//! together with its sequence counter, retry policy, drop counters and
//! cached plugin connection. All of that state sits behind a single mutex;
//! the lock is only held for list and counter bookkeeping, never across a
//! delivery attempt.
//!
//! # Indication lifecycle
//!
//! ```text
//!   enqueue ──▶ pending ──lease_due──▶ leased ──success──▶ delivered
//!      │           │  ▲                  │
//!      │           │  └──── requeued ◀───┤ failure, retries left
//!      ▼           ▼                     ▼
//!  queue full   expired /          retries exceeded /
//!               purged / drained   queue full / closed
//! ```
//!
//! Every indication that leaves the queue either counts as a success or
//! increments exactly one of the four drop counters. At most one indication
//! per queue is leased at a time; the cached connection therefore always has
//! a single user.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Weak},
    time::Instant,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tidings_core::{
    Clock, DeliveryContext, Destination, DestinationKey, DiscardReason, Indication,
    SequenceIdentifier, SequenceNumber, SubscriptionRef,
};
use tracing::{debug, info, warn};

use crate::{
    config::{ConfigUpdate, QueueSettings},
    error::{DeliveryError, EnqueueError},
    plugin::ConnectionHandle,
    retry::RetryDecision,
    MIN_ADAPTIVE_QUEUE_LENGTH,
};

/// Queue of pending indications for a single destination.
pub struct DestinationQueue {
    key: DestinationKey,
    destination: Arc<Destination>,
    sequence_context: Arc<str>,
    creation_time: DateTime<Utc>,
    created_at: Instant,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
}

struct QueueState {
    pending: VecDeque<Indication>,
    next_sequence_number: SequenceNumber,
    settings: QueueSettings,
    max_queue_length: usize,
    max_queue_length_adapted: bool,
    counters: DropCounters,
    last_success: Option<(Instant, DateTime<Utc>)>,
    lease_outstanding: bool,
    connection: Option<ConnectionHandle>,
    closed: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct DropCounters {
    queue_full: u64,
    lifetime_expired: u64,
    retry_attempts_exceeded: u64,
    subscription_disable: u64,
}

/// Result of scanning a queue for due work.
#[derive(Debug, Default)]
pub struct LeaseScan {
    /// The earliest eligible indication, now leased to the caller.
    pub lease: Option<Lease>,
    /// Earliest time a pending indication becomes eligible, when nothing
    /// was leased.
    pub next_wake: Option<Instant>,
}

/// An indication temporarily removed from its queue for one delivery
/// attempt.
///
/// The lease must be settled with the attempt's outcome. A lease that is
/// dropped unsettled leaves its queue blocked until the queue is drained.
pub struct Lease {
    /// The indication being delivered.
    pub indication: Indication,
    /// Connection cached by the previous successful delivery.
    pub connection: Option<ConnectionHandle>,
    destination: Arc<Destination>,
    queue: Weak<DestinationQueue>,
}

/// What happened to an indication after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back in the queue, eligible again at the given instant.
    Requeued {
        /// When the next attempt may start
        next_eligible_at: Instant,
    },
    /// Dropped for the given reason.
    Discarded(DiscardReason),
}

/// Outcome of [`DestinationQueue::report_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureReport {
    /// Whether the indication was requeued or dropped.
    pub disposition: FailureDisposition,
    /// The destination has not accepted a delivery for at least the
    /// subscription removal interval.
    pub subscription_removal_due: bool,
    /// Last successful delivery, if there ever was one.
    pub last_successful_delivery: Option<DateTime<Utc>>,
}

impl FailureReport {
    fn closed() -> Self {
        Self {
            disposition: FailureDisposition::Discarded(DiscardReason::QueueClosed),
            subscription_removal_due: false,
            last_successful_delivery: None,
        }
    }
}

/// Outcome of settling a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The attempt succeeded.
    Delivered,
    /// The attempt failed.
    Failed(FailureReport),
}

/// Read-only snapshot of a queue's configuration and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    /// Destination key.
    pub name: String,
    /// When the queue was created.
    pub creation_time: DateTime<Utc>,
    /// Sequence context stamped on every indication.
    pub sequence_context: String,
    /// Number the next accepted indication will receive.
    pub next_sequence_number: u64,
    /// Current maximum number of queued indications.
    pub max_queue_length: usize,
    /// Sequence identifier lifetime in seconds.
    pub lifetime_seconds: u64,
    /// Retries allowed after the initial attempt.
    pub max_retry_attempts: u16,
    /// Minimum retry interval in seconds.
    pub min_retry_interval_seconds: u64,
    /// Indications physically present in the queue.
    pub current_length: usize,
    /// Indications rejected or dropped because the queue was full.
    pub queue_full_dropped: u64,
    /// Indications that aged out before being delivered.
    pub lifetime_expired: u64,
    /// Indications dropped after their last allowed attempt failed.
    pub retry_attempts_exceeded: u64,
    /// Indications dropped because their subscription or listener went
    /// away.
    pub subscription_disable_dropped: u64,
    /// Last successful delivery, `None` if there never was one.
    pub last_successful_delivery_time: Option<DateTime<Utc>>,
    /// An indication is currently leased to a worker.
    pub delivery_in_progress: bool,
}

impl DestinationQueue {
    /// Creates an empty queue for `destination`.
    pub fn new(
        destination: Destination,
        settings: QueueSettings,
        sequence_context: impl Into<Arc<str>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let key = destination.key();
        let creation_time = clock.now_utc();
        let created_at = clock.now();
        let max_queue_length = settings.max_queue_length;

        Self {
            key,
            destination: Arc::new(destination),
            sequence_context: sequence_context.into(),
            creation_time,
            created_at,
            clock,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                next_sequence_number: SequenceNumber::FIRST,
                settings,
                max_queue_length,
                max_queue_length_adapted: false,
                counters: DropCounters::default(),
                last_success: None,
                lease_outstanding: false,
                connection: None,
                closed: false,
            }),
        }
    }

    /// Returns the destination key.
    pub fn key(&self) -> &DestinationKey {
        &self.key
    }

    /// Returns the handler snapshot captured at creation.
    pub fn destination(&self) -> &Arc<Destination> {
        &self.destination
    }

    /// Returns the sequence context of this queue instance.
    pub fn sequence_context(&self) -> &str {
        &self.sequence_context
    }

    /// Number of indications physically present, not counting a leased one.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once the queue has been drained and closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns a copy of the queue's current settings.
    pub fn settings(&self) -> QueueSettings {
        self.state.lock().settings.clone()
    }

    /// Appends an indication and assigns it the next sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::QueueFull`] when the queue already holds its
    /// maximum number of indications; the incoming indication is dropped and
    /// counted. Returns [`EnqueueError::Closed`] after
    /// [`DestinationQueue::drain_and_close`].
    pub fn enqueue(
        &self,
        payload: Bytes,
        subscription: SubscriptionRef,
        context: DeliveryContext,
    ) -> Result<SequenceNumber, EnqueueError> {
        let now = self.clock.now();
        let now_utc = self.clock.now_utc();
        let mut state = self.state.lock();

        if state.closed {
            return Err(EnqueueError::Closed { key: self.key.clone() });
        }

        self.adapt_max_queue_length(&mut state, now);

        if state.pending.len() >= state.max_queue_length {
            state.counters.queue_full += 1;
            warn!(
                destination = %self.key,
                subscription = %subscription,
                max_queue_length = state.max_queue_length,
                "destination queue full, dropping indication"
            );
            return Err(EnqueueError::QueueFull {
                key: self.key.clone(),
                max_queue_length: state.max_queue_length,
            });
        }

        let number = state.next_sequence_number;
        state.next_sequence_number = number.next();

        let mut indication =
            Indication::new(payload, self.key.clone(), subscription, context, now, now_utc);
        indication.sequence =
            Some(SequenceIdentifier { context: self.sequence_context.clone(), number });
        state.pending.push_back(indication);

        debug!(
            destination = %self.key,
            sequence_number = number.get(),
            current_length = state.pending.len(),
            "indication enqueued"
        );

        Ok(number)
    }

    /// Recomputes the maximum queue length once, after the queue has lived
    /// for one sequence identifier lifetime, from the number of indications
    /// that arrived in that time.
    fn adapt_max_queue_length(&self, state: &mut QueueState, now: Instant) {
        if !state.settings.adaptive_queue_length || state.max_queue_length_adapted {
            return;
        }
        if now.saturating_duration_since(self.created_at) < state.settings.lifetime() {
            return;
        }

        let arrivals = usize::try_from(state.next_sequence_number.get() - 1).unwrap_or(usize::MAX);
        let ceiling = state.settings.max_queue_length;
        state.max_queue_length = arrivals.clamp(MIN_ADAPTIVE_QUEUE_LENGTH.min(ceiling), ceiling);
        state.max_queue_length_adapted = true;

        debug!(
            destination = %self.key,
            arrivals,
            max_queue_length = state.max_queue_length,
            "adapted maximum queue length"
        );
    }

    /// Expires aged-out indications and leases the earliest eligible one.
    ///
    /// The scan runs from the head. Expired indications are removed and
    /// counted wherever they are. The first indication whose retry delay has
    /// elapsed is leased, even if older indications ahead of it are still
    /// waiting for their retry. Nothing is leased while an earlier lease is
    /// still outstanding.
    pub fn lease_due(self: &Arc<Self>, now: Instant) -> LeaseScan {
        let mut state = self.state.lock();

        if state.closed || state.lease_outstanding {
            return LeaseScan::default();
        }

        let lifetime = state.settings.lifetime();
        let mut next_wake: Option<Instant> = None;
        let mut index = 0;

        while index < state.pending.len() {
            let (expired, eligible, eligible_at) = {
                let item = &state.pending[index];
                (
                    now.saturating_duration_since(item.enqueued_at) > lifetime,
                    item.next_eligible_at <= now,
                    item.next_eligible_at,
                )
            };

            if expired {
                state.pending.remove(index);
                state.counters.lifetime_expired += 1;
                continue;
            }

            if eligible {
                let Some(indication) = state.pending.remove(index) else {
                    break;
                };
                state.lease_outstanding = true;
                let connection = state.connection.take();

                return LeaseScan {
                    lease: Some(Lease {
                        indication,
                        connection,
                        destination: self.destination.clone(),
                        queue: Arc::downgrade(self),
                    }),
                    next_wake: None,
                };
            }

            next_wake = Some(next_wake.map_or(eligible_at, |wake| wake.min(eligible_at)));
            index += 1;
        }

        if state.pending.is_empty() && state.connection.is_some() {
            state.connection = None;
            debug!(destination = %self.key, "released idle delivery connection");
        }

        LeaseScan { lease: None, next_wake }
    }

    /// Records a successful delivery of a leased indication.
    ///
    /// The indication is discarded. `connection` is kept for the next
    /// delivery to this destination.
    pub fn report_success(&self, indication: Indication, connection: Option<ConnectionHandle>) {
        let now = self.clock.now();
        let now_utc = self.clock.now_utc();
        let mut state = self.state.lock();
        state.lease_outstanding = false;

        if state.closed {
            return;
        }

        state.last_success = Some((now, now_utc));
        state.connection = connection;

        debug!(
            destination = %self.key,
            sequence_number = indication.sequence_number().map(SequenceNumber::get),
            attempts = indication.attempt_number(),
            "indication delivered"
        );
    }

    /// Records a failed delivery of a leased indication.
    ///
    /// The cached connection is discarded. The indication is requeued at the
    /// tail with a backoff delay if the retry policy allows another attempt
    /// and the queue has room; otherwise it is dropped and counted.
    pub fn report_failure(
        &self,
        mut indication: Indication,
        error: &DeliveryError,
    ) -> FailureReport {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.lease_outstanding = false;
        state.connection = None;

        if state.closed {
            return FailureReport::closed();
        }

        indication.retry_count = indication.retry_count.saturating_add(1);

        let last_success_at = state.last_success.map_or(self.created_at, |(instant, _)| instant);
        let subscription_removal_due = now.saturating_duration_since(last_success_at)
            >= state.settings.subscription_removal_interval;
        let last_successful_delivery = state.last_success.map(|(_, time)| time);
        let sequence_number = indication.sequence_number().map(SequenceNumber::get);

        let disposition = match state.settings.retry.decide(indication.retry_count, error) {
            RetryDecision::GiveUp { reason } => {
                state.counters.retry_attempts_exceeded += 1;
                warn!(
                    destination = %self.key,
                    sequence_number,
                    attempts = indication.retry_count,
                    error = %error,
                    reason = %reason,
                    "discarding indication after failed delivery"
                );
                FailureDisposition::Discarded(DiscardReason::RetryAttemptsExceeded)
            },
            RetryDecision::Retry { .. } if state.pending.len() >= state.max_queue_length => {
                state.counters.queue_full += 1;
                warn!(
                    destination = %self.key,
                    sequence_number,
                    max_queue_length = state.max_queue_length,
                    "destination queue full, discarding indication awaiting retry"
                );
                FailureDisposition::Discarded(DiscardReason::QueueFull)
            },
            RetryDecision::Retry { delay } => {
                let next_eligible_at = now + delay;
                indication.next_eligible_at = next_eligible_at;
                debug!(
                    destination = %self.key,
                    sequence_number,
                    attempts = indication.retry_count,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "delivery failed, indication requeued"
                );
                state.pending.push_back(indication);
                FailureDisposition::Requeued { next_eligible_at }
            },
        };

        FailureReport { disposition, subscription_removal_due, last_successful_delivery }
    }

    /// Puts back a leased indication that was never attempted.
    fn restore(&self, indication: Indication, connection: Option<ConnectionHandle>) {
        let mut state = self.state.lock();
        state.lease_outstanding = false;
        if state.closed {
            return;
        }
        state.pending.push_front(indication);
        state.connection = connection;
    }

    /// Removes every queued indication belonging to `subscription`.
    ///
    /// A leased indication is not affected. Returns the number removed.
    pub fn purge_subscription(&self, subscription: &SubscriptionRef) -> usize {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|indication| &indication.subscription != subscription);
        let removed = before - state.pending.len();
        state.counters.subscription_disable += removed as u64;

        if removed > 0 {
            debug!(
                destination = %self.key,
                subscription = %subscription,
                removed,
                "purged subscription indications"
            );
        }
        removed
    }

    /// Discards everything queued, releases the cached connection and
    /// rejects all further use.
    ///
    /// Returns the number of indications discarded. An indication leased at
    /// the time is dropped when its lease is settled.
    pub fn drain_and_close(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.pending.len();
        state.pending.clear();
        state.counters.subscription_disable += removed as u64;
        state.connection = None;
        state.closed = true;

        info!(destination = %self.key, dropped = removed, "destination queue drained and closed");
        removed
    }

    /// Applies a runtime configuration change to this queue.
    pub fn update_settings(&self, update: ConfigUpdate) {
        update.apply(&mut self.state.lock().settings);
    }

    /// Returns a copy of all counters and configuration.
    pub fn snapshot_info(&self) -> QueueInfo {
        let state = self.state.lock();

        QueueInfo {
            name: self.key.to_string(),
            creation_time: self.creation_time,
            sequence_context: self.sequence_context.to_string(),
            next_sequence_number: state.next_sequence_number.get(),
            max_queue_length: state.max_queue_length,
            lifetime_seconds: state.settings.lifetime().as_secs(),
            max_retry_attempts: state.settings.retry.max_retry_attempts,
            min_retry_interval_seconds: state.settings.retry.min_retry_interval.as_secs(),
            current_length: state.pending.len(),
            queue_full_dropped: state.counters.queue_full,
            lifetime_expired: state.counters.lifetime_expired,
            retry_attempts_exceeded: state.counters.retry_attempts_exceeded,
            subscription_disable_dropped: state.counters.subscription_disable,
            last_successful_delivery_time: state.last_success.map(|(_, time)| time),
            delivery_in_progress: state.lease_outstanding,
        }
    }
}

impl fmt::Debug for DestinationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationQueue")
            .field("key", &self.key)
            .field("sequence_context", &self.sequence_context)
            .finish_non_exhaustive()
    }
}

impl Lease {
    /// Handler snapshot of the destination being delivered to.
    pub fn destination(&self) -> &Arc<Destination> {
        &self.destination
    }

    /// Hands the indication back to the head of its queue without counting
    /// an attempt.
    pub fn release(self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.restore(self.indication, self.connection);
        }
    }

    /// Reports the attempt's outcome to the originating queue.
    ///
    /// If the queue has been removed in the meantime, a success is not
    /// recorded anywhere and a failure is discarded as
    /// [`DiscardReason::QueueClosed`].
    pub fn settle(self, outcome: &Result<(), DeliveryError>) -> Settlement {
        let Self { indication, connection, queue, .. } = self;

        let Some(queue) = queue.upgrade() else {
            return match outcome {
                Ok(()) => Settlement::Delivered,
                Err(_) => Settlement::Failed(FailureReport::closed()),
            };
        };

        match outcome {
            Ok(()) => {
                queue.report_success(indication, connection);
                Settlement::Delivered
            },
            Err(error) => {
                drop(connection);
                Settlement::Failed(queue.report_failure(indication, error))
            },
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("destination", &self.indication.destination)
            .field("sequence_number", &self.indication.sequence_number())
            .field("retry_count", &self.indication.retry_count)
            .field("has_connection", &self.connection.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tidings_core::{DestinationKind, TestClock};

    use std::time::Duration;

    use super::*;
    use crate::retry::RetryPolicy;

    const SECOND: Duration = Duration::from_secs(1);
    const RETRY_ATTEMPTS_EXCEEDED: DiscardReason = DiscardReason::RetryAttemptsExceeded;

    fn settings(max_retry_attempts: u16, max_queue_length: usize) -> QueueSettings {
        QueueSettings {
            retry: RetryPolicy {
                max_retry_attempts,
                min_retry_interval: Duration::from_secs(20),
                ..RetryPolicy::default()
            },
            max_queue_length,
            adaptive_queue_length: false,
            lifetime_override: None,
            subscription_removal_interval: Duration::from_secs(3600),
        }
    }

    fn queue_with(settings: QueueSettings) -> (Arc<DestinationQueue>, TestClock) {
        let clock = TestClock::new();
        let destination = Destination::new(
            "root/interop",
            "CIM_ListenerDestinationCIMXML",
            "l1",
            DestinationKind::CimXml,
        )
        .with_address("http://listener.example:5988");
        let queue = DestinationQueue::new(destination, settings, "ctx", Arc::new(clock.clone()));
        (Arc::new(queue), clock)
    }

    fn enqueue(
        queue: &DestinationQueue,
        subscription: &str,
    ) -> Result<SequenceNumber, EnqueueError> {
        queue.enqueue(
            Bytes::from_static(b"<INDICATION/>"),
            SubscriptionRef::from(subscription),
            DeliveryContext::default(),
        )
    }

    fn lease(queue: &Arc<DestinationQueue>, clock: &TestClock) -> Lease {
        queue.lease_due(clock.now()).lease.expect("an eligible indication")
    }

    #[test]
    fn sequence_numbers_start_at_one_and_increase() {
        let (queue, _clock) = queue_with(settings(3, 10));

        let numbers: Vec<u64> = (0..4).map(|_| enqueue(&queue, "s").unwrap().get()).collect();

        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(queue.snapshot_info().next_sequence_number, 5);
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn enqueue_stamps_sequence_identifier() {
        let (queue, clock) = queue_with(settings(3, 10));
        enqueue(&queue, "s").unwrap();

        let leased = lease(&queue, &clock);

        let sequence = leased.indication.sequence.clone().unwrap();
        assert_eq!(&*sequence.context, "ctx");
        assert_eq!(sequence.number, SequenceNumber::FIRST);
    }

    #[test]
    fn full_queue_drops_new_indications() {
        let (queue, _clock) = queue_with(settings(3, 2));
        enqueue(&queue, "s").unwrap();
        enqueue(&queue, "s").unwrap();

        let result = enqueue(&queue, "s");

        assert!(matches!(result, Err(EnqueueError::QueueFull { max_queue_length: 2, .. })));
        let info = queue.snapshot_info();
        assert_eq!(info.current_length, 2);
        assert_eq!(info.queue_full_dropped, 1);
        assert_eq!(info.next_sequence_number, 3);
    }

    #[test]
    fn only_one_lease_outstanding_per_queue() {
        let (queue, clock) = queue_with(settings(3, 10));
        enqueue(&queue, "s").unwrap();
        enqueue(&queue, "s").unwrap();

        let first = lease(&queue, &clock);
        let second = queue.lease_due(clock.now());

        assert!(second.lease.is_none());
        assert!(queue.snapshot_info().delivery_in_progress);
        assert_eq!(queue.len(), 1);

        assert_eq!(first.settle(&Ok(())), Settlement::Delivered);
        assert_eq!(lease(&queue, &clock).indication.sequence_number(), Some(SequenceNumber(2)));
    }

    #[test]
    fn successful_delivery_records_time_and_keeps_connection() {
        let (queue, clock) = queue_with(settings(3, 10));
        enqueue(&queue, "s").unwrap();
        enqueue(&queue, "s").unwrap();
        assert_eq!(queue.snapshot_info().last_successful_delivery_time, None);

        let mut first = lease(&queue, &clock);
        first.connection = Some(Box::new(42_u32));
        first.settle(&Ok(()));

        let second = lease(&queue, &clock);
        let reused = second.connection.and_then(|handle| handle.downcast::<u32>().ok());
        assert_eq!(reused.as_deref(), Some(&42));
        assert_eq!(queue.snapshot_info().last_successful_delivery_time, Some(clock.now_utc()));
    }

    #[test]
    fn failed_delivery_requeues_with_backoff() {
        let (queue, clock) = queue_with(settings(3, 10));
        enqueue(&queue, "s").unwrap();

        let leased = lease(&queue, &clock);
        let report = queue.report_failure(leased.indication, &DeliveryError::network("refused"));

        assert_eq!(
            report.disposition,
            FailureDisposition::Requeued { next_eligible_at: clock.now() + Duration::from_secs(20) }
        );
        assert_eq!(queue.len(), 1);

        let scan = queue.lease_due(clock.now());
        assert!(scan.lease.is_none());
        assert_eq!(scan.next_wake, Some(clock.now() + Duration::from_secs(20)));

        clock.advance(Duration::from_secs(20));
        assert_eq!(lease(&queue, &clock).indication.retry_count, 1);
    }

    #[test]
    fn always_failing_indication_is_attempted_max_retries_plus_one_times() {
        let (queue, clock) = queue_with(settings(2, 10));
        enqueue(&queue, "s").unwrap();
        let error = DeliveryError::network("refused");
        let mut attempts = 0;

        loop {
            let Some(leased) = queue.lease_due(clock.now()).lease else {
                clock.advance(Duration::from_secs(20));
                continue;
            };
            attempts += 1;
            let report = queue.report_failure(leased.indication, &error);
            if report.disposition == FailureDisposition::Discarded(RETRY_ATTEMPTS_EXCEEDED) {
                break;
            }
        }

        assert_eq!(attempts, 3);
        let info = queue.snapshot_info();
        assert_eq!(info.retry_attempts_exceeded, 1);
        assert_eq!(info.current_length, 0);
        assert_eq!(info.queue_full_dropped, 0);
    }

    #[test]
    fn non_retryable_failure_is_dropped_immediately() {
        let (queue, clock) = queue_with(settings(3, 10));
        enqueue(&queue, "s").unwrap();

        let leased = lease(&queue, &clock);
        let rejected = DeliveryError::listener(400, "bad request");
        let report = queue.report_failure(leased.indication, &rejected);

        assert_eq!(report.disposition, FailureDisposition::Discarded(RETRY_ATTEMPTS_EXCEEDED));
        assert_eq!(queue.snapshot_info().retry_attempts_exceeded, 1);
    }

    #[test]
    fn failed_indication_is_dropped_when_queue_filled_up_meanwhile() {
        let (queue, clock) = queue_with(settings(3, 1));
        enqueue(&queue, "s").unwrap();
        let leased = lease(&queue, &clock);
        enqueue(&queue, "s").unwrap();

        let report = queue.report_failure(leased.indication, &DeliveryError::timeout(5));

        assert_eq!(report.disposition, FailureDisposition::Discarded(DiscardReason::QueueFull));
        let info = queue.snapshot_info();
        assert_eq!(info.queue_full_dropped, 1);
        assert_eq!(info.current_length, 1);
    }

    #[test]
    fn retrying_head_does_not_block_later_indications() {
        let (queue, clock) = queue_with(settings(3, 10));
        enqueue(&queue, "s").unwrap();
        let leased = lease(&queue, &clock);
        queue.report_failure(leased.indication, &DeliveryError::network("refused"));
        enqueue(&queue, "s").unwrap();

        let next = lease(&queue, &clock);

        assert_eq!(next.indication.sequence_number(), Some(SequenceNumber(2)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn expired_indications_are_removed_without_delivery() {
        let (queue, clock) = queue_with(QueueSettings {
            lifetime_override: Some(Duration::from_secs(10)),
            ..settings(3, 10)
        });
        enqueue(&queue, "s").unwrap();
        clock.advance(Duration::from_secs(5));
        enqueue(&queue, "s").unwrap();
        clock.advance(Duration::from_secs(6));

        let leased = lease(&queue, &clock);

        assert_eq!(leased.indication.sequence_number(), Some(SequenceNumber(2)));
        let info = queue.snapshot_info();
        assert_eq!(info.lifetime_expired, 1);
        assert_eq!(info.retry_attempts_exceeded, 0);
        assert_eq!(info.queue_full_dropped, 0);
    }

    #[test]
    fn indication_at_exact_lifetime_is_not_expired() {
        let (queue, clock) = queue_with(QueueSettings {
            lifetime_override: Some(Duration::from_secs(10)),
            ..settings(3, 10)
        });
        enqueue(&queue, "s").unwrap();
        clock.advance(Duration::from_secs(10));

        assert!(queue.lease_due(clock.now()).lease.is_some());
        assert_eq!(queue.snapshot_info().lifetime_expired, 0);
    }

    #[test]
    fn purge_removes_only_matching_subscription() {
        let (queue, _clock) = queue_with(settings(3, 10));
        for subscription in ["a", "b", "a", "c", "a"] {
            enqueue(&queue, subscription).unwrap();
        }

        let removed = queue.purge_subscription(&SubscriptionRef::from("a"));

        assert_eq!(removed, 3);
        let info = queue.snapshot_info();
        assert_eq!(info.current_length, 2);
        assert_eq!(info.subscription_disable_dropped, 3);
    }

    #[test]
    fn drain_and_close_discards_everything_and_rejects_enqueue() {
        let (queue, clock) = queue_with(settings(3, 10));
        enqueue(&queue, "s").unwrap();
        enqueue(&queue, "s").unwrap();
        enqueue(&queue, "s").unwrap();
        let leased = lease(&queue, &clock);

        assert_eq!(queue.drain_and_close(), 2);

        assert!(queue.is_closed());
        assert!(matches!(enqueue(&queue, "s"), Err(EnqueueError::Closed { .. })));
        assert!(queue.lease_due(clock.now()).lease.is_none());

        let settlement = leased.settle(&Err(DeliveryError::network("refused")));
        assert_eq!(settlement, Settlement::Failed(FailureReport::closed()));
        let info = queue.snapshot_info();
        assert_eq!(info.subscription_disable_dropped, 2);
        assert_eq!(info.retry_attempts_exceeded, 0);
        assert_eq!(info.current_length, 0);
    }

    #[test]
    fn released_lease_returns_to_the_head_unchanged() {
        let (queue, clock) = queue_with(settings(3, 10));
        enqueue(&queue, "s").unwrap();
        enqueue(&queue, "s").unwrap();
        let leased = lease(&queue, &clock);

        leased.release();

        let again = lease(&queue, &clock);
        assert_eq!(again.indication.sequence_number(), Some(SequenceNumber::FIRST));
        assert_eq!(again.indication.retry_count, 0);
    }

    #[test]
    fn lease_outliving_its_queue_settles_as_closed() {
        let (queue, clock) = queue_with(settings(3, 10));
        enqueue(&queue, "s").unwrap();
        let leased = lease(&queue, &clock);
        drop(queue);

        let settlement = leased.settle(&Err(DeliveryError::network("refused")));

        assert_eq!(settlement, Settlement::Failed(FailureReport::closed()));
    }

    #[test]
    fn failure_after_removal_interval_requests_subscription_removal() {
        let (queue, clock) = queue_with(QueueSettings {
            lifetime_override: Some(Duration::from_secs(7200)),
            ..settings(3, 10)
        });
        enqueue(&queue, "s").unwrap();
        let leased = lease(&queue, &clock);
        let early = queue.report_failure(leased.indication, &DeliveryError::network("refused"));
        assert!(!early.subscription_removal_due);

        clock.advance(Duration::from_secs(3600));
        let leased = lease(&queue, &clock);
        let late = queue.report_failure(leased.indication, &DeliveryError::network("refused"));

        assert!(late.subscription_removal_due);
        assert_eq!(late.last_successful_delivery, None);
    }

    #[test]
    fn connection_is_released_when_queue_runs_empty() {
        let (queue, clock) = queue_with(settings(3, 10));
        enqueue(&queue, "s").unwrap();
        let mut leased = lease(&queue, &clock);
        leased.connection = Some(Box::new("open"));
        leased.settle(&Ok(()));

        let scan = queue.lease_due(clock.now());
        assert!(scan.lease.is_none());
        assert_eq!(scan.next_wake, None);

        enqueue(&queue, "s").unwrap();
        assert!(lease(&queue, &clock).connection.is_none());
    }

    #[test]
    fn adaptive_length_is_recomputed_once_after_lifetime() {
        let (queue, clock) = queue_with(QueueSettings {
            adaptive_queue_length: true,
            lifetime_override: Some(Duration::from_secs(60)),
            ..settings(3, 2400)
        });
        for _ in 0..50 {
            enqueue(&queue, "s").unwrap();
        }
        assert_eq!(queue.snapshot_info().max_queue_length, 2400);

        clock.advance(Duration::from_secs(60) + SECOND);
        queue.lease_due(clock.now());
        enqueue(&queue, "s").unwrap();

        assert_eq!(queue.snapshot_info().max_queue_length, 200);
    }

    #[test]
    fn settings_updates_apply_to_existing_queue() {
        let (queue, _clock) = queue_with(settings(3, 10));

        queue.update_settings(ConfigUpdate::MinRetryInterval(Duration::from_secs(45)));
        queue.update_settings(ConfigUpdate::MaxRetryAttempts(5));

        let info = queue.snapshot_info();
        assert_eq!(info.min_retry_interval_seconds, 45);
        assert_eq!(info.max_retry_attempts, 5);
        assert_eq!(info.lifetime_seconds, 45 * 5 * 10);
    }

    #[test]
    fn queue_info_serializes_with_camel_case_names() {
        let (queue, _clock) = queue_with(settings(3, 10));
        let json = serde_json::to_value(queue.snapshot_info()).unwrap();

        assert_eq!(json["name"], "root/interop:CIM_ListenerDestinationCIMXML.l1");
        assert_eq!(json["nextSequenceNumber"], 1);
        assert_eq!(json["lastSuccessfulDeliveryTime"], serde_json::Value::Null);
    }
}
