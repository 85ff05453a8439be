//! Scriptable delivery plugin.
//!
//! [`MockPlugin`] records every attempt it receives and answers according
//! to a per-destination [`MockBehavior`]. It also tracks how many attempts
//! run at once, which lets tests check the worker pool bound.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tidings_core::{Destination, DestinationKey, Indication, SequenceNumber};
use tidings_delivery::{ConnectionHandle, DeliveryError, DeliveryPlugin};

/// How the mock answers attempts for one destination.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Every attempt succeeds.
    Succeed,
    /// Every attempt fails with the given error.
    AlwaysFail(DeliveryError),
    /// The first `n` attempts fail with the given error, later ones succeed.
    FailTimes(u32, DeliveryError),
}

/// One attempt seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// Destination that was attempted.
    pub destination: DestinationKey,
    /// Sequence number of the indication, if it was queued.
    pub sequence_number: Option<SequenceNumber>,
    /// Attempt number reported by the indication (1-based).
    pub attempt_number: u32,
    /// Whether the mock answered with success.
    pub succeeded: bool,
}

#[derive(Debug, Default)]
struct MockState {
    behaviors: HashMap<DestinationKey, MockBehavior>,
    failures: HashMap<DestinationKey, u32>,
    attempts: Vec<Attempt>,
}

/// Delivery plugin with scripted outcomes and attempt recording.
#[derive(Debug)]
pub struct MockPlugin {
    default_behavior: MockBehavior,
    latency: Duration,
    state: Mutex<MockState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for MockPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlugin {
    /// Creates a mock that accepts everything immediately.
    pub fn new() -> Self {
        Self {
            default_behavior: MockBehavior::Succeed,
            latency: Duration::ZERO,
            state: Mutex::new(MockState::default()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Uses `behavior` for destinations without their own script.
    #[must_use]
    pub fn with_default_behavior(mut self, behavior: MockBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    /// Makes every attempt take `latency` before answering.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Scripts the answers for one destination.
    #[must_use]
    pub fn with_behavior(self, destination: DestinationKey, behavior: MockBehavior) -> Self {
        self.set_behavior(destination, behavior);
        self
    }

    /// Replaces the script of one destination, resetting its failure count.
    pub fn set_behavior(&self, destination: DestinationKey, behavior: MockBehavior) {
        let mut state = self.state.lock();
        state.failures.remove(&destination);
        state.behaviors.insert(destination, behavior);
    }

    /// All attempts seen so far, in the order they started.
    pub fn attempts(&self) -> Vec<Attempt> {
        self.state.lock().attempts.clone()
    }

    /// Attempts seen for one destination.
    pub fn attempts_for(&self, destination: &DestinationKey) -> Vec<Attempt> {
        self.state
            .lock()
            .attempts
            .iter()
            .filter(|attempt| &attempt.destination == destination)
            .cloned()
            .collect()
    }

    /// Number of attempts seen for one destination.
    pub fn attempt_count(&self, destination: &DestinationKey) -> usize {
        self.state
            .lock()
            .attempts
            .iter()
            .filter(|attempt| &attempt.destination == destination)
            .count()
    }

    /// Number of successful attempts across all destinations.
    pub fn delivered_count(&self) -> usize {
        self.state.lock().attempts.iter().filter(|attempt| attempt.succeeded).count()
    }

    /// Sequence numbers delivered to one destination, in delivery order.
    pub fn delivered_sequence(&self, destination: &DestinationKey) -> Vec<u64> {
        self.state
            .lock()
            .attempts
            .iter()
            .filter(|attempt| attempt.succeeded && &attempt.destination == destination)
            .filter_map(|attempt| attempt.sequence_number.map(SequenceNumber::get))
            .collect()
    }

    /// Number of attempts currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of attempts that ever ran at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn answer(&self, indication: &Indication) -> Result<(), DeliveryError> {
        let mut state = self.state.lock();
        let behavior =
            state.behaviors.get(&indication.destination).unwrap_or(&self.default_behavior).clone();

        let outcome = match behavior {
            MockBehavior::Succeed => Ok(()),
            MockBehavior::AlwaysFail(error) => Err(error),
            MockBehavior::FailTimes(limit, error) => {
                let failures = state.failures.entry(indication.destination.clone()).or_insert(0);
                if *failures < limit {
                    *failures += 1;
                    Err(error)
                } else {
                    Ok(())
                }
            },
        };

        state.attempts.push(Attempt {
            destination: indication.destination.clone(),
            sequence_number: indication.sequence_number(),
            attempt_number: indication.attempt_number(),
            succeeded: outcome.is_ok(),
        });
        outcome
    }
}

#[async_trait]
impl DeliveryPlugin for MockPlugin {
    async fn deliver(
        &self,
        _destination: &Destination,
        indication: &Indication,
        _connection: &mut Option<ConnectionHandle>,
    ) -> tidings_delivery::Result<()> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let outcome = self.answer(indication);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}
