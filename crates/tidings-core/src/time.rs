//! Time abstractions for testable timing decisions.
//!
//! Queue lifetimes, retry eligibility and adaptive sizing all read the time
//! through [`Clock`], so tests can move time forward without sleeping.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses [`RealClock`]; tests inject a [`TestClock`] and
/// advance it explicitly.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for age and eligibility checks.
    fn now(&self) -> Instant;

    /// Returns the current wall-clock time for reported timestamps.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same offset, so advancing one handle moves every
/// component holding a clone.
#[derive(Debug, Clone)]
pub struct TestClock {
    offset_ns: Arc<AtomicU64>,
    base_instant: Instant,
    base_utc: DateTime<Utc>,
}

impl TestClock {
    /// Creates a test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    /// Creates a test clock whose wall-clock time starts at `start`.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        Self {
            offset_ns: Arc::new(AtomicU64::new(0)),
            base_instant: Instant::now(),
            base_utc: start,
        }
    }

    /// Moves both the monotonic and the wall clock forward.
    pub fn advance(&self, duration: Duration) {
        let duration_ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.offset_ns.fetch_add(duration_ns, Ordering::AcqRel);
    }

    /// Returns how far the clock has been advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::Duration::MAX);
        self.base_utc.checked_add_signed(elapsed).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(10));
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn test_clock_wall_time_follows_monotonic_time() {
        let start = DateTime::<Utc>::from_timestamp(1_000, 0).unwrap();
        let clock = TestClock::with_start_time(start);

        assert_eq!(clock.now_utc(), start);

        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now_utc(), DateTime::<Utc>::from_timestamp(1_060, 0).unwrap());
    }

    #[test]
    fn clones_share_the_same_time() {
        let clock = TestClock::new();
        let handle = clock.clone();

        handle.advance(Duration::from_millis(250));

        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }

    #[test]
    fn real_clock_is_monotonic() {
        let clock = RealClock::new();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
