//! Test infrastructure for the reliable delivery subsystem.
//!
//! Provides a scriptable delivery plugin, an event recorder, destination
//! and configuration fixtures, and a polling helper for asserting on state
//! that background workers change.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::time::Duration;

pub mod events;
pub mod fixtures;
pub mod plugin;

pub use events::RecordingEventHandler;
pub use fixtures::{fast_config, listener, DestinationBuilder};
pub use plugin::{Attempt, MockBehavior, MockPlugin};

/// Default timeout for [`wait_until`] in tests.
///
/// Generous enough for CI machines with variable scheduling.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Installs a test-writer tracing subscriber.
///
/// Honours `RUST_LOG` and defaults to `error`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        )
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let result = tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;

    if result.is_err() {
        tracing::debug!(timeout = ?timeout, "condition not met before timeout");
    }
    result.is_ok()
}
