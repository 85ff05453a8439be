//! End-to-end tests of the dispatcher and worker pool.
//!
//! Each test runs a started [`ReliableDeliveryService`] against the
//! scriptable mock plugin with millisecond retry intervals and observes the
//! outcome through the mock's attempt log, the recorded events and queue
//! snapshots.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use tidings_core::{DeliveryContext, Destination, DiscardReason, RealClock, SubscriptionRef};
use tidings_delivery::{DeliveryConfig, DeliveryError, ReliableDeliveryService};
use tidings_testing::{
    fast_config, init_tracing, listener, wait_until, MockBehavior, MockPlugin,
    RecordingEventHandler, DEFAULT_WAIT_TIMEOUT,
};

fn service(
    config: DeliveryConfig,
    plugin: Arc<MockPlugin>,
) -> (Arc<ReliableDeliveryService>, Arc<RecordingEventHandler>) {
    init_tracing();
    let events = RecordingEventHandler::new();
    let service = Arc::new(ReliableDeliveryService::new(
        config,
        plugin,
        events.clone(),
        Arc::new(RealClock::new()),
    ));
    (service, events)
}

fn send(service: &ReliableDeliveryService, destination: &Destination, n: usize) -> Result<()> {
    let payload = Bytes::from(format!("<INDICATION ID=\"{n}\"/>"));
    let subscription = SubscriptionRef::from("sub");
    service.enqueue(destination, payload, subscription, DeliveryContext::default())?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_attempts_never_exceed_max_delivery_threads() -> Result<()> {
    let plugin = Arc::new(MockPlugin::new().with_latency(Duration::from_millis(40)));
    let (service, _events) = service(fast_config(2, 3), plugin.clone());
    service.start()?;

    let destinations: Vec<_> = (0..5).map(|n| listener(&format!("listener{n}"))).collect();
    for (n, destination) in destinations.iter().enumerate() {
        send(&service, destination, n)?;
    }

    assert!(wait_until(DEFAULT_WAIT_TIMEOUT, || plugin.delivered_count() == 5).await);

    assert!(plugin.peak_concurrency() <= 2, "peak concurrency {}", plugin.peak_concurrency());
    assert_eq!(service.stats().peak_workers, 2);
    for destination in &destinations {
        assert_eq!(plugin.attempt_count(&destination.key()), 1);
    }

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn always_failing_destination_is_attempted_retry_limit_plus_one_times() -> Result<()> {
    let destination = listener("down");
    let refused = MockBehavior::AlwaysFail(DeliveryError::network("refused"));
    let plugin = Arc::new(MockPlugin::new().with_behavior(destination.key(), refused));
    let (service, events) = service(fast_config(2, 2), plugin.clone());
    service.start()?;

    send(&service, &destination, 1)?;

    let discarded = || !events.discard_reasons(&destination.key()).is_empty();
    assert!(wait_until(DEFAULT_WAIT_TIMEOUT, discarded).await);

    let attempts = plugin.attempts_for(&destination.key());
    let numbers: Vec<_> = attempts.iter().map(|attempt| attempt.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(events.failed_attempt_count(&destination.key()), 3);
    assert_eq!(
        events.discard_reasons(&destination.key()),
        vec![DiscardReason::RetryAttemptsExceeded]
    );

    let info = service.queue_info(&destination.key()).expect("queue exists");
    assert_eq!(info.retry_attempts_exceeded, 1);
    assert_eq!(info.current_length, 0);
    assert!(info.last_successful_delivery_time.is_none());

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn transient_failures_are_retried_until_delivered() -> Result<()> {
    let destination = listener("flaky");
    let timeouts = MockBehavior::FailTimes(2, DeliveryError::timeout(10));
    let plugin = Arc::new(MockPlugin::new().with_behavior(destination.key(), timeouts));
    let (service, events) = service(fast_config(2, 3), plugin.clone());
    service.start()?;

    send(&service, &destination, 1)?;

    let delivered = || events.delivered_count(&destination.key()) == 1;
    assert!(wait_until(DEFAULT_WAIT_TIMEOUT, delivered).await);

    assert_eq!(plugin.attempt_count(&destination.key()), 3);
    assert_eq!(plugin.delivered_sequence(&destination.key()), vec![1]);
    let info = service.queue_info(&destination.key()).expect("queue exists");
    assert_eq!(info.retry_attempts_exceeded, 0);
    assert!(info.last_successful_delivery_time.is_some());

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn rejected_indication_is_not_retried() -> Result<()> {
    let destination = listener("strict");
    let plugin = Arc::new(MockPlugin::new().with_behavior(
        destination.key(),
        MockBehavior::AlwaysFail(DeliveryError::listener(400, "malformed export request")),
    ));
    let (service, events) = service(fast_config(1, 5), plugin.clone());
    service.start()?;

    send(&service, &destination, 1)?;

    let discarded = || !events.discard_reasons(&destination.key()).is_empty();
    assert!(wait_until(DEFAULT_WAIT_TIMEOUT, discarded).await);

    assert_eq!(plugin.attempt_count(&destination.key()), 1);
    let info = service.queue_info(&destination.key()).expect("queue exists");
    assert_eq!(info.retry_attempts_exceeded, 1);

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn healthy_destination_receives_indications_in_sequence_order() -> Result<()> {
    let destination = listener("ordered");
    let plugin = Arc::new(MockPlugin::new());
    let (service, _events) = service(fast_config(4, 3), plugin.clone());
    service.start()?;

    for n in 0..10 {
        send(&service, &destination, n)?;
    }

    assert!(wait_until(DEFAULT_WAIT_TIMEOUT, || plugin.delivered_count() == 10).await);
    assert_eq!(plugin.delivered_sequence(&destination.key()), (1..=10).collect::<Vec<u64>>());

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn failing_destination_does_not_hold_up_others() -> Result<()> {
    let down = listener("down");
    let up = listener("up");
    let refused = MockBehavior::AlwaysFail(DeliveryError::network("refused"));
    let plugin = Arc::new(MockPlugin::new().with_behavior(down.key(), refused));
    let mut config = fast_config(1, 50);
    config.queue.retry.min_retry_interval = Duration::from_millis(200);
    config.queue.retry.max_delay = Duration::from_millis(200);
    let (service, _events) = service(config, plugin.clone());
    service.start()?;

    send(&service, &down, 1)?;
    for n in 0..3 {
        send(&service, &up, n)?;
    }

    let all_up = || plugin.delivered_sequence(&up.key()).len() == 3;
    assert!(wait_until(DEFAULT_WAIT_TIMEOUT, all_up).await);
    let info = service.queue_info(&down.key()).expect("queue exists");
    assert_eq!(info.current_length + usize::from(info.delivery_in_progress), 1);

    service.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_lets_in_flight_attempt_finish_and_drains_queues() -> Result<()> {
    let destination = listener("slow");
    let plugin = Arc::new(MockPlugin::new().with_latency(Duration::from_millis(100)));
    let (service, _events) = service(fast_config(1, 3), plugin.clone());
    service.start()?;

    for n in 0..5 {
        send(&service, &destination, n)?;
    }
    assert!(wait_until(DEFAULT_WAIT_TIMEOUT, || plugin.in_flight() == 1).await);

    service.shutdown_with_timeout(Duration::from_secs(2)).await?;

    assert!(plugin.delivered_count() >= 1);
    assert!(plugin.delivered_count() < 5);
    assert!(service.table().is_empty());
    assert_eq!(service.stats().running_workers, 0);
    Ok(())
}
