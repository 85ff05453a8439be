//! Routing of indications to reliable or one-shot delivery.
//!
//! ```text
//!   RouteRequest
//!        │
//!        ▼
//!   listener kind? ──no──▶ SNMP without host? ──yes──▶ MissingTargetHost
//!        │ yes                   │ no
//!        ▼                       ▼
//!   address? ──no──▶ MissingDestination          deliver once
//!        │ yes
//!        ▼
//!   local? ──yes──▶ local listener (Forwarded)
//!        │ no
//!        ▼
//!   reliable? ──yes──▶ enqueue (Queued)
//!        │ no
//!        ▼
//!   deliver once (Delivered)
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tidings_core::{
    Clock, DeliveryContext, Destination, DestinationKind, Indication, SequenceNumber,
    SubscriptionRef,
};
use tracing::{debug, warn};

use crate::{
    error::{EnqueueError, RouteError},
    plugin::DeliveryPlugin,
    service::ReliableDeliveryService,
};

/// One indication addressed to one handler.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// Snapshot of the handler instance.
    pub destination: Destination,
    /// Subscription that matched the indication.
    pub subscription: SubscriptionRef,
    /// Encoded indication.
    pub payload: Bytes,
    /// Request metadata for the plugin.
    pub context: DeliveryContext,
}

/// What happened to a routed indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Accepted by the destination queue for reliable delivery.
    Queued {
        /// Sequence number assigned by the queue.
        sequence_number: SequenceNumber,
    },
    /// Delivered in a single attempt without queueing.
    Delivered,
    /// Handed to a listener running in this process.
    Forwarded,
}

/// Decides per handler kind whether an indication is queued or delivered
/// once.
#[derive(Debug, Clone)]
pub struct IndicationRouter {
    service: Arc<ReliableDeliveryService>,
    plugin: Arc<dyn DeliveryPlugin>,
    local_listener: Arc<dyn DeliveryPlugin>,
    clock: Arc<dyn Clock>,
}

impl IndicationRouter {
    /// Creates a router. Local listener addresses go to `plugin` until
    /// [`IndicationRouter::with_local_listener`] overrides it.
    pub fn new(
        service: Arc<ReliableDeliveryService>,
        plugin: Arc<dyn DeliveryPlugin>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { service, local_listener: plugin.clone(), plugin, clock }
    }

    /// Routes `localhost/` listener addresses to `listener`.
    #[must_use]
    pub fn with_local_listener(mut self, listener: Arc<dyn DeliveryPlugin>) -> Self {
        self.local_listener = listener;
        self
    }

    /// Routes one indication.
    ///
    /// # Errors
    ///
    /// - [`RouteError::InvalidDestination`] if the destination key is
    ///   incomplete
    /// - [`RouteError::MissingDestination`] if a listener has no address
    /// - [`RouteError::MissingTargetHost`] if an SNMP handler has no host
    /// - [`RouteError::Dropped`] if the destination queue refused the
    ///   indication
    /// - [`RouteError::Delivery`] if a one-shot attempt failed
    pub async fn route(&self, request: RouteRequest) -> Result<RouteOutcome, RouteError> {
        let RouteRequest { destination, subscription, payload, context } = request;
        destination.validate()?;

        let plugin = self.plugin.as_ref();
        match destination.kind {
            kind if kind.is_listener() => {
                if destination.address().is_none() {
                    return Err(RouteError::MissingDestination { key: destination.key() });
                }

                if destination.is_local() {
                    let local = self.local_listener.as_ref();
                    self.deliver_once(local, &destination, subscription, payload, context).await?;
                    return Ok(RouteOutcome::Forwarded);
                }

                let queued = self.service.enqueue(
                    &destination,
                    payload.clone(),
                    subscription.clone(),
                    context.clone(),
                );
                match queued {
                    Ok(sequence_number) => {
                        debug!(
                            destination = %destination.key(),
                            %sequence_number,
                            "indication queued"
                        );
                        return Ok(RouteOutcome::Queued { sequence_number });
                    },
                    Err(EnqueueError::ReliableDeliveryDisabled { .. }) => {},
                    Err(error) => return Err(error.into()),
                }

                self.deliver_once(plugin, &destination, subscription, payload, context).await?;
                Ok(RouteOutcome::Delivered)
            },
            DestinationKind::Snmp => {
                if destination.address().is_none() {
                    return Err(RouteError::MissingTargetHost { key: destination.key() });
                }
                self.deliver_once(plugin, &destination, subscription, payload, context).await?;
                Ok(RouteOutcome::Delivered)
            },
            _ => {
                self.deliver_once(plugin, &destination, subscription, payload, context).await?;
                Ok(RouteOutcome::Delivered)
            },
        }
    }

    async fn deliver_once(
        &self,
        plugin: &dyn DeliveryPlugin,
        destination: &Destination,
        subscription: SubscriptionRef,
        payload: Bytes,
        context: DeliveryContext,
    ) -> Result<(), RouteError> {
        let indication = Indication::new(
            payload,
            destination.key(),
            subscription,
            context,
            self.clock.now(),
            self.clock.now_utc(),
        );
        let mut connection = None;

        plugin.deliver(destination, &indication, &mut connection).await.map_err(|error| {
            warn!(
                destination = %indication.destination,
                subscription = %indication.subscription,
                kind = ?destination.kind,
                error = %error,
                "failed to deliver an indication"
            );
            RouteError::from(error)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tidings_core::{NoOpEventHandler, TestClock};

    use super::*;
    use crate::{
        config::{ConfigUpdate, DeliveryConfig},
        error::DeliveryError,
        plugin::ConnectionHandle,
    };

    #[derive(Debug, Default)]
    struct CountingPlugin {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl DeliveryPlugin for CountingPlugin {
        async fn deliver(
            &self,
            _destination: &Destination,
            _indication: &Indication,
            _connection: &mut Option<ConnectionHandle>,
        ) -> crate::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DeliveryError::network("connection refused"));
            }
            Ok(())
        }
    }

    fn router(plugin: Arc<CountingPlugin>) -> (IndicationRouter, Arc<ReliableDeliveryService>) {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let service = Arc::new(ReliableDeliveryService::new(
            DeliveryConfig::default(),
            plugin.clone(),
            Arc::new(NoOpEventHandler::new()),
            clock.clone(),
        ));
        (IndicationRouter::new(service.clone(), plugin, clock), service)
    }

    fn request(destination: Destination) -> RouteRequest {
        RouteRequest {
            destination,
            subscription: SubscriptionRef::from("sub"),
            payload: Bytes::from_static(b"<INDICATION/>"),
            context: DeliveryContext::default(),
        }
    }

    fn listener(address: Option<&str>) -> Destination {
        let destination =
            Destination::new("root", "CIM_ListenerDestinationCIMXML", "l", DestinationKind::CimXml);
        match address {
            Some(address) => destination.with_address(address),
            None => destination,
        }
    }

    #[tokio::test]
    async fn remote_listener_is_queued() {
        let plugin = Arc::new(CountingPlugin::default());
        let (router, service) = router(plugin.clone());

        let first = router.route(request(listener(Some("http://l.example")))).await.unwrap();
        let second = router.route(request(listener(Some("http://l.example")))).await.unwrap();

        assert_eq!(first, RouteOutcome::Queued { sequence_number: SequenceNumber(1) });
        assert_eq!(second, RouteOutcome::Queued { sequence_number: SequenceNumber(2) });
        assert_eq!(service.stats().queued_indications, 2);
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_retry_attempts_delivers_once_without_a_queue() {
        let plugin = Arc::new(CountingPlugin::default());
        let (router, service) = router(plugin.clone());
        service.update_config(ConfigUpdate::MaxRetryAttempts(0));

        let outcome = router.route(request(listener(Some("http://l.example")))).await.unwrap();

        assert_eq!(outcome, RouteOutcome::Delivered);
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
        assert!(service.table().is_empty());
    }

    #[tokio::test]
    async fn one_shot_failure_is_reported() {
        let plugin = Arc::new(CountingPlugin { fail: true, ..CountingPlugin::default() });
        let (router, _service) = router(plugin.clone());

        let syslog = Destination::new(
            "root",
            "PG_ListenerDestinationSystemLog",
            "s",
            DestinationKind::SystemLog,
        );

        let result = router.route(request(syslog)).await;

        assert!(matches!(result, Err(RouteError::Delivery(DeliveryError::NetworkError { .. }))));
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listener_without_address_is_rejected() {
        let (router, service) = router(Arc::new(CountingPlugin::default()));

        let result = router.route(request(listener(None))).await;

        assert!(matches!(result, Err(RouteError::MissingDestination { .. })));
        assert!(service.table().is_empty());
    }

    #[tokio::test]
    async fn local_listener_is_forwarded() {
        let remote = Arc::new(CountingPlugin::default());
        let local = Arc::new(CountingPlugin::default());
        let (router, service) = router(remote.clone());
        let router = router.with_local_listener(local.clone());

        let outcome =
            router.route(request(listener(Some("localhost/CIMListener/test")))).await.unwrap();

        assert_eq!(outcome, RouteOutcome::Forwarded);
        assert_eq!(local.calls.load(Ordering::SeqCst), 1);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
        assert!(service.table().is_empty());
    }

    #[tokio::test]
    async fn snmp_requires_a_target_host() {
        let plugin = Arc::new(CountingPlugin::default());
        let (router, _service) = router(plugin.clone());
        let trap =
            Destination::new("root", "PG_IndicationHandlerSNMPMapper", "t", DestinationKind::Snmp);

        let missing = router.route(request(trap.clone())).await;
        let sent = router.route(request(trap.with_address("trap.example"))).await.unwrap();

        assert!(matches!(missing, Err(RouteError::MissingTargetHost { .. })));
        assert_eq!(sent, RouteOutcome::Delivered);
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_queue_surfaces_as_dropped() {
        let plugin = Arc::new(CountingPlugin::default());
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let mut config = DeliveryConfig::default();
        config.queue.max_queue_length = 1;
        config.queue.adaptive_queue_length = false;
        let service = Arc::new(ReliableDeliveryService::new(
            config,
            plugin.clone(),
            Arc::new(NoOpEventHandler::new()),
            clock.clone(),
        ));
        let router = IndicationRouter::new(service, plugin, clock);

        router.route(request(listener(Some("http://l.example")))).await.unwrap();
        let result = router.route(request(listener(Some("http://l.example")))).await;

        assert!(matches!(
            result,
            Err(RouteError::Dropped(EnqueueError::QueueFull { max_queue_length: 1, .. }))
        ));
    }

    #[tokio::test]
    async fn incomplete_destination_is_invalid() {
        let (router, _service) = router(Arc::new(CountingPlugin::default()));
        let destination = Destination::new("root", "", "l", DestinationKind::CimXml)
            .with_address("http://l.example");

        let result = router.route(request(destination)).await;

        assert!(matches!(result, Err(RouteError::InvalidDestination(_))));
    }
}
