//! Destination and configuration fixtures.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tidings_core::{Destination, DestinationKind};
use tidings_delivery::{DeliveryConfig, QueueSettings, RetryPolicy};

const INTEROP_NAMESPACE: &str = "root/PG_InterOp";
const CIMXML_CLASS: &str = "CIM_ListenerDestinationCIMXML";

/// Builder for destination snapshots used in tests.
#[derive(Debug, Clone)]
pub struct DestinationBuilder {
    namespace: String,
    class_name: String,
    name: String,
    kind: DestinationKind,
    address: Option<String>,
    creation_time: Option<DateTime<Utc>>,
}

impl DestinationBuilder {
    /// Starts a CIM-XML listener named `name` with a remote address.
    pub fn listener(name: &str) -> Self {
        Self {
            namespace: INTEROP_NAMESPACE.to_string(),
            class_name: CIMXML_CLASS.to_string(),
            name: name.to_string(),
            kind: DestinationKind::CimXml,
            address: Some(format!("http://{name}.example:5988/cimlistener")),
            creation_time: None,
        }
    }

    /// Changes the handler kind.
    #[must_use]
    pub fn kind(mut self, kind: DestinationKind) -> Self {
        self.kind = kind;
        self
    }

    /// Changes the handler class name.
    #[must_use]
    pub fn class_name(mut self, class_name: &str) -> Self {
        self.class_name = class_name.to_string();
        self
    }

    /// Sets the address.
    #[must_use]
    pub fn address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    /// Removes the address.
    #[must_use]
    pub fn without_address(mut self) -> Self {
        self.address = None;
        self
    }

    /// Sets the handler creation time.
    #[must_use]
    pub fn created_at(mut self, creation_time: DateTime<Utc>) -> Self {
        self.creation_time = Some(creation_time);
        self
    }

    /// Builds the destination snapshot.
    pub fn build(self) -> Destination {
        let mut destination =
            Destination::new(self.namespace, self.class_name, self.name, self.kind);
        destination.address = self.address;
        destination.creation_time = self.creation_time;
        destination
    }
}

/// Remote CIM-XML listener named `name`.
pub fn listener(name: &str) -> Destination {
    DestinationBuilder::listener(name).build()
}

/// Configuration with millisecond retry intervals for tests that run the
/// real dispatcher.
pub fn fast_config(max_delivery_threads: usize, max_retry_attempts: u16) -> DeliveryConfig {
    DeliveryConfig {
        max_delivery_threads,
        queue: QueueSettings {
            retry: RetryPolicy {
                max_retry_attempts,
                min_retry_interval: Duration::from_millis(20),
                max_delay: Duration::from_millis(20),
                ..RetryPolicy::default()
            },
            lifetime_override: Some(Duration::from_secs(60)),
            ..QueueSettings::default()
        },
        idle_cleanup_interval: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(5),
        ..DeliveryConfig::default()
    }
}
