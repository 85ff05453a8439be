//! Delivery plugin interface.
//!
//! A plugin performs one transport-level delivery attempt (HTTP push to a
//! listener, SNMP trap, syslog line, mail, file append) and enforces its own
//! per-attempt timeout. The delivery subsystem only decides when and how
//! often to call it.

use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use tidings_core::{Destination, DestinationKind, Indication};

use crate::error::{DeliveryError, Result};

/// Transport state a plugin may keep between deliveries to the same
/// destination, such as an open HTTP connection.
///
/// The destination queue stores the handle after a successful delivery and
/// hands it back for the next attempt. It is dropped after a failure, when
/// the queue runs empty and when the queue is drained.
pub type ConnectionHandle = Box<dyn Any + Send + Sync>;

/// Transport that delivers indications to one or more kinds of destination.
#[async_trait]
pub trait DeliveryPlugin: Send + Sync + fmt::Debug {
    /// Attempts to deliver `indication` to `destination`.
    ///
    /// `connection` holds whatever the plugin stored on the previous
    /// successful delivery to the same destination. The plugin may reuse,
    /// replace or clear it.
    ///
    /// # Errors
    ///
    /// Returns a [`DeliveryError`] describing why the attempt failed. Its
    /// [`DeliveryError::is_retryable`] classification decides whether the
    /// indication is attempted again.
    async fn deliver(
        &self,
        destination: &Destination,
        indication: &Indication,
        connection: &mut Option<ConnectionHandle>,
    ) -> Result<()>;
}

/// Plugin that forwards each delivery to the plugin registered for the
/// destination's kind.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<DestinationKind, Arc<dyn DeliveryPlugin>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `plugin` for `kind`, replacing any earlier registration.
    #[must_use]
    pub fn with_plugin(mut self, kind: DestinationKind, plugin: Arc<dyn DeliveryPlugin>) -> Self {
        self.plugins.insert(kind, plugin);
        self
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("kinds", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl DeliveryPlugin for PluginRegistry {
    async fn deliver(
        &self,
        destination: &Destination,
        indication: &Indication,
        connection: &mut Option<ConnectionHandle>,
    ) -> Result<()> {
        let Some(plugin) = self.plugins.get(&destination.kind) else {
            return Err(DeliveryError::Unsupported { kind: destination.kind });
        };
        plugin.deliver(destination, indication, connection).await
    }
}
