//! Core domain models and strongly-typed identifiers.
//!
//! Defines indications, destination snapshots, delivery context and the
//! newtype wrappers that keep destination keys, subscription references and
//! sequence numbers from being mixed up with one another.

use std::{fmt, sync::Arc, time::Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Address prefix of listeners hosted inside this server process.
pub const LOCAL_ADDRESS_PREFIX: &str = "localhost/";

/// Strongly-typed indication identifier.
///
/// Assigned once when the indication enters the delivery subsystem and
/// carried through every attempt and event it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndicationId(pub Uuid);

impl IndicationId {
    /// Creates a new random indication ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IndicationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IndicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for IndicationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Key identifying one delivery destination.
///
/// Derived from the handler's namespace, class and name as
/// `namespace:ClassName.Name`. Two handlers with the same key share a
/// single destination queue.
///
/// # Example
///
/// ```
/// use tidings_core::DestinationKey;
///
/// let key = DestinationKey::from_parts("root/interop", "CIM_ListenerDestinationCIMXML", "l1");
/// assert_eq!(key.as_str(), "root/interop:CIM_ListenerDestinationCIMXML.l1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationKey(String);

impl DestinationKey {
    /// Builds a key from the handler's naming attributes.
    pub fn from_parts(namespace: &str, class_name: &str, name: &str) -> Self {
        Self(format!("{namespace}:{class_name}.{name}"))
    }

    /// Parses a key previously produced by [`DestinationKey::from_parts`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedKey`] if the namespace separator or the
    /// class/name separator is missing, or if any part is empty.
    pub fn parse(text: &str) -> Result<Self> {
        let Some((namespace, rest)) = text.split_once(':') else {
            return Err(CoreError::malformed_key(text, "missing namespace separator"));
        };
        let Some((class_name, name)) = rest.split_once('.') else {
            return Err(CoreError::malformed_key(text, "missing class separator"));
        };
        if namespace.is_empty() || class_name.is_empty() || name.is_empty() {
            return Err(CoreError::malformed_key(text, "empty key component"));
        }
        Ok(Self(text.to_string()))
    }

    /// Returns the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to the subscription an indication was produced for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionRef(String);

impl SubscriptionRef {
    /// Creates a subscription reference from its object path.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Returns the subscription's object path.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionRef {
    fn from(path: &str) -> Self {
        Self(path.to_string())
    }
}

impl From<String> for SubscriptionRef {
    fn from(path: String) -> Self {
        Self(path)
    }
}

/// Per-destination sequence number.
///
/// Numbering starts at 1 for every destination queue and is never reused
/// while that queue is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// First number handed out by a fresh queue.
    pub const FIRST: Self = Self(1);

    /// Returns the raw value.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Returns the number following this one.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence context and number stamped on a reliably delivered indication.
///
/// The context string identifies the queue instance, so a consumer that
/// sees the context change knows numbering restarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceIdentifier {
    /// Identifies the server and listener incarnation
    pub context: Arc<str>,
    /// Position of the indication within that context
    pub number: SequenceNumber,
}

/// Type of destination a handler delivers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    /// CIM-XML listener reached over HTTP.
    CimXml,
    /// WS-Management event sink.
    WsMan,
    /// SNMP trap receiver.
    Snmp,
    /// Local system log.
    SystemLog,
    /// E-mail recipient list.
    Email,
    /// Local file.
    File,
}

impl DestinationKind {
    /// Returns true for listener destinations that may use reliable
    /// delivery.
    pub fn is_listener(self) -> bool {
        matches!(self, Self::CimXml | Self::WsMan)
    }
}

/// Immutable snapshot of a handler's configuration.
///
/// Captured when the destination queue is created so that later changes to
/// the handler instance do not affect indications already queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Namespace the handler instance lives in.
    pub namespace: String,
    /// Handler class name.
    pub class_name: String,
    /// Handler instance name.
    pub name: String,
    /// Kind of transport this handler uses.
    pub kind: DestinationKind,
    /// Listener URL, SNMP target host, mail recipients or file path.
    pub address: Option<String>,
    /// When the handler instance was created, if known.
    pub creation_time: Option<DateTime<Utc>>,
}

impl Destination {
    /// Creates a destination snapshot without an address.
    pub fn new(
        namespace: impl Into<String>,
        class_name: impl Into<String>,
        name: impl Into<String>,
        kind: DestinationKind,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            class_name: class_name.into(),
            name: name.into(),
            kind,
            address: None,
            creation_time: None,
        }
    }

    /// Sets the destination address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Sets the handler creation time.
    #[must_use]
    pub fn with_creation_time(mut self, creation_time: DateTime<Utc>) -> Self {
        self.creation_time = Some(creation_time);
        self
    }

    /// Returns the key of the queue this destination maps to.
    pub fn key(&self) -> DestinationKey {
        DestinationKey::from_parts(&self.namespace, &self.class_name, &self.name)
    }

    /// Returns the address if it is present and non-blank.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref().map(str::trim).filter(|address| !address.is_empty())
    }

    /// Returns true if the address names a listener inside this process.
    pub fn is_local(&self) -> bool {
        self.address().is_some_and(|address| address.starts_with(LOCAL_ADDRESS_PREFIX))
    }

    /// Checks that the parts forming the queue key are present.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidDestination`] naming the first empty part.
    pub fn validate(&self) -> Result<()> {
        let parts = [
            ("namespace", &self.namespace),
            ("class name", &self.class_name),
            ("name", &self.name),
        ];
        match parts.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((part, _)) => {
                Err(CoreError::invalid_destination(self.key().as_str(), format!("empty {part}")))
            },
            None => Ok(()),
        }
    }
}

/// Request metadata passed through to the delivery plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryContext {
    /// Namespace of the originating request.
    pub namespace: Option<String>,
    /// Content languages of the indication payload.
    pub content_languages: Vec<String>,
    /// Identifier of the operation that produced the indication.
    pub operation_id: Uuid,
}

impl DeliveryContext {
    /// Creates a context for a request in the given namespace.
    pub fn for_namespace(namespace: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), ..Self::default() }
    }
}

impl Default for DeliveryContext {
    fn default() -> Self {
        Self { namespace: None, content_languages: Vec::new(), operation_id: Uuid::new_v4() }
    }
}

/// A single indication travelling through the delivery subsystem.
///
/// Owned by exactly one destination queue, or leased to exactly one worker
/// while a delivery attempt is in progress.
#[derive(Debug, Clone)]
pub struct Indication {
    /// Unique identifier.
    pub id: IndicationId,
    /// Encoded indication, opaque to the delivery subsystem.
    pub payload: Bytes,
    /// Destination queue this indication belongs to.
    pub destination: DestinationKey,
    /// Subscription that produced this indication.
    pub subscription: SubscriptionRef,
    /// Sequence identifier, present only for reliably delivered indications.
    pub sequence: Option<SequenceIdentifier>,
    /// When the indication was enqueued, for lifetime checks.
    pub enqueued_at: Instant,
    /// Wall-clock enqueue time, for reporting.
    pub enqueued_at_utc: DateTime<Utc>,
    /// Number of failed attempts so far.
    pub retry_count: u16,
    /// Earliest instant the next attempt may start.
    pub next_eligible_at: Instant,
    /// Metadata forwarded to the delivery plugin.
    pub context: DeliveryContext,
}

impl Indication {
    /// Creates an indication that is due immediately and carries no
    /// sequence identifier.
    pub fn new(
        payload: Bytes,
        destination: DestinationKey,
        subscription: SubscriptionRef,
        context: DeliveryContext,
        now: Instant,
        now_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            id: IndicationId::new(),
            payload,
            destination,
            subscription,
            sequence: None,
            enqueued_at: now,
            enqueued_at_utc: now_utc,
            retry_count: 0,
            next_eligible_at: now,
            context,
        }
    }

    /// Returns the sequence number, if one was assigned.
    pub fn sequence_number(&self) -> Option<SequenceNumber> {
        self.sequence.as_ref().map(|sequence| sequence.number)
    }

    /// Returns the number of attempts made so far, counting the one in
    /// progress.
    pub fn attempt_number(&self) -> u32 {
        u32::from(self.retry_count) + 1
    }
}
