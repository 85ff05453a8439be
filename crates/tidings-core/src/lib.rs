//! Core domain models and event types.
//!
//! Provides strongly-typed domain primitives, the clock abstraction, and
//! delivery event definitions for the reliable indication delivery system.
//! The delivery and testing crates depend on these foundational types so
//! that destination keys, subscription references and sequence numbers are
//! never passed around as bare strings or integers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    AttemptFailedEvent, DeliveredEvent, DeliveryEvent, DiscardReason, DiscardedEvent,
    EventHandler, MulticastEventHandler, NoOpEventHandler, SubscriptionRemovalDueEvent,
};
pub use models::{
    DeliveryContext, Destination, DestinationKey, DestinationKind, Indication, IndicationId,
    SequenceIdentifier, SequenceNumber, SubscriptionRef,
};
pub use time::{Clock, RealClock, TestClock};
