//! Reliable indication delivery with per-destination queues and bounded
//! retry.
//!
//! Indications bound for a CIM-XML or WS-Management listener are placed in
//! a queue owned by that listener. A single dispatcher task scans the
//! queues and hands due indications to a bounded pool of delivery workers.
//! Failed attempts are retried after a minimum interval until a configurable
//! number of retries is exhausted or the indication outlives its sequence
//! identifier lifetime.
//!
//! # Architecture
//!
//! 1. **Route** - [`IndicationRouter`] decides per handler kind whether an
//!    indication is queued, delivered once or forwarded to a local listener
//! 2. **Queue** - [`DestinationQueue`] assigns sequence numbers and keeps
//!    drop counters; [`DestinationQueueTable`] owns the live queues
//! 3. **Dispatch** - [`Dispatcher`] leases at most one due indication per
//!    queue per scan
//! 4. **Deliver** - [`DeliveryWorkerPool`] runs the plugin and settles the
//!    lease back into the queue
//!
//! # Guarantees
//!
//! - Sequence numbers of one queue instance start at 1 and increase by 1
//! - Every indication leaving a queue is either delivered or counted in
//!   exactly one drop counter
//! - No more than `max_delivery_threads` attempts run at once
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use tidings_core::{DeliveryContext, Destination, DestinationKind, RealClock, SubscriptionRef};
//! use tidings_delivery::{
//!     IndicationRouter, PluginRegistry, ReliableDeliveryService, RouteRequest, ServiceConfig,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ServiceConfig::load()?.to_delivery_config();
//! let plugins = Arc::new(PluginRegistry::new());
//! let service = Arc::new(ReliableDeliveryService::with_defaults(config, plugins.clone()));
//! service.start()?;
//!
//! let router = IndicationRouter::new(service.clone(), plugins, Arc::new(RealClock::new()));
//! let destination = Destination::new(
//!     "root/interop",
//!     "CIM_ListenerDestinationCIMXML",
//!     "listener1",
//!     DestinationKind::CimXml,
//! )
//! .with_address("http://listener.example:5988");
//! router
//!     .route(RouteRequest {
//!         destination,
//!         subscription: SubscriptionRef::from("root/interop:CIM_IndicationSubscription.s1"),
//!         payload: Bytes::from_static(b"<INDICATION/>"),
//!         context: DeliveryContext::default(),
//!     })
//!     .await?;
//!
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod plugin;
pub mod queue;
pub mod retry;
pub mod router;
pub mod service;
pub mod table;
pub mod worker_pool;

pub use config::{ConfigUpdate, DeliveryConfig, QueueSettings, ServiceConfig};
pub use dispatcher::{Dispatcher, DispatcherHandle, DispatcherState};
pub use error::{DeliveryError, EnqueueError, ErrorCategory, Result, RouteError};
pub use plugin::{ConnectionHandle, DeliveryPlugin, PluginRegistry};
pub use queue::{
    DestinationQueue, FailureDisposition, FailureReport, Lease, LeaseScan, QueueInfo, Settlement,
};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use router::{IndicationRouter, RouteOutcome, RouteRequest};
pub use service::{ReliableDeliveryService, ServiceStats};
pub use table::DestinationQueueTable;
pub use worker_pool::{DeliveryWorkerPool, PoolStats};

/// Default number of concurrent delivery workers.
pub const DEFAULT_MAX_DELIVERY_THREADS: usize = 5;

/// Default maximum number of indications held by one destination queue.
pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 2400;

/// Lower bound for an adapted maximum queue length.
pub const MIN_ADAPTIVE_QUEUE_LENGTH: usize = 200;
