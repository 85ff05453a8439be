//! Error types for indication delivery.
//!
//! [`DeliveryError`] is what a delivery plugin reports for a failed attempt
//! and drives the retry decision. [`EnqueueError`] and [`RouteError`] are the
//! only failures a caller ever sees synchronously: everything that happens
//! after an indication has been queued is observable through counters and
//! events only.

use std::{fmt, time::Duration};

use thiserror::Error;
use tidings_core::{CoreError, DestinationKey, DestinationKind};

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failure of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The listener could not be reached.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// The plugin gave up waiting for the listener.
    #[error("delivery timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the attempt timed out
        timeout_seconds: u64,
    },

    /// The listener answered with an error status.
    #[error("listener returned status {status_code}: {message}")]
    ListenerError {
        /// Status code returned by the listener
        status_code: u16,
        /// Error text returned by the listener
        message: String,
    },

    /// A listener hosted in this process is not running.
    #[error("local listener unavailable: {message}")]
    ListenerUnavailable {
        /// Why the listener could not take the indication
        message: String,
    },

    /// Handler configuration cannot be delivered to.
    #[error("invalid handler configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// No plugin is registered for the destination kind.
    #[error("no delivery plugin for {kind:?} destinations")]
    Unsupported {
        /// Destination kind that has no plugin
        kind: DestinationKind,
    },

    /// Workers or dispatcher did not stop within the allowed time.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// How long shutdown waited
        timeout: Duration,
    },

    /// Unexpected internal error, including a panicking plugin.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a listener error from a status response.
    pub fn listener(status_code: u16, message: impl Into<String>) -> Self {
        Self::ListenerError { status_code, message: message.into() }
    }

    /// Creates a listener unavailable error.
    pub fn listener_unavailable(message: impl Into<String>) -> Self {
        Self::ListenerUnavailable { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Determines if another attempt could succeed.
    ///
    /// Transport failures, timeouts, unavailable local listeners and server
    /// side listener errors (status 500 and above) are retryable. Client side
    /// listener errors, configuration problems and internal errors are not:
    /// repeating the same request would fail the same way.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. } | Self::Timeout { .. } | Self::ListenerUnavailable { .. } => {
                true
            },
            Self::ListenerError { status_code, .. } => *status_code >= 500,
            Self::ConfigurationError { .. }
            | Self::Unsupported { .. }
            | Self::ShutdownTimeout { .. }
            | Self::InternalError { .. } => false,
        }
    }
}

/// Category of delivery error for log fields and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connectivity and timeouts.
    Transport,
    /// The listener answered but refused.
    Listener,
    /// Handler or plugin setup problems.
    Configuration,
    /// Failures inside this process.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Transport,
            DeliveryError::ListenerError { .. } | DeliveryError::ListenerUnavailable { .. } => {
                Self::Listener
            },
            DeliveryError::ConfigurationError { .. } | DeliveryError::Unsupported { .. } => {
                Self::Configuration
            },
            DeliveryError::ShutdownTimeout { .. } | DeliveryError::InternalError { .. } => {
                Self::Internal
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Listener => write!(f, "listener"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Why an indication was not accepted into a destination queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The queue already holds its maximum number of indications.
    #[error("destination queue {key} is full ({max_queue_length} indications)")]
    QueueFull {
        /// Destination whose queue is full
        key: DestinationKey,
        /// Limit that was reached
        max_queue_length: usize,
    },

    /// The queue was drained because its listener went away.
    #[error("destination queue {key} is closed")]
    Closed {
        /// Destination whose queue is closed
        key: DestinationKey,
    },

    /// The retry limit is zero, so nothing is queued.
    #[error("reliable delivery is disabled, {key} must be delivered directly")]
    ReliableDeliveryDisabled {
        /// Destination that was not queued
        key: DestinationKey,
    },
}

/// Synchronous failure reported by the indication router.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// A listener destination has no address.
    #[error("destination {key} has no listener address")]
    MissingDestination {
        /// Destination without an address
        key: DestinationKey,
    },

    /// An SNMP destination has no target host.
    #[error("destination {key} has no target host")]
    MissingTargetHost {
        /// Destination without a target host
        key: DestinationKey,
    },

    /// The destination snapshot failed validation.
    #[error(transparent)]
    InvalidDestination(#[from] CoreError),

    /// The indication was dropped at enqueue time.
    #[error("indication dropped: {0}")]
    Dropped(#[from] EnqueueError),

    /// A one-shot or forwarded delivery failed.
    #[error("failed to deliver an indication: {0}")]
    Delivery(#[from] DeliveryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(30).is_retryable());
        assert!(DeliveryError::listener(503, "busy").is_retryable());
        assert!(DeliveryError::listener_unavailable("not started").is_retryable());

        assert!(!DeliveryError::listener(400, "bad request").is_retryable());
        assert!(!DeliveryError::configuration("no url").is_retryable());
        assert!(!DeliveryError::internal("plugin panicked").is_retryable());
        assert!(!DeliveryError::Unsupported { kind: DestinationKind::Email }.is_retryable());
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(ErrorCategory::from(&DeliveryError::network("x")), ErrorCategory::Transport);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::listener(500, "x")),
            ErrorCategory::Listener
        );
        assert_eq!(
            ErrorCategory::from(&DeliveryError::configuration("x")),
            ErrorCategory::Configuration
        );
        assert_eq!(ErrorCategory::Internal.to_string(), "internal");
    }

    #[test]
    fn route_error_wraps_enqueue_error() {
        let key = DestinationKey::from_parts("root", "Listener", "a");
        let error = RouteError::from(EnqueueError::QueueFull { key, max_queue_length: 200 });
        assert_eq!(
            error.to_string(),
            "indication dropped: destination queue root:Listener.a is full (200 indications)"
        );
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::timeout(30).to_string(), "delivery timeout after 30s");
        assert_eq!(
            RouteError::from(DeliveryError::network("refused")).to_string(),
            "failed to deliver an indication: network connection failed: refused"
        );
    }
}
