//! Error types for domain primitive construction.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while building or validating domain primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Destination key does not follow the `namespace:Class.name` layout.
    #[error("malformed destination key '{key}': {reason}")]
    MalformedKey {
        /// The rejected key text
        key: String,
        /// What was wrong with it
        reason: &'static str,
    },

    /// Destination snapshot is missing a required attribute.
    #[error("invalid destination {key}: {reason}")]
    InvalidDestination {
        /// Key of the offending destination
        key: String,
        /// Description of the missing or invalid attribute
        reason: String,
    },
}

impl CoreError {
    /// Creates a malformed key error.
    pub fn malformed_key(key: impl Into<String>, reason: &'static str) -> Self {
        Self::MalformedKey { key: key.into(), reason }
    }

    /// Creates an invalid destination error.
    pub fn invalid_destination(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDestination { key: key.into(), reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_key_and_reason() {
        let error = CoreError::invalid_destination("root:Listener.a", "missing address");
        assert_eq!(error.to_string(), "invalid destination root:Listener.a: missing address");
    }
}
