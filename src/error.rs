//! Error taxonomy for the liveness and session layer
//!
//! Every failure a client, session or registrar can surface is one of these
//! variants. Per-connection failures never escape their connection: callers
//! see them as return values, background tasks log them.

use crate::config::ConfigError;
use crate::transport::ConnectionState;
use thiserror::Error;

/// Main error type for fleetwire operations
#[derive(Debug, Error)]
pub enum FleetError {
    /// Operation attempted after an explicit shutdown. Never retried.
    #[error("client is closed")]
    Closed,

    /// No stream is active right now, typically mid-reconnect.
    #[error("not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    /// Dial, read or write failure on the underlying transport.
    #[error("transport failure: {message}")]
    TransportFailure { message: String },

    /// Backpressure: the outbound queue of a session is at capacity.
    #[error("outbound queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("lease {lease_id} lost: {reason}")]
    LeaseLost { lease_id: i64, reason: String },

    #[error("clock skew detected: {message}")]
    ClockSkew { message: String },

    #[error("max reconnect attempts ({max}) exceeded")]
    MaxAttemptsExceeded { max: u32 },

    #[error("invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("coordination store error: {message}")]
    Store { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result alias used across the crate
pub type FleetResult<T> = Result<T, FleetError>;

impl FleetError {
    /// Create transport failure error
    pub fn transport_failure<S: Into<String>>(message: S) -> Self {
        Self::TransportFailure {
            message: message.into(),
        }
    }

    /// Create invalid parameter error
    pub fn invalid_parameter<S: Into<String>>(message: S) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Create coordination store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create lease lost error
    pub fn lease_lost<S: Into<String>>(lease_id: i64, reason: S) -> Self {
        Self::LeaseLost {
            lease_id,
            reason: reason.into(),
        }
    }

    /// Whether this failure means the stream it happened on is unusable.
    ///
    /// Only these errors send a client down the reconnect path; everything
    /// else is the caller's problem.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TransportFailure { .. } | Self::Io(_))
    }

    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnected { .. }
                | Self::TransportFailure { .. }
                | Self::QueueFull { .. }
                | Self::Io(_)
                | Self::Store { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(FleetError::transport_failure("reset").is_transport());
        assert!(FleetError::Io(std::io::Error::other("broken pipe")).is_transport());

        assert!(!FleetError::Closed.is_transport());
        assert!(!FleetError::QueueFull { capacity: 4 }.is_transport());
        assert!(!FleetError::invalid_parameter("too big").is_transport());
    }

    #[test]
    fn test_transient_classification() {
        assert!(FleetError::NotConnected {
            state: ConnectionState::Connecting
        }
        .is_transient());
        assert!(FleetError::QueueFull { capacity: 1 }.is_transient());
        assert!(!FleetError::Closed.is_transient());
        assert!(!FleetError::MaxAttemptsExceeded { max: 3 }.is_transient());
    }

    #[test]
    fn test_error_display() {
        let errors = vec![
            FleetError::Closed,
            FleetError::NotConnected {
                state: ConnectionState::TransientFailure,
            },
            FleetError::transport_failure("connection reset"),
            FleetError::QueueFull { capacity: 100 },
            FleetError::lease_lost(7, "keepalive channel closed"),
            FleetError::ClockSkew {
                message: "ttl 12 > granted 6".to_string(),
            },
            FleetError::MaxAttemptsExceeded { max: 3 },
            FleetError::invalid_parameter("key is required"),
            FleetError::NotFound("agent-1".to_string()),
            FleetError::store("unavailable"),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_queue_full_message_names_capacity() {
        let error = FleetError::QueueFull { capacity: 100 };
        assert_eq!(error.to_string(), "outbound queue is full (capacity 100)");
    }
}
