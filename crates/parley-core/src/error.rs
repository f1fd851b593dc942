//! Error types for the Parley core.
//!
//! Transport failures under the retry budget are handled inside the state
//! machine; only the variants below ever reach callers.

use thiserror::Error;

/// Errors surfaced by the realtime transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be started (bad identity, missing credential,
    /// network failure).
    #[error("connection failed: {reason}")]
    Connection {
        /// Why the connection failed
        reason: String,
    },

    /// Server rejected the credential; a new one is required.
    #[error("authentication expired")]
    AuthExpired,

    /// Reconnect budget exhausted.
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Offline queue is full; the payload was not accepted.
    #[error("outbound queue full ({capacity} frames)")]
    QueueFull {
        /// Configured queue capacity
        capacity: usize,
    },

    /// Frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Returns true if retrying later may succeed without caller action.
    ///
    /// Auth expiry needs a new credential and an exhausted budget needs an
    /// explicit reconnect, so neither is transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::QueueFull { .. })
    }
}

impl From<parley_proto::ProtocolError> for TransportError {
    fn from(err: parley_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_transient() {
        assert!(TransportError::Connection { reason: "refused".into() }.is_transient());
        assert!(TransportError::QueueFull { capacity: 8 }.is_transient());
    }

    #[test]
    fn terminal_errors_are_not_transient() {
        assert!(!TransportError::AuthExpired.is_transient());
        assert!(!TransportError::ConnectionLost { attempts: 5 }.is_transient());
        assert!(!TransportError::Protocol("bad frame".into()).is_transient());
    }

    #[test]
    fn protocol_errors_convert() {
        let err: TransportError = parley_proto::ProtocolError::MissingType.into();
        assert!(matches!(err, TransportError::Protocol(msg) if msg.contains("type")));
    }
}
