//! Error types for delivery to the Forward-protocol collector.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while connecting to, authenticating with, or
/// transmitting to the collector.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// TCP connect to the endpoint failed
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// TCP connect (or TLS setup) did not finish within the configured timeout
    #[error("connection to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    /// TLS session could not be established
    #[error("TLS handshake with {address} failed: {source}")]
    Tls {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Shared-key handshake failed before the server gave a verdict
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Server rejected the shared key
    #[error("authentication rejected by server: {0}")]
    AuthRejected(String),

    /// No open connection to send on
    #[error("not connected")]
    NotConnected,

    /// Shared key configured but the handshake has not succeeded
    #[error("connection is not authenticated")]
    NotAuthenticated,

    /// Peer closed the connection while a reply was expected
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Ack reply did not match the chunk that was sent
    #[error("ack mismatch: expected chunk {expected}, got {received}")]
    AckMismatch { expected: String, received: String },

    /// Closing the transport failed; its state is unknown
    #[error("failed to close connection: {0}")]
    Disconnect(#[source] std::io::Error),

    /// Write or read on an open connection failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message could not be encoded
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Reply could not be decoded
    #[error("failed to decode reply: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Exporter was stopped
    #[error("exporter has been stopped")]
    Stopped,
}

impl ForwardError {
    /// Whether this error came from releasing the transport.
    ///
    /// These are never retried locally.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ForwardError::Disconnect(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ForwardError::ConnectTimeout {
            address: "localhost:24224".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(
            err.to_string(),
            "connection to localhost:24224 timed out after 30s"
        );

        let err = ForwardError::AckMismatch {
            expected: "abc".to_string(),
            received: "xyz".to_string(),
        };
        assert!(err.to_string().contains("abc"));
        assert!(err.to_string().contains("xyz"));

        assert_eq!(ForwardError::NotConnected.to_string(), "not connected");
    }

    #[test]
    fn test_disconnect_classification() {
        let err = ForwardError::Disconnect(std::io::Error::other("boom"));
        assert!(err.is_disconnect());
        assert!(!ForwardError::NotConnected.is_disconnect());
        assert!(!ForwardError::Io(std::io::Error::other("boom")).is_disconnect());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ForwardError>();
    }
}
