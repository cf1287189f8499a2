//! Streaming to the remote breath analysis service
//!
//! # Architecture
//!
//! ```text
//! EncodedFrame ──▶ SocketTransport ──▶ (writer task) ──▶ ws://host:port
//!                        ▲                                    │
//!                        │ handshake (once)                   │ JSON text
//!                  SessionParameters                          ▼
//!                                                      ResultsReceiver
//! ```
//!
//! Lost frames are never replayed and a dropped connection is never retried.

mod protocol;
mod results;
mod transport;

pub use protocol::{AnalysisTuning, SessionParameters, DEFAULT_SERVER_URL, UID_PREFIX};
pub use results::{decode, BreathMetrics, DecodeError, ResultsReceiver};
pub use transport::{SendOutcome, SocketTransport, TransportEvent, TransportState};

/// Errors that can occur on the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Server URL could not be parsed or has the wrong scheme
    InvalidUrl(String),
    /// Failed to establish WebSocket connection
    ConnectionFailed(String),
    /// WebSocket protocol error
    ProtocolError(String),
    /// Failed to write to the socket
    SendFailed(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::InvalidUrl(e) => {
                write!(f, "Invalid server URL: {}", e)
            }
            TransportError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to analysis server: {}", e)
            }
            TransportError::ProtocolError(e) => {
                write!(f, "WebSocket protocol error: {}", e)
            }
            TransportError::SendFailed(e) => {
                write!(f, "Failed to send: {}", e)
            }
        }
    }
}

impl std::error::Error for TransportError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = TransportError::InvalidUrl("ftp://x".to_string());
        assert!(err.to_string().contains("ftp://x"));

        let err = TransportError::SendFailed("broken pipe".to_string());
        assert!(err.to_string().contains("broken pipe"));
    }
}
