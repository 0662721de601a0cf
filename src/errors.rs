//! Error types for telemetry protocol operations
//!
//! Every per-packet failure on the collector is recoverable: the packet is
//! dropped and ingestion continues. Only transport-level socket errors are
//! fatal to the task that owns the socket.
use std::io;

use thiserror::Error;

/// Result type alias for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Telemetry protocol error enumeration
///
/// Covers all failure modes in the pipeline:
/// - Datagram framing violations (short or malformed header, unknown type)
/// - Reliability outcomes (ACK timeout)
/// - Payload sizing
/// - Socket I/O
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    /// Datagram shorter than the fixed 10-byte header
    #[error("header too short: need {expected} bytes, received {received}")]
    HeaderTooShort { expected: usize, received: usize },

    /// Header bytes present but not interpretable
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Message type nibble is neither DATA nor HEARTBEAT
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// No matching ACK arrived within the wait window
    #[error("ACK timeout for sequence {sequence}")]
    AckTimeout { sequence: u16 },

    /// Payload exceeds the per-packet budget
    #[error("payload too large: {required} bytes, limit {available}")]
    PayloadTooLarge { required: usize, available: usize },

    /// Socket or file I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl TelemetryError {
    /// True for errors that must stop the owning task.
    ///
    /// Decode failures, ACK timeouts and oversized payloads are all handled
    /// locally; only I/O errors escalate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// True for errors raised while decoding an inbound datagram.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::HeaderTooShort { .. } | Self::MalformedHeader(_) | Self::UnknownMessageType(_)
        )
    }
}

impl From<io::Error> for TelemetryError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(TelemetryError::Io("reset".into()).is_fatal());
        assert!(!TelemetryError::UnknownMessageType(7).is_fatal());
        assert!(!TelemetryError::AckTimeout { sequence: 3 }.is_fatal());

        assert!(TelemetryError::HeaderTooShort { expected: 10, received: 4 }.is_decode_error());
        assert!(TelemetryError::MalformedHeader("version 3".into()).is_decode_error());
        assert!(!TelemetryError::PayloadTooLarge { required: 200, available: 190 }.is_decode_error());
    }

    #[test]
    fn test_display_messages() {
        let err = TelemetryError::HeaderTooShort { expected: 10, received: 4 };
        assert_eq!(err.to_string(), "header too short: need 10 bytes, received 4");

        let err: TelemetryError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert_eq!(err, TelemetryError::Io("boom".to_string()));
    }
}
