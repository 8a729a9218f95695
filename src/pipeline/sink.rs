//! Message sinks: the application side of every connection.

use crate::codec::{FrameError, MqttPacket};
use crate::config::Protocol;
use crate::util::ConnectionId;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Error returned by a sink. Closes the connection that produced the message.
#[derive(Debug, Clone, Error)]
#[error("sink error: {message}")]
pub struct SinkError {
    message: String,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Why a connection ended.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed its end of the stream.
    PeerClosed,
    /// The peer completed a protocol-level close, such as a WebSocket close frame.
    ProtocolClose,
    /// The listener was draining and no further reads were issued.
    Drained,
    /// The drain timeout expired and the socket was dropped.
    ForceClosed,
    Frame(FrameError),
    Sink(SinkError),
    Io(String),
}

impl CloseReason {
    /// Classify a codec failure. Transport failures are kept apart from
    /// framing violations.
    pub fn from_frame_error(error: FrameError) -> Self {
        match error {
            FrameError::Io(e) => CloseReason::Io(e.to_string()),
            other => CloseReason::Frame(other),
        }
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::ProtocolClose => "protocol_close",
            CloseReason::Drained => "drained",
            CloseReason::ForceClosed => "force_closed",
            CloseReason::Frame(e) => e.kind(),
            CloseReason::Sink(_) => "sink",
            CloseReason::Io(_) => "io",
        }
    }

    /// Whether the connection ended because something went wrong.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CloseReason::Frame(_) | CloseReason::Sink(_) | CloseReason::Io(_)
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("closed by peer"),
            CloseReason::ProtocolClose => f.write_str("protocol close completed"),
            CloseReason::Drained => f.write_str("drained during shutdown"),
            CloseReason::ForceClosed => f.write_str("force-closed after shutdown timeout"),
            CloseReason::Frame(e) => write!(f, "{}", e),
            CloseReason::Sink(e) => write!(f, "{}", e),
            CloseReason::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

/// Receives decoded messages for one protocol.
///
/// Called on the worker task that owns the connection, so calls for a single
/// connection never overlap. Implementations must not block indefinitely.
pub trait MessageSink<M>: Send + Sync + 'static {
    /// Handle one message. A returned reply is encoded back to the same peer.
    fn on_message(&self, connection: ConnectionId, message: M) -> Result<Option<M>, SinkError>;

    /// Called exactly once when the connection ends.
    fn on_connection_closed(&self, connection: ConnectionId, reason: &CloseReason) {
        let _ = (connection, reason);
    }
}

/// Sink that logs every message and replies with nothing.
#[derive(Debug, Clone, Copy)]
pub struct LoggingSink {
    protocol: Protocol,
}

impl LoggingSink {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }
}

impl MessageSink<String> for LoggingSink {
    fn on_message(&self, connection: ConnectionId, message: String) -> Result<Option<String>, SinkError> {
        info!(protocol = %self.protocol, connection = %connection, message = %message, "received message");
        Ok(None)
    }

    fn on_connection_closed(&self, connection: ConnectionId, reason: &CloseReason) {
        debug!(protocol = %self.protocol, connection = %connection, reason = %reason, "connection closed");
    }
}

impl MessageSink<MqttPacket> for LoggingSink {
    fn on_message(
        &self,
        connection: ConnectionId,
        message: MqttPacket,
    ) -> Result<Option<MqttPacket>, SinkError> {
        info!(
            protocol = %self.protocol,
            connection = %connection,
            packet_type = ?message.packet_type(),
            flags = message.flags(),
            payload_len = message.payload().len(),
            "received message"
        );
        Ok(None)
    }

    fn on_connection_closed(&self, connection: ConnectionId, reason: &CloseReason) {
        debug!(protocol = %self.protocol, connection = %connection, reason = %reason, "connection closed");
    }
}

/// One sink per protocol.
#[derive(Clone)]
pub struct Sinks {
    pub mqtt: Arc<dyn MessageSink<MqttPacket>>,
    pub websocket: Arc<dyn MessageSink<String>>,
    pub line: Arc<dyn MessageSink<String>>,
}

impl Sinks {
    /// Log every message on every protocol.
    pub fn logging() -> Self {
        Self {
            mqtt: Arc::new(LoggingSink::new(Protocol::Mqtt)),
            websocket: Arc::new(LoggingSink::new(Protocol::WebSocket)),
            line: Arc::new(LoggingSink::new(Protocol::Line)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PacketType;

    #[test]
    fn test_close_reason_kinds() {
        assert_eq!(CloseReason::PeerClosed.kind(), "peer_closed");
        assert_eq!(CloseReason::Drained.kind(), "drained");
        assert_eq!(
            CloseReason::Frame(FrameError::malformed("bad")).kind(),
            "malformed_frame"
        );
        assert_eq!(CloseReason::Sink(SinkError::new("nope")).kind(), "sink");
    }

    #[test]
    fn test_close_reason_is_error() {
        assert!(!CloseReason::PeerClosed.is_error());
        assert!(!CloseReason::ProtocolClose.is_error());
        assert!(!CloseReason::ForceClosed.is_error());
        assert!(CloseReason::Io("reset".to_string()).is_error());
        assert!(CloseReason::Sink(SinkError::new("nope")).is_error());
    }

    #[test]
    fn test_io_frame_error_classified_as_io() {
        let error = FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        let reason = CloseReason::from_frame_error(error);
        assert!(matches!(reason, CloseReason::Io(_)));

        let reason = CloseReason::from_frame_error(FrameError::FrameTooLong { length: 9, max: 8 });
        assert_eq!(reason.kind(), "frame_too_long");
    }

    #[test]
    fn test_logging_sink_returns_no_reply() {
        let sinks = Sinks::logging();
        let id = ConnectionId::next();

        assert!(sinks.line.on_message(id, "hello".to_string()).unwrap().is_none());
        let packet = MqttPacket::new(PacketType::PingReq, 0, bytes::Bytes::new());
        assert!(sinks.mqtt.on_message(id, packet).unwrap().is_none());
    }

    #[test]
    fn test_sink_error_display() {
        let error = SinkError::new("queue full");
        assert_eq!(error.message(), "queue full");
        assert_eq!(error.to_string(), "sink error: queue full");
    }
}
