//! Wire framing codecs, one per protocol.
//!
//! Each codec is a pure `tokio_util` [`Decoder`](tokio_util::codec::Decoder) /
//! [`Encoder`](tokio_util::codec::Encoder) pair. None of them perform I/O.

mod line;
mod mqtt;
mod websocket;

pub use line::{LineCodec, DEFAULT_MAX_LINE_LENGTH};
pub use mqtt::{
    decode_remaining_length, encode_remaining_length, MqttCodec, MqttPacket, PacketType,
    MAX_REMAINING_LENGTH,
};
pub use websocket::{
    CloseCode, CloseFrame, Role, WebSocketCodec, WsFrame, DEFAULT_MAX_FRAME_PAYLOAD, DEFAULT_PATH, DEFAULT_WRITE_CHUNK_SIZE,
};

use thiserror::Error;

/// Errors raised while framing a connection's byte stream.
///
/// All of these are scoped to a single connection: the connection is closed
/// and every other connection keeps running.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame too long: {length} bytes exceeds maximum {max} bytes")]
    FrameTooLong { length: usize, max: usize },

    #[error("handshake rejected ({status}): {reason}")]
    HandshakeRejected { status: u16, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame(reason.into())
    }

    pub(crate) fn rejected(status: u16, reason: impl Into<String>) -> Self {
        Self::HandshakeRejected {
            status,
            reason: reason.into(),
        }
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "malformed_frame",
            Self::FrameTooLong { .. } => "frame_too_long",
            Self::HandshakeRejected { .. } => "handshake_rejected",
            Self::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(FrameError::malformed("x").kind(), "malformed_frame");
        assert_eq!(
            FrameError::FrameTooLong { length: 2, max: 1 }.kind(),
            "frame_too_long"
        );
        assert_eq!(FrameError::rejected(404, "nope").kind(), "handshake_rejected");
        assert_eq!(
            FrameError::from(std::io::Error::other("reset")).kind(),
            "io"
        );
    }

    #[test]
    fn test_error_display() {
        let err = FrameError::FrameTooLong {
            length: 9000,
            max: 8192,
        };
        assert_eq!(
            err.to_string(),
            "frame too long: 9000 bytes exceeds maximum 8192 bytes"
        );

        let err = FrameError::rejected(404, "no websocket endpoint at /chat");
        assert_eq!(
            err.to_string(),
            "handshake rejected (404): no websocket endpoint at /chat"
        );
    }
}
