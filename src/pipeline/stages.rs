//! Frame-to-message stages, one per protocol.

use crate::codec::{
    CloseCode, CloseFrame, FrameError, LineCodec, MqttCodec, MqttPacket, WebSocketCodec, WsFrame,
};
use tokio_util::codec::{Decoder, Encoder};

/// What to do with one decoded frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Step<M, F> {
    /// Hand a message to the sink.
    Deliver(M),
    /// Write a frame straight back to the peer.
    Respond(F),
    /// Drop the frame.
    Ignore,
    /// Optionally write a final frame, then close the connection.
    Finish(Option<F>),
}

/// The protocol-specific part of a pipeline: how frames become messages and
/// how messages become frames again.
pub trait Stages: Send + 'static {
    type Frame: Send + 'static;
    type Message: Send + 'static;
    type Codec: Decoder<Item = Self::Frame, Error = FrameError>
        + Encoder<Self::Frame, Error = FrameError>
        + Send
        + Unpin
        + 'static;

    /// Inbound: frame to message.
    fn interpret(&mut self, frame: Self::Frame) -> Step<Self::Message, Self::Frame>;

    /// Outbound: message to frame.
    fn outbound(&self, message: Self::Message) -> Self::Frame;

    /// Frame to send the peer before closing on a decode error, if any.
    fn rejection(codec: &Self::Codec, error: &FrameError) -> Option<Self::Frame> {
        let _ = (codec, error);
        None
    }
}

/// MQTT packets pass through unchanged.
#[derive(Debug, Default)]
pub struct MqttStages;

impl Stages for MqttStages {
    type Frame = MqttPacket;
    type Message = MqttPacket;
    type Codec = MqttCodec;

    fn interpret(&mut self, frame: MqttPacket) -> Step<MqttPacket, MqttPacket> {
        Step::Deliver(frame)
    }

    fn outbound(&self, message: MqttPacket) -> MqttPacket {
        message
    }
}

/// Lines pass through unchanged.
#[derive(Debug, Default)]
pub struct LineStages;

impl Stages for LineStages {
    type Frame = String;
    type Message = String;
    type Codec = LineCodec;

    fn interpret(&mut self, frame: String) -> Step<String, String> {
        Step::Deliver(frame)
    }

    fn outbound(&self, message: String) -> String {
        message
    }
}

/// Completes the upgrade, answers pings, and echoes the close handshake.
/// Only text messages reach the sink.
#[derive(Debug, Default)]
pub struct WebSocketStages;

impl Stages for WebSocketStages {
    type Frame = WsFrame;
    type Message = String;
    type Codec = WebSocketCodec;

    fn interpret(&mut self, frame: WsFrame) -> Step<String, WsFrame> {
        match frame {
            WsFrame::Text(text) => Step::Deliver(text),
            upgrade @ WsFrame::Upgrade { .. } => Step::Respond(upgrade),
            WsFrame::Ping(payload) => Step::Respond(WsFrame::Pong(payload)),
            WsFrame::Pong(_) | WsFrame::Reject { .. } => Step::Ignore,
            WsFrame::Close(frame) => Step::Finish(Some(WsFrame::Close(frame))),
        }
    }

    fn outbound(&self, message: String) -> WsFrame {
        WsFrame::Text(message)
    }

    fn rejection(codec: &WebSocketCodec, error: &FrameError) -> Option<WsFrame> {
        let close = |code: CloseCode, reason: &'static str| {
            Some(WsFrame::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
        };

        match error {
            FrameError::HandshakeRejected { status, reason } => Some(WsFrame::Reject {
                status: *status,
                reason: reason.clone(),
            }),
            FrameError::MalformedFrame(_) if codec.is_upgraded() => {
                close(CloseCode::Protocol, "protocol error")
            }
            FrameError::FrameTooLong { .. } if codec.is_upgraded() => {
                close(CloseCode::Size, "message too big")
            }
            _ => None,
        }
    }
}
