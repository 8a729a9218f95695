//! HTTP/1.1 upgrade handshake followed by RFC 6455 text framing.
//!
//! A server-side codec starts in handshake mode and parses one HTTP request
//! head. A valid upgrade request for the configured path is yielded as
//! [`WsFrame::Upgrade`], whose encoding is the `101 Switching Protocols`
//! response, and the codec switches to frame mode. Anything else fails with
//! [`FrameError::HandshakeRejected`].
//!
//! In frame mode text and continuation frames are reassembled into one
//! UTF-8 message. Control frames may arrive between fragments.

use super::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Cursor};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::handshake::machine::TryParse;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request, Response, create_response, write_response,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Control, Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::{Frame, FrameHeader, Utf8Bytes};
use tokio_util::codec::{Decoder, Encoder};

pub use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
pub use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

pub const DEFAULT_PATH: &str = "/ws";
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 65536;
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = 16384;

const MAX_HANDSHAKE_SIZE: usize = 8192;
const MAX_CONTROL_PAYLOAD: usize = 125;

/// Which side of the connection this codec speaks for.
///
/// Clients mask every frame they send; servers never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// A unit produced or consumed by [`WebSocketCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    /// An accepted upgrade request. Encodes as the `101` response.
    Upgrade { accept_key: String },
    /// A refused handshake. Encodes as a plain HTTP error response.
    Reject { status: u16, reason: String },
    /// A complete text message, reassembled from any fragments.
    Text(String),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseFrame>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Handshake,
    Frames,
}

/// Handshake and frame codec for the WebSocket listener.
#[derive(Debug)]
pub struct WebSocketCodec {
    role: Role,
    mode: Mode,
    path: String,
    max_payload: usize,
    chunk_size: usize,
    /// Text message whose final fragment has not arrived yet.
    fragments: Option<Vec<u8>>,
}

impl WebSocketCodec {
    /// Server codec that accepts upgrades at `path` only.
    #[must_use]
    pub fn server(path: impl Into<String>, max_payload: usize, chunk_size: usize) -> Self {
        Self {
            role: Role::Server,
            mode: Mode::Handshake,
            path: path.into(),
            max_payload,
            chunk_size: chunk_size.max(1),
            fragments: None,
        }
    }

    /// Client codec, already past the handshake.
    #[must_use]
    pub fn client(max_payload: usize, chunk_size: usize) -> Self {
        Self {
            role: Role::Client,
            mode: Mode::Frames,
            path: String::new(),
            max_payload,
            chunk_size: chunk_size.max(1),
            fragments: None,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the handshake has completed and frames are being parsed.
    #[must_use]
    pub fn is_upgraded(&self) -> bool {
        self.mode == Mode::Frames
    }

    fn decode_handshake(&mut self, src: &mut BytesMut) -> Result<Option<WsFrame>, FrameError> {
        let Some((head_len, request)) = Request::try_parse(&src[..]).map_err(handshake_error)? else {
            if src.len() > MAX_HANDSHAKE_SIZE {
                return Err(head_too_large());
            }
            return Ok(None);
        };

        if head_len > MAX_HANDSHAKE_SIZE {
            return Err(head_too_large());
        }

        src.advance(head_len);
        let accept_key = self.accept(&request)?;
        self.mode = Mode::Frames;

        Ok(Some(WsFrame::Upgrade { accept_key }))
    }

    /// Check an upgrade request and return the `Sec-WebSocket-Accept` value.
    fn accept(&self, request: &Request) -> Result<String, FrameError> {
        let path = request.uri().path();
        if path != self.path {
            return Err(FrameError::rejected(
                StatusCode::NOT_FOUND.as_u16(),
                format!("no websocket endpoint at {}", path),
            ));
        }

        if request
            .headers()
            .get(SEC_WEBSOCKET_KEY)
            .is_some_and(|key| key.is_empty())
        {
            return Err(handshake_error(WsError::Protocol(
                ProtocolError::MissingSecWebSocketKey,
            )));
        }

        let response = create_response(request).map_err(handshake_error)?;
        response
            .headers()
            .get(SEC_WEBSOCKET_ACCEPT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| FrameError::rejected(StatusCode::BAD_REQUEST.as_u16(), "missing accept key"))
    }

    fn decode_frame(&mut self, src: &mut BytesMut) -> Result<Option<WsFrame>, FrameError> {
        loop {
            let Some(frame) = self.next_frame(src)? else {
                return Ok(None);
            };
            let FrameHeader {
                is_final, opcode, ..
            } = *frame.header();

            match opcode {
                OpCode::Data(Data::Continue) => {
                    let Some(mut message) = self.fragments.take() else {
                        return Err(violation(ProtocolError::UnexpectedContinueFrame));
                    };
                    if message.len() + frame.payload().len() > self.max_payload {
                        return Err(FrameError::FrameTooLong {
                            length: message.len() + frame.payload().len(),
                            max: self.max_payload,
                        });
                    }
                    message.extend_from_slice(frame.payload());
                    if is_final {
                        return text(Bytes::from(message)).map(Some);
                    }
                    self.fragments = Some(message);
                }
                OpCode::Data(Data::Text) => {
                    if self.fragments.is_some() {
                        return Err(violation(ProtocolError::ExpectedFragment(Data::Text)));
                    }
                    if is_final {
                        return text(frame.into_payload()).map(Some);
                    }
                    self.fragments = Some(frame.into_payload().to_vec());
                }
                OpCode::Data(Data::Binary) => {
                    return Err(FrameError::malformed("binary frames are not supported"));
                }
                OpCode::Control(control @ (Control::Close | Control::Ping | Control::Pong)) => {
                    if !is_final {
                        return Err(violation(ProtocolError::FragmentedControlFrame));
                    }
                    if frame.payload().len() > MAX_CONTROL_PAYLOAD {
                        return Err(violation(ProtocolError::ControlFrameTooBig));
                    }
                    let payload = frame.into_payload();
                    let control = match control {
                        Control::Ping => WsFrame::Ping(payload),
                        Control::Pong => WsFrame::Pong(payload),
                        _ => WsFrame::Close(close_frame(payload)?),
                    };
                    return Ok(Some(control));
                }
                OpCode::Data(Data::Reserved(code)) => {
                    return Err(violation(ProtocolError::UnknownDataFrameType(code)));
                }
                OpCode::Control(Control::Reserved(code)) => {
                    return Err(violation(ProtocolError::UnknownControlFrameType(code)));
                }
            }
        }
    }

    /// Split one complete frame off `src`, unmasked.
    fn next_frame(&self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let mut cursor = Cursor::new(&src[..]);
        let Some((header, length)) = FrameHeader::parse(&mut cursor).map_err(frame_error)? else {
            return Ok(None);
        };
        let header_len = cursor.position() as usize;

        if header.rsv1 || header.rsv2 || header.rsv3 {
            return Err(violation(ProtocolError::NonZeroReservedBits));
        }
        match (self.role, header.mask.is_some()) {
            (Role::Server, false) => return Err(violation(ProtocolError::UnmaskedFrameFromClient)),
            (Role::Client, true) => return Err(violation(ProtocolError::MaskedFrameFromServer)),
            _ => {}
        }

        if length > self.max_payload as u64 {
            return Err(FrameError::FrameTooLong {
                length: usize::try_from(length).unwrap_or(usize::MAX),
                max: self.max_payload,
            });
        }
        let length = length as usize;

        if src.len() < header_len + length {
            src.reserve(header_len + length - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let payload = src.split_to(length).freeze();
        if header.mask.is_some() {
            unmask(header, payload).map(Some)
        } else {
            Ok(Some(Frame::from_payload(header, payload)))
        }
    }

    fn put_frame(&self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if self.role == Role::Client {
            frame.header_mut().mask = Some(fastrand::u32(..).to_ne_bytes());
        }
        dst.reserve(frame.len());
        frame.format(&mut (&mut *dst).writer()).map_err(write_error)
    }

    fn put_control(&self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.payload().len() > MAX_CONTROL_PAYLOAD {
            return Err(violation(ProtocolError::ControlFrameTooBig));
        }
        self.put_frame(frame, dst)
    }
}

impl Decoder for WebSocketCodec {
    type Item = WsFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.mode {
            Mode::Handshake => self.decode_handshake(src),
            Mode::Frames => self.decode_frame(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None if self.mode == Mode::Handshake => Err(FrameError::rejected(
                StatusCode::BAD_REQUEST.as_u16(),
                "connection closed during handshake",
            )),
            None => Err(FrameError::malformed(format!(
                "truncated frame: {} bytes left at end of stream",
                src.len()
            ))),
        }
    }
}

impl Encoder<WsFrame> for WebSocketCodec {
    type Error = FrameError;

    fn encode(&mut self, item: WsFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            WsFrame::Upgrade { accept_key } => {
                let response = Response::builder()
                    .status(StatusCode::SWITCHING_PROTOCOLS)
                    .header(CONNECTION, "Upgrade")
                    .header(UPGRADE, "websocket")
                    .header(SEC_WEBSOCKET_ACCEPT, accept_key)
                    .body(())
                    .map_err(write_error)?;
                write_response((&mut *dst).writer(), &response).map_err(write_error)?;
            }
            WsFrame::Reject { status, reason } => {
                let status = StatusCode::from_u16(status).map_err(write_error)?;
                let body = format!("{}\n", reason);
                let response = Response::builder()
                    .status(status)
                    .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                    .header(CONTENT_LENGTH, body.len())
                    .header(CONNECTION, "close")
                    .body(())
                    .map_err(write_error)?;
                write_response((&mut *dst).writer(), &response).map_err(write_error)?;
                dst.put_slice(body.as_bytes());
            }
            WsFrame::Text(text) => {
                let payload = Bytes::from(text);
                if payload.len() <= self.chunk_size {
                    self.put_frame(Frame::message(payload, OpCode::Data(Data::Text), true), dst)?;
                } else {
                    let mut offset = 0;
                    let mut opcode = OpCode::Data(Data::Text);
                    while offset < payload.len() {
                        let end = (offset + self.chunk_size).min(payload.len());
                        let chunk = payload.slice(offset..end);
                        self.put_frame(Frame::message(chunk, opcode, end == payload.len()), dst)?;
                        opcode = OpCode::Data(Data::Continue);
                        offset = end;
                    }
                }
            }
            WsFrame::Ping(payload) => self.put_control(Frame::ping(payload), dst)?,
            WsFrame::Pong(payload) => self.put_control(Frame::pong(payload), dst)?,
            WsFrame::Close(frame) => self.put_control(Frame::close(frame), dst)?,
        }
        Ok(())
    }
}

/// Rebuild a client frame with its mask removed.
fn unmask(mut header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    let masked = header.clone();
    header.mask = None;

    // Formatting applies the mask, and applying it twice restores the payload.
    let header_len = masked.len(payload.len() as u64);
    let mut raw = BytesMut::with_capacity(header_len + payload.len()).writer();
    Frame::from_payload(masked, payload)
        .format(&mut raw)
        .map_err(frame_error)?;
    let payload = raw.into_inner().freeze().split_off(header_len);

    Ok(Frame::from_payload(header, payload))
}

fn text(payload: Bytes) -> Result<WsFrame, FrameError> {
    Utf8Bytes::try_from(payload)
        .map(|text| WsFrame::Text(text.as_str().to_owned()))
        .map_err(|_| FrameError::malformed("text payload is not valid UTF-8"))
}

fn close_frame(payload: Bytes) -> Result<Option<CloseFrame>, FrameError> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(violation(ProtocolError::InvalidCloseSequence)),
        _ => {
            let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
            if !code.is_allowed() {
                return Err(FrameError::malformed(format!("close code {} is not allowed", code)));
            }
            let reason = Utf8Bytes::try_from(payload.slice(2..))
                .map_err(|_| FrameError::malformed("close reason is not valid UTF-8"))?;
            Ok(Some(CloseFrame { code, reason }))
        }
    }
}

fn violation(error: ProtocolError) -> FrameError {
    FrameError::malformed(error.to_string())
}

fn frame_error(error: WsError) -> FrameError {
    match error {
        WsError::Io(e) => FrameError::Io(e),
        other => FrameError::malformed(other.to_string()),
    }
}

fn handshake_error(error: WsError) -> FrameError {
    let status = match &error {
        WsError::Protocol(ProtocolError::WrongHttpMethod) => StatusCode::METHOD_NOT_ALLOWED,
        WsError::Capacity(_) => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    };
    FrameError::rejected(status.as_u16(), error.to_string())
}

fn head_too_large() -> FrameError {
    FrameError::rejected(
        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE.as_u16(),
        "request head too large",
    )
}

fn write_error(error: impl std::fmt::Display) -> FrameError {
    FrameError::Io(io::Error::other(error.to_string()))
}
