//! MQTT fixed-header framing.
//!
//! Frame format: `[type:4 | flags:4][remaining length varint, 1-4 bytes][payload]`.
//! Only frame boundaries are handled here; variable headers and payloads are
//! passed through untouched.

use super::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest value the four-byte remaining length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Upper bound on how much buffer space a declared length may pre-reserve.
const MAX_RESERVE: usize = 64 * 1024;

/// Control packet type, taken from the high nibble of the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    /// Map a header nibble to a packet type. `0` is reserved.
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        let packet_type = match nibble {
            1 => Self::Connect,
            2 => Self::ConnAck,
            3 => Self::Publish,
            4 => Self::PubAck,
            5 => Self::PubRec,
            6 => Self::PubRel,
            7 => Self::PubComp,
            8 => Self::Subscribe,
            9 => Self::SubAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubAck,
            12 => Self::PingReq,
            13 => Self::PingResp,
            14 => Self::Disconnect,
            15 => Self::Auth,
            _ => return None,
        };
        Some(packet_type)
    }
}

/// One framed MQTT control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttPacket {
    packet_type: PacketType,
    flags: u8,
    payload: Bytes,
}

impl MqttPacket {
    /// Create a packet. Only the low four bits of `flags` are kept.
    pub fn new(packet_type: PacketType, flags: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            flags: flags & 0x0f,
            payload: payload.into(),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Everything after the remaining length field.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The first byte of the fixed header.
    pub fn header_byte(&self) -> u8 {
        (self.packet_type as u8) << 4 | self.flags
    }
}

/// Append `length` as an MQTT variable byte integer.
///
/// Callers must keep `length <= MAX_REMAINING_LENGTH`.
pub fn encode_remaining_length(mut length: usize, dst: &mut BytesMut) {
    loop {
        let mut byte = (length % 128) as u8;
        length /= 128;
        if length > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if length == 0 {
            break;
        }
    }
}

/// Read an MQTT variable byte integer from the start of `src`.
///
/// Returns `(value, bytes consumed)`, or `None` if more bytes are needed.
pub fn decode_remaining_length(src: &[u8]) -> Result<Option<(usize, usize)>, FrameError> {
    let mut value = 0usize;
    for (index, shift) in (0..4).map(|i| (i, i * 7)) {
        let Some(&byte) = src.get(index) else {
            return Ok(None);
        };
        value |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
    }
    Err(FrameError::malformed(
        "remaining length field is longer than 4 bytes",
    ))
}

/// Fixed-header framing codec for the MQTT listener.
#[derive(Debug, Clone)]
pub struct MqttCodec {
    max_remaining_length: usize,
}

impl MqttCodec {
    /// Create a codec that rejects packets declaring more than
    /// `max_remaining_length` payload bytes.
    #[must_use]
    pub fn new(max_remaining_length: usize) -> Self {
        Self {
            max_remaining_length: max_remaining_length.min(MAX_REMAINING_LENGTH),
        }
    }

    #[must_use]
    pub fn max_remaining_length(&self) -> usize {
        self.max_remaining_length
    }
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new(MAX_REMAINING_LENGTH)
    }
}

impl Decoder for MqttCodec {
    type Item = MqttPacket;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&header) = src.first() else {
            return Ok(None);
        };

        let packet_type = PacketType::from_nibble(header >> 4)
            .ok_or_else(|| FrameError::malformed("reserved packet type 0"))?;

        let Some((remaining, length_bytes)) = decode_remaining_length(&src[1..])? else {
            return Ok(None);
        };

        if remaining > self.max_remaining_length {
            return Err(FrameError::malformed(format!(
                "remaining length {remaining} exceeds maximum {}",
                self.max_remaining_length
            )));
        }

        let header_len = 1 + length_bytes;
        let total = header_len + remaining;
        if src.len() < total {
            src.reserve((total - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        src.advance(header_len);
        let payload = src.split_to(remaining).freeze();

        Ok(Some(MqttPacket {
            packet_type,
            flags: header & 0x0f,
            payload,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::malformed(format!(
                "truncated packet: {} bytes left at end of stream",
                src.len()
            ))),
        }
    }
}

impl Encoder<MqttPacket> for MqttCodec {
    type Error = FrameError;

    fn encode(&mut self, item: MqttPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = item.payload.len();
        if length > self.max_remaining_length {
            return Err(FrameError::FrameTooLong {
                length,
                max: self.max_remaining_length,
            });
        }

        dst.reserve(1 + 4 + length);
        dst.put_u8(item.header_byte());
        encode_remaining_length(length, dst);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::new();

        let packet = MqttPacket::new(PacketType::Publish, 0b0010, &b"\x00\x03a/bhello"[..]);
        codec.encode(packet.clone(), &mut buf).unwrap();

        // header + 1 length byte + payload
        assert_eq!(buf.len(), 2 + packet.payload().len());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.flags(), 0b0010);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_payload() {
        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::from(&[0xC0u8, 0x00][..]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.packet_type(), PacketType::PingReq);
        assert!(decoded.payload().is_empty());
    }

    #[test]
    fn test_remaining_length_boundaries() {
        let cases = [
            (0usize, 1usize),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
            (MAX_REMAINING_LENGTH, 4),
        ];

        for (value, width) in cases {
            let mut buf = BytesMut::new();
            encode_remaining_length(value, &mut buf);
            assert_eq!(buf.len(), width, "width of {}", value);
            assert_eq!(
                decode_remaining_length(&buf).unwrap(),
                Some((value, width)),
                "value {}",
                value
            );
        }
    }

    #[test]
    fn test_remaining_length_too_long() {
        let result = decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert!(matches!(result, Err(FrameError::MalformedFrame(_))));
    }

    #[test]
    fn test_partial_header() {
        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::new();

        buf.put_u8(0x30);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // continuation bit set, second length byte still missing
        buf.put_u8(0x80);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_u8(0x01);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_slice(&[0u8; 128]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload().len(), 128);
    }

    #[test]
    fn test_truncated_payload_at_eof() {
        let mut codec = MqttCodec::default();
        // declares 10 payload bytes, only 4 arrive before the peer closes
        let mut buf = BytesMut::from(&[0x30u8, 0x0A, 1, 2, 3, 4][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        let result = codec.decode_eof(&mut buf);
        assert!(matches!(result, Err(FrameError::MalformedFrame(_))));
    }

    #[test]
    fn test_clean_eof() {
        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_exceeds_configured_maximum() {
        let mut codec = MqttCodec::new(100);
        let mut buf = BytesMut::new();
        buf.put_u8(0x30);
        encode_remaining_length(200, &mut buf);

        match codec.decode(&mut buf) {
            Err(FrameError::MalformedFrame(reason)) => {
                assert_eq!(reason, "remaining length 200 exceeds maximum 100");
            }
            other => panic!("expected malformed frame, got {other:?}"),
        }
    }

    #[test]
    fn test_reserved_packet_type() {
        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::from(&[0x00u8, 0x00][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_encode_too_large() {
        let mut codec = MqttCodec::new(10);
        let mut buf = BytesMut::new();
        let packet = MqttPacket::new(PacketType::Publish, 0, vec![0u8; 20]);
        assert!(codec.encode(packet, &mut buf).is_err());
    }

    #[test]
    fn test_multiple_packets() {
        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::new();

        codec
            .encode(MqttPacket::new(PacketType::Connect, 0, &b"one"[..]), &mut buf)
            .unwrap();
        codec
            .encode(MqttPacket::new(PacketType::Publish, 0, vec![7u8; 300]), &mut buf)
            .unwrap();
        codec
            .encode(MqttPacket::new(PacketType::Disconnect, 0, Bytes::new()), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.packet_type(), PacketType::Connect);
        assert_eq!(&first.payload()[..], b"one");

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.payload().len(), 300);

        let third = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(third.packet_type(), PacketType::Disconnect);

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_flags_masked() {
        let packet = MqttPacket::new(PacketType::Subscribe, 0xF2, Bytes::new());
        assert_eq!(packet.flags(), 0x02);
        assert_eq!(packet.header_byte(), 0x82);
    }
}
