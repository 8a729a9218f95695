//! Newline-delimited UTF-8 text framing.

use super::FrameError;
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Default maximum line length, excluding the delimiter.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8192;

/// Splits a byte stream on `\n` or `\r\n`, yielding lines without the delimiter.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    /// Bytes of the buffer already scanned without finding a delimiter.
    next_index: usize,
}

impl LineCodec {
    /// Create a codec that rejects lines longer than `max_length` bytes.
    #[must_use]
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }

    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// An undelimited buffer past the maximum can only still be a line if
    /// its one extra byte is the `\r` of a pending `\r\n`.
    fn overflows(&self, src: &[u8]) -> bool {
        src.len() > self.max_length + 1
            || (src.len() == self.max_length + 1 && src.last() != Some(&b'\r'))
    }

    fn too_long(&self, length: usize) -> FrameError {
        FrameError::FrameTooLong {
            length,
            max: self.max_length,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // A full line plus "\r\n" never needs more than max_length + 2 bytes.
        let scan_end = src.len().min(self.max_length + 2);
        let found = src[self.next_index..scan_end]
            .iter()
            .position(|b| *b == b'\n');

        let Some(offset) = found else {
            if self.overflows(src) {
                return Err(self.too_long(src.len()));
            }
            self.next_index = scan_end;
            return Ok(None);
        };

        let newline = self.next_index + offset;
        self.next_index = 0;

        let mut line = src.split_to(newline + 1);
        line.truncate(newline);
        if line.last() == Some(&b'\r') {
            line.truncate(newline - 1);
        }

        if line.len() > self.max_length {
            return Err(self.too_long(line.len()));
        }

        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|_| FrameError::malformed("line is not valid UTF-8"))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.len() > self.max_length {
            let length = src.len();
            src.clear();
            self.next_index = 0;
            return Err(self.too_long(length));
        }
        if !src.is_empty() {
            debug!(bytes = src.len(), "discarding unterminated line at end of stream");
            src.clear();
            self.next_index = 0;
        }
        Ok(None)
    }
}

impl Encoder<String> for LineCodec {
    type Error = FrameError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&str>>::encode(self, &item, dst)
    }
}

impl Encoder<&str> for LineCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_length {
            return Err(self.too_long(item.len()));
        }
        if item.contains('\n') {
            return Err(FrameError::malformed("outbound line contains a newline"));
        }

        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(b'\n');

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_back_to_back_lines() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"ping\npong\nok\n"[..]);

        assert_eq!(decode_all(&mut codec, &mut buf), vec!["ping", "pong", "ok"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_crlf_delimiter() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"hello\r\nworld\n"[..]);

        assert_eq!(decode_all(&mut codec, &mut buf), vec!["hello", "world"]);
    }

    #[test]
    fn test_empty_line() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"\n\r\n"[..]);

        assert_eq!(decode_all(&mut codec, &mut buf), vec!["", ""]);
    }

    #[test]
    fn test_partial_line() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"par"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(b"tial\r");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(b"\nnext");

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("partial"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"next");
    }

    #[test]
    fn test_line_too_long_without_delimiter() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&vec![b'a'; DEFAULT_MAX_LINE_LENGTH + 2][..]);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(FrameError::FrameTooLong { .. })));
    }

    #[test]
    fn test_one_byte_over_maximum_without_delimiter() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&vec![b'a'; DEFAULT_MAX_LINE_LENGTH + 1][..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::FrameTooLong { length: 8193, max: 8192 })
        ));
    }

    #[test]
    fn test_pending_carriage_return_at_maximum() {
        let mut codec = LineCodec::default();
        let mut data = vec![b'a'; DEFAULT_MAX_LINE_LENGTH];
        data.push(b'\r');
        let mut buf = BytesMut::from(&data[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_u8(b'\n');
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line.len(), DEFAULT_MAX_LINE_LENGTH);
    }

    #[test]
    fn test_eof_with_overlong_unterminated_line() {
        let mut codec = LineCodec::default();
        let mut data = vec![b'a'; DEFAULT_MAX_LINE_LENGTH];
        data.push(b'\r');
        let mut buf = BytesMut::from(&data[..]);

        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FrameError::FrameTooLong { length: 8193, max: 8192 })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_line_too_long_with_delimiter() {
        let mut codec = LineCodec::new(4);
        let mut buf = BytesMut::from(&b"abcde\n"[..]);

        let result = codec.decode(&mut buf);
        assert!(matches!(
            result,
            Err(FrameError::FrameTooLong { length: 5, max: 4 })
        ));
    }

    #[test]
    fn test_exact_maximum_accepted() {
        let mut codec = LineCodec::default();
        let mut data = vec![b'x'; DEFAULT_MAX_LINE_LENGTH];
        data.extend_from_slice(b"\r\n");
        let mut buf = BytesMut::from(&data[..]);

        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line.len(), DEFAULT_MAX_LINE_LENGTH);
    }

    #[test]
    fn test_long_line_arriving_in_pieces() {
        let mut codec = LineCodec::new(16);
        let mut buf = BytesMut::new();

        buf.put_slice(&[b'a'; 10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(&[b'a'; 10]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"\xff\xfe\n"[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_eof_discards_partial_line() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"done\nleftover"[..]);

        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("done"));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_decode() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::new();

        codec.encode("héllo wörld".to_string(), &mut buf).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, "héllo wörld");
    }

    #[test]
    fn test_encode_rejects_embedded_newline() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::new();

        assert!(codec.encode("two\nlines", &mut buf).is_err());
        assert!(buf.is_empty());
    }
}
