//! TLV frame format.
//!
//! Frame layout (default 5 byte header + body):
//!
//! ```text
//! +-----------+-----------+-------------+----------------+
//! | ka | type |  length   | [reserved]  | body           |
//! |  1 byte   |  4 bytes  | header - 5  | length bytes   |
//! +-----------+-----------+-------------+----------------+
//! ```
//!
//! Bit 7 of the first byte is the keep-alive flag, bits 0-6 the message type.
//! The length is an unsigned big-endian integer. Headers configured larger
//! than five bytes carry zeroed reserved octets that decoders skip.

use crate::error::ProtocolError;
use crate::{
    DEFAULT_HEADER_SIZE, DEFAULT_MAX_BODY_SIZE, KEEP_ALIVE_BIT, MIN_HEADER_SIZE, TYPE_MASK,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Packs a message type and keep-alive flag into a header type byte.
pub fn type_byte(msg_type: u8, keep_alive: bool) -> u8 {
    let b = msg_type & TYPE_MASK;
    if keep_alive {
        b | KEEP_ALIVE_BIT
    } else {
        b
    }
}

/// Returns whether the keep-alive bit is set in a type byte.
pub fn is_keep_alive(type_byte: u8) -> bool {
    type_byte & KEEP_ALIVE_BIT != 0
}

/// Extracts the message type (low seven bits) from a type byte.
pub fn message_type(type_byte: u8) -> u8 {
    type_byte & TYPE_MASK
}

/// Header and body limits agreed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvConfig {
    /// Size of the fixed header in bytes.
    pub header_size_bytes: usize,
    /// Largest body a peer may announce.
    pub max_body_size_bytes: u32,
}

impl Default for TlvConfig {
    fn default() -> Self {
        Self {
            header_size_bytes: DEFAULT_HEADER_SIZE,
            max_body_size_bytes: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl TlvConfig {
    pub fn new(header_size_bytes: usize, max_body_size_bytes: u32) -> Result<Self, ProtocolError> {
        let config = Self {
            header_size_bytes,
            max_body_size_bytes,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_body_size(mut self, max: u32) -> Self {
        self.max_body_size_bytes = max;
        self
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.header_size_bytes < MIN_HEADER_SIZE {
            return Err(ProtocolError::InvalidHeaderSize {
                size: self.header_size_bytes,
                min: MIN_HEADER_SIZE,
            });
        }
        Ok(())
    }

    /// Rejects lengths above the configured maximum.
    pub fn check_length(&self, length: u32) -> Result<(), ProtocolError> {
        if length > self.max_body_size_bytes {
            return Err(ProtocolError::BodyTooLarge {
                size: length,
                max: self.max_body_size_bytes,
            });
        }
        Ok(())
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: u8,
    pub keep_alive: bool,
    pub length: u32,
}

impl FrameHeader {
    pub fn new(msg_type: u8, keep_alive: bool, length: u32) -> Self {
        Self {
            msg_type,
            keep_alive,
            length,
        }
    }

    /// The packed type/keep-alive byte.
    pub fn type_byte(&self) -> u8 {
        type_byte(self.msg_type, self.keep_alive)
    }

    /// Writes exactly `header_size` bytes.
    pub fn encode_into<B: BufMut>(&self, buf: &mut B, header_size: usize) {
        buf.put_u8(self.type_byte());
        buf.put_u32(self.length);
        if header_size > MIN_HEADER_SIZE {
            buf.put_bytes(0, header_size - MIN_HEADER_SIZE);
        }
    }

    /// Decodes the leading five bytes of a header.
    ///
    /// Callers supply the full header; reserved trailing octets are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < MIN_HEADER_SIZE {
            return Err(ProtocolError::IncompleteHeader {
                len: buf.len(),
                needed: MIN_HEADER_SIZE,
            });
        }
        let b = buf[0];
        let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        Ok(Self {
            msg_type: message_type(b),
            keep_alive: is_keep_alive(b),
            length,
        })
    }

    /// Replaces `out` with header followed by `body`, reusing its capacity.
    pub fn encode_frame_into(
        msg_type: u8,
        keep_alive: bool,
        body: &[u8],
        config: &TlvConfig,
        out: &mut Vec<u8>,
    ) -> Result<(), ProtocolError> {
        if msg_type > TYPE_MASK {
            return Err(ProtocolError::InvalidMessageType(msg_type));
        }
        let length = u32::try_from(body.len()).map_err(|_| ProtocolError::BodyTooLarge {
            size: u32::MAX,
            max: config.max_body_size_bytes,
        })?;
        config.check_length(length)?;

        out.clear();
        out.reserve(config.header_size_bytes + body.len());
        Self::new(msg_type, keep_alive, length).encode_into(out, config.header_size_bytes);
        out.extend_from_slice(body);
        Ok(())
    }
}

/// A complete TLV frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type in `[0, 127]`.
    pub msg_type: u8,
    /// Whether the connection stays open after the exchange.
    pub keep_alive: bool,
    /// Opaque body.
    pub body: Bytes,
}

impl Frame {
    /// Creates a frame that closes the connection after its exchange.
    pub fn new(msg_type: u8, body: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            keep_alive: false,
            body: body.into(),
        }
    }

    /// Creates a keep-alive frame.
    pub fn keep_alive(msg_type: u8, body: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            keep_alive: true,
            body: body.into(),
        }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader::new(self.msg_type, self.keep_alive, self.body.len() as u32)
    }

    /// Encodes the frame with the default header size and body limit.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        self.encode_with(&TlvConfig::default())
    }

    pub fn encode_with(&self, config: &TlvConfig) -> Result<BytesMut, ProtocolError> {
        if self.msg_type > TYPE_MASK {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let length = u32::try_from(self.body.len()).map_err(|_| ProtocolError::BodyTooLarge {
            size: u32::MAX,
            max: config.max_body_size_bytes,
        })?;
        config.check_length(length)?;

        let mut buf = BytesMut::with_capacity(config.header_size_bytes + self.body.len());
        self.header()
            .encode_into(&mut buf, config.header_size_bytes);
        buf.put_slice(&self.body);
        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        Self::decode_with(buf, &TlvConfig::default())
    }

    pub fn decode_with(
        buf: &mut BytesMut,
        config: &TlvConfig,
    ) -> Result<Option<Self>, ProtocolError> {
        let header_size = config.header_size_bytes;
        if buf.len() < header_size {
            return Ok(None);
        }

        // Peek at header without consuming
        let header = FrameHeader::decode(&buf[..header_size])?;
        config.check_length(header.length)?;

        let total_len = header_size + header.length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(header_size);
        let body = buf.split_to(header.length as usize).freeze();

        Ok(Some(Self {
            msg_type: header.msg_type,
            keep_alive: header.keep_alive,
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ERROR_TYPE;
    use proptest::prelude::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new(1, Bytes::from_static(b"Hello World"));

        let mut buf = frame.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_wire_layout() {
        let frame = Frame::keep_alive(3, vec![0xAA; 258]);
        let encoded = frame.encode().unwrap();

        assert_eq!(encoded[0], 0x83);
        assert_eq!(&encoded[1..5], &[0x00, 0x00, 0x01, 0x02]);
        assert_eq!(encoded.len(), 5 + 258);
    }

    #[test]
    fn test_type_byte_helpers() {
        assert_eq!(type_byte(1, false), 0x01);
        assert_eq!(type_byte(1, true), 0x81);
        assert_eq!(type_byte(ERROR_TYPE, true), 0xFF);
        assert!(is_keep_alive(0x81));
        assert!(!is_keep_alive(0x7F));
        assert_eq!(message_type(0xFF), ERROR_TYPE);
    }

    #[test]
    fn test_incomplete_frame() {
        let encoded = Frame::new(0, Bytes::from_static(b"abc")).encode().unwrap();

        let mut buf = BytesMut::from(&encoded[..4]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        let mut buf = BytesMut::from(&encoded[..6]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_empty_body() {
        let frame = Frame::new(ERROR_TYPE, Bytes::new());
        let mut buf = frame.encode().unwrap();
        assert_eq!(&buf[..], &[0x7F, 0, 0, 0, 0]);

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_body_too_large() {
        let config = TlvConfig::default().with_max_body_size(4);
        let frame = Frame::new(1, vec![0u8; 5]);
        let result = frame.encode_with(&config);
        assert!(matches!(
            result,
            Err(ProtocolError::BodyTooLarge { size: 5, max: 4 })
        ));

        let mut buf = BytesMut::from(&[0x01, 0, 0, 0, 5][..]);
        let result = Frame::decode_with(&mut buf, &config);
        assert!(matches!(result, Err(ProtocolError::BodyTooLarge { .. })));
    }

    #[test]
    fn test_invalid_message_type() {
        let frame = Frame::new(200, Bytes::new());
        assert!(matches!(
            frame.encode(),
            Err(ProtocolError::InvalidMessageType(200))
        ));
    }

    #[test]
    fn test_header_too_short() {
        let result = FrameHeader::decode(&[0x01, 0x00]);
        assert!(matches!(
            result,
            Err(ProtocolError::IncompleteHeader { len: 2, needed: 5 })
        ));
    }

    #[test]
    fn test_tlv_config_validation() {
        assert!(TlvConfig::new(5, 1000).is_ok());
        assert!(TlvConfig::new(8, 1000).is_ok());
        assert!(matches!(
            TlvConfig::new(4, 1000),
            Err(ProtocolError::InvalidHeaderSize { size: 4, min: 5 })
        ));
    }

    #[test]
    fn test_wide_header_is_padded() {
        let config = TlvConfig::new(8, 1000).unwrap();
        let frame = Frame::keep_alive(9, Bytes::from_static(b"xy"));

        let mut buf = frame.encode_with(&config).unwrap();
        assert_eq!(buf.len(), 10);
        assert_eq!(&buf[5..8], &[0, 0, 0]);

        let decoded = Frame::decode_with(&mut buf, &config).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_encode_frame_into_reuses_buffer() {
        let config = TlvConfig::default();
        let mut out = Vec::with_capacity(64);
        let ptr = out.as_ptr();

        FrameHeader::encode_frame_into(1, true, b"first", &config, &mut out).unwrap();
        assert_eq!(out[0], 0x81);
        assert_eq!(out.len(), 10);

        FrameHeader::encode_frame_into(2, false, b"xy", &config, &mut out).unwrap();
        assert_eq!(&out[..], &[0x02, 0, 0, 0, 2, b'x', b'y']);
        assert_eq!(out.as_ptr(), ptr);
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Frame::new(0, Bytes::from_static(b"one")).encode().unwrap());
        buf.extend_from_slice(&Frame::keep_alive(1, Bytes::from_static(b"two")).encode().unwrap());

        let first = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.body.as_ref(), b"one");
        assert!(!first.keep_alive);

        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.body.as_ref(), b"two");
        assert!(second.keep_alive);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_codec_roundtrip(
            msg_type in 0u8..127,
            keep_alive in any::<bool>(),
            body in proptest::collection::vec(any::<u8>(), 0..1000),
        ) {
            let config = TlvConfig::new(5, 1000).unwrap();
            let frame = Frame { msg_type, keep_alive, body: Bytes::from(body.clone()) };

            let mut buf = frame.encode_with(&config).unwrap();
            let header = FrameHeader::decode(&buf[..5]).unwrap();
            prop_assert_eq!(header, FrameHeader::new(msg_type, keep_alive, body.len() as u32));

            let decoded = Frame::decode_with(&mut buf, &config).unwrap().unwrap();
            prop_assert_eq!(decoded.msg_type, msg_type);
            prop_assert_eq!(decoded.keep_alive, keep_alive);
            prop_assert_eq!(decoded.body.as_ref(), &body[..]);
        }
    }
}
