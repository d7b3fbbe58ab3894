//! Streaming decoder for TLV frames.

use crate::error::ProtocolError;
use crate::frame::{Frame, TlvConfig};
use bytes::{Bytes, BytesMut};

/// Accumulates bytes from a blocking reader and yields complete frames.
pub struct Decoder {
    buffer: BytesMut,
    config: TlvConfig,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_config(TlvConfig::default())
    }

    pub fn with_config(config: TlvConfig) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            config,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode_with(&mut self.buffer, &self.config)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
