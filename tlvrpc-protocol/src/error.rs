//! Protocol error types.

use crate::conn::ConnState;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or connection I/O.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message type: {0} (max 127)")]
    InvalidMessageType(u8),

    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: u32, max: u32 },

    #[error("invalid header size: {size} bytes (min {min})")]
    InvalidHeaderSize { size: usize, min: usize },

    #[error("incomplete header: got {len} bytes, need {needed}")]
    IncompleteHeader { len: usize, needed: usize },

    #[error("unexpected end of stream while {state}")]
    UnexpectedEof { state: ConnState },

    #[error("peer accepted zero bytes")]
    WriteZero,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether the peer closed the connection mid-message.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::UnexpectedEof { .. })
    }
}
