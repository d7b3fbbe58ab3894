//! # tlvrpc-protocol
//!
//! Wire protocol implementation for tlvrpc.
//!
//! This crate provides:
//! - TLV framing: one type/keep-alive byte, a big-endian `u32` length, the body
//! - A streaming decoder for blocking readers
//! - The per-connection read/write state machine shared by clients and servers

pub mod codec;
pub mod conn;
pub mod error;
pub mod frame;

pub use codec::Decoder;
pub use conn::{ConnState, FrameReader, ReadProgress, WriteBuf, WriteProgress};
pub use error::ProtocolError;
pub use frame::{is_keep_alive, message_type, type_byte, Frame, FrameHeader, TlvConfig};

/// Default size of the frame header in bytes (1 type byte + 4 length bytes).
pub const DEFAULT_HEADER_SIZE: usize = 5;

/// Smallest header the codec can decode.
pub const MIN_HEADER_SIZE: usize = 5;

/// Default maximum body size (1 MiB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 1024 * 1024;

/// Reserved message type answered for unregistered request types.
pub const ERROR_TYPE: u8 = 0x7f;

/// High bit of the type byte: the sender wants the connection kept open.
pub const KEEP_ALIVE_BIT: u8 = 0x80;

/// Low seven bits of the type byte.
pub const TYPE_MASK: u8 = 0x7f;

/// Default port for tlvrpc servers.
pub const DEFAULT_PORT: u16 = 8080;
