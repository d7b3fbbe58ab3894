//! Per-connection protocol state machine.
//!
//! Non-blocking sockets never deliver a whole message in one call. A
//! [`FrameReader`] keeps the header scratch buffer and body buffer of one
//! connection between readiness events, and a [`WriteBuf`] tracks how much of
//! an outbound frame has been accepted by the kernel. Both stop at the first
//! `WouldBlock` and resume on the next event without changing state.
//!
//! ```text
//! client:  CONNECTING -> WRITING -> READING_HEADER -> READING_BODY -> DONE | ERROR
//! server:  READING_HEADER -> READING_BODY -> WRITING_RESPONSE -> DONE | ERROR
//!                 ^                                             |
//!                 +------------------ keep-alive reset ---------+
//! ```

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, TlvConfig};
use std::fmt;
use std::io::{self, Read, Write};

/// Protocol state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Non-blocking connect in flight (client only).
    Connecting,
    /// Writing the request frame (client only).
    Writing,
    /// Filling the fixed-size header buffer.
    ReadingHeader,
    /// Filling the body buffer sized from the header.
    ReadingBody,
    /// Draining the response frame (server only).
    WritingResponse,
    /// Exchange finished; the socket is idle or about to close.
    Done,
    /// Transport failure; the socket is closed.
    Error,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Connecting => write!(f, "CONNECTING"),
            ConnState::Writing => write!(f, "WRITING"),
            ConnState::ReadingHeader => write!(f, "READING_HEADER"),
            ConnState::ReadingBody => write!(f, "READING_BODY"),
            ConnState::WritingResponse => write!(f, "WRITING_RESPONSE"),
            ConnState::Done => write!(f, "DONE"),
            ConnState::Error => write!(f, "ERROR"),
        }
    }
}

/// Outcome of driving a [`FrameReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadProgress {
    /// The source would block before the frame completed.
    Pending,
    /// Header and body are both complete.
    Complete(FrameHeader),
}

/// Outcome of driving a [`WriteBuf`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    Pending,
    Complete,
}

/// Incremental reader for one inbound frame.
///
/// The header buffer is allocated once. The body buffer keeps its capacity
/// across [`reset`](Self::reset) and only grows when a later frame is larger.
/// The reader never consumes bytes past the end of the current frame.
#[derive(Debug)]
pub struct FrameReader {
    config: TlvConfig,
    header: Box<[u8]>,
    header_pos: usize,
    decoded: Option<FrameHeader>,
    body: Vec<u8>,
    body_pos: usize,
}

impl FrameReader {
    pub fn new(config: TlvConfig) -> Self {
        Self {
            header: vec![0u8; config.header_size_bytes].into_boxed_slice(),
            config,
            header_pos: 0,
            decoded: None,
            body: Vec::new(),
            body_pos: 0,
        }
    }

    /// `ReadingHeader` until the header decodes, then `ReadingBody`.
    pub fn state(&self) -> ConnState {
        match self.decoded {
            None => ConnState::ReadingHeader,
            Some(_) => ConnState::ReadingBody,
        }
    }

    /// The decoded header, once complete.
    pub fn header(&self) -> Option<FrameHeader> {
        self.decoded
    }

    /// Body bytes read so far (the whole body once complete).
    pub fn body(&self) -> &[u8] {
        &self.body[..self.body_pos]
    }

    /// Capacity retained for the body buffer.
    pub fn body_capacity(&self) -> usize {
        self.body.capacity()
    }

    /// Returns whether no byte of a new frame has been read yet.
    pub fn is_idle(&self) -> bool {
        self.header_pos == 0 && self.decoded.is_none()
    }

    /// Rewinds for the next frame without releasing buffers.
    pub fn reset(&mut self) {
        self.header_pos = 0;
        self.decoded = None;
        self.body.clear();
        self.body_pos = 0;
    }

    /// Reads until the frame completes or the source would block.
    ///
    /// End of stream at any point is an error: a graceful close in the middle
    /// of a message is indistinguishable from a protocol violation.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> Result<ReadProgress, ProtocolError> {
        loop {
            let state = self.state();
            match self.decoded {
                None => {
                    let n = match read_some(src, &mut self.header[self.header_pos..])? {
                        Some(n) => n,
                        None => return Ok(ReadProgress::Pending),
                    };
                    if n == 0 {
                        return Err(ProtocolError::UnexpectedEof { state });
                    }
                    self.header_pos += n;
                    if self.header_pos < self.header.len() {
                        continue;
                    }

                    let header = FrameHeader::decode(&self.header)?;
                    self.config.check_length(header.length)?;
                    // resize only reallocates when the body outgrows the capacity
                    self.body.clear();
                    self.body.resize(header.length as usize, 0);
                    self.body_pos = 0;
                    self.decoded = Some(header);
                }
                Some(header) => {
                    if self.body_pos == self.body.len() {
                        return Ok(ReadProgress::Complete(header));
                    }
                    let n = match read_some(src, &mut self.body[self.body_pos..])? {
                        Some(n) => n,
                        None => return Ok(ReadProgress::Pending),
                    };
                    if n == 0 {
                        return Err(ProtocolError::UnexpectedEof { state });
                    }
                    self.body_pos += n;
                }
            }
        }
    }
}

/// Outbound frame bytes plus a drain cursor.
#[derive(Debug, Default)]
pub struct WriteBuf {
    buf: Vec<u8>,
    pos: usize,
}

impl WriteBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contents, keeping the allocation when it is big enough.
    pub fn load(&mut self, bytes: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(bytes);
        self.pos = 0;
    }

    /// Gives the encoder direct access to the buffer and rewinds the cursor.
    pub fn vec_mut(&mut self) -> &mut Vec<u8> {
        self.pos = 0;
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn written(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }

    /// Writes until drained or the sink would block.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> Result<WriteProgress, ProtocolError> {
        while self.pos < self.buf.len() {
            match dst.write(&self.buf[self.pos..]) {
                Ok(0) => return Err(ProtocolError::WriteZero),
                Ok(n) => self.pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteProgress::Pending)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(WriteProgress::Complete)
    }
}

fn read_some<R: Read>(src: &mut R, buf: &mut [u8]) -> Result<Option<usize>, ProtocolError> {
    loop {
        match src.read(buf) {
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
