//! Server-side connection context.

use mio::net::TcpStream;
use mio::Interest;
use std::net::SocketAddr;
use std::time::Instant;
use tlvrpc_protocol::{ConnState, FrameReader, TlvConfig, WriteBuf};

/// Everything needed to resume a partially completed exchange on one socket.
///
/// Owned by the reactor whose poll holds the socket's registration. The
/// buffers survive [`reset`](Self::reset) so keep-alive connections do not
/// reallocate between requests.
#[derive(Debug)]
pub struct Connection {
    pub(crate) stream: TcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) state: ConnState,
    pub(crate) reader: FrameReader,
    pub(crate) response: WriteBuf,
    /// Interest currently registered with the poll.
    pub(crate) interest: Interest,
    /// Keep-alive bit of the request being served.
    pub(crate) keep_alive: bool,
    pub(crate) requests: u64,
    pub(crate) started: Instant,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, tlv: TlvConfig) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::ReadingHeader,
            reader: FrameReader::new(tlv),
            response: WriteBuf::new(),
            interest: Interest::READABLE,
            keep_alive: false,
            requests: 0,
            started: Instant::now(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Requests served on this socket so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Rewinds for the next request after a keep-alive response drained.
    pub fn reset(&mut self) {
        self.reader.reset();
        self.response.clear();
        self.keep_alive = false;
        self.state = ConnState::ReadingHeader;
        self.started = Instant::now();
    }
}
