//! Blocking one-shot client.

use crate::error::ClientError;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tlvrpc_protocol::{Decoder, Frame, TlvConfig};

/// Read buffer size for socket reads.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Sends one frame per connection over a blocking socket.
///
/// Useful for tests and tools that want a plain request/response without an
/// I/O thread. Keep-alive bits are sent as given but the socket is closed
/// after the first response.
#[derive(Debug, Clone)]
pub struct BlockingClient {
    addr: SocketAddr,
    tlv: TlvConfig,
    timeout: Option<Duration>,
}

impl BlockingClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            tlv: TlvConfig::default(),
            timeout: Some(Duration::from_secs(30)),
        }
    }

    pub fn with_tlv(mut self, tlv: TlvConfig) -> Self {
        self.tlv = tlv;
        self
    }

    /// Read/write timeout; `None` blocks forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn send(&self, frame: &Frame) -> Result<Frame, ClientError> {
        let bytes = frame.encode_with(&self.tlv)?;
        self.send_raw(&bytes)
    }

    /// Writes already-encoded bytes and reads one response frame.
    pub fn send_raw(&self, request: &[u8]) -> Result<Frame, ClientError> {
        let mut stream = TcpStream::connect(self.addr)
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(self.timeout)?;
        stream.set_write_timeout(self.timeout)?;
        stream.write_all(request)?;

        let mut decoder = Decoder::with_config(self.tlv);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if let Some(frame) = decoder.decode_frame()? {
                return Ok(frame);
            }
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            decoder.extend(&buf[..n]);
        }
    }
}
