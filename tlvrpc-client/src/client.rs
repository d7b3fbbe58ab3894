//! High-level client API.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::handle::{RequestEnvelope, ResponseHandle};
use crate::io::{IoLoop, Shared, WAKER};
use crate::state::ClientState;
use bytes::Bytes;
use mio::{Poll, Waker};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tlvrpc_protocol::{is_keep_alive, Frame, ProtocolError};

/// Asynchronous RPC client backed by one I/O thread.
///
/// `submit` may be called from any number of threads. Each request runs on
/// its own socket unless it is keep-alive and the shared socket is idle.
pub struct Client {
    config: ClientConfig,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    client_id: String,
    thread: Mutex<Option<JoinHandle<ClientState>>>,
    final_state: Mutex<Option<ClientState>>,
}

impl Client {
    /// Creates a client and starts its I/O thread. No socket is opened yet.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let shared = Arc::new(Shared::new(config.queue_capacity, waker));
        let client_id = short_id();

        let io = IoLoop::new(poll, shared.clone(), config.clone(), client_id.clone());
        let thread = thread::Builder::new()
            .name(format!("tlvrpc-client-{}", client_id))
            .spawn(move || io.run())?;

        Ok(Self {
            config,
            shared,
            next_id: AtomicU64::new(0),
            client_id,
            thread: Mutex::new(Some(thread)),
            final_state: Mutex::new(None),
        })
    }

    /// Creates a client with default settings for `addr`.
    pub fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        Self::new(ClientConfig::new(addr))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Queues an encoded request frame.
    ///
    /// The first byte carries the message type and keep-alive bit. Returns
    /// [`ClientError::QueueFull`] at once when the queue is full; the request
    /// was not sent and may be retried.
    pub fn submit(&self, request: impl Into<Bytes>) -> Result<ResponseHandle, ClientError> {
        let request = request.into();
        let needed = self.config.tlv.header_size_bytes;
        if request.len() < needed {
            return Err(ProtocolError::IncompleteHeader {
                len: request.len(),
                needed,
            }
            .into());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let keep_alive = is_keep_alive(request[0]);
        let (envelope, handle) = RequestEnvelope::new(id, request, keep_alive);
        self.shared.enqueue(envelope)?;
        Ok(handle)
    }

    /// Encodes `frame` with the configured header size and queues it.
    pub fn submit_frame(&self, frame: &Frame) -> Result<ResponseHandle, ClientError> {
        let bytes = frame.encode_with(&self.config.tlv)?;
        self.submit(bytes.freeze())
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Stops the I/O thread, waits for it and returns the final counters.
    ///
    /// Requests still queued or in flight are dropped and their handles
    /// resolve with [`ClientError::Cancelled`].
    pub fn stop(&self) -> ClientState {
        self.shared.stop();
        if let Some(thread) = self.thread.lock().take() {
            let state = match thread.join() {
                Ok(state) => state,
                Err(_) => {
                    tracing::error!("[{}] Client I/O thread panicked", self.client_id);
                    ClientState::new(self.client_id.clone())
                }
            };
            tracing::debug!("[{}] {}", self.client_id, state);
            *self.final_state.lock() = Some(state);
        }
        self.state()
            .unwrap_or_else(|| ClientState::new(self.client_id.clone()))
    }

    /// Counters of a stopped client; `None` while the I/O thread runs.
    pub fn state(&self) -> Option<ClientState> {
        self.final_state.lock().clone()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.client_id)
            .field("addr", &self.config.addr)
            .field("stopped", &self.is_stopped())
            .field("queued", &self.shared.queued())
            .finish()
    }
}

/// Last group of a random UUID.
fn short_id() -> String {
    let id = uuid::Uuid::new_v4().to_string();
    match id.rsplit_once('-') {
        Some((_, tail)) => tail.to_string(),
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unused_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn test_short_id() {
        let id = short_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_short_request_rejected() {
        let client = Client::connect(unused_addr()).unwrap();
        let err = client.submit(vec![0x81u8, 0]).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::IncompleteHeader { len: 2, needed: 5 })
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let client = Client::connect(unused_addr()).unwrap();
        assert!(client.state().is_none());

        let first = client.stop();
        assert_eq!(first.client_id, client.client_id());
        assert!(client.is_stopped());
        assert_eq!(client.stop(), first);
        assert_eq!(client.state(), Some(first));

        let frame = Frame::new(1, Bytes::new());
        assert!(matches!(client.submit_frame(&frame), Err(ClientError::Stopped)));
    }

    #[test]
    fn test_invalid_config() {
        let config = ClientConfig::new(unused_addr()).with_queue_capacity(0);
        assert!(matches!(Client::new(config), Err(ClientError::InvalidConfig(_))));
    }
}
