//! Request envelopes and completion handles.

use crate::error::ClientError;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

pub(crate) type Completion = oneshot::Sender<Result<RpcResponse, ClientError>>;

/// A completed RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    /// Message type of the response frame (127 for the server's error frame).
    pub msg_type: u8,
    pub keep_alive: bool,
    pub body: Bytes,
    /// Time from submission to the last body byte.
    pub latency: Duration,
}

impl RpcResponse {
    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

/// A request on its way from a caller to the I/O thread.
///
/// Completed exactly once: with a response, with an error, or implicitly
/// with [`ClientError::Cancelled`] when dropped unsent.
pub(crate) struct RequestEnvelope {
    pub(crate) id: u64,
    pub(crate) request: Bytes,
    pub(crate) keep_alive: bool,
    pub(crate) started: Instant,
    completion: Completion,
}

impl RequestEnvelope {
    pub(crate) fn new(id: u64, request: Bytes, keep_alive: bool) -> (Self, ResponseHandle) {
        let (tx, rx) = oneshot::channel();
        let envelope = Self {
            id,
            request,
            keep_alive,
            started: Instant::now(),
            completion: tx,
        };
        (envelope, ResponseHandle { id, rx })
    }

    pub(crate) fn complete(self, result: Result<RpcResponse, ClientError>) {
        if self.completion.send(result).is_err() {
            tracing::trace!("Request {} completed after its handle was dropped", self.id);
        }
    }
}

/// Completion handle returned by [`Client::submit`](crate::Client::submit).
///
/// Await it from async code, or call [`wait`](Self::wait) from a plain
/// thread. The client enforces no timeout; wrap the handle in one.
#[derive(Debug)]
pub struct ResponseHandle {
    id: u64,
    rx: oneshot::Receiver<Result<RpcResponse, ClientError>>,
}

impl ResponseHandle {
    /// Sequence id assigned at submission.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks the current thread until the request completes.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn wait(self) -> Result<RpcResponse, ClientError> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(ClientError::Cancelled))
    }
}

impl Future for ResponseHandle {
    type Output = Result<RpcResponse, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(ClientError::Cancelled)))
    }
}
