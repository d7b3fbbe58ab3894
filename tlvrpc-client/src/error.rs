//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tlvrpc_protocol::ProtocolError),

    #[error("submission queue full")]
    QueueFull,

    #[error("client stopped")]
    Stopped,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request cancelled before completion")]
    Cancelled,

    #[error("I/O thread panicked while dispatching: {0}")]
    DispatchPanic(String),

    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    ///
    /// A full queue means the request was never sent.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::QueueFull => true,
            ClientError::ConnectFailed(_) => true,
            ClientError::ConnectionClosed => true,
            _ => false,
        }
    }
}
