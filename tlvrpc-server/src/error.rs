//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tlvrpc_protocol::ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),

    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("server shutting down")]
    ShuttingDown,

    #[error("reactor thread panicked: {0}")]
    ThreadPanicked(String),
}

impl ServerError {
    /// Returns whether the error only affects a single connection.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            ServerError::Io(_) | ServerError::Protocol(_) | ServerError::HandlerPanicked(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlvrpc_protocol::ProtocolError;

    #[test]
    fn test_connection_scoped() {
        let err = ServerError::from(ProtocolError::WriteZero);
        assert!(err.is_connection_scoped());

        let err = ServerError::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(err.is_connection_scoped());

        assert!(ServerError::HandlerPanicked("boom".into()).is_connection_scoped());
        assert!(!ServerError::ShuttingDown.is_connection_scoped());
        assert!(!ServerError::InvalidConfig("workers".into()).is_connection_scoped());
    }

    #[test]
    fn test_error_display() {
        let err = ServerError::InvalidConfig("workers must be > 0".into());
        assert!(err.to_string().contains("workers must be > 0"));

        let err = ServerError::ThreadPanicked("reactor-1".into());
        assert!(err.to_string().contains("reactor-1"));
    }
}
