//! Client configuration.

use crate::error::ClientError;
use std::net::SocketAddr;
use tlvrpc_protocol::{TlvConfig, DEFAULT_PORT};

/// Default capacity of the submission queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default number of readiness events drained per poll.
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Requests that may wait for the I/O thread before `submit` rejects.
    pub queue_capacity: usize,
    /// Readiness events drained per poll.
    pub events_capacity: usize,
    /// Set `TCP_NODELAY` on every socket.
    pub nodelay: bool,
    /// Header size and response body limit.
    pub tlv: TlvConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))
    }
}

impl ClientConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            nodelay: true,
            tlv: TlvConfig::default(),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_tlv(mut self, tlv: TlvConfig) -> Self {
        self.tlv = tlv;
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.queue_capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.events_capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "events_capacity must be greater than zero".to_string(),
            ));
        }
        self.tlv.validate()?;
        Ok(())
    }
}
