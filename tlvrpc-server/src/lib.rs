//! # tlvrpc-server
//!
//! Reactor servers for tlvrpc.
//!
//! This crate provides:
//! - A handler table mapping message types to `&[u8] -> Bytes` handlers
//! - A single-threaded reactor server owning one poll and every connection
//! - A sharded multi-reactor server: one acceptor, N worker reactors
//! - Server statistics and cooperative shutdown
//! - YAML/environment configuration
//!
//! Handlers run synchronously on the reactor thread that owns the
//! connection. Timeouts are never enforced by the reactor.

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod multi;
mod reactor;
pub mod server;
pub mod shutdown;
pub mod stats;

pub use config::{Config, ConfigError, NetworkConfig, ReactorConfig, ReactorMode, TlvSettings};
pub use connection::Connection;
pub use error::ServerError;
pub use handler::{Dispatched, HandlerPanic, HandlerTable, MessageHandler};
pub use multi::MultiReactorServer;
pub use server::{Server, ServerConfig, ServerHandle};
pub use shutdown::ShutdownHandle;
pub use stats::{ServerStats, StatsSnapshot};

/// Starts the topology selected by `config.reactor.mode`.
pub fn start(config: &Config, handlers: HandlerTable) -> Result<ServerHandle, ServerError> {
    let server_config = ServerConfig::from_config(config, handlers);
    match config.reactor.mode {
        ReactorMode::Single => Server::new(server_config)?.spawn(),
        ReactorMode::Multi => MultiReactorServer::new(server_config)?.start(|_| {}),
    }
}
