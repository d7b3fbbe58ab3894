//! # tlvrpc-client
//!
//! Client library for tlvrpc.
//!
//! This crate provides:
//! - An asynchronous client with one background I/O thread per instance
//! - A bounded submission queue that rejects instead of blocking
//! - Keep-alive reuse of one shared socket
//! - Completion handles usable from async code or plain threads
//! - A blocking one-shot client for tests and tools

pub mod blocking;
pub mod client;
pub mod config;
pub mod error;
pub mod handle;
mod io;
pub mod state;

pub use blocking::BlockingClient;
pub use client::Client;
pub use config::{ClientConfig, DEFAULT_EVENTS_CAPACITY, DEFAULT_QUEUE_CAPACITY};
pub use error::ClientError;
pub use handle::{ResponseHandle, RpcResponse};
pub use state::ClientState;
