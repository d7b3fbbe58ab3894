//! tlvrpc - length-prefixed RPC over non-blocking TCP reactors
//!
//! Runs an echo server on message types 0 and 1 until Ctrl-C.

use bytes::Bytes;
use tlvrpc_server::{Config, HandlerTable, ReactorMode};
use tracing_subscriber::EnvFilter;

fn echo(body: &[u8]) -> Bytes {
    Bytes::copy_from_slice(body)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if TLVRPC_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("TLVRPC_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            if std::env::var("TLVRPC_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting tlvrpc server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Header size: {} bytes, max body: {} bytes",
        config.tlv.header_size_bytes,
        config.tlv.max_body_size_bytes
    );
    match config.reactor.mode {
        ReactorMode::Single => tracing::info!("  Reactor: single"),
        ReactorMode::Multi => tracing::info!("  Reactor: {} workers", config.reactor.workers),
    }

    let handlers = HandlerTable::new()
        .with_handler(0, echo)
        .with_handler(1, echo);
    let server = tlvrpc_server::start(&config, handlers)?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping server...");

    let stats = server.stats();
    tokio::task::spawn_blocking(move || server.stop()).await??;
    let stats = stats.snapshot();

    tracing::info!(
        "Server stopped (connections={}, requests={}, errors={})",
        stats.connections_total,
        stats.requests_total,
        stats.errors_total
    );
    Ok(())
}
