//! Single-threaded reactor server.

use crate::config::Config;
use crate::error::ServerError;
use crate::handler::HandlerTable;
use crate::reactor::{accept_all, bind_listener, Reactor, LISTENER, WAKER};
use crate::shutdown::ShutdownHandle;
use crate::stats::ServerStats;
use mio::net::TcpListener;
use mio::{Events, Interest, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tlvrpc_protocol::{TlvConfig, DEFAULT_PORT};

/// Runtime server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Header size and body limit.
    pub tlv: TlvConfig,
    /// Advisory; the reactor never times out a request.
    pub request_timeout: Duration,
    /// Advisory; the reactor never times out a response.
    pub response_timeout: Duration,
    /// Listen backlog.
    pub backlog: u32,
    /// Advisory connection limit; exceeding it only logs a warning.
    pub max_connections: usize,
    /// Worker reactors (multi-reactor only).
    pub workers: usize,
    /// Readiness events drained per poll.
    pub events_capacity: usize,
    /// Handlers by message type.
    pub handlers: Arc<HandlerTable>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("tlv", &self.tlv)
            .field("request_timeout", &self.request_timeout)
            .field("response_timeout", &self.response_timeout)
            .field("backlog", &self.backlog)
            .field("max_connections", &self.max_connections)
            .field("workers", &self.workers)
            .field("events_capacity", &self.events_capacity)
            .field("handlers", &self.handlers)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            tlv: TlvConfig::default(),
            request_timeout: Duration::from_millis(1000),
            response_timeout: Duration::from_millis(1000),
            backlog: 1024,
            max_connections: 1000,
            workers: 1,
            events_capacity: 1024,
            handlers: Arc::new(HandlerTable::new()),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr, handlers: HandlerTable) -> Self {
        Self {
            bind_addr,
            handlers: Arc::new(handlers),
            ..Default::default()
        }
    }

    /// Builds the runtime configuration from a loaded [`Config`].
    pub fn from_config(config: &Config, handlers: HandlerTable) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            tlv: config.tlv.tlv_config(),
            request_timeout: config.network.request_timeout(),
            response_timeout: config.network.response_timeout(),
            backlog: config.network.backlog,
            max_connections: config.network.max_connections,
            workers: config.reactor.workers,
            events_capacity: config.reactor.events_capacity,
            handlers: Arc::new(handlers),
        }
    }

    pub fn with_tlv(mut self, tlv: TlvConfig) -> Self {
        self.tlv = tlv;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }

    pub fn with_timeouts(mut self, request: Duration, response: Duration) -> Self {
        self.request_timeout = request;
        self.response_timeout = response;
        self
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        self.tlv
            .validate()
            .map_err(|e| ServerError::InvalidConfig(e.to_string()))?;
        if self.workers == 0 {
            return Err(ServerError::InvalidConfig(
                "workers must be greater than zero".to_string(),
            ));
        }
        if self.events_capacity == 0 {
            return Err(ServerError::InvalidConfig(
                "events_capacity must be greater than zero".to_string(),
            ));
        }
        if self.backlog == 0 {
            return Err(ServerError::InvalidConfig(
                "backlog must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A server that owns one poll, one listener and every connection.
pub struct Server {
    config: ServerConfig,
    reactor: Reactor,
    shutdown: ShutdownHandle,
    stats: Arc<ServerStats>,
}

impl Server {
    /// Creates the server's poll and waker. Nothing is bound yet.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let stats = Arc::new(ServerStats::new());
        let reactor = Reactor::new(
            "reactor",
            config.handlers.clone(),
            config.tlv,
            config.max_connections,
            stats.clone(),
        )?;
        let waker = Arc::new(Waker::new(reactor.registry(), WAKER)?);

        Ok(Self {
            config,
            reactor,
            shutdown: ShutdownHandle::new(vec![waker]),
            stats,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Handle that stops [`run`](Self::run) from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Binds, calls `on_start` once with the bound address, then serves on
    /// the calling thread until shutdown.
    pub fn run(mut self, on_start: impl FnOnce(SocketAddr)) -> Result<(), ServerError> {
        let (listener, local_addr) = self.listen()?;
        on_start(local_addr);
        self.serve(listener)
    }

    /// Binds on the calling thread, then serves on a reactor thread.
    ///
    /// The listener is registered before this returns, so the returned
    /// handle's address accepts connections immediately.
    pub fn spawn(mut self) -> Result<ServerHandle, ServerError> {
        let (listener, local_addr) = self.listen()?;
        let mut handle = ServerHandle::new(local_addr, self.stats.clone(), self.shutdown.clone());
        let thread = thread::Builder::new()
            .name("tlvrpc-reactor".to_string())
            .spawn(move || self.serve(listener))?;
        handle.threads.push(thread);
        Ok(handle)
    }

    fn listen(&mut self) -> Result<(TcpListener, SocketAddr), ServerError> {
        if self.shutdown.is_shutdown() {
            return Err(ServerError::ShuttingDown);
        }
        let mut listener = bind_listener(self.config.bind_addr, self.config.backlog)?;
        let local_addr = listener.local_addr()?;
        self.reactor
            .registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        tracing::info!("Server listening on {} (single reactor)", local_addr);
        Ok((listener, local_addr))
    }

    fn serve(mut self, listener: TcpListener) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(self.config.events_capacity);

        loop {
            if self.shutdown.is_shutdown() {
                break;
            }
            if let Err(e) = self.reactor.poll(&mut events) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => {
                        let reactor = &mut self.reactor;
                        let result = accept_all(&listener, |stream, peer| {
                            if let Err(e) = reactor.register(stream, peer) {
                                tracing::warn!("[{}] Failed to register connection: {}", peer, e);
                            }
                        });
                        if let Err(e) = result {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                    WAKER => {}
                    token => self.reactor.connection_event(token, event),
                }
            }
        }

        tracing::info!(
            "{} stopped with {} open connection(s)",
            self.reactor.name(),
            self.reactor.connection_count()
        );
        Ok(())
    }
}

/// A running server.
///
/// Dropping the handle requests shutdown and joins the reactor threads.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stats: Arc<ServerStats>,
    shutdown: ShutdownHandle,
    pub(crate) threads: Vec<JoinHandle<Result<(), ServerError>>>,
}

impl ServerHandle {
    pub(crate) fn new(
        local_addr: SocketAddr,
        stats: Arc<ServerStats>,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            local_addr,
            stats,
            shutdown,
            threads: Vec::new(),
        }
    }

    /// The bound address (resolved when binding to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Requests shutdown without waiting.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Waits for every reactor thread to exit.
    pub fn join(mut self) -> Result<(), ServerError> {
        self.join_threads()
    }

    /// Requests shutdown and waits for every reactor thread.
    pub fn stop(self) -> Result<(), ServerError> {
        self.shutdown();
        self.join()
    }

    fn join_threads(&mut self) -> Result<(), ServerError> {
        let mut result = Ok(());
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("reactor").to_string();
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("{} exited with error: {}", name, e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(_) => {
                    if result.is_ok() {
                        result = Err(ServerError::ThreadPanicked(name));
                    }
                }
            }
        }
        result
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.shutdown.shutdown();
            if let Err(e) = self.join_threads() {
                tracing::warn!("Server stopped with error: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::mpsc;

    fn local_config() -> ServerConfig {
        ServerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            HandlerTable::new().with_handler(1, |_: &[u8]| Bytes::from_static(b"ok")),
        )
    }

    #[test]
    fn test_config_validation() {
        assert!(local_config().validate().is_ok());
        assert!(local_config().with_workers(0).validate().is_err());
        assert!(local_config().with_events_capacity(0).validate().is_err());
        assert!(local_config().with_backlog(0).validate().is_err());

        let bad_tlv = TlvConfig {
            header_size_bytes: 3,
            max_body_size_bytes: 10,
        };
        let err = local_config().with_tlv(bad_tlv).validate().unwrap_err();
        assert!(matches!(err, ServerError::InvalidConfig(_)));
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.network.backlog = 64;
        config.reactor.workers = 3;
        config.tlv.max_body_size_bytes = 4096;

        let server_config = ServerConfig::from_config(&config, HandlerTable::new());
        assert_eq!(server_config.backlog, 64);
        assert_eq!(server_config.workers, 3);
        assert_eq!(server_config.tlv.max_body_size_bytes, 4096);
        assert_eq!(server_config.request_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_run_calls_on_start_once_and_stops() {
        let server = Server::new(local_config()).unwrap();
        let shutdown = server.shutdown_handle();
        let (tx, rx) = mpsc::channel();

        let thread = std::thread::spawn(move || server.run(move |addr| tx.send(addr).unwrap()));

        let addr = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(addr.port(), 0);
        std::net::TcpStream::connect(addr).unwrap();

        shutdown.shutdown();
        thread.join().unwrap().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_spawn_and_stop() {
        let handle = Server::new(local_config()).unwrap().spawn().unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        handle.stop().unwrap();
    }

    #[test]
    fn test_shutdown_before_start() {
        let server = Server::new(local_config()).unwrap();
        server.shutdown_handle().shutdown();
        assert!(matches!(server.spawn(), Err(ServerError::ShuttingDown)));
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let first = Server::new(local_config()).unwrap().spawn().unwrap();
        let config = ServerConfig {
            bind_addr: first.local_addr(),
            ..local_config()
        };
        let result = Server::new(config).unwrap().spawn();
        assert!(matches!(result, Err(ServerError::Io(_))));
        first.stop().unwrap();
    }
}
