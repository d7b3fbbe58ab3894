//! Reactor core shared by the single-threaded server and every worker shard.
//!
//! A [`Reactor`] owns one `mio::Poll` and the [`Connection`]s registered with
//! it. Connections live in a slab and the slab key doubles as the poll token,
//! so a readiness event finds its context with one index lookup.
//!
//! Polling is edge-triggered: a readiness event is only reported again after
//! the socket returned `WouldBlock`, so every pass drives a connection until
//! it blocks or finishes.

use crate::connection::Connection;
use crate::error::ServerError;
use crate::handler::HandlerTable;
use crate::stats::ServerStats;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tlvrpc_protocol::{ConnState, FrameHeader, ReadProgress, TlvConfig, WriteProgress};

/// Token of the listening socket.
pub(crate) const LISTENER: Token = Token(usize::MAX - 1);
/// Token of the shutdown / handoff waker.
pub(crate) const WAKER: Token = Token(usize::MAX);

/// What to do with a connection after driving it.
enum Next {
    Continue,
    Close,
}

pub(crate) struct Reactor {
    name: String,
    poll: Poll,
    connections: Slab<Connection>,
    handlers: Arc<HandlerTable>,
    tlv: TlvConfig,
    max_connections: usize,
    stats: Arc<ServerStats>,
}

impl Reactor {
    pub(crate) fn new(
        name: impl Into<String>,
        handlers: Arc<HandlerTable>,
        tlv: TlvConfig,
        max_connections: usize,
        stats: Arc<ServerStats>,
    ) -> io::Result<Self> {
        Ok(Self {
            name: name.into(),
            poll: Poll::new()?,
            connections: Slab::new(),
            handlers,
            tlv,
            max_connections,
            stats,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Blocks until at least one registration is ready or a waker fires.
    pub(crate) fn poll(&mut self, events: &mut Events) -> io::Result<()> {
        self.poll.poll(events, None)
    }

    /// Takes ownership of an accepted socket and registers it for reading.
    pub(crate) fn register(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<Token> {
        let entry = self.connections.vacant_entry();
        let token = Token(entry.key());
        let mut conn = Connection::new(stream, peer, self.tlv);
        self.poll
            .registry()
            .register(&mut conn.stream, token, Interest::READABLE)?;
        entry.insert(conn);

        let active = self.stats.connection_opened();
        if active as usize > self.max_connections {
            tracing::warn!(
                "[{}] {} active connections exceeds max_connections {}",
                peer,
                active,
                self.max_connections
            );
        }
        tracing::debug!("[{}] Connection registered on {}", peer, self.name);
        Ok(token)
    }

    /// Drives the connection behind `token` after a readiness event.
    pub(crate) fn connection_event(&mut self, token: Token, event: &Event) {
        let result = match self.connections.get_mut(token.0) {
            Some(conn) => Self::drive(
                conn,
                token,
                event,
                self.poll.registry(),
                &self.handlers,
                &self.tlv,
                &self.stats,
            ),
            // Closed earlier in the same batch of events.
            None => return,
        };

        match result {
            Ok(Next::Continue) => {}
            Ok(Next::Close) => self.close(token),
            Err(ServerError::HandlerPanicked(msg)) => {
                if let Some(conn) = self.connections.get(token.0) {
                    tracing::error!("[{}] Handler panicked, closing connection: {}", conn.peer, msg);
                }
                self.close(token);
            }
            Err(e) => {
                self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                if let Some(conn) = self.connections.get_mut(token.0) {
                    tracing::debug!("[{}] Connection error in {}: {}", conn.peer, conn.state, e);
                    conn.state = ConnState::Error;
                }
                self.close(token);
            }
        }
    }

    fn drive(
        conn: &mut Connection,
        token: Token,
        event: &Event,
        registry: &Registry,
        handlers: &HandlerTable,
        tlv: &TlvConfig,
        stats: &ServerStats,
    ) -> Result<Next, ServerError> {
        if event.is_error() {
            let err = conn
                .stream
                .take_error()?
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error"));
            return Err(err.into());
        }

        loop {
            match conn.state {
                ConnState::ReadingHeader | ConnState::ReadingBody => {
                    let header = match conn.reader.read_from(&mut conn.stream) {
                        Ok(ReadProgress::Pending) => {
                            conn.state = conn.reader.state();
                            return Ok(Next::Continue);
                        }
                        Ok(ReadProgress::Complete(header)) => header,
                        Err(e) if e.is_eof() && conn.reader.is_idle() => {
                            tracing::trace!("[{}] Peer closed idle connection", conn.peer);
                            conn.state = ConnState::Done;
                            return Ok(Next::Close);
                        }
                        Err(e) => return Err(e.into()),
                    };
                    Self::dispatch(conn, header, handlers, tlv, stats)?;
                }
                ConnState::WritingResponse => match conn.response.write_to(&mut conn.stream)? {
                    WriteProgress::Pending => {
                        Self::set_interest(conn, token, registry, Interest::WRITABLE)?;
                        return Ok(Next::Continue);
                    }
                    WriteProgress::Complete => {
                        stats.responses_total.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(
                            "[{}] Response of {} bytes written in {:?}",
                            conn.peer,
                            conn.response.len(),
                            conn.started.elapsed()
                        );
                        if !conn.keep_alive {
                            conn.state = ConnState::Done;
                            return Ok(Next::Close);
                        }
                        conn.reset();
                        Self::set_interest(conn, token, registry, Interest::READABLE)?;
                        // Bytes of the next request may already be buffered.
                    }
                },
                // client-only states never occur here
                _ => return Ok(Next::Close),
            }
        }
    }

    /// Runs the handler for a complete request and frames its response.
    fn dispatch(
        conn: &mut Connection,
        header: FrameHeader,
        handlers: &HandlerTable,
        tlv: &TlvConfig,
        stats: &ServerStats,
    ) -> Result<(), ServerError> {
        stats.requests_total.fetch_add(1, Ordering::Relaxed);
        conn.requests += 1;
        conn.keep_alive = header.keep_alive;

        let dispatched = handlers
            .dispatch(header.msg_type, conn.reader.body())
            .map_err(|panic| {
                stats.handler_panics_total.fetch_add(1, Ordering::Relaxed);
                ServerError::HandlerPanicked(panic.to_string())
            })?;
        if dispatched.unknown_type {
            stats.unknown_types_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "[{}] Unknown message type {}, answering with error frame",
                conn.peer,
                header.msg_type
            );
        }

        FrameHeader::encode_frame_into(
            dispatched.msg_type,
            header.keep_alive,
            &dispatched.body,
            tlv,
            conn.response.vec_mut(),
        )?;
        conn.state = ConnState::WritingResponse;
        Ok(())
    }

    fn set_interest(
        conn: &mut Connection,
        token: Token,
        registry: &Registry,
        interest: Interest,
    ) -> io::Result<()> {
        if conn.interest != interest {
            registry.reregister(&mut conn.stream, token, interest)?;
            conn.interest = interest;
        }
        Ok(())
    }

    /// Deregisters and drops the connection behind `token`.
    pub(crate) fn close(&mut self, token: Token) {
        if !self.connections.contains(token.0) {
            return;
        }
        let mut conn = self.connections.remove(token.0);
        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            tracing::trace!("[{}] Deregister failed: {}", conn.peer, e);
        }
        self.stats.connection_closed();
        tracing::debug!(
            "[{}] Connection closed after {} request(s)",
            conn.peer,
            conn.requests
        );
    }

    /// Closes every connection this reactor owns.
    pub(crate) fn close_all(&mut self) {
        let tokens: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
        for key in tokens {
            self.close(Token(key));
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if !self.connections.is_empty() {
            tracing::debug!(
                "{} releasing {} open connection(s)",
                self.name,
                self.connections.len()
            );
            self.close_all();
        }
    }
}

/// Binds a non-blocking listener with `SO_REUSEADDR` and the given backlog.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Accepts until the listener would block.
pub(crate) fn accept_all(
    listener: &TcpListener,
    mut on_accept: impl FnMut(TcpStream, SocketAddr),
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", peer, e);
                }
                on_accept(stream, peer);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
