//! Sharded multi-reactor server.
//!
//! One acceptor thread owns the listener. Every accepted socket is pushed
//! onto the handoff queue of the next worker in round-robin order and that
//! worker's poll is woken. A worker registers the socket with its own poll
//! and serves it until it closes; sockets never move between workers.

use crate::error::ServerError;
use crate::reactor::{accept_all, bind_listener, Reactor, LISTENER, WAKER};
use crate::server::{ServerConfig, ServerHandle};
use crate::shutdown::ShutdownHandle;
use crate::stats::ServerStats;
use crossbeam_queue::SegQueue;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

type Handoff = SegQueue<(TcpStream, SocketAddr)>;

/// Acceptor-side view of one worker.
struct WorkerLane {
    id: usize,
    queue: Arc<Handoff>,
    waker: Arc<Waker>,
}

impl WorkerLane {
    fn hand_off(&self, stream: TcpStream, peer: SocketAddr) {
        self.queue.push((stream, peer));
        if let Err(e) = self.waker.wake() {
            tracing::warn!("[{}] Failed to wake worker-{}: {}", peer, self.id, e);
        }
    }
}

/// One shard: a reactor plus the queue it drains on wake-up.
struct WorkerReactor {
    reactor: Reactor,
    queue: Arc<Handoff>,
    events_capacity: usize,
}

impl WorkerReactor {
    fn run(mut self, shutdown: ShutdownHandle) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(self.events_capacity);
        tracing::debug!("{} started", self.reactor.name());

        loop {
            if shutdown.is_shutdown() {
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
                    WAKER => self.drain_handoff(),
                    token => self.reactor.connection_event(token, event),
                }
            }
        }

        // sockets handed off but never registered are dropped with the queue
        tracing::debug!(
            "{} stopped with {} open connection(s), {} pending handoff(s)",
            self.reactor.name(),
            self.reactor.connection_count(),
            self.queue.len()
        );
        Ok(())
    }

    fn drain_handoff(&mut self) {
        while let Some((stream, peer)) = self.queue.pop() {
            if let Err(e) = self.reactor.register(stream, peer) {
                tracing::warn!("[{}] Failed to register connection: {}", peer, e);
            }
        }
    }
}

struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    lanes: Vec<WorkerLane>,
    next: usize,
    stats: Arc<ServerStats>,
    events_capacity: usize,
}

impl Acceptor {
    fn run(mut self, shutdown: ShutdownHandle) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(self.events_capacity);

        loop {
            if shutdown.is_shutdown() {
                break;
            }
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                if event.token() == LISTENER {
                    self.accept_ready();
                }
            }
        }

        tracing::debug!("acceptor stopped after {} connection(s)", self.next);
        Ok(())
    }

    fn accept_ready(&mut self) {
        let lanes = &self.lanes;
        let stats = &self.stats;
        let next = &mut self.next;
        let result = accept_all(&self.listener, |stream, peer| {
            let id = *next % lanes.len();
            *next = next.wrapping_add(1);
            stats.worker_assigned(id);
            tracing::trace!("[{}] Assigned to worker-{}", peer, id);
            lanes[id].hand_off(stream, peer);
        });
        if let Err(e) = result {
            tracing::error!("Accept error: {}", e);
        }
    }
}

/// Server with one acceptor thread and a fixed pool of worker reactors.
#[derive(Debug)]
pub struct MultiReactorServer {
    config: ServerConfig,
}

impl MultiReactorServer {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Starts the workers, binds the listener, calls `on_start` once with the
    /// bound address and finally starts the acceptor.
    pub fn start(self, on_start: impl FnOnce(SocketAddr)) -> Result<ServerHandle, ServerError> {
        let config = self.config;
        let stats = Arc::new(ServerStats::with_workers(config.workers));

        let mut workers = Vec::with_capacity(config.workers);
        let mut lanes = Vec::with_capacity(config.workers);
        let mut wakers = Vec::with_capacity(config.workers + 1);
        for id in 0..config.workers {
            let reactor = Reactor::new(
                format!("worker-{}", id),
                config.handlers.clone(),
                config.tlv,
                config.max_connections,
                stats.clone(),
            )?;
            let waker = Arc::new(Waker::new(reactor.registry(), WAKER)?);
            let queue = Arc::new(Handoff::new());
            lanes.push(WorkerLane {
                id,
                queue: queue.clone(),
                waker: waker.clone(),
            });
            wakers.push(waker);
            workers.push(WorkerReactor {
                reactor,
                queue,
                events_capacity: config.events_capacity,
            });
        }

        let poll = Poll::new()?;
        wakers.push(Arc::new(Waker::new(poll.registry(), WAKER)?));
        let mut listener = bind_listener(config.bind_addr, config.backlog)?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let shutdown = ShutdownHandle::new(wakers);
        // Dropping the handle on an early return stops what already started.
        let mut handle = ServerHandle::new(local_addr, stats.clone(), shutdown.clone());

        for (id, worker) in workers.into_iter().enumerate() {
            let shutdown = shutdown.clone();
            let thread = thread::Builder::new()
                .name(format!("tlvrpc-worker-{}", id))
                .spawn(move || worker.run(shutdown))?;
            handle.threads.push(thread);
        }

        tracing::info!(
            "Server listening on {} ({} worker reactors)",
            local_addr,
            config.workers
        );
        on_start(local_addr);

        let acceptor = Acceptor {
            poll,
            listener,
            lanes,
            next: 0,
            stats,
            events_capacity: config.events_capacity,
        };
        let thread = thread::Builder::new()
            .name("tlvrpc-acceptor".to_string())
            .spawn(move || acceptor.run(shutdown))?;
        handle.threads.push(thread);

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerTable;

    #[test]
    fn test_start_and_stop() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), HandlerTable::new())
            .with_workers(3);
        let mut started = 0;
        let handle = MultiReactorServer::new(config)
            .unwrap()
            .start(|_| started += 1)
            .unwrap();

        assert_eq!(started, 1);
        assert_eq!(handle.stats().worker_assignments(), vec![0, 0, 0]);
        handle.stop().unwrap();
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), HandlerTable::new())
            .with_workers(0);
        assert!(matches!(
            MultiReactorServer::new(config),
            Err(ServerError::InvalidConfig(_))
        ));
    }
}
