//! The client's I/O thread.
//!
//! Callers push [`RequestEnvelope`]s onto a bounded queue and wake the
//! thread. Each loop iteration drains the queue, then waits on the poll and
//! drives every ready channel through
//! `CONNECTING -> WRITING -> READING_HEADER -> READING_BODY -> DONE`.
//!
//! A channel carries one request at a time. Keep-alive channels stay open
//! after their response, registered for readability, and one of them is the
//! shared slot the next keep-alive request reuses.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::handle::{RequestEnvelope, RpcResponse};
use crate::state::ClientState;
use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tlvrpc_protocol::{ConnState, FrameHeader, FrameReader, ReadProgress, WriteBuf, WriteProgress};

pub(crate) const WAKER: Token = Token(usize::MAX);

/// State shared between callers and the I/O thread.
pub(crate) struct Shared {
    queue: ArrayQueue<RequestEnvelope>,
    waker: Waker,
    stopped: AtomicBool,
}

impl Shared {
    pub(crate) fn new(capacity: usize, waker: Waker) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            waker,
            stopped: AtomicBool::new(false),
        }
    }

    /// Queues an envelope without blocking.
    pub(crate) fn enqueue(&self, envelope: RequestEnvelope) -> Result<(), ClientError> {
        if self.is_stopped() {
            return Err(ClientError::Stopped);
        }
        // the rejected envelope is dropped here, never completed
        self.queue.push(envelope).map_err(|_| ClientError::QueueFull)?;
        if let Err(e) = self.waker.wake() {
            tracing::warn!("Failed to wake client I/O thread: {}", e);
        }
        Ok(())
    }

    pub(crate) fn stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        if first {
            if let Err(e) = self.waker.wake() {
                tracing::warn!("Failed to wake client I/O thread: {}", e);
            }
        }
        first
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// Client-side connection context.
struct Channel {
    stream: TcpStream,
    state: ConnState,
    /// Request in flight; `None` while idle.
    envelope: Option<RequestEnvelope>,
    request: WriteBuf,
    reader: FrameReader,
    interest: Interest,
    opened: Instant,
}

impl Channel {
    /// Loads the next request onto an idle keep-alive channel.
    fn begin(&mut self, envelope: RequestEnvelope) {
        self.request.load(&envelope.request);
        self.reader.reset();
        self.envelope = Some(envelope);
        self.state = ConnState::Writing;
    }

    fn set_interest(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        if self.interest != interest {
            registry.reregister(&mut self.stream, token, interest)?;
            self.interest = interest;
        }
        Ok(())
    }
}

enum Step {
    Continue,
    Completed(FrameHeader),
    /// Idle channel closed by the peer or sent unsolicited bytes.
    Close,
}

pub(crate) struct IoLoop {
    poll: Poll,
    shared: Arc<Shared>,
    config: ClientConfig,
    channels: Slab<Channel>,
    /// Channel the next keep-alive request may reuse.
    shared_slot: Option<usize>,
    state: ClientState,
}

impl IoLoop {
    pub(crate) fn new(
        poll: Poll,
        shared: Arc<Shared>,
        config: ClientConfig,
        client_id: String,
    ) -> Self {
        Self {
            poll,
            shared,
            config,
            channels: Slab::new(),
            shared_slot: None,
            state: ClientState::new(client_id),
        }
    }

    /// Runs until stopped and returns the final counters.
    pub(crate) fn run(mut self) -> ClientState {
        let mut events = Events::with_capacity(self.config.events_capacity);
        tracing::debug!("[{}] Client I/O thread started", self.state.client_id);

        loop {
            if self.shared.is_stopped() {
                break;
            }
            self.register_requests();

            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("[{}] Poll failed: {}", self.state.client_id, e);
                break;
            }

            for event in events.iter() {
                if event.token() != WAKER {
                    self.channel_event(event.token(), event);
                }
            }
        }

        self.shutdown();
        self.state
    }

    fn register_requests(&mut self) {
        while let Some(envelope) = self.shared.queue.pop() {
            self.state.requests_registered += 1;
            self.start_request(envelope);
        }
    }

    fn start_request(&mut self, envelope: RequestEnvelope) {
        if envelope.keep_alive {
            if let Some(key) = self.reusable_slot() {
                let registry = self.poll.registry();
                let channel = &mut self.channels[key];
                tracing::trace!("[{}] Reusing channel for request {}", self.state.client_id, envelope.id);
                channel.begin(envelope);
                match channel.set_interest(registry, Token(key), Interest::WRITABLE) {
                    Ok(()) => self.state.channels_reused += 1,
                    Err(e) => self.fail(key, e.into()),
                }
                return;
            }
        }

        let mut stream = match TcpStream::connect(self.config.addr) {
            Ok(stream) => stream,
            Err(e) => {
                self.state.connect_errors += 1;
                tracing::debug!("[{}] Connect to {} failed: {}", self.state.client_id, self.config.addr, e);
                envelope.complete(Err(ClientError::ConnectFailed(e.to_string())));
                return;
            }
        };
        self.state.channels_opened += 1;

        let entry = self.channels.vacant_entry();
        let key = entry.key();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, Token(key), Interest::WRITABLE)
        {
            self.state.channels_closed += 1;
            envelope.complete(Err(e.into()));
            return;
        }

        let keep_alive = envelope.keep_alive;
        let mut request = WriteBuf::new();
        request.load(&envelope.request);
        entry.insert(Channel {
            stream,
            state: ConnState::Connecting,
            envelope: Some(envelope),
            request,
            reader: FrameReader::new(self.config.tlv),
            interest: Interest::WRITABLE,
            opened: Instant::now(),
        });
        if keep_alive {
            self.promote(key);
        }
    }

    /// Makes `key` the shared slot, closing the previous slot if it is idle.
    fn promote(&mut self, key: usize) {
        let Some(previous) = self.shared_slot.replace(key) else {
            return;
        };
        let idle = self
            .channels
            .get(previous)
            .map_or(false, |c| c.envelope.is_none());
        if previous != key && idle {
            self.close(previous);
        }
    }

    /// The shared slot, if it is registered, connected and idle.
    ///
    /// A FIN that arrived together with the last response raises no further
    /// readiness event, so the socket is probed here before reuse.
    fn reusable_slot(&mut self) -> Option<usize> {
        let key = self.shared_slot?;
        let channel = self.channels.get_mut(key)?;
        if channel.state != ConnState::Done || channel.envelope.is_some() {
            return None;
        }
        if channel.stream.peer_addr().is_ok() && probe_idle(&mut channel.stream) {
            return Some(key);
        }
        tracing::debug!("[{}] Shared channel closed while idle", self.state.client_id);
        self.close(key);
        None
    }

    fn channel_event(&mut self, token: Token, event: &Event) {
        let key = token.0;
        let registry = self.poll.registry();
        let result = match self.channels.get_mut(key) {
            Some(channel) => {
                let state = &mut self.state;
                let nodelay = self.config.nodelay;
                panic::catch_unwind(AssertUnwindSafe(|| {
                    Self::drive(channel, token, event, registry, state, nodelay)
                }))
                .unwrap_or_else(|payload| Err(ClientError::DispatchPanic(panic_message(payload.as_ref()))))
            }
            // closed earlier in this batch
            None => return,
        };

        match result {
            Ok(Step::Continue) => {}
            Ok(Step::Completed(header)) => self.finish(key, header),
            Ok(Step::Close) => self.close(key),
            Err(e) => self.fail(key, e),
        }
    }

    fn drive(
        channel: &mut Channel,
        token: Token,
        event: &Event,
        registry: &Registry,
        state: &mut ClientState,
        nodelay: bool,
    ) -> Result<Step, ClientError> {
        if event.is_error() {
            let err = channel
                .stream
                .take_error()?
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error"));
            if channel.state == ConnState::Connecting {
                state.connect_errors += 1;
                return Err(ClientError::ConnectFailed(err.to_string()));
            }
            return Err(err.into());
        }

        loop {
            match channel.state {
                ConnState::Connecting => {
                    if let Some(err) = channel.stream.take_error()? {
                        state.connect_errors += 1;
                        return Err(ClientError::ConnectFailed(err.to_string()));
                    }
                    match channel.stream.peer_addr() {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                            return Ok(Step::Continue)
                        }
                        Err(e) => {
                            state.connect_errors += 1;
                            return Err(ClientError::ConnectFailed(e.to_string()));
                        }
                    }
                    if nodelay {
                        channel.stream.set_nodelay(true)?;
                    }
                    state.channels_connected += 1;
                    state.connect_duration += channel.opened.elapsed();
                    channel.state = ConnState::Writing;
                }
                ConnState::Writing => match channel.request.write_to(&mut channel.stream)? {
                    WriteProgress::Pending => return Ok(Step::Continue),
                    WriteProgress::Complete => {
                        channel.state = ConnState::ReadingHeader;
                        channel.set_interest(registry, token, Interest::READABLE)?;
                    }
                },
                ConnState::ReadingHeader | ConnState::ReadingBody => {
                    match channel.reader.read_from(&mut channel.stream) {
                        Ok(ReadProgress::Pending) => {
                            channel.state = channel.reader.state();
                            return Ok(Step::Continue);
                        }
                        Ok(ReadProgress::Complete(header)) => return Ok(Step::Completed(header)),
                        Err(e) if e.is_eof() => return Err(ClientError::ConnectionClosed),
                        Err(e) => return Err(e.into()),
                    }
                }
                ConnState::Done => {
                    return if probe_idle(&mut channel.stream) {
                        Ok(Step::Continue)
                    } else {
                        Ok(Step::Close)
                    };
                }
                _ => return Ok(Step::Close),
            }
        }
    }

    /// Completes the in-flight request of a channel whose body just arrived.
    fn finish(&mut self, key: usize, header: FrameHeader) {
        let channel = &mut self.channels[key];
        let Some(envelope) = channel.envelope.take() else {
            self.close(key);
            return;
        };

        let latency = envelope.started.elapsed();
        let keep_alive = envelope.keep_alive;
        let response = RpcResponse {
            msg_type: header.msg_type,
            keep_alive: header.keep_alive,
            body: Bytes::copy_from_slice(channel.reader.body()),
            latency,
        };
        self.state.requests_completed += 1;
        self.state.request_duration += latency;
        tracing::trace!(
            "[{}] Request {} completed in {:?}",
            self.state.client_id,
            envelope.id,
            latency
        );
        envelope.complete(Ok(response));

        if !keep_alive {
            channel.state = ConnState::Done;
            self.close(key);
            return;
        }

        // Still registered for readability: an EOF while idle shows up as an event.
        channel.state = ConnState::Done;
        channel.reader.reset();
        self.promote(key);
    }

    fn fail(&mut self, key: usize, err: ClientError) {
        if let Some(channel) = self.channels.get_mut(key) {
            channel.state = ConnState::Error;
            if let Some(envelope) = channel.envelope.take() {
                tracing::debug!(
                    "[{}] Request {} failed after {:?}: {}",
                    self.state.client_id,
                    envelope.id,
                    envelope.started.elapsed(),
                    err
                );
                envelope.complete(Err(err));
            }
        }
        self.close(key);
    }

    fn close(&mut self, key: usize) {
        if !self.channels.contains(key) {
            return;
        }
        let mut channel = self.channels.remove(key);
        if let Err(e) = self.poll.registry().deregister(&mut channel.stream) {
            tracing::trace!("[{}] Deregister failed: {}", self.state.client_id, e);
        }
        if self.shared_slot == Some(key) {
            self.shared_slot = None;
        }
        self.state.channels_closed += 1;
    }

    /// Closes every channel; unfinished requests resolve as cancelled.
    fn shutdown(&mut self) {
        let keys: Vec<usize> = self.channels.iter().map(|(key, _)| key).collect();
        let in_flight = self
            .channels
            .iter()
            .filter(|(_, c)| c.envelope.is_some())
            .count();
        for key in keys {
            self.close(key);
        }

        let mut dropped = 0;
        while self.shared.queue.pop().is_some() {
            dropped += 1;
        }
        tracing::debug!(
            "[{}] Client stopped, {} in-flight and {} queued request(s) dropped",
            self.state.client_id,
            in_flight,
            dropped
        );
    }
}

/// Returns whether an idle channel is still usable. Nothing is expected on
/// an idle channel: EOF, unsolicited bytes and errors all retire it.
fn probe_idle(stream: &mut TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.read(&mut probe) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => true,
        Ok(0) => false,
        Ok(_) => {
            tracing::warn!("Unsolicited bytes on idle channel");
            false
        }
        Err(_) => false,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
