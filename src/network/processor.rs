//! Socket processing loop
//!
//! One thread owns every connection, both slab pools and the poller.
//! Each cycle runs three phases:
//!
//! ```text
//! ┌─ admit ──── drain Admission queue → register READABLE, assign id
//! ├─ read ───── poll → ready_read → read_budget/read/frame → process → release
//! └─ write ──── route outbound queue → toggle WRITABLE → poll → ready_write → write
//! ```
//!
//! Readiness is edge-triggered, so it is remembered in `ready_read` and
//! `ready_write` until the socket reports `WouldBlock`. A connection
//! parked for lack of read slots stays in `ready_read` and is retried on
//! every cycle.
//!
//! Failures on one connection close that connection only. A failure of
//! the poller itself aborts the cycle; [`SocketProcessor::run`] then
//! rebuilds the poller and re-registers every connection.

use super::accept::Admission;
use super::connection::{Connection, ReadState};
use super::outbound::{MessageProcessor, OutboundSender, RemoteOutbound, WriteProxy};
use super::ConnectionError;
use crate::buffer::{Message, SlabPool, SocketId};
use crate::config::{EngineConfig, LoopConfig, FIRST_SOCKET_ID};
use crate::error::{Error, Result};
use crate::framing::FramerFactory;
use crate::metrics;
use crossbeam_channel::{Receiver, TryRecvError};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Work done by one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub admitted: usize,
    pub closed: usize,
    pub bytes_read: usize,
    pub delivered: usize,
    pub bytes_written: usize,
    pub messages_written: usize,
    /// Connections left parked for lack of read slots
    pub parked: usize,
}

impl CycleReport {
    /// Nothing moved; parked connections alone do not count as work
    pub fn is_idle(&self) -> bool {
        self.admitted == 0
            && self.closed == 0
            && self.bytes_read == 0
            && self.delivered == 0
            && self.bytes_written == 0
            && self.messages_written == 0
    }
}

/// Sleep schedule between idle cycles
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    adaptive: bool,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &LoopConfig) -> Self {
        Self {
            base: config.idle_backoff(),
            max: config.max_idle_backoff(),
            adaptive: config.adaptive_backoff,
            current: config.idle_backoff(),
        }
    }

    /// Delay for this idle cycle
    pub fn next_idle(&mut self) -> Duration {
        let delay = self.current;
        if self.adaptive {
            self.current = (self.current * 2).max(Duration::from_millis(1)).min(self.max);
        }
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// mio poller plus its event buffer
struct Selector {
    poll: Poll,
    events: Events,
}

impl Selector {
    fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    fn register(&self, stream: &mut TcpStream, id: SocketId, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(stream, token(id), interest)
    }

    fn reregister(
        &self,
        stream: &mut TcpStream,
        id: SocketId,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(stream, token(id), interest)
    }

    fn deregister(&self, stream: &mut TcpStream) -> io::Result<()> {
        self.poll.registry().deregister(stream)
    }

    /// Non-blocking poll; merges readiness into the ready sets
    fn select_now(
        &mut self,
        ready_read: &mut HashSet<SocketId>,
        ready_write: &mut HashSet<SocketId>,
    ) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let mut count = 0;
        for event in self.events.iter() {
            let id = SocketId(event.token().0 as u64);
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                ready_read.insert(id);
            }
            if event.is_writable() || event.is_write_closed() || event.is_error() {
                ready_write.insert(id);
            }
            count += 1;
        }
        Ok(count)
    }
}

fn token(id: SocketId) -> Token {
    Token(id.0 as usize)
}

fn interest_for(write_interest: bool) -> Interest {
    if write_interest {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

/// Result of handing queued units to the application
enum Delivery {
    Done,
    /// Write pool ran dry; the head unit waits for a retry
    Blocked,
    Failed(Error),
}

fn close_reason(err: &ConnectionError) -> &'static str {
    match err {
        ConnectionError::Io(_) => "io",
        ConnectionError::Framing(e) if e.is_exhausted() => "pool",
        ConnectionError::Framing(_) => "framing",
        ConnectionError::Pool(_) => "pool",
        ConnectionError::Processor(_) => "processor",
    }
}

pub struct SocketProcessor {
    inbound: Receiver<Admission>,
    outbound: VecDeque<Message>,
    remote_rx: Receiver<RemoteOutbound>,
    remote_tx: OutboundSender,
    /// Remote sends waiting for a free write slot
    deferred: VecDeque<RemoteOutbound>,

    read_pool: SlabPool,
    write_pool: SlabPool,

    factory: Box<dyn FramerFactory>,
    processor: Box<dyn MessageProcessor>,

    connections: HashMap<SocketId, Connection>,
    selector: Selector,
    events_capacity: usize,
    ready_read: HashSet<SocketId>,
    ready_write: HashSet<SocketId>,
    became_pending: HashSet<SocketId>,
    became_idle: HashSet<SocketId>,
    pending_close: Vec<(SocketId, &'static str)>,
    work_ids: Vec<SocketId>,
    scratch: Box<[u8]>,

    next_id: u64,
    cycle: CycleReport,
    backoff: Backoff,
    shutdown: Arc<AtomicBool>,
}

impl SocketProcessor {
    pub fn new(
        inbound: Receiver<Admission>,
        factory: Box<dyn FramerFactory>,
        processor: Box<dyn MessageProcessor>,
        config: &EngineConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        config.validate()?;
        let (tx, remote_rx) = crossbeam_channel::unbounded();
        let events_capacity = config.event_loop.events_capacity;

        Ok(Self {
            inbound,
            outbound: VecDeque::new(),
            remote_rx,
            remote_tx: OutboundSender::new(tx),
            deferred: VecDeque::new(),
            read_pool: SlabPool::new("read", &config.read_pool),
            write_pool: SlabPool::new("write", &config.write_pool),
            factory,
            processor,
            connections: HashMap::new(),
            selector: Selector::new(events_capacity)?,
            events_capacity,
            ready_read: HashSet::new(),
            ready_write: HashSet::new(),
            became_pending: HashSet::new(),
            became_idle: HashSet::new(),
            pending_close: Vec::new(),
            work_ids: Vec::new(),
            scratch: vec![0u8; config.event_loop.read_buffer_size].into_boxed_slice(),
            next_id: FIRST_SOCKET_ID,
            cycle: CycleReport::default(),
            backoff: Backoff::new(&config.event_loop),
            shutdown,
        })
    }

    /// Handle for queueing responses from other threads
    pub fn outbound_sender(&self) -> OutboundSender {
        self.remote_tx.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn read_pool(&self) -> &SlabPool {
        &self.read_pool
    }

    pub fn write_pool(&self) -> &SlabPool {
        &self.write_pool
    }

    /// Run cycles until the shutdown flag is set, then close everything
    pub fn run(mut self) -> Result<()> {
        info!(first_id = self.next_id, "Socket processor started");

        while !self.shutdown.load(Ordering::Acquire) {
            match self.execute_cycle() {
                Ok(report) if report.is_idle() => thread::sleep(self.backoff.next_idle()),
                Ok(report) => {
                    trace!(?report, "Cycle complete");
                    self.backoff.reset();
                }
                Err(e) => {
                    error!(error = %e, "Processing cycle failed, rebuilding selector");
                    metrics::LOOP_RESTARTS.inc();
                    if let Err(e) = self.rebuild_selector() {
                        error!(error = %e, "Selector rebuild failed");
                    }
                    thread::sleep(self.backoff.next_idle());
                }
            }
        }

        self.close_all();
        info!("Socket processor stopped");
        Ok(())
    }

    /// One admit, read and write pass
    pub fn execute_cycle(&mut self) -> Result<CycleReport> {
        self.take_new_sockets();
        self.read_from_sockets()?;
        self.write_to_sockets()?;

        let report = std::mem::take(&mut self.cycle);
        if !report.is_idle() {
            metrics::record_pool(&self.read_pool);
            metrics::record_pool(&self.write_pool);
        }
        Ok(report)
    }

    fn take_new_sockets(&mut self) {
        loop {
            match self.inbound.try_recv() {
                Ok(Admission::Open(stream)) => self.admit(stream),
                Ok(Admission::Close(id)) => self.close(id, "requested"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream) {
        let id = SocketId(self.next_id);
        self.next_id += 1;

        if let Err(e) = self.selector.register(&mut stream, id, Interest::READABLE) {
            warn!(conn = %id, error = %e, "Failed to register connection");
            metrics::CONNECTIONS_CLOSED.with_label_values(&["register"]).inc();
            return;
        }

        let connection = Connection::new(id, stream, self.factory.create());
        debug!(conn = %id, peer = ?connection.peer(), "Connection admitted");
        self.connections.insert(id, connection);
        // Data may have arrived before registration
        self.ready_read.insert(id);
        self.cycle.admitted += 1;
        metrics::ACTIVE_CONNECTIONS.set(self.connections.len() as i64);
    }

    fn read_from_sockets(&mut self) -> Result<()> {
        self.selector
            .select_now(&mut self.ready_read, &mut self.ready_write)?;
        if self.ready_read.is_empty() {
            return Ok(());
        }

        let mut ids = std::mem::take(&mut self.work_ids);
        ids.extend(self.ready_read.iter().copied());
        ids.sort_unstable();
        for &id in &ids {
            self.read_from_socket(id);
        }
        ids.clear();
        self.work_ids = ids;

        self.flush_pending_close();
        Ok(())
    }

    fn read_from_socket(&mut self, id: SocketId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            self.ready_read.remove(&id);
            return;
        };

        // Units held back by an exhausted write pool go before new input
        if conn.undelivered.is_empty() {
            if conn.end_of_stream() {
                // Retry a split deferred for lack of a read slot
                self.ready_read.remove(&id);
                if let Err(e) = conn.framer.on_readable(&mut self.read_pool, &[]) {
                    let err = ConnectionError::from(e);
                    warn!(conn = %id, error = %err, "Framing failed, closing connection");
                    self.pending_close.push((id, close_reason(&err)));
                    return;
                }
            } else {
                let outcome = match conn.read(&mut self.read_pool, &mut self.scratch) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(conn = %id, error = %e, "Read failed, closing connection");
                        self.pending_close.push((id, close_reason(&e)));
                        return;
                    }
                };

                self.cycle.bytes_read += outcome.bytes;
                metrics::BYTES_READ.inc_by(outcome.bytes as u64);
                match outcome.state {
                    ReadState::Drained | ReadState::EndOfStream => {
                        self.ready_read.remove(&id);
                    }
                    ReadState::Parked => {
                        trace!(conn = %id, "Read pool exhausted, connection parked");
                        self.cycle.parked += 1;
                        metrics::BACKPRESSURE_STALLS.inc();
                    }
                }
            }
            conn.collect_completed();
        }

        match self.deliver_pending(id) {
            Delivery::Done => {}
            Delivery::Blocked => {
                trace!(conn = %id, "Write pool exhausted, delivery deferred");
                self.ready_read.insert(id);
                self.cycle.parked += 1;
                metrics::BACKPRESSURE_STALLS.inc();
                return;
            }
            Delivery::Failed(e) => {
                let err = ConnectionError::Processor(e.to_string());
                warn!(conn = %id, error = %err, "Closing connection");
                self.pending_close.push((id, close_reason(&err)));
                return;
            }
        }

        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        if conn.end_of_stream() {
            if conn.framer.is_stalled() {
                // A complete unit still waits for a read slot
                self.ready_read.insert(id);
                self.cycle.parked += 1;
            } else {
                debug!(conn = %id, "Peer closed connection");
                self.pending_close.push((id, "eof"));
            }
        }
    }

    /// Hand a connection's complete units to the application in order
    ///
    /// A unit whose processing runs out of write slots is put back, and
    /// whatever it queued so far is released, so it can be retried in
    /// full once writes free slots.
    fn deliver_pending(&mut self, id: SocketId) -> Delivery {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Delivery::Done;
        };

        while let Some(mut message) = conn.undelivered.pop_front() {
            message.set_socket_id(id);
            let queued = self.outbound.len();
            let result = {
                let mut proxy =
                    WriteProxy::new(&mut self.write_pool, &mut self.outbound, &self.remote_tx);
                let bytes = self.read_pool.bytes(&message);
                self.processor.process(&message, bytes, &mut proxy)
            };

            if matches!(&result, Err(Error::Pool(e)) if e.is_exhausted()) {
                for partial in self.outbound.drain(queued..) {
                    if let Err(e) = self.write_pool.release(partial) {
                        error!(conn = %id, error = %e, "Failed to release outbound message");
                    }
                }
                conn.undelivered.push_front(message);
                return Delivery::Blocked;
            }

            self.cycle.delivered += 1;
            metrics::MESSAGES_DELIVERED.inc();
            if let Err(e) = self.read_pool.release(message) {
                error!(conn = %id, error = %e, "Failed to release inbound message");
            }
            if let Err(e) = result {
                return Delivery::Failed(e);
            }
        }
        Delivery::Done
    }

    fn write_to_sockets(&mut self) -> Result<()> {
        self.take_new_outbound_messages();
        self.cancel_empty_sockets();
        self.register_non_empty_sockets();
        self.flush_pending_close();

        self.selector
            .select_now(&mut self.ready_read, &mut self.ready_write)?;
        if self.ready_write.is_empty() {
            return Ok(());
        }

        let mut ids = std::mem::take(&mut self.work_ids);
        ids.extend(self.ready_write.iter().copied());
        ids.sort_unstable();
        for &id in &ids {
            self.write_to_socket(id);
        }
        ids.clear();
        self.work_ids = ids;

        self.flush_pending_close();
        Ok(())
    }

    fn write_to_socket(&mut self, id: SocketId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            self.ready_write.remove(&id);
            return;
        };
        if conn.writer.is_empty() {
            return;
        }

        match conn.writer.write_to(&mut conn.stream, &mut self.write_pool) {
            Ok(outcome) => {
                self.cycle.bytes_written += outcome.bytes;
                self.cycle.messages_written += outcome.messages;
                metrics::BYTES_WRITTEN.inc_by(outcome.bytes as u64);
                metrics::MESSAGES_WRITTEN.inc_by(outcome.messages as u64);
                if outcome.blocked {
                    self.ready_write.remove(&id);
                }
                if conn.writer.is_empty() {
                    self.became_idle.insert(id);
                }
            }
            Err(e) => {
                warn!(conn = %id, error = %e, "Write failed, closing connection");
                self.pending_close.push((id, close_reason(&e)));
            }
        }
    }

    /// Route queued messages to their connections' writers
    fn take_new_outbound_messages(&mut self) {
        self.take_remote_outbound();

        while let Some(message) = self.outbound.pop_front() {
            let conn = message
                .socket_id()
                .and_then(|id| self.connections.get_mut(&id));
            match conn {
                Some(conn) => {
                    if conn.writer.is_empty() {
                        self.became_idle.remove(&conn.id);
                        self.became_pending.insert(conn.id);
                    }
                    conn.writer.enqueue(message);
                }
                None => {
                    debug!(conn = ?message.socket_id(), "Dropping message for closed connection");
                    if let Err(e) = self.write_pool.release(message) {
                        error!(error = %e, "Failed to release outbound message");
                    }
                }
            }
        }
    }

    /// Copy cross-thread sends into write-pool messages
    fn take_remote_outbound(&mut self) {
        loop {
            let item = match self.deferred.pop_front() {
                Some(item) => item,
                None => match self.remote_rx.try_recv() {
                    Ok(item) => item,
                    Err(_) => break,
                },
            };
            if !self.connections.contains_key(&item.to) {
                debug!(conn = %item.to, "Dropping remote send for closed connection");
                continue;
            }

            let mut message = match self.write_pool.acquire() {
                Ok(message) => message,
                Err(_) => {
                    self.deferred.push_front(item);
                    break;
                }
            };
            match message.append(&mut self.write_pool, &item.data) {
                Ok(()) => {
                    message.set_socket_id(item.to);
                    self.outbound.push_back(message);
                }
                Err(e) => {
                    if let Err(e) = self.write_pool.release(message) {
                        error!(error = %e, "Failed to release outbound message");
                    }
                    if e.is_exhausted() {
                        self.deferred.push_front(item);
                        break;
                    }
                    warn!(conn = %item.to, error = %e, "Remote send rejected, closing connection");
                    self.pending_close.push((item.to, "size_exceeded"));
                }
            }
        }
    }

    /// Drop write interest for connections whose writer drained
    fn cancel_empty_sockets(&mut self) {
        for id in self.became_idle.drain() {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            if !conn.writer.is_empty() || !conn.write_interest {
                continue;
            }
            match self
                .selector
                .reregister(&mut conn.stream, id, Interest::READABLE)
            {
                Ok(()) => {
                    conn.write_interest = false;
                    self.ready_write.remove(&id);
                }
                Err(e) => {
                    warn!(conn = %id, error = %e, "Failed to drop write interest");
                    self.pending_close.push((id, "register"));
                }
            }
        }
    }

    /// Add write interest for connections that just got data to send
    fn register_non_empty_sockets(&mut self) {
        for id in self.became_pending.drain() {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            if conn.write_interest {
                continue;
            }
            match self
                .selector
                .reregister(&mut conn.stream, id, interest_for(true))
            {
                Ok(()) => conn.write_interest = true,
                Err(e) => {
                    warn!(conn = %id, error = %e, "Failed to add write interest");
                    self.pending_close.push((id, "register"));
                }
            }
        }
    }

    fn flush_pending_close(&mut self) {
        let pending = std::mem::take(&mut self.pending_close);
        for (id, reason) in pending {
            self.close(id, reason);
        }
    }

    /// Deregister, release every slot the connection holds, drop the socket
    fn close(&mut self, id: SocketId, reason: &'static str) {
        self.ready_read.remove(&id);
        self.ready_write.remove(&id);
        self.became_idle.remove(&id);
        self.became_pending.remove(&id);

        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        if let Err(e) = self.selector.deregister(&mut conn.stream) {
            debug!(conn = %id, error = %e, "Deregister failed");
        }
        if let Err(e) = conn.reclaim_inbound(&mut self.read_pool) {
            error!(conn = %id, error = %e, "Failed to reclaim read slots");
        }
        if let Err(e) = conn.writer.reclaim(&mut self.write_pool) {
            error!(conn = %id, error = %e, "Failed to reclaim write slots");
        }

        self.cycle.closed += 1;
        metrics::CONNECTIONS_CLOSED.with_label_values(&[reason]).inc();
        metrics::ACTIVE_CONNECTIONS.set(self.connections.len() as i64);
        debug!(conn = %id, reason, "Connection closed");
    }

    fn close_all(&mut self) {
        let ids: Vec<SocketId> = self.connections.keys().copied().collect();
        for id in ids {
            self.close(id, "shutdown");
        }
        for message in self.outbound.drain(..) {
            if let Err(e) = self.write_pool.release(message) {
                error!(error = %e, "Failed to release outbound message");
            }
        }
    }

    /// Replace the poller and re-register every connection
    fn rebuild_selector(&mut self) -> Result<()> {
        let selector = Selector::new(self.events_capacity)?;
        let mut failed = Vec::new();

        for (&id, conn) in self.connections.iter_mut() {
            // Detach from the old poller first; mio rejects double registration
            self.selector.deregister(&mut conn.stream).ok();
            let interest = interest_for(conn.write_interest);
            if let Err(e) = selector.register(&mut conn.stream, id, interest) {
                warn!(conn = %id, error = %e, "Re-registration failed");
                failed.push(id);
            }
            // Readiness may have been lost with the old poller
            self.ready_read.insert(id);
            if conn.write_interest {
                self.ready_write.insert(id);
            }
        }

        self.selector = selector;
        for id in failed {
            self.close(id, "register");
        }
        info!(connections = self.connections.len(), "Selector rebuilt");
        Ok(())
    }
}
