//! Per-connection state for the socket processor.
//!
//! A [`Connection`] bundles the non-blocking stream with the framer that
//! assembles its inbound bytes and the writer that drains its outbound
//! queue:
//!
//! ```text
//! socket ──read──→ scratch ──on_readable──→ MessageFramer ──→ completed
//! socket ←─write── slab slot ←── MessageWriter ←── outbound queue
//! ```
//!
//! The read path never pulls more bytes off the socket than the framer
//! can store. When the read pool runs dry the connection is parked and
//! the unread bytes stay in the kernel buffer.

use super::writer::MessageWriter;
use super::ConnectionError;
use crate::buffer::{Message, PoolError, SlabPool, SocketId};
use crate::framing::MessageFramer;
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::SocketAddr;

/// Why a read pass over one connection stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Socket returned `WouldBlock`; wait for the next readiness event
    Drained,
    /// Framer has no room; retry next cycle without a new event
    Parked,
    /// Peer closed its side
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: usize,
    pub state: ReadState,
}

/// Socket context owned by the processing thread
pub struct Connection {
    pub(crate) id: SocketId,
    pub(crate) stream: TcpStream,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) framer: Box<dyn MessageFramer>,
    pub(crate) writer: MessageWriter,
    /// Complete units not yet handed to the application
    pub(crate) undelivered: VecDeque<Message>,
    pub(crate) end_of_stream: bool,
    /// Registered for writability
    pub(crate) write_interest: bool,
}

impl Connection {
    pub fn new(id: SocketId, stream: TcpStream, framer: Box<dyn MessageFramer>) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            id,
            stream,
            peer,
            framer,
            writer: MessageWriter::new(),
            undelivered: VecDeque::new(),
            end_of_stream: false,
            write_interest: false,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Read everything currently available into the framer
    pub fn read(
        &mut self,
        pool: &mut SlabPool,
        scratch: &mut [u8],
    ) -> Result<ReadOutcome, ConnectionError> {
        let outcome = read_into_framer(&mut self.stream, self.framer.as_mut(), pool, scratch)?;
        if outcome.state == ReadState::EndOfStream {
            self.end_of_stream = true;
        }
        Ok(outcome)
    }

    /// Queue the framer's completed units behind any still undelivered
    pub(crate) fn collect_completed(&mut self) {
        self.undelivered.extend(self.framer.drain_completed());
    }

    /// Return every inbound slot the connection holds
    pub(crate) fn reclaim_inbound(&mut self, pool: &mut SlabPool) -> Result<(), PoolError> {
        let mut result = self.framer.reclaim(pool);
        for message in self.undelivered.drain(..) {
            if let Err(e) = pool.release(message) {
                result = Err(e);
            }
        }
        result
    }
}

/// Move bytes from a non-blocking source into a framer
///
/// Each read is capped by the framer's budget so no byte is taken off
/// the source without a slot to hold it.
pub(crate) fn read_into_framer<R: Read + ?Sized>(
    source: &mut R,
    framer: &mut dyn MessageFramer,
    pool: &mut SlabPool,
    scratch: &mut [u8],
) -> Result<ReadOutcome, ConnectionError> {
    let mut total = 0;

    loop {
        let budget = framer.read_budget(pool)?;
        if budget == 0 {
            return Ok(ReadOutcome {
                bytes: total,
                state: ReadState::Parked,
            });
        }

        let want = budget.min(scratch.len());
        match source.read(&mut scratch[..want]) {
            Ok(0) => {
                return Ok(ReadOutcome {
                    bytes: total,
                    state: ReadState::EndOfStream,
                })
            }
            Ok(n) => {
                total += n;
                framer.on_readable(pool, &scratch[..n])?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(ReadOutcome {
                    bytes: total,
                    state: ReadState::Drained,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ConnectionError::Io(e)),
        }
    }
}
