//! Outbound message queue for one connection.

use super::ConnectionError;
use crate::buffer::{Message, PoolError, SlabPool};
use std::collections::VecDeque;
use std::io::{self, Write};
use tracing::trace;

/// Progress of one write pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub bytes: usize,
    /// Messages fully written and released
    pub messages: usize,
    /// Destination returned `WouldBlock` with data still queued
    pub blocked: bool,
}

/// FIFO of messages waiting to be written to a socket
///
/// Bytes go straight from the slab slot to the socket. A message is
/// released only once its last byte has been written.
#[derive(Debug, Default)]
pub struct MessageWriter {
    queue: VecDeque<Message>,
    /// Bytes of the head message already written
    written: usize,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, message: Message) {
        self.queue.push_back(message);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Write queued messages until the destination would block
    pub fn write_to<W: Write + ?Sized>(
        &mut self,
        dst: &mut W,
        pool: &mut SlabPool,
    ) -> Result<WriteOutcome, ConnectionError> {
        let mut outcome = WriteOutcome::default();

        while let Some(head) = self.queue.front() {
            let pending = &pool.bytes(head)[self.written..];
            if pending.is_empty() {
                if let Some(done) = self.queue.pop_front() {
                    trace!(len = done.len(), "Message written");
                    pool.release(done)?;
                }
                self.written = 0;
                outcome.messages += 1;
                continue;
            }

            match dst.write(pending) {
                Ok(0) => {
                    return Err(ConnectionError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    )))
                }
                Ok(n) => {
                    self.written += n;
                    outcome.bytes += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    outcome.blocked = true;
                    return Ok(outcome);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::Io(e)),
            }
        }

        Ok(outcome)
    }

    /// Release every queued message
    pub fn reclaim(&mut self, pool: &mut SlabPool) -> Result<(), PoolError> {
        let mut result = Ok(());
        for message in self.queue.drain(..) {
            if let Err(e) = pool.release(message) {
                result = Err(e);
            }
        }
        self.written = 0;
        result
    }
}
