//! Handing responses back to the socket processor
//!
//! Application code runs on the processing thread and sees each inbound
//! message together with a [`WriteProxy`]. Responses built through the
//! proxy live in the write pool and join the outbound queue; the
//! processor routes them to their connection by socket id.
//!
//! Threads other than the processing thread use an [`OutboundSender`],
//! which carries plain bytes across a channel. The processor copies them
//! into the write pool at the start of its next write pass.

use crate::buffer::{Message, PoolError, SlabPool, SocketId};
use crate::error::{Error, Result};
use crossbeam_channel::Sender;
use std::collections::VecDeque;

/// Bytes for one connection, sent from outside the processing thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutbound {
    pub to: SocketId,
    pub data: Vec<u8>,
}

/// Cloneable handle for queueing responses from any thread
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: Sender<RemoteOutbound>,
}

impl OutboundSender {
    pub(crate) fn new(tx: Sender<RemoteOutbound>) -> Self {
        Self { tx }
    }

    pub fn send(&self, to: SocketId, data: impl Into<Vec<u8>>) -> Result<()> {
        self.tx
            .send(RemoteOutbound {
                to,
                data: data.into(),
            })
            .map_err(|_| Error::Internal("socket processor has stopped".into()))
    }
}

/// Write access to the outbound side during message processing
pub struct WriteProxy<'a> {
    pool: &'a mut SlabPool,
    queue: &'a mut VecDeque<Message>,
    remote: &'a OutboundSender,
}

impl<'a> WriteProxy<'a> {
    pub fn new(
        pool: &'a mut SlabPool,
        queue: &'a mut VecDeque<Message>,
        remote: &'a OutboundSender,
    ) -> Self {
        Self {
            pool,
            queue,
            remote,
        }
    }

    /// Empty message from the write pool
    pub fn acquire(&mut self) -> std::result::Result<Message, PoolError> {
        self.pool.acquire()
    }

    pub fn append(
        &mut self,
        message: &mut Message,
        data: &[u8],
    ) -> std::result::Result<(), PoolError> {
        message.append(self.pool, data)
    }

    pub fn bytes(&self, message: &Message) -> &[u8] {
        self.pool.bytes(message)
    }

    /// Give back a message that will not be submitted
    pub fn release(&mut self, message: Message) -> std::result::Result<(), PoolError> {
        self.pool.release(message)
    }

    /// Queue a message for the connection named by its socket id
    pub fn submit(&mut self, message: Message) -> Result<()> {
        if message.socket_id().is_none() {
            self.pool.release(message)?;
            return Err(Error::Internal("outbound message has no socket id".into()));
        }
        self.queue.push_back(message);
        Ok(())
    }

    /// Copy `data` into a new message addressed to `to` and queue it
    pub fn reply(&mut self, to: SocketId, data: &[u8]) -> Result<()> {
        let mut message = self.pool.acquire()?;
        if let Err(e) = message.append(self.pool, data) {
            self.pool.release(message)?;
            return Err(e.into());
        }
        message.set_socket_id(to);
        self.queue.push_back(message);
        Ok(())
    }

    /// Handle for responding later from another thread
    pub fn remote(&self) -> OutboundSender {
        self.remote.clone()
    }
}

/// Application callback for complete inbound messages
///
/// The message and its bytes are only borrowed; the processor returns
/// the slot to the read pool once `process` returns. An error closes the
/// connection the message arrived on, except a write-pool
/// [`PoolError::Exhausted`]: then the messages queued during the call are
/// released and the same message is processed again once slots free up.
pub trait MessageProcessor: Send {
    fn process(
        &mut self,
        message: &Message,
        bytes: &[u8],
        writer: &mut WriteProxy<'_>,
    ) -> Result<()>;
}

impl<F> MessageProcessor for F
where
    F: FnMut(&Message, &[u8], &mut WriteProxy<'_>) -> Result<()> + Send,
{
    fn process(
        &mut self,
        message: &Message,
        bytes: &[u8],
        writer: &mut WriteProxy<'_>,
    ) -> Result<()> {
        self(message, bytes, writer)
    }
}

/// Pin a closure to the [`MessageProcessor`] signature
pub fn processor_fn<F>(f: F) -> F
where
    F: FnMut(&Message, &[u8], &mut WriteProxy<'_>) -> Result<()> + Send,
{
    f
}
