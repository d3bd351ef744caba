//! Messages: views into slab pool slots

use super::pool::{PoolError, PoolId, SlabPool};
use super::tier::TierKind;
use std::any::Any;
use std::fmt;

/// Identifier of the connection a message came from or goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message held in one slot of a [`SlabPool`]
///
/// The message is a handle (tier + offset) into the pool's backing
/// regions; the bytes themselves are reached through the pool. Each
/// handle owns its slot exclusively. It is not `Clone`, and
/// [`SlabPool::release`] consumes it.
pub struct Message {
    pool: PoolId,
    tier: TierKind,
    offset: usize,
    len: usize,
    capacity: usize,
    socket_id: Option<SocketId>,
    metadata: Option<Box<dyn Any + Send>>,
}

impl Message {
    pub(crate) fn new(pool: PoolId, tier: TierKind, offset: usize, capacity: usize) -> Self {
        Self {
            pool,
            tier,
            offset,
            len: 0,
            capacity,
            socket_id: None,
            metadata: None,
        }
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn tier(&self) -> TierKind {
        self.tier
    }

    /// Start of the owned slot within the tier region
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes in use
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the owned slot
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn socket_id(&self) -> Option<SocketId> {
        self.socket_id
    }

    pub fn set_socket_id(&mut self, id: SocketId) {
        self.socket_id = Some(id);
    }

    /// Protocol metadata attached by the framer, if it is a `T`
    pub fn metadata<T: Any>(&self) -> Option<&T> {
        self.metadata.as_ref()?.downcast_ref::<T>()
    }

    pub fn set_metadata<T: Any + Send>(&mut self, metadata: T) {
        self.metadata = Some(Box::new(metadata));
    }

    pub fn take_metadata(&mut self) -> Option<Box<dyn Any + Send>> {
        self.metadata.take()
    }

    /// Append bytes, promoting to a larger tier when the slot is full
    ///
    /// Fails with [`PoolError::Exhausted`] when the next tier has no free
    /// slot (backpressure; nothing is written) and with
    /// [`PoolError::SizeExceeded`] when the result would not fit the
    /// largest tier.
    pub fn append(&mut self, pool: &mut SlabPool, data: &[u8]) -> Result<(), PoolError> {
        pool.append(self, data)
    }

    /// Copy `from[start..]` onto the end of this message
    ///
    /// Seeds the next protocol unit with bytes read past the end of the
    /// previous one.
    pub fn carry_forward(
        &mut self,
        pool: &mut SlabPool,
        from: &Message,
        start: usize,
    ) -> Result<(), PoolError> {
        pool.carry_forward(self, from, start)
    }

    /// Shorten the message; no-op if `len` is not shorter
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity);
        self.len = len;
    }

    pub(crate) fn relocate(&mut self, tier: TierKind, offset: usize, capacity: usize) {
        self.tier = tier;
        self.offset = offset;
        self.capacity = capacity;
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("tier", &self.tier)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("socket_id", &self.socket_id)
            .field("has_metadata", &self.metadata.is_some())
            .finish()
    }
}
