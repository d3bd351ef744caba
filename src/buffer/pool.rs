//! Tiered slab pool implementation

use super::message::Message;
use super::tier::{PoolConfig, Tier, TierKind};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::{debug, info, trace};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Identity of the pool that issued a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u32);

/// Slab pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No free slot in the tier; retry once a slot is released
    #[error("{tier} tier exhausted")]
    Exhausted { tier: TierKind },

    /// Content would outgrow the largest tier
    #[error("message of {requested} bytes exceeds maximum slot size {max}")]
    SizeExceeded { requested: usize, max: usize },

    /// More offsets returned to a ring than it can hold
    #[error("free ring of {tier} tier overflowed")]
    RingOverflow { tier: TierKind },

    /// Message released into a pool that did not issue it
    #[error("message does not belong to this pool")]
    ForeignMessage,
}

impl PoolError {
    /// Backpressure condition rather than a hard failure
    pub fn is_exhausted(&self) -> bool {
        matches!(self, PoolError::Exhausted { .. })
    }
}

/// Tiered slab pool of message buffers
///
/// Three contiguous regions (small, medium, large), each cut into
/// fixed-size slots tracked by a [`FreeBlockRing`](super::FreeBlockRing).
/// Messages start in the small tier and are copied one tier up when they
/// outgrow their slot; the old slot is freed after the copy.
///
/// Not thread-safe: owned by the processing thread.
#[derive(Debug)]
pub struct SlabPool {
    id: PoolId,
    name: &'static str,
    tiers: [Tier; 3],
}

impl SlabPool {
    /// Create a pool, allocating every tier region up front
    ///
    /// `config` must already be validated.
    pub fn new(name: &'static str, config: &PoolConfig) -> Self {
        let id = PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed));
        let tiers = TierKind::ALL.map(|kind| Tier::new(kind, config.tier(kind)));

        info!(
            pool = name,
            small = ?config.small,
            medium = ?config.medium,
            large = ?config.large,
            "Initialized slab pool"
        );

        Self { id, name, tiers }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Largest message the pool can represent
    pub fn max_message_size(&self) -> usize {
        self.tiers[TierKind::Large.index()].slot_size
    }

    pub fn slot_size(&self, kind: TierKind) -> usize {
        self.tiers[kind.index()].slot_size
    }

    /// Free slots remaining in a tier
    pub fn free_slots(&self, kind: TierKind) -> usize {
        self.tiers[kind.index()].free_count()
    }

    /// Take an empty message backed by a small-tier slot
    pub fn acquire(&mut self) -> Result<Message, PoolError> {
        let tier = &mut self.tiers[TierKind::Small.index()];
        let offset = tier.free.take().ok_or(PoolError::Exhausted {
            tier: TierKind::Small,
        })?;

        trace!(pool = self.name, offset, "Acquired small slot");
        Ok(Message::new(self.id, TierKind::Small, offset, tier.slot_size))
    }

    /// Promote a message one tier up, copying its bytes
    ///
    /// On failure the message is left untouched in its current tier.
    pub fn grow(&mut self, message: &mut Message) -> Result<(), PoolError> {
        self.check_owner(message)?;
        let src = message.tier();
        let dst = src.next().ok_or(PoolError::SizeExceeded {
            requested: message.capacity() + 1,
            max: self.max_message_size(),
        })?;

        let new_offset = self.tiers[dst.index()]
            .free
            .take()
            .ok_or(PoolError::Exhausted { tier: dst })?;

        self.copy_between(
            (src, message.offset()),
            (dst, new_offset),
            message.len(),
        );

        // Free the smaller slot only after the copy
        if !self.tiers[src.index()].free.put(message.offset()) {
            // Undo the take so the larger slot is not lost
            self.tiers[dst.index()].free.put(new_offset);
            return Err(PoolError::RingOverflow { tier: src });
        }

        let capacity = self.tiers[dst.index()].slot_size;
        debug!(
            pool = self.name,
            from = %src,
            to = %dst,
            len = message.len(),
            "Promoted message"
        );
        message.relocate(dst, new_offset, capacity);
        Ok(())
    }

    /// Return a message's slot to its tier
    ///
    /// Consumes the message, so each acquisition is released exactly once.
    pub fn release(&mut self, message: Message) -> Result<(), PoolError> {
        self.check_owner(&message)?;
        let tier = message.tier();
        if !self.tiers[tier.index()].free.put(message.offset()) {
            return Err(PoolError::RingOverflow { tier });
        }
        trace!(pool = self.name, %tier, offset = message.offset(), "Released slot");
        Ok(())
    }

    /// Content of a message
    pub fn bytes(&self, message: &Message) -> &[u8] {
        let region = &self.tiers[message.tier().index()].region;
        &region[message.offset()..message.offset() + message.len()]
    }

    /// Content of a message, writable in place
    pub fn bytes_mut(&mut self, message: &Message) -> &mut [u8] {
        let region = &mut self.tiers[message.tier().index()].region;
        &mut region[message.offset()..message.offset() + message.len()]
    }

    /// Copy `data` to the end of a message, promoting it as needed
    pub(crate) fn append(&mut self, message: &mut Message, data: &[u8]) -> Result<(), PoolError> {
        self.check_owner(message)?;
        let required = message.len() + data.len();
        if required > self.max_message_size() {
            return Err(PoolError::SizeExceeded {
                requested: required,
                max: self.max_message_size(),
            });
        }
        while required > message.capacity() {
            self.grow(message)?;
        }

        let start = message.offset() + message.len();
        let region = &mut self.tiers[message.tier().index()].region;
        region[start..start + data.len()].copy_from_slice(data);
        message.set_len(required);
        Ok(())
    }

    /// Copy `from[start..]` to the end of `into`
    pub(crate) fn carry_forward(
        &mut self,
        into: &mut Message,
        from: &Message,
        start: usize,
    ) -> Result<(), PoolError> {
        self.check_owner(from)?;
        self.check_owner(into)?;
        let tail = from.len().saturating_sub(start);
        if tail == 0 {
            return Ok(());
        }

        let required = into.len() + tail;
        if required > self.max_message_size() {
            return Err(PoolError::SizeExceeded {
                requested: required,
                max: self.max_message_size(),
            });
        }
        while required > into.capacity() {
            self.grow(into)?;
        }

        self.copy_between(
            (from.tier(), from.offset() + start),
            (into.tier(), into.offset() + into.len()),
            tail,
        );
        into.set_len(required);
        Ok(())
    }

    /// Snapshot of slot usage per tier
    pub fn stats(&self) -> PoolStats {
        let tiers = self
            .tiers
            .iter()
            .map(|tier| TierStats {
                tier: tier.kind,
                slot_size: tier.slot_size,
                slot_count: tier.slot_count,
                free_slots: tier.free_count(),
                outstanding: tier.outstanding(),
            })
            .collect();

        PoolStats {
            name: self.name,
            tiers,
        }
    }

    fn check_owner(&self, message: &Message) -> Result<(), PoolError> {
        if message.pool() == self.id {
            Ok(())
        } else {
            Err(PoolError::ForeignMessage)
        }
    }

    /// Copy `len` bytes between two (tier, absolute offset) positions
    fn copy_between(&mut self, src: (TierKind, usize), dst: (TierKind, usize), len: usize) {
        let (src_tier, src_at) = src;
        let (dst_tier, dst_at) = dst;
        let (si, di) = (src_tier.index(), dst_tier.index());

        if si == di {
            self.tiers[si]
                .region
                .copy_within(src_at..src_at + len, dst_at);
        } else if si < di {
            let (low, high) = self.tiers.split_at_mut(di);
            high[0].region[dst_at..dst_at + len]
                .copy_from_slice(&low[si].region[src_at..src_at + len]);
        } else {
            let (low, high) = self.tiers.split_at_mut(si);
            low[di].region[dst_at..dst_at + len]
                .copy_from_slice(&high[0].region[src_at..src_at + len]);
        }
    }
}

/// Statistics for a slab pool
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub name: &'static str,
    pub tiers: Vec<TierStats>,
}

impl PoolStats {
    pub fn tier(&self, kind: TierKind) -> &TierStats {
        &self.tiers[kind.index()]
    }

    /// Slots held by live messages across all tiers
    pub fn outstanding(&self) -> usize {
        self.tiers.iter().map(|t| t.outstanding).sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TierStats {
    pub tier: TierKind,
    pub slot_size: usize,
    pub slot_count: usize,
    pub free_slots: usize,
    pub outstanding: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::tier::TierConfig;

    fn small_pool() -> SlabPool {
        SlabPool::new(
            "test",
            &PoolConfig {
                small: TierConfig::new(16, 4),
                medium: TierConfig::new(64, 2),
                large: TierConfig::new(256, 1),
            },
        )
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_outstanding_never_exceeds_slot_count() {
        let mut pool = small_pool();
        let mut held = Vec::new();

        for round in 0..3 {
            while let Ok(m) = pool.acquire() {
                held.push(m);
            }
            assert_eq!(held.len(), 4, "round {}", round);
            assert_eq!(
                pool.acquire().unwrap_err(),
                PoolError::Exhausted {
                    tier: TierKind::Small
                }
            );

            for m in held.drain(..) {
                pool.release(m).unwrap();
            }
            assert_eq!(pool.stats().outstanding(), 0);
        }
    }

    #[test]
    fn test_release_makes_offset_reusable() {
        let mut pool = SlabPool::new(
            "scenario",
            &PoolConfig {
                small: TierConfig::new(4096, 4),
                medium: TierConfig::new(131072, 1),
                large: TierConfig::new(262144, 1),
            },
        );

        let mut held: Vec<Message> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert!(pool.acquire().unwrap_err().is_exhausted());

        let returned = held.remove(1);
        let offset = returned.offset();
        pool.release(returned).unwrap();

        let again = pool.acquire().unwrap();
        assert_eq!(again.offset(), offset);
    }

    #[test]
    fn test_append_round_trip_around_slot_capacity() {
        for len in [15, 16, 17] {
            let mut pool = small_pool();
            let mut m = pool.acquire().unwrap();
            let data = pattern(len);
            pool.append(&mut m, &data).unwrap();
            assert_eq!(m.len(), len);
            assert_eq!(pool.bytes(&m), &data[..]);

            let expected_tier = if len > 16 {
                TierKind::Medium
            } else {
                TierKind::Small
            };
            assert_eq!(m.tier(), expected_tier);
            pool.release(m).unwrap();
            assert_eq!(pool.stats().outstanding(), 0);
        }
    }

    #[test]
    fn test_double_promotion_preserves_pattern() {
        let mut pool = small_pool();
        let mut m = pool.acquire().unwrap();
        let data = pattern(200);

        // Feed in small chunks so each promotion copies existing content
        for chunk in data.chunks(7) {
            pool.append(&mut m, chunk).unwrap();
        }

        assert_eq!(m.tier(), TierKind::Large);
        assert_eq!(m.capacity(), 256);
        assert_eq!(pool.bytes(&m), &data[..]);

        let stats = pool.stats();
        assert_eq!(stats.tier(TierKind::Small).outstanding, 0);
        assert_eq!(stats.tier(TierKind::Medium).outstanding, 0);
        assert_eq!(stats.tier(TierKind::Large).outstanding, 1);
    }

    #[test]
    fn test_grow_failure_leaves_message_in_place() {
        let mut pool = small_pool();
        let mut first = pool.acquire().unwrap();
        let mut second = pool.acquire().unwrap();
        let mut third = pool.acquire().unwrap();
        pool.append(&mut first, &pattern(20)).unwrap();
        pool.append(&mut second, &pattern(20)).unwrap();

        // Medium tier (2 slots) is now full
        pool.append(&mut third, &pattern(10)).unwrap();
        let offset = third.offset();
        let err = pool.append(&mut third, &pattern(10)).unwrap_err();
        assert_eq!(
            err,
            PoolError::Exhausted {
                tier: TierKind::Medium
            }
        );
        assert_eq!(third.tier(), TierKind::Small);
        assert_eq!(third.offset(), offset);
        assert_eq!(pool.bytes(&third), &pattern(10)[..]);
    }

    #[test]
    fn test_grow_overflow_returns_larger_slot() {
        let mut pool = small_pool();
        // A stale handle whose small slot is already back in the ring
        let mut stale = Message::new(pool.id(), TierKind::Small, 0, 16);

        let err = pool.grow(&mut stale).unwrap_err();
        assert_eq!(
            err,
            PoolError::RingOverflow {
                tier: TierKind::Small
            }
        );
        assert_eq!(stale.tier(), TierKind::Small);
        assert_eq!(pool.free_slots(TierKind::Medium), 2);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[test]
    fn test_size_exceeded_is_reported() {
        let mut pool = small_pool();
        let mut m = pool.acquire().unwrap();
        let err = pool.append(&mut m, &pattern(257)).unwrap_err();
        assert_eq!(
            err,
            PoolError::SizeExceeded {
                requested: 257,
                max: 256
            }
        );
        assert_eq!(m.tier(), TierKind::Small);
        assert!(m.is_empty());

        pool.append(&mut m, &pattern(256)).unwrap();
        assert!(matches!(
            pool.grow(&mut m),
            Err(PoolError::SizeExceeded { .. })
        ));
    }

    #[test]
    fn test_foreign_message_rejected() {
        let mut a = small_pool();
        let mut b = small_pool();
        let m = a.acquire().unwrap();
        assert_eq!(b.release(m).unwrap_err(), PoolError::ForeignMessage);
        assert_eq!(a.stats().outstanding(), 1);
    }

    #[test]
    fn test_carry_forward_copies_tail() {
        let mut pool = small_pool();
        let mut from = pool.acquire().unwrap();
        pool.append(&mut from, b"GET / HTTP/1.1\r\n").unwrap();

        let mut into = pool.acquire().unwrap();
        pool.carry_forward(&mut into, &from, 4).unwrap();
        assert_eq!(pool.bytes(&into), b"/ HTTP/1.1\r\n");

        let mut empty = pool.acquire().unwrap();
        pool.carry_forward(&mut empty, &from, from.len()).unwrap();
        assert!(empty.is_empty());
    }
}
