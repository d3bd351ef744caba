//! Slab Message Pool
//!
//! Byte storage for in-flight messages without per-message heap
//! allocation. Each pool owns three regions cut into fixed-size slots;
//! free slots are tracked by offset in a wrap-around ring per tier.
//!
//! # Architecture
//!
//! ```text
//! SlabPool
//!   ├─→ Small  (4 KB x 1024)   → FreeBlockRing [0, 4K, 8K, ...]
//!   ├─→ Medium (128 KB x 128)  → FreeBlockRing [0, 128K, ...]
//!   └─→ Large  (1 MB x 16)     → FreeBlockRing [0, 1M, ...]
//!
//! Message { tier, offset, len, capacity }
//!   └─→ append() past capacity: copy to next tier, free old slot
//! ```
//!
//! A slot offset is either in its tier's ring or owned by exactly one
//! live [`Message`], never both.

pub mod message;
pub mod pool;
pub mod ring;
pub mod tier;

pub use message::{Message, SocketId};
pub use pool::{PoolError, PoolId, PoolStats, SlabPool, TierStats};
pub use ring::FreeBlockRing;
pub use tier::{PoolConfig, TierConfig, TierKind, KB, MB};
