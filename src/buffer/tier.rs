//! Tier management for the slab pool

use super::ring::FreeBlockRing;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Size tier of a slab pool, strictly ordered `Small < Medium < Large`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Small,
    Medium,
    Large,
}

impl TierKind {
    pub const ALL: [TierKind; 3] = [TierKind::Small, TierKind::Medium, TierKind::Large];

    pub fn index(self) -> usize {
        match self {
            TierKind::Small => 0,
            TierKind::Medium => 1,
            TierKind::Large => 2,
        }
    }

    /// The tier a message is promoted to, one step at a time
    pub fn next(self) -> Option<TierKind> {
        match self {
            TierKind::Small => Some(TierKind::Medium),
            TierKind::Medium => Some(TierKind::Large),
            TierKind::Large => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TierKind::Small => "small",
            TierKind::Medium => "medium",
            TierKind::Large => "large",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slot geometry of one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Size of each slot in bytes
    pub slot_size: usize,
    /// Number of slots in the tier
    pub slot_count: usize,
}

impl TierConfig {
    pub const fn new(slot_size: usize, slot_count: usize) -> Self {
        Self {
            slot_size,
            slot_count,
        }
    }

    /// Bytes reserved for the tier's backing region
    pub fn region_len(&self) -> usize {
        self.slot_size * self.slot_count
    }
}

/// Slot geometry of all three tiers of a pool
///
/// Fixed at startup. Sizing is a capacity planning decision for the
/// operator; the pool never grows a tier at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub small: TierConfig,
    pub medium: TierConfig,
    pub large: TierConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            small: TierConfig::new(4 * KB, 1024),   // 4 MB
            medium: TierConfig::new(128 * KB, 128), // 16 MB
            large: TierConfig::new(MB, 16),         // 16 MB
        }
    }
}

impl PoolConfig {
    pub fn tier(&self, kind: TierKind) -> TierConfig {
        match kind {
            TierKind::Small => self.small,
            TierKind::Medium => self.medium,
            TierKind::Large => self.large,
        }
    }

    /// Check that every tier is non-empty and slot sizes strictly increase
    pub fn validate(&self) -> Result<(), String> {
        for kind in TierKind::ALL {
            let tier = self.tier(kind);
            if tier.slot_size == 0 || tier.slot_count == 0 {
                return Err(format!(
                    "{} tier must have non-zero slot size and count (got {}x{})",
                    kind, tier.slot_size, tier.slot_count
                ));
            }
            tier.slot_size
                .checked_mul(tier.slot_count)
                .ok_or_else(|| format!("{} tier region size overflows", kind))?;
        }
        if self.small.slot_size >= self.medium.slot_size
            || self.medium.slot_size >= self.large.slot_size
        {
            return Err(format!(
                "tier slot sizes must strictly increase (small={}, medium={}, large={})",
                self.small.slot_size, self.medium.slot_size, self.large.slot_size
            ));
        }
        Ok(())
    }
}

/// One tier: a contiguous region cut into equal slots plus its free ring
#[derive(Debug)]
pub(crate) struct Tier {
    pub kind: TierKind,
    pub slot_size: usize,
    pub slot_count: usize,
    pub region: Box<[u8]>,
    pub free: FreeBlockRing,
}

impl Tier {
    /// Allocate the region and seed the ring with every slot offset
    pub fn new(kind: TierKind, config: TierConfig) -> Self {
        let mut free = FreeBlockRing::new(config.slot_count);
        for slot in 0..config.slot_count {
            free.put(slot * config.slot_size);
        }

        Self {
            kind,
            slot_size: config.slot_size,
            slot_count: config.slot_count,
            region: vec![0u8; config.region_len()].into_boxed_slice(),
            free,
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.available()
    }

    pub fn outstanding(&self) -> usize {
        self.slot_count - self.free.available()
    }
}
