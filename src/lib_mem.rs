#![forbid(unsafe_code)]
#![deny(warnings)]
#![warn(clippy::pedantic)]

use anyhow::{Context, Result as AnyResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::MemoryTuning;

/// Written into every byte of a new block so the pages are really resident
/// instead of shared zero pages.
pub const FILL_PATTERN: u8 = 0xA5;

/// Bounds on one adjuster step. `min <= max` always holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockSizes {
    min: u64,
    max: u64,
}

impl BlockSizes {
    /// A `max` below `min` is raised to `min`.
    pub fn new(min: u64, max: u64) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// 1% / 5% of total memory, floored by the tuning minimums.
    pub fn for_total(total_memory: u64, tuning: &MemoryTuning) -> Self {
        let min = (total_memory / 100).max(tuning.min_block_floor);
        Self::new(min, (total_memory / 20).max(tuning.max_block_floor))
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn alloc_size(&self, rate: f64, total_memory: u64) -> u64 {
        let wanted = (rate.max(0.0) * total_memory as f64) as u64;
        wanted.clamp(self.min, self.max)
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn free_size(&self, rate: f64, allocated: u64) -> u64 {
        let wanted = (rate.abs() * allocated as f64) as u64;
        wanted.clamp(self.min / 2, self.max)
    }

    /// What one adjuster tick does to the arena for a given allocation rate.
    pub fn plan(&self, rate: f64, total_memory: u64, allocated: u64) -> ArenaAction {
        if rate > 0.0 {
            ArenaAction::Allocate(self.alloc_size(rate, total_memory))
        } else if rate < 0.0 {
            ArenaAction::Free(self.free_size(rate, allocated))
        } else {
            ArenaAction::Idle
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArenaAction {
    Allocate(u64),
    Free(u64),
    Idle,
}

/// Pool of filled byte blocks. `allocated_bytes` is exact: freeing drops
/// whole blocks from the tail and shrinks the last partial one, so released
/// memory goes back to the allocator right away.
pub struct MemoryArena {
    blocks: Mutex<Vec<Vec<u8>>>,
    allocated: AtomicU64,
    sizes: BlockSizes,
}

impl MemoryArena {
    pub fn new(sizes: BlockSizes) -> Self {
        Self {
            blocks: Mutex::new(Vec::new()),
            allocated: AtomicU64::new(0),
            sizes,
        }
    }

    pub fn sizes(&self) -> BlockSizes {
        self.sizes
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Allocates and fills one block of `size` bytes. The fill happens before
    /// the pool lock is taken.
    pub fn allocate(&self, size: u64) -> AnyResult<u64> {
        if size == 0 {
            return Ok(0);
        }
        let len = usize::try_from(size).context("block size exceeds address space")?;
        let mut block = Vec::new();
        block
            .try_reserve_exact(len)
            .with_context(|| format!("reserve {size} bytes"))?;
        block.resize(len, FILL_PATTERN);
        let mut blocks = self.blocks.lock();
        blocks.push(block);
        self.allocated.fetch_add(size, Ordering::AcqRel);
        Ok(size)
    }

    /// Frees `min(size, allocated_bytes)` and returns the amount freed.
    pub fn free(&self, size: u64) -> u64 {
        let mut blocks = self.blocks.lock();
        let mut remaining = size.min(self.allocated.load(Ordering::Acquire));
        let mut freed = 0u64;
        while remaining > 0 {
            let Some(last) = blocks.last_mut() else { break };
            let len = last.len() as u64;
            if len <= remaining {
                blocks.pop();
                remaining -= len;
                freed += len;
            } else {
                // remaining < len <= usize::MAX
                let keep = usize::try_from(len - remaining).unwrap_or(0);
                last.truncate(keep);
                last.shrink_to_fit();
                freed += remaining;
                remaining = 0;
            }
        }
        self.allocated.fetch_sub(freed, Ordering::AcqRel);
        freed
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn free_fraction(&self, fraction: f64) -> u64 {
        let size = (self.allocated_bytes() as f64 * fraction.clamp(0.0, 1.0)) as u64;
        self.free(size)
    }

    /// Drops every block. Returns the bytes released.
    pub fn release_all(&self) -> u64 {
        let drained = {
            let mut blocks = self.blocks.lock();
            let freed = self.allocated.swap(0, Ordering::AcqRel);
            (std::mem::take(&mut *blocks), freed)
        };
        let (blocks, freed) = drained;
        drop(blocks);
        freed
    }
}
