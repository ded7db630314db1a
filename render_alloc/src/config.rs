//! Tunables for the arena block pool and the mem block manager

use crate::{error::AllocError, util::is_power_of_two};

/// Default size of each block handed out by an [crate::arena::ArenaBlockPool]
pub const DEFAULT_ARENA_BLOCK_SIZE: usize = 32 * 1024 * 1024;
/// Alignment used by [crate::arena::Arena::alloc_default]
pub const ARENA_DEFAULT_ALIGNMENT: usize = 16;
pub const CACHE_LINE_SIZE: usize = 64;
/// Arena requests are rounded up to at least this size and alignment
pub const ALLOC_MIN_GRANULE: usize = 4;
/// Batched frees above this count are sorted and grouped by owning block
pub const FREE_LIST_SORT_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaBlockPoolConfig {
    /// Size in bytes of every block
    pub block_size: usize,
    /// Alignment of every block's base address
    pub block_alignment: usize,
}
impl Default for ArenaBlockPoolConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_ARENA_BLOCK_SIZE,
            block_alignment: CACHE_LINE_SIZE,
        }
    }
}
impl ArenaBlockPoolConfig {
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), AllocError> {
        if !is_power_of_two(self.block_size) {
            return Err(AllocError::InvalidConfig(
                "block_size must be a non-zero power of two",
            ));
        }
        if !is_power_of_two(self.block_alignment) {
            return Err(AllocError::InvalidConfig(
                "block_alignment must be a non-zero power of two",
            ));
        }
        if self.block_size < self.block_alignment {
            return Err(AllocError::InvalidConfig(
                "block_size must be at least block_alignment",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemBlockManagerConfig {
    /// Number of blocks (and therefore the maximum number of pools)
    pub num_blocks: usize,
    /// Distance in bytes between consecutive entries
    pub entry_stride: usize,
}
impl MemBlockManagerConfig {
    pub fn new(num_blocks: usize, entry_stride: usize) -> Self {
        Self {
            num_blocks,
            entry_stride,
        }
    }

    pub fn validate(&self) -> Result<(), AllocError> {
        if self.num_blocks == 0 {
            return Err(AllocError::InvalidConfig("num_blocks must be at least 1"));
        }
        if self.num_blocks > u32::MAX as usize {
            return Err(AllocError::InvalidConfig("num_blocks must fit in a u32"));
        }
        if self.entry_stride == 0 {
            return Err(AllocError::InvalidConfig("entry_stride must be at least 1"));
        }
        Ok(())
    }
}
