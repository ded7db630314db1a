//! Shared owner of every [MemBlock] and the memory behind them

use std::{
    alloc::{self, Layout},
    fmt::Debug,
    mem::size_of,
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering as StdOrdering},
};

use tracing::Level;

use crate::{
    config::{MemBlockManagerConfig, CACHE_LINE_SIZE, FREE_LIST_SORT_THRESHOLD},
    error::AllocError,
    free_list::ConcurrentFreeList,
    util::UsizePtr,
};

use super::{bits::BitWord, block::MemBlock};

/// Distinguishes managers so a [BlockId] can't be returned to the wrong one
static NEXT_MANAGER_TAG: AtomicU32 = AtomicU32::new(0);

/// Proof of ownership of one block checked out of a [MemBlockManager]
///
/// Not `Clone`: holding one is what entitles a pool to allocate out of the
/// block, and giving it back through [MemBlockManager::free_block] gives
/// that up.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct BlockId {
    index: u32,
    manager_tag: u32,
}
impl BlockId {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Owns a fixed array of [MemBlock]s and one contiguous entry region
///
/// Blocks are checked out to pools through a thread-safe free list.
/// Freeing entries works from any thread: the owning block is found by
/// address and the entries land in its pending free list.
pub struct MemBlockManager<I: BitWord, L: BitWord> {
    config: MemBlockManagerConfig,
    tag: u32,
    blocks: Box<[MemBlock<I, L>]>,
    entry_memory: NonNull<u8>,
    entry_layout: Layout,
    /// Bytes of entry memory per block
    entry_to_block_divider: usize,
    free_blocks: ConcurrentFreeList<u32>,
}
// safety: the manager owns the entry region, and blocks are Send + Sync
unsafe impl<I: BitWord, L: BitWord> Send for MemBlockManager<I, L> {}
unsafe impl<I: BitWord, L: BitWord> Sync for MemBlockManager<I, L> {}

impl<I: BitWord, L: BitWord> MemBlockManager<I, L> {
    pub const ENTRIES_PER_BLOCK: usize = MemBlock::<I, L>::NUM_ENTRIES;

    /// Bytes of entry memory needed for `num_blocks` blocks of `entry_stride` entries
    pub fn query_entry_memory_required(num_blocks: usize, entry_stride: usize) -> Option<usize> {
        num_blocks
            .checked_mul(Self::ENTRIES_PER_BLOCK)?
            .checked_mul(entry_stride)
    }

    pub fn new(config: MemBlockManagerConfig) -> Result<Self, AllocError> {
        config.validate()?;
        let bytes = Self::query_entry_memory_required(config.num_blocks, config.entry_stride)
            .ok_or(AllocError::InvalidConfig("entry memory size overflows"))?;
        let entry_layout = Layout::from_size_align(bytes, CACHE_LINE_SIZE)
            .map_err(|_| AllocError::InvalidConfig("entry memory size overflows"))?;

        // safety: validation guarantees at least one block of nonzero stride
        let entry_memory = NonNull::new(unsafe { alloc::alloc(entry_layout) }).ok_or(
            AllocError::SystemAllocFailed {
                size: bytes,
                alignment: CACHE_LINE_SIZE,
            },
        )?;

        let entry_to_block_divider = config.entry_stride * Self::ENTRIES_PER_BLOCK;
        let blocks = (0..config.num_blocks)
            .map(|i| unsafe {
                // safety: each block gets its own disjoint slice of entry_memory,
                // which lives as long as the manager
                let block_memory = entry_memory.as_ptr().add(i * entry_to_block_divider);
                MemBlock::new(NonNull::new_unchecked(block_memory), config.entry_stride)
            })
            .collect::<Box<[_]>>();

        tracing::debug!(
            num_blocks = config.num_blocks,
            entry_stride = config.entry_stride,
            entries_per_block = Self::ENTRIES_PER_BLOCK,
            entry_memory = ?UsizePtr::from(entry_memory),
            bytes,
            "created mem block manager"
        );

        let mut ret = Self {
            config,
            tag: NEXT_MANAGER_TAG.fetch_add(1, StdOrdering::Relaxed),
            blocks,
            entry_memory,
            entry_layout,
            entry_to_block_divider,
            free_blocks: ConcurrentFreeList::with_capacity(config.num_blocks),
        };
        ret.full_reset();
        Ok(ret)
    }

    /// Reset every block and put them all back in the free list
    pub fn full_reset(&mut self) {
        // safety: &mut self, so no pool can be using any block
        unsafe { self.force_full_reset() }
    }

    /// Like [Self::full_reset], but assumes every block is already empty
    pub fn fast_reset(&mut self) {
        // safety: &mut self, so no pool can be using any block
        unsafe { self.force_fast_reset() }
    }

    /// Reclaim every block, including ones checked out to pools
    ///
    /// # Safety
    ///
    /// No pool may touch any block of this manager concurrently, and every
    /// pool bound to it must `fast_reset` before allocating again. Entries
    /// handed out before the reset must not be freed afterwards.
    pub unsafe fn force_full_reset(&self) {
        self.free_blocks.clear();
        for block in self.blocks.iter() {
            block.owner_full_reset();
        }
        self.push_all_blocks();
    }

    /// [Self::force_full_reset] for a manager whose blocks are all empty
    ///
    /// # Safety
    ///
    /// Same as [Self::force_full_reset]
    pub unsafe fn force_fast_reset(&self) {
        self.free_blocks.clear();
        for block in self.blocks.iter() {
            block.owner_fast_reset();
        }
        self.push_all_blocks();
    }

    /// Check out a block, or `None` if every block is in use
    pub fn allocate_block(&self) -> Option<BlockId> {
        let trace_span = tracing::span!(Level::TRACE, "MemBlockManager::allocate_block");
        let _span_enter = trace_span.enter();

        let index = self.free_blocks.pop()?;
        let block = &self.blocks[index as usize];
        debug_assert!(block.is_valid());
        debug_assert!(block.is_empty());
        tracing::event!(
            Level::TRACE,
            index,
            entries = ?UsizePtr::from(block.get_base_entry_memory_address())
        );
        Some(BlockId {
            index,
            manager_tag: self.tag,
        })
    }

    /// Give a block back, resetting it cheaply if it is already empty
    pub fn free_block(&self, block_id: BlockId) {
        let trace_span = tracing::span!(
            Level::TRACE,
            "MemBlockManager::free_block",
            index = block_id.index
        );
        let _span_enter = trace_span.enter();

        assert_eq!(
            block_id.manager_tag, self.tag,
            "block returned to the wrong manager"
        );
        let block = &self.blocks[block_id.index()];
        debug_assert!(block.is_valid());
        // safety: the BlockId proves the caller owns this block, and we consume it
        unsafe {
            if block.is_empty() {
                tracing::event!(Level::TRACE, "fast reset");
                block.owner_fast_reset();
            } else {
                tracing::event!(
                    Level::TRACE,
                    used = block.get_num_used_entries(),
                    "full reset"
                );
                block.owner_full_reset();
            }
        }
        self.free_blocks.push(block_id.index);
    }

    /// Free entries from any thread, routing each to its owning block
    ///
    /// Large batches are sorted so each block's lock is taken once.
    /// `entries` may be reordered.
    pub fn free_list(&self, entries: &mut [NonNull<u8>]) {
        match entries.len() {
            0 => {}
            1 => self.free_entry(entries[0]),
            n if n <= FREE_LIST_SORT_THRESHOLD => {
                for &entry in entries.iter() {
                    self.free_entry(entry);
                }
            }
            _ => {
                entries.sort_unstable();
                let mut rest = &entries[..];
                while let Some(&first) = rest.first() {
                    let block_idx = self.get_owning_block_index(first);
                    let run = rest
                        .iter()
                        .position(|&entry| self.get_owning_block_index(entry) != block_idx)
                        .unwrap_or(rest.len());
                    self.blocks[block_idx].add_to_pending_free_list(&rest[..run]);
                    rest = &rest[run..];
                }
            }
        }
    }

    fn free_entry(&self, entry: NonNull<u8>) {
        let block_idx = self.get_owning_block_index(entry);
        self.blocks[block_idx].add_to_pending_free_list(&[entry]);
    }

    /// Index of the block that handed out `entry`
    pub fn get_owning_block_index(&self, entry: NonNull<u8>) -> usize {
        let offset = (entry.as_ptr() as usize).wrapping_sub(self.entry_memory.as_ptr() as usize);
        let index = offset / self.entry_to_block_divider;
        debug_assert!(
            self.is_valid_block_index(index),
            "entry {:?} doesn't belong to this manager",
            UsizePtr::from(entry)
        );
        index
    }

    pub fn is_valid_block_index(&self, index: usize) -> bool {
        index < self.blocks.len()
    }

    pub(crate) fn block(&self, block_id: &BlockId) -> &MemBlock<I, L> {
        debug_assert_eq!(block_id.manager_tag, self.tag);
        &self.blocks[block_id.index()]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Blocks not currently checked out. Only exact when nobody is racing.
    pub fn num_free_blocks(&self) -> usize {
        self.free_blocks.len()
    }

    pub fn get_entry_stride(&self) -> usize {
        self.config.entry_stride
    }

    /// Total bytes owned: entry memory plus bookkeeping
    pub fn get_memory_usage(&self) -> usize {
        size_of::<Self>()
            + self.blocks.len() * size_of::<MemBlock<I, L>>()
            + self.entry_layout.size()
            + self.config.num_blocks * size_of::<u32>()
    }

    /// Push in reverse so blocks come back out in ascending index order
    fn push_all_blocks(&self) {
        for index in (0..self.blocks.len() as u32).rev() {
            self.free_blocks.push(index);
        }
    }
}
impl<I: BitWord, L: BitWord> Drop for MemBlockManager<I, L> {
    fn drop(&mut self) {
        unsafe {
            // safety: allocated in new with exactly this layout
            alloc::dealloc(self.entry_memory.as_ptr(), self.entry_layout);
        }
    }
}
impl<I: BitWord, L: BitWord> Debug for MemBlockManager<I, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlockManager")
            .field("@addr", &(self as *const _))
            .field("config", &self.config)
            .field("entries_per_block", &Self::ENTRIES_PER_BLOCK)
            .field("entry_memory", &UsizePtr::from(self.entry_memory))
            .field("free_blocks", &self.free_blocks)
            .finish()
    }
}
