//! Per-thread front end for allocating entries out of a [MemBlockManager]

use std::{
    cell::Cell,
    collections::VecDeque,
    fmt::{self, Debug, Display},
    marker::PhantomData,
    mem::{align_of, size_of},
    ops::{Add, AddAssign, Deref, DerefMut},
    ptr::NonNull,
    sync::Arc,
};

use rustc_hash::FxHashSet;

use crate::{config::CACHE_LINE_SIZE, error::AllocError};

use super::{
    bits::BitWord,
    block::MemBlock,
    manager::{BlockId, MemBlockManager},
};

/// Counters for how allocations were satisfied
///
/// The `case_*` counters count entries, not calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks checked out of the manager
    pub blocks_allocated: usize,
    /// Entries allocated from the active block
    pub case_a_allocs: usize,
    /// Entries allocated after cycling to another owned block
    pub case_b_allocs: usize,
    /// Entries allocated from freshly checked out blocks
    pub case_c_allocs: usize,
    /// Entries passed to [LocalUntypedMemPool::untyped_free_list]
    pub free_calls: usize,
    /// Pending free lists drained while cycling
    pub process_pending_free_list: usize,
    /// Blocks given back because they became empty
    pub returned_empty_blocks: usize,
    /// Times the manager had no block to give
    pub failed_block_allocs: usize,
    /// Entries that could not be allocated when that happened
    pub failed_entry_allocs: usize,
}
impl PoolStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn total_allocs(&self) -> usize {
        self.case_a_allocs + self.case_b_allocs + self.case_c_allocs
    }
}
impl AddAssign for PoolStats {
    fn add_assign(&mut self, rhs: Self) {
        self.blocks_allocated += rhs.blocks_allocated;
        self.case_a_allocs += rhs.case_a_allocs;
        self.case_b_allocs += rhs.case_b_allocs;
        self.case_c_allocs += rhs.case_c_allocs;
        self.free_calls += rhs.free_calls;
        self.process_pending_free_list += rhs.process_pending_free_list;
        self.returned_empty_blocks += rhs.returned_empty_blocks;
        self.failed_block_allocs += rhs.failed_block_allocs;
        self.failed_entry_allocs += rhs.failed_entry_allocs;
    }
}
impl Add for PoolStats {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}
impl Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = [
            ("BLOCKS_ALLOCATED", self.blocks_allocated),
            ("CASE_A_ALLOCS", self.case_a_allocs),
            ("CASE_B_ALLOCS", self.case_b_allocs),
            ("CASE_C_ALLOCS", self.case_c_allocs),
            ("FREE_CALLS", self.free_calls),
            ("PROCESS_PENDING_FREE_LIST", self.process_pending_free_list),
            ("RETURNED_EMPTY_BLOCKS", self.returned_empty_blocks),
            ("FAILED_BLOCK_ALLOCS", self.failed_block_allocs),
            ("FAILED_ENTRY_ALLOCS", self.failed_entry_allocs),
        ];
        for (name, value) in rows {
            writeln!(f, "{:>26} = {}", name, value)?;
        }
        Ok(())
    }
}

/// Allocates fixed-size entries out of blocks checked out of a shared manager
///
/// Owned by one thread at a time (it is `Send` but not `Sync`). Entries it
/// hands out can be freed from any thread, through any pool or directly
/// through the manager.
pub struct LocalUntypedMemPool<I: BitWord, L: BitWord> {
    block_manager: Option<Arc<MemBlockManager<I, L>>>,
    /// Owned blocks in cycling order. The front is the active block.
    blocks: VecDeque<BlockId>,
    /// Capacity of every owned block combined
    num_reserved: usize,
    /// Entries in use, not counting pending frees that haven't been processed
    num_allocated: usize,
    stats: PoolStats,
    /// prevent this type from being Sync
    _not_sync: PhantomData<Cell<()>>,
}

impl<I: BitWord, L: BitWord> Default for LocalUntypedMemPool<I, L> {
    fn default() -> Self {
        Self::empty()
    }
}
impl<I: BitWord, L: BitWord> LocalUntypedMemPool<I, L> {
    const ENTRIES_PER_BLOCK: usize = MemBlock::<I, L>::NUM_ENTRIES;

    /// A pool with no manager. Allocation fails until [Self::init].
    pub fn empty() -> Self {
        Self {
            block_manager: None,
            blocks: VecDeque::new(),
            num_reserved: 0,
            num_allocated: 0,
            stats: PoolStats::default(),
            _not_sync: PhantomData,
        }
    }

    pub fn new(block_manager: Arc<MemBlockManager<I, L>>) -> Result<Self, AllocError> {
        let mut ret = Self::empty();
        ret.init(block_manager)?;
        Ok(ret)
    }

    /// Bind to `block_manager` and check out a first block
    pub fn init(&mut self, block_manager: Arc<MemBlockManager<I, L>>) -> Result<(), AllocError> {
        self.clean_up();
        self.block_manager = Some(block_manager);
        self.full_reset()
    }

    /// Give every owned block back and unbind from the manager
    pub fn clean_up(&mut self) {
        self.return_all_blocks();
        self.block_manager = None;
        self.num_allocated = 0;
    }

    /// Give every owned block back, then start over with one fresh block
    pub fn full_reset(&mut self) -> Result<(), AllocError> {
        self.return_all_blocks();
        self.fast_reset()
    }

    /// Forget every owned block without giving it back, then start over
    /// with one fresh block. Also resets the stats.
    ///
    /// For when the manager has already reclaimed the blocks, e.g. after
    /// [MemBlockManager::force_fast_reset].
    pub fn fast_reset(&mut self) -> Result<(), AllocError> {
        self.stats.reset();
        self.blocks.clear();
        self.num_reserved = 0;
        self.num_allocated = 0;

        let block_manager = self
            .block_manager
            .as_deref()
            .ok_or(AllocError::NotInitialized)?;
        let block_id = block_manager
            .allocate_block()
            .ok_or(AllocError::NoFreeBlocks)?;
        self.stats.blocks_allocated += 1;
        self.blocks.push_back(block_id);
        self.num_reserved = Self::ENTRIES_PER_BLOCK;
        Ok(())
    }

    /// Allocate exactly `num_entries` entries, appending them to `entries`
    ///
    /// Either every entry is allocated, or none are and
    /// [AllocError::PoolExhausted] is returned.
    pub fn untyped_alloc_list(
        &mut self,
        num_entries: usize,
        entries: &mut Vec<NonNull<u8>>,
    ) -> Result<(), AllocError> {
        let block_manager = match self.block_manager.as_deref() {
            Some(block_manager) if !self.blocks.is_empty() => block_manager,
            _ => return Err(AllocError::NotInitialized),
        };
        debug_assert!(self.is_valid());
        if num_entries == 0 {
            return Ok(());
        }
        let start_len = entries.len();
        let mut remaining = num_entries;

        // case A: the active block
        let num = unsafe {
            // safety: we hold the BlockId and are !Sync
            block_manager
                .block(&self.blocks[0])
                .owner_alloc_list(remaining, entries)
        };
        self.stats.case_a_allocs += num;
        self.num_allocated += num;
        remaining -= num;
        if remaining == 0 {
            return Ok(());
        }

        // case B: visit each other owned block once, reclaiming as we go
        for _ in 1..self.blocks.len() {
            self.blocks.rotate_left(1);
            let block = block_manager.block(&self.blocks[0]);
            self.stats.process_pending_free_list += 1;
            // safety: we hold the BlockId and are !Sync
            let freed = unsafe { block.owner_process_pending_free_list() };
            self.num_allocated -= freed;

            if block.is_empty() && self.blocks.len() > 1 {
                if let Some(block_id) = self.blocks.pop_front() {
                    self.stats.returned_empty_blocks += 1;
                    self.num_reserved -= Self::ENTRIES_PER_BLOCK;
                    block_manager.free_block(block_id);
                }
                // so that the next rotation lands on the block after this one
                self.blocks.rotate_right(1);
                continue;
            }

            // safety: as above
            let num = unsafe { block.owner_alloc_list(remaining, entries) };
            self.stats.case_b_allocs += num;
            self.num_allocated += num;
            remaining -= num;
            if remaining == 0 {
                return Ok(());
            }
        }

        // case C: fresh blocks from the manager
        while remaining > 0 {
            let Some(block_id) = block_manager.allocate_block() else {
                self.stats.failed_block_allocs += 1;
                self.stats.failed_entry_allocs += remaining;
                let satisfied = num_entries - remaining;
                tracing::warn!(
                    requested = num_entries,
                    satisfied,
                    owned_blocks = self.blocks.len(),
                    "mem block manager out of blocks, rolling back"
                );

                // undo this call's partial allocation. It all went to our own
                // blocks' pending lists, so it can be reclaimed right away.
                self.stats.free_calls += entries.len() - start_len;
                block_manager.free_list(&mut entries[start_len..]);
                entries.truncate(start_len);
                for block_id in &self.blocks {
                    // safety: we hold the BlockId and are !Sync
                    let freed = unsafe {
                        block_manager
                            .block(block_id)
                            .owner_process_pending_free_list()
                    };
                    self.num_allocated -= freed;
                }
                debug_assert!(self.is_valid());
                return Err(AllocError::PoolExhausted {
                    requested: num_entries,
                    satisfied,
                });
            };
            self.stats.blocks_allocated += 1;
            self.num_reserved += Self::ENTRIES_PER_BLOCK;

            // the new block goes right after the active one and becomes active
            self.blocks.rotate_left(1);
            self.blocks.push_front(block_id);

            let num = unsafe {
                // safety: we hold the BlockId and are !Sync
                block_manager
                    .block(&self.blocks[0])
                    .owner_alloc_list(remaining, entries)
            };
            self.stats.case_c_allocs += num;
            self.num_allocated += num;
            remaining -= num;
        }

        debug_assert!(self.is_valid());
        Ok(())
    }

    /// Free entries allocated by any pool sharing this pool's manager
    ///
    /// `entries` may be reordered.
    pub fn untyped_free_list(&mut self, entries: &mut [NonNull<u8>]) {
        self.stats.free_calls += entries.len();
        match &self.block_manager {
            Some(block_manager) => block_manager.free_list(entries),
            None => debug_assert!(entries.is_empty(), "free through an uninitialized pool"),
        }
    }

    /// Drain every owned block's pending frees and check nothing is left in use
    pub fn verify_no_outstanding_allocs(&mut self) -> bool {
        let Some(block_manager) = self.block_manager.as_deref() else {
            return true;
        };
        let mut all_empty = true;
        for block_id in &self.blocks {
            let block = block_manager.block(block_id);
            // safety: we hold the BlockId and are !Sync
            let freed = unsafe { block.owner_process_pending_free_list() };
            self.num_allocated -= freed;
            all_empty &= block.is_empty();
        }
        debug_assert!(!all_empty || self.num_allocated == 0);
        all_empty
    }

    pub fn get_stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    pub fn get_mem_block_manager(&self) -> Option<&Arc<MemBlockManager<I, L>>> {
        self.block_manager.as_ref()
    }

    /// Conservative: entries freed by other threads may not be reflected yet
    pub fn get_num_entries_allocated(&self) -> usize {
        self.num_allocated
    }

    pub fn get_num_entries_reserved(&self) -> usize {
        self.num_reserved
    }

    pub fn num_owned_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_valid(&self) -> bool {
        let Some(block_manager) = self.block_manager.as_deref() else {
            return self.blocks.is_empty() && self.num_allocated == 0;
        };
        if self.blocks.is_empty() {
            return false;
        }
        if self.num_reserved != self.blocks.len() * Self::ENTRIES_PER_BLOCK
            || self.num_allocated > self.num_reserved
        {
            return false;
        }
        let mut seen = FxHashSet::default();
        let mut num_used = 0;
        for block_id in &self.blocks {
            if !seen.insert(block_id.index()) {
                return false;
            }
            let block = block_manager.block(block_id);
            if !block.is_valid() {
                return false;
            }
            num_used += block.get_num_used_entries();
        }
        num_used == self.num_allocated
    }

    fn return_all_blocks(&mut self) {
        if let Some(block_manager) = &self.block_manager {
            for block_id in self.blocks.drain(..) {
                block_manager.free_block(block_id);
            }
        }
        self.blocks.clear();
        self.num_reserved = 0;
    }
}
impl<I: BitWord, L: BitWord> Drop for LocalUntypedMemPool<I, L> {
    fn drop(&mut self) {
        self.clean_up();
    }
}
impl<I: BitWord, L: BitWord> Debug for LocalUntypedMemPool<I, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalUntypedMemPool")
            .field("@addr", &(self as *const _))
            .field(
                "blocks",
                &self.blocks.iter().map(BlockId::index).collect::<Vec<_>>(),
            )
            .field("num_reserved", &self.num_reserved)
            .field("num_allocated", &self.num_allocated)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Typed front end over [LocalUntypedMemPool]
///
/// Entries are uninitialized storage for a `T`. The pool never constructs
/// or drops values.
pub struct MemPool<I: BitWord, L: BitWord, T> {
    inner: LocalUntypedMemPool<I, L>,
    scratch: Vec<NonNull<u8>>,
    _p: PhantomData<fn() -> T>,
}
// safety: scratch is always empty between calls
unsafe impl<I: BitWord, L: BitWord, T> Send for MemPool<I, L, T> {}

impl<I: BitWord, L: BitWord, T> MemPool<I, L, T> {
    pub fn new(block_manager: Arc<MemBlockManager<I, L>>) -> Result<Self, AllocError> {
        if block_manager.get_entry_stride() < size_of::<T>() {
            return Err(AllocError::InvalidConfig("entry stride smaller than the type"));
        }
        if align_of::<T>() > CACHE_LINE_SIZE || block_manager.get_entry_stride() % align_of::<T>() != 0
        {
            return Err(AllocError::InvalidConfig("entry stride doesn't align the type"));
        }
        Ok(Self {
            inner: LocalUntypedMemPool::new(block_manager)?,
            scratch: Vec::new(),
            _p: PhantomData,
        })
    }

    pub fn alloc_list(
        &mut self,
        num_entries: usize,
        entries: &mut Vec<NonNull<T>>,
    ) -> Result<(), AllocError> {
        self.scratch.clear();
        self.inner.untyped_alloc_list(num_entries, &mut self.scratch)?;
        entries.extend(self.scratch.drain(..).map(NonNull::cast::<T>));
        Ok(())
    }

    pub fn free_list(&mut self, entries: &[NonNull<T>]) {
        self.scratch.clear();
        self.scratch
            .extend(entries.iter().map(|entry| entry.cast::<u8>()));
        self.inner.untyped_free_list(&mut self.scratch);
    }
}
impl<I: BitWord, L: BitWord, T> Deref for MemPool<I, L, T> {
    type Target = LocalUntypedMemPool<I, L>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
impl<I: BitWord, L: BitWord, T> DerefMut for MemPool<I, L, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
impl<I: BitWord, L: BitWord, T> Debug for MemPool<I, L, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemPool")
            .field("type", &std::any::type_name::<T>())
            .field("inner", &self.inner)
            .finish()
    }
}
