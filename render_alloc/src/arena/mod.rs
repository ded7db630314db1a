//! Bump arenas backed by a shared pool of fixed-size blocks
//!
//! An [Arena] is owned by a single thread. It bump-allocates out of the most
//! recently checked-out [ArenaBlock] and only touches the shared
//! [ArenaBlockPool] when it needs another block or when it is rewound past
//! the start of a block.
//!
//! Memory is never freed individually. Instead, [Arena::get_ptr] captures a
//! watermark which [Arena::set_ptr] later rewinds to, usually through a
//! [ScopedArenaMem] guard.

use std::{
    alloc::{self, Layout},
    cmp,
    fmt::Debug,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::{atomic::Ordering, Arc},
};

use tracing::Level;

use crate::{
    config::{ArenaBlockPoolConfig, ALLOC_MIN_GRANULE, ARENA_DEFAULT_ALIGNMENT},
    error::AllocError,
    free_list::ConcurrentFreeList,
    loom_testing::*,
    util::{align_up, human_bytes, is_power_of_two, UsizePtr},
};

mod fixed;
pub use fixed::*;

/// Fill pattern for fresh [Arena] allocations in debug builds
const ARENA_DEBUG_FILL: u8 = 0xac;

/// Allocate `size` bytes aligned to `alignment` on a specific NUMA node
pub type NumaAllocFn = dyn Fn(usize, usize) -> Option<NonNull<u8>> + Send + Sync;
/// Release memory previously returned by the matching [NumaAllocFn]
pub type NumaFreeFn = dyn Fn(NonNull<u8>, usize) + Send + Sync;

/// Injected strategy for placing arena blocks on one NUMA node
///
/// Topology discovery is someone else's problem. This only carries the
/// node id (for diagnostics) and the allocate/free pair to use.
pub struct NumaAffinity {
    node: u32,
    alloc: Box<NumaAllocFn>,
    free: Box<NumaFreeFn>,
}
impl NumaAffinity {
    pub fn new<A, F>(node: u32, alloc: A, free: F) -> Self
    where
        A: Fn(usize, usize) -> Option<NonNull<u8>> + Send + Sync + 'static,
        F: Fn(NonNull<u8>, usize) + Send + Sync + 'static,
    {
        Self {
            node,
            alloc: Box::new(alloc),
            free: Box::new(free),
        }
    }

    pub fn node(&self) -> u32 {
        self.node
    }
}
impl Debug for NumaAffinity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NumaAffinity")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

/// One fixed-size slab of raw memory
///
/// This is a move-only handle. It can only be created by an
/// [ArenaBlockPool] and can only be given up by handing it back to the pool
/// it came from, so a block is never reachable from two owners at once.
pub struct ArenaBlock {
    memory: NonNull<u8>,
    size: usize,
}
// safety: the block exclusively owns its buffer, which is plain bytes
unsafe impl Send for ArenaBlock {}
impl ArenaBlock {
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.memory
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn addr(&self) -> usize {
        self.memory.as_ptr() as usize
    }

    fn end_addr(&self) -> usize {
        self.addr() + self.size
    }

    /// Inclusive of the one-past-the-end address
    fn contains(&self, addr: usize) -> bool {
        addr >= self.addr() && addr <= self.end_addr()
    }
}
impl Debug for ArenaBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaBlock")
            .field("memory", &UsizePtr::from(self.memory))
            .field("size", &self.size)
            .finish()
    }
}

/// Thread-safe source of [ArenaBlock]s
///
/// Blocks that are returned are kept on a free list and handed out again.
/// Their memory only goes back to the system in [ArenaBlockPool::clean_up]
/// (which also runs on drop).
pub struct ArenaBlockPool {
    config: ArenaBlockPoolConfig,
    numa: Option<NumaAffinity>,
    /// Number of blocks that currently exist, free or checked out
    total_blocks: AtomicUsize,
    free_blocks: ConcurrentFreeList<ArenaBlock>,
}
impl ArenaBlockPool {
    pub fn new(config: ArenaBlockPoolConfig) -> Result<Self, AllocError> {
        config.validate()?;
        Ok(Self {
            config,
            numa: None,
            total_blocks: AtomicUsize::new(0),
            free_blocks: ConcurrentFreeList::new(),
        })
    }

    /// Source every block through `numa` rather than the global allocator
    pub fn with_numa(config: ArenaBlockPoolConfig, numa: NumaAffinity) -> Result<Self, AllocError> {
        let mut ret = Self::new(config)?;
        ret.numa = Some(numa);
        Ok(ret)
    }

    pub fn allocate_block(&self) -> Result<ArenaBlock, AllocError> {
        let trace_span = tracing::span!(Level::TRACE, "ArenaBlockPool::allocate_block");
        let _span_enter = trace_span.enter();

        if let Some(block) = self.free_blocks.pop() {
            tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(block.memory), "reused block");
            return Ok(block);
        }

        let memory = self.raw_alloc()?;
        let total = self.total_blocks.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            ptr = ?UsizePtr::from(memory),
            block_size = self.config.block_size,
            total_blocks = total,
            numa_node = ?self.numa_node(),
            "arena block pool grew"
        );
        Ok(ArenaBlock {
            memory,
            size: self.config.block_size,
        })
    }

    /// Return a block for reuse. The memory stays allocated.
    pub fn free_block(&self, block: ArenaBlock) {
        debug_assert_eq!(block.size, self.config.block_size);
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(block.memory), "ArenaBlockPool::free_block");
        self.free_blocks.push(block);
    }

    /// Release every free block's memory back to where it came from
    ///
    /// All blocks are expected to have been returned. Calling this again
    /// is harmless.
    pub fn clean_up(&self) {
        let blocks = self.free_blocks.clear();
        let total = self.total_blocks.load(Ordering::Relaxed);
        debug_assert_eq!(
            blocks.len(),
            total,
            "arena blocks still checked out during clean up"
        );
        if !blocks.is_empty() {
            tracing::debug!(
                num_blocks = blocks.len(),
                bytes = blocks.len() * self.config.block_size,
                "arena block pool cleaning up"
            );
        }
        self.total_blocks.fetch_sub(blocks.len(), Ordering::Relaxed);
        for block in blocks {
            self.raw_free(block);
        }
    }

    pub fn get_block_size(&self) -> usize {
        self.config.block_size
    }

    /// Bytes of block memory currently held, free or checked out
    pub fn get_memory_usage(&self) -> usize {
        self.total_blocks() * self.config.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks.load(Ordering::Relaxed)
    }

    pub fn free_blocks(&self) -> usize {
        self.free_blocks.len()
    }

    pub fn numa_node(&self) -> Option<u32> {
        self.numa.as_ref().map(NumaAffinity::node)
    }

    pub fn show(&self) -> String {
        let node = match self.numa_node() {
            Some(node) => node.to_string(),
            None => "none".to_string(),
        };
        format!(
            "ArenaBlockPool\n  numa node    = {}\n  block size   = {} ({})\n  total blocks = {}\n  free blocks  = {}\n",
            node,
            self.config.block_size,
            human_bytes(self.config.block_size),
            self.total_blocks(),
            self.free_blocks(),
        )
    }

    fn raw_alloc(&self) -> Result<NonNull<u8>, AllocError> {
        let size = self.config.block_size;
        let alignment = self.config.block_alignment;
        let ptr = match &self.numa {
            Some(numa) => (numa.alloc)(size, alignment),
            None => {
                let layout = Layout::from_size_align(size, alignment)
                    .map_err(|_| AllocError::InvalidConfig("bad arena block layout"))?;
                // safety: config validation guarantees a non-zero size
                NonNull::new(unsafe { alloc::alloc(layout) })
            }
        };
        match ptr {
            Some(ptr) => {
                debug_assert_eq!(ptr.as_ptr() as usize % alignment, 0);
                Ok(ptr)
            }
            None => {
                tracing::error!(size, alignment, "failed to allocate arena block");
                Err(AllocError::SystemAllocFailed { size, alignment })
            }
        }
    }

    fn raw_free(&self, block: ArenaBlock) {
        match &self.numa {
            Some(numa) => (numa.free)(block.memory, block.size),
            None => unsafe {
                // safety: this is the same layout raw_alloc used,
                // and the block came from this pool
                let layout = Layout::from_size_align_unchecked(block.size, self.config.block_alignment);
                alloc::dealloc(block.memory.as_ptr(), layout);
            },
        }
    }
}
impl Drop for ArenaBlockPool {
    fn drop(&mut self) {
        self.clean_up();
    }
}
impl Debug for ArenaBlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaBlockPool")
            .field("@addr", &(self as *const _))
            .field("config", &self.config)
            .field("numa", &self.numa)
            .field("total_blocks", &self.total_blocks())
            .field("free_blocks", &self.free_blocks)
            .finish()
    }
}

/// Something that can capture its allocation cursor and later restore it
pub trait Rewind {
    type Mark: Copy;

    fn mark(&self) -> Self::Mark;
    fn rewind(&mut self, mark: Self::Mark);

    /// Undo every allocation made through the returned guard when it drops
    fn scoped(&mut self) -> ScopedArenaMem<'_, Self>
    where
        Self: Sized,
    {
        ScopedArenaMem::new(self)
    }
}

/// Scoped sub-allocation
///
/// Captures the arena's cursor on construction and restores it on drop,
/// whichever way the scope is left. Allocate through the guard itself.
pub struct ScopedArenaMem<'a, A: Rewind> {
    arena: &'a mut A,
    mark: A::Mark,
}
impl<'a, A: Rewind> ScopedArenaMem<'a, A> {
    pub fn new(arena: &'a mut A) -> Self {
        let mark = arena.mark();
        Self { arena, mark }
    }
}
impl<'a, A: Rewind> Drop for ScopedArenaMem<'a, A> {
    fn drop(&mut self) {
        self.arena.rewind(self.mark);
    }
}
impl<'a, A: Rewind> Deref for ScopedArenaMem<'a, A> {
    type Target = A;

    fn deref(&self) -> &A {
        self.arena
    }
}
impl<'a, A: Rewind> DerefMut for ScopedArenaMem<'a, A> {
    fn deref_mut(&mut self) -> &mut A {
        self.arena
    }
}

/// Single-threaded bump allocator that grows by checking out pool blocks
pub struct Arena {
    block_pool: Option<Arc<ArenaBlockPool>>,
    /// Every block this arena has checked out, the active one last
    blocks: Vec<ArenaBlock>,
    /// Offset of the bump cursor within the active block
    cursor: usize,
}
impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
impl Arena {
    /// An uninitialized arena. Every allocation fails until [Arena::init].
    pub fn new() -> Self {
        Self {
            block_pool: None,
            blocks: Vec::new(),
            cursor: 0,
        }
    }

    pub fn with_pool(block_pool: Arc<ArenaBlockPool>) -> Result<Self, AllocError> {
        let mut ret = Self::new();
        ret.init(block_pool)?;
        Ok(ret)
    }

    /// Bind to `block_pool` and check out the first block
    pub fn init(&mut self, block_pool: Arc<ArenaBlockPool>) -> Result<(), AllocError> {
        self.clean_up();
        self.block_pool = Some(block_pool);
        self.alloc_new_block()
    }

    /// Give every block back and unbind from the pool
    pub fn clean_up(&mut self) {
        self.release_all_blocks();
        self.block_pool = None;
    }

    /// Give every block back and start again from a single block
    pub fn clear(&mut self) -> Result<(), AllocError> {
        self.release_all_blocks();
        self.alloc_new_block()
    }

    pub fn alloc(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(is_power_of_two(alignment));
        let size = cmp::max(size, ALLOC_MIN_GRANULE);
        let alignment = cmp::max(alignment, ALLOC_MIN_GRANULE);

        if self.blocks.is_empty() {
            return Err(AllocError::NotInitialized);
        }
        debug_assert!(self.is_valid());

        if let Some(ptr) = self.bump(size, alignment) {
            return Ok(ptr);
        }

        // doesn't fit in what's left of the active block, try exactly one fresh one
        let prev_cursor = self.cursor;
        self.alloc_new_block()?;
        if let Some(ptr) = self.bump(size, alignment) {
            return Ok(ptr);
        }

        // the request can never fit, so put everything back the way it was
        if let (Some(block), Some(block_pool)) = (self.blocks.pop(), &self.block_pool) {
            block_pool.free_block(block);
        }
        self.cursor = prev_cursor;
        let block_size = self.get_block_size();
        tracing::error!(size, alignment, block_size, "arena allocation larger than a block");
        Err(AllocError::BlockTooSmall {
            size,
            alignment,
            block_size,
        })
    }

    pub fn alloc_default(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.alloc(size, ARENA_DEFAULT_ALIGNMENT)
    }

    pub fn alloc_layout(&mut self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        self.alloc(layout.size(), layout.align())
    }

    /// Move `value` into arena memory
    ///
    /// The arena never runs destructors, so `value` is effectively leaked
    /// unless the caller drops it in place before rewinding.
    pub fn alloc_value<T>(&mut self, value: T) -> Result<NonNull<T>, AllocError> {
        let ptr = self.alloc_layout(Layout::new::<T>())?.cast::<T>();
        unsafe {
            // safety: freshly allocated, correctly sized and aligned for T
            ptr.as_ptr().write(value);
        }
        Ok(ptr)
    }

    /// Allocate `n` contiguous `T`s, constructing element `i` with `f(i)`
    pub fn alloc_array_with<T, F>(&mut self, n: usize, mut f: F) -> Result<NonNull<T>, AllocError>
    where
        F: FnMut(usize) -> T,
    {
        let layout = Layout::array::<T>(n).map_err(|_| AllocError::LayoutOverflow)?;
        let ptr = self.alloc_layout(layout)?.cast::<T>();
        for i in 0..n {
            unsafe {
                // safety: in bounds of the allocation we just made
                ptr.as_ptr().add(i).write(f(i));
            }
        }
        Ok(ptr)
    }

    /// Current cursor, or `None` when uninitialized
    pub fn get_ptr(&self) -> Option<NonNull<u8>> {
        let block = self.blocks.last()?;
        // safety: cursor never exceeds the block size
        Some(unsafe { NonNull::new_unchecked(block.memory.as_ptr().add(self.cursor)) })
    }

    /// Rewind the cursor to a value previously returned by [Arena::get_ptr]
    ///
    /// Blocks checked out after the one containing `ptr` go back to the pool.
    /// `None` rewinds all the way, keeping only the oldest block.
    pub fn set_ptr(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            if self.blocks.is_empty() {
                return;
            }
            self.release_blocks_after(0);
            self.cursor = 0;
            return;
        };

        debug_assert!(self.is_valid_ptr(ptr));
        let addr = ptr.as_ptr() as usize;
        let Some(idx) = self.blocks.iter().rposition(|block| block.contains(addr)) else {
            debug_assert!(false, "set_ptr with a pointer this arena doesn't own");
            return;
        };
        self.release_blocks_after(idx);
        self.cursor = addr - self.blocks[idx].addr();
        debug_assert!(self.is_valid());
    }

    pub fn get_block_size(&self) -> usize {
        self.block_pool
            .as_ref()
            .map(|pool| pool.get_block_size())
            .unwrap_or(0)
    }

    pub fn get_block_pool(&self) -> Option<&Arc<ArenaBlockPool>> {
        self.block_pool.as_ref()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_valid(&self) -> bool {
        match self.blocks.last() {
            Some(block) => self.block_pool.is_some() && self.cursor <= block.size,
            None => self.cursor == 0,
        }
    }

    /// Whether `ptr` lies within memory this arena has handed out
    pub fn is_valid_ptr(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let Some((active, rest)) = self.blocks.split_last() else {
            return false;
        };
        if addr >= active.addr() && addr <= active.addr() + self.cursor {
            return true;
        }
        rest.iter().any(|block| block.contains(addr))
    }

    fn bump(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        let block = self.blocks.last()?;
        let base = block.addr();
        let start = align_up(base + self.cursor, alignment);
        let end = start.checked_add(size)?;
        if end > block.end_addr() {
            return None;
        }
        self.cursor = end - base;
        // safety: start..end lies within the block
        let ptr = unsafe { NonNull::new_unchecked(block.memory.as_ptr().add(start - base)) };
        if cfg!(debug_assertions) {
            unsafe {
                // safety: we just handed out exactly these bytes
                ptr.as_ptr().write_bytes(ARENA_DEBUG_FILL, size);
            }
        }
        Some(ptr)
    }

    fn alloc_new_block(&mut self) -> Result<(), AllocError> {
        let block = match &self.block_pool {
            Some(block_pool) => block_pool.allocate_block()?,
            None => return Err(AllocError::NotInitialized),
        };
        self.blocks.push(block);
        self.cursor = 0;
        Ok(())
    }

    fn release_blocks_after(&mut self, idx: usize) {
        if let Some(block_pool) = &self.block_pool {
            for block in self.blocks.drain(idx + 1..).rev() {
                block_pool.free_block(block);
            }
        }
    }

    fn release_all_blocks(&mut self) {
        if let Some(block_pool) = &self.block_pool {
            for block in self.blocks.drain(..).rev() {
                block_pool.free_block(block);
            }
        }
        self.cursor = 0;
    }
}
impl Rewind for Arena {
    type Mark = Option<NonNull<u8>>;

    fn mark(&self) -> Self::Mark {
        self.get_ptr()
    }

    fn rewind(&mut self, mark: Self::Mark) {
        self.set_ptr(mark);
    }
}
impl Drop for Arena {
    fn drop(&mut self) {
        self.clean_up();
    }
}
impl Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("@addr", &(self as *const _))
            .field("block_size", &self.get_block_size())
            .field("blocks", &self.blocks)
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests;
