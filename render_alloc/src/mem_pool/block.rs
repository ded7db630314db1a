//! Two-level bitmap allocator for fixed-size entries
//!
//! A [MemBlock] hands out entries from a contiguous region. Which entries
//! are in use is tracked in one leaf word per group of entries, plus two
//! internal summary words recording which leaves are completely full and
//! completely empty.
//!
//! The summaries and leaves belong to whichever thread currently owns the
//! block. Other threads that free entries don't touch them at all. Instead,
//! they OR the entries into a separate pending bitmap under a spin lock,
//! which the owner folds back in with [MemBlock::process_pending_free_list].

use std::{cell::UnsafeCell, cmp, fmt::Debug, ptr::NonNull, sync::atomic::Ordering};

use crate::{loom_testing::*, spin::SpinLock, util::UsizePtr};

use super::bits::{BitWord, ConstGenericsHackWorkaround};

const FULL_RESET_DEBUG_FILL: u8 = 0xbc;
const FAST_RESET_DEBUG_FILL: u8 = 0xbd;
const FREED_ENTRY_DEBUG_FILL: u8 = 0xbe;

/// Bitmaps that only the owning thread may touch
struct OwnerState<I: BitWord, L: BitWord> {
    /// Conservative, i.e. doesn't include unprocessed pending frees
    num_free_entries: usize,
    /// One bit per leaf, set if every entry in the leaf is in use
    internal_full: I,
    /// One bit per leaf, set if no entry in the leaf is in use
    internal_empty: I,
    /// One bit per entry, set if in use
    used_entries: I::ArrayTy<L>,
}
impl<I: BitWord, L: BitWord> OwnerState<I, L> {
    fn new(num_entries: usize) -> Self {
        Self {
            num_free_entries: num_entries,
            internal_full: I::ZERO,
            internal_empty: I::ONES,
            used_entries: I::ArrayTy::<L>::init(L::ZERO),
        }
    }
}

/// Entries freed by other threads that the owner hasn't processed yet
struct PendingFree<I: BitWord, L: BitWord> {
    /// One bit per leaf, set if `free_entries` for that leaf is nonzero
    internal_free: I,
    free_entries: I::ArrayTy<L>,
}
impl<I: BitWord, L: BitWord> PendingFree<I, L> {
    fn new() -> Self {
        Self {
            internal_free: I::ZERO,
            free_entries: I::ArrayTy::<L>::init(L::ZERO),
        }
    }

    fn is_clear(&self) -> bool {
        self.internal_free == I::ZERO && self.free_entries.as_slice().iter().all(|&x| x == L::ZERO)
    }
}

/// Fixed-capacity allocator of `I::BITS * L::BITS` equal-size entries
#[repr(align(64))]
pub struct MemBlock<I: BitWord, L: BitWord> {
    entry_memory: NonNull<u8>,
    entry_stride: usize,
    owner: UnsafeCell<OwnerState<I, L>>,
    /// Set whenever `pending` holds anything, so the owner can skip the lock
    has_pending: AtomicBool,
    pending: SpinLock<PendingFree<I, L>>,
}
// safety: the block doesn't own the entries, it only does address arithmetic on them
unsafe impl<I: BitWord, L: BitWord> Send for MemBlock<I, L> {}
// safety: other threads can only reach the pending bitmap, which is locked.
// Owner state is only mutated through &mut self, or through the crate-internal
// owner_* functions by the one pool that has the block checked out.
unsafe impl<I: BitWord, L: BitWord> Sync for MemBlock<I, L> {}

impl<I: BitWord, L: BitWord> MemBlock<I, L> {
    pub const NUM_LEAF_NODES: usize = I::BITS as usize;
    pub const ENTRIES_PER_LEAF_NODE: usize = L::BITS as usize;
    pub const NUM_ENTRIES: usize = Self::NUM_LEAF_NODES * Self::ENTRIES_PER_LEAF_NODE;
    const NUM_ENTRIES_CHECK: () = assert!(Self::NUM_ENTRIES % 32 == 0);

    /// Create an empty block over `NUM_ENTRIES * entry_stride` bytes at `entry_memory`
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes for as long as the
    /// block is in use, and must only be accessed through entries this block
    /// has handed out.
    pub unsafe fn new(entry_memory: NonNull<u8>, entry_stride: usize) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::NUM_ENTRIES_CHECK;
        debug_assert!(entry_stride > 0);
        Self {
            entry_memory,
            entry_stride,
            owner: UnsafeCell::new(OwnerState::new(Self::NUM_ENTRIES)),
            has_pending: AtomicBool::new(false),
            pending: SpinLock::new(PendingFree::new()),
        }
    }

    /// Forget every allocation, including pending frees
    pub fn full_reset(&mut self) {
        // safety: &mut self is exclusive
        unsafe { self.owner_full_reset() }
    }

    /// Reset a block that is already known to be empty
    pub fn fast_reset(&mut self) {
        // safety: &mut self is exclusive
        unsafe { self.owner_fast_reset() }
    }

    /// Allocate up to `num_entries` entries, appending them to `entries`
    ///
    /// Returns how many were allocated, which is
    /// `min(num_entries, self.get_num_free_entries())`.
    pub fn alloc_list(&mut self, num_entries: usize, entries: &mut Vec<NonNull<u8>>) -> usize {
        // safety: &mut self is exclusive
        unsafe { self.owner_alloc_list(num_entries, entries) }
    }

    /// Fold pending frees into the main bitmaps, returning how many there were
    pub fn process_pending_free_list(&mut self) -> usize {
        // safety: &mut self is exclusive
        unsafe { self.owner_process_pending_free_list() }
    }

    /// Hand entries back from any thread
    ///
    /// They only become allocatable again after the owner next calls
    /// [Self::process_pending_free_list].
    pub fn add_to_pending_free_list(&self, entries: &[NonNull<u8>]) {
        debug_assert!(!entries.is_empty());

        if cfg!(debug_assertions) {
            for &entry in entries {
                let _ = self.entry_index(entry);
                unsafe {
                    // safety: caller is giving up the entry, which lies in our region
                    entry
                        .as_ptr()
                        .write_bytes(FREED_ENTRY_DEBUG_FILL, self.entry_stride);
                }
            }
        }

        let mut pending = self.pending.lock();
        for &entry in entries {
            let idx = self.entry_index(entry);
            let leaf_idx = idx >> L::SHIFT;
            let entry_bit = L::bit(idx & (Self::ENTRIES_PER_LEAF_NODE - 1));
            debug_assert!(
                pending.free_entries.as_slice()[leaf_idx] & entry_bit == L::ZERO,
                "entry freed twice"
            );
            pending.internal_free |= I::bit(leaf_idx);
            pending.free_entries.as_mut_slice()[leaf_idx] |= entry_bit;
        }
        self.has_pending.store(true, Ordering::Release);
    }

    pub fn is_full(&self) -> bool {
        self.owner_state().num_free_entries == 0
    }

    pub fn is_empty(&self) -> bool {
        self.owner_state().num_free_entries == Self::NUM_ENTRIES
    }

    pub fn get_num_free_entries(&self) -> usize {
        self.owner_state().num_free_entries
    }

    pub fn get_num_used_entries(&self) -> usize {
        Self::NUM_ENTRIES - self.owner_state().num_free_entries
    }

    pub fn get_base_entry_memory_address(&self) -> NonNull<u8> {
        self.entry_memory
    }

    pub fn get_entry_stride(&self) -> usize {
        self.entry_stride
    }

    /// Check that the summaries and the free count agree with the leaves
    pub fn is_valid(&self) -> bool {
        let owner = self.owner_state();
        if owner.internal_full & owner.internal_empty != I::ZERO {
            return false;
        }
        let mut num_used = 0;
        for (leaf_idx, &leaf) in owner.used_entries.as_slice().iter().enumerate() {
            let bit = I::bit(leaf_idx);
            let full = owner.internal_full & bit != I::ZERO;
            let empty = owner.internal_empty & bit != I::ZERO;
            if full != (leaf == L::ONES) || empty != (leaf == L::ZERO) {
                return false;
            }
            num_used += leaf.count_ones() as usize;
        }
        owner.num_free_entries == Self::NUM_ENTRIES - num_used
    }

    fn owner_state(&self) -> &OwnerState<I, L> {
        // safety: shared access to a block whose state is being mutated
        // concurrently can only come from inside this crate, and doesn't
        unsafe { &*self.owner.get() }
    }

    fn entry_ptr(&self, idx: usize) -> NonNull<u8> {
        debug_assert!(idx < Self::NUM_ENTRIES);
        // safety: idx is within the region this block was created over
        unsafe { NonNull::new_unchecked(self.entry_memory.as_ptr().add(idx * self.entry_stride)) }
    }

    fn entry_index(&self, entry: NonNull<u8>) -> usize {
        let offset = (entry.as_ptr() as usize).wrapping_sub(self.entry_memory.as_ptr() as usize);
        debug_assert!(
            offset % self.entry_stride == 0,
            "entry {:?} is misaligned",
            UsizePtr::from(entry)
        );
        let idx = offset / self.entry_stride;
        assert!(
            idx < Self::NUM_ENTRIES,
            "entry {:?} isn't in this block",
            UsizePtr::from(entry)
        );
        idx
    }

    /// # Safety
    ///
    /// Caller must own the block (see [Self::owner_alloc_list])
    pub(crate) unsafe fn owner_full_reset(&self) {
        *self.owner.get() = OwnerState::new(Self::NUM_ENTRIES);
        *self.pending.lock() = PendingFree::new();
        self.has_pending.store(false, Ordering::Relaxed);
        if cfg!(debug_assertions) {
            self.entry_memory
                .as_ptr()
                .write_bytes(FULL_RESET_DEBUG_FILL, Self::NUM_ENTRIES * self.entry_stride);
        }
    }

    /// # Safety
    ///
    /// Caller must own the block (see [Self::owner_alloc_list])
    pub(crate) unsafe fn owner_fast_reset(&self) {
        let owner = &mut *self.owner.get();
        debug_assert!(owner
            .used_entries
            .as_slice()
            .iter()
            .all(|&x| x == L::ZERO));
        debug_assert!(self.pending.lock().is_clear());
        owner.num_free_entries = Self::NUM_ENTRIES;
        owner.internal_full = I::ZERO;
        owner.internal_empty = I::ONES;
        self.has_pending.store(false, Ordering::Relaxed);
        if cfg!(debug_assertions) {
            self.entry_memory
                .as_ptr()
                .write_bytes(FAST_RESET_DEBUG_FILL, Self::NUM_ENTRIES * self.entry_stride);
        }
    }

    /// # Safety
    ///
    /// Caller must be the only thread touching the owner state, i.e. it
    /// either has `&mut self` or has this block checked out of a manager.
    pub(crate) unsafe fn owner_alloc_list(
        &self,
        num_entries: usize,
        entries: &mut Vec<NonNull<u8>>,
    ) -> usize {
        if num_entries == 0 {
            return 0;
        }
        let owner = &mut *self.owner.get();

        if num_entries == 1 || owner.num_free_entries < 2 {
            if owner.num_free_entries == 0 {
                return 0;
            }
            owner.num_free_entries -= 1;

            let leaf_idx = (!owner.internal_full).first_set();
            debug_assert!(leaf_idx < Self::NUM_LEAF_NODES);
            let leaf = &mut owner.used_entries.as_mut_slice()[leaf_idx];
            let entry_idx = (!*leaf).first_set();
            *leaf |= L::bit(entry_idx);

            let leaf_bit = I::bit(leaf_idx);
            if *leaf == L::ONES {
                owner.internal_full |= leaf_bit;
            }
            owner.internal_empty &= !leaf_bit;

            entries.push(self.entry_ptr((leaf_idx << L::SHIFT) + entry_idx));
            debug_assert!(self.is_valid());
            return 1;
        }

        let num_allocated = cmp::min(num_entries, owner.num_free_entries);
        owner.num_free_entries -= num_allocated;
        entries.reserve(num_allocated);
        let mut to_alloc = num_allocated;

        // whole empty leaves at a time
        while owner.internal_empty != I::ZERO && to_alloc >= Self::ENTRIES_PER_LEAF_NODE {
            let leaf_idx = owner.internal_empty.first_set();
            let leaf = &mut owner.used_entries.as_mut_slice()[leaf_idx];
            debug_assert!(*leaf == L::ZERO);
            *leaf = L::ONES;

            let leaf_bit = I::bit(leaf_idx);
            owner.internal_empty &= !leaf_bit;
            owner.internal_full |= leaf_bit;

            let first = leaf_idx << L::SHIFT;
            entries.extend((first..first + Self::ENTRIES_PER_LEAF_NODE).map(|i| self.entry_ptr(i)));
            to_alloc -= Self::ENTRIES_PER_LEAF_NODE;
        }

        // then bit by bit out of leaves that aren't full
        while to_alloc > 0 {
            let leaf_idx = (!owner.internal_full).first_set();
            debug_assert!(leaf_idx < Self::NUM_LEAF_NODES);
            let leaf = &mut owner.used_entries.as_mut_slice()[leaf_idx];
            let mut free = !*leaf;
            debug_assert!(free != L::ZERO);

            let first = leaf_idx << L::SHIFT;
            while free != L::ZERO && to_alloc > 0 {
                let entry_idx = free.first_set();
                free &= !L::bit(entry_idx);
                entries.push(self.entry_ptr(first + entry_idx));
                to_alloc -= 1;
            }
            *leaf = !free;

            let leaf_bit = I::bit(leaf_idx);
            if free == L::ZERO {
                owner.internal_full |= leaf_bit;
            }
            owner.internal_empty &= !leaf_bit;
        }

        debug_assert!(self.is_valid());
        num_allocated
    }

    /// # Safety
    ///
    /// Caller must own the block (see [Self::owner_alloc_list])
    pub(crate) unsafe fn owner_process_pending_free_list(&self) -> usize {
        let owner = &mut *self.owner.get();
        if !self.has_pending.load(Ordering::Acquire) || owner.num_free_entries == Self::NUM_ENTRIES
        {
            return 0;
        }

        let mut pending = self.pending.lock();
        self.has_pending.store(false, Ordering::Relaxed);

        let mut num_freed = 0;
        while pending.internal_free != I::ZERO {
            let leaf_idx = pending.internal_free.first_set();
            let leaf_bit = I::bit(leaf_idx);
            pending.internal_free &= !leaf_bit;

            let freed = pending.free_entries.as_slice()[leaf_idx];
            pending.free_entries.as_mut_slice()[leaf_idx] = L::ZERO;

            let leaf = &mut owner.used_entries.as_mut_slice()[leaf_idx];
            debug_assert!(*leaf & freed == freed, "freed an entry that wasn't in use");
            *leaf &= !freed;

            owner.internal_full &= !leaf_bit;
            if *leaf == L::ZERO {
                owner.internal_empty |= leaf_bit;
            }
            num_freed += freed.count_ones() as usize;
        }
        drop(pending);

        owner.num_free_entries += num_freed;
        debug_assert!(self.is_valid());
        num_freed
    }
}
impl<I: BitWord, L: BitWord> Debug for MemBlock<I, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlock")
            .field("@addr", &(self as *const _))
            .field("entry_memory", &UsizePtr::from(self.entry_memory))
            .field("entry_stride", &self.entry_stride)
            .field("num_entries", &Self::NUM_ENTRIES)
            .field("has_pending", &self.has_pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
