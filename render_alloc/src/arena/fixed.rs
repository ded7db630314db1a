//! Bidirectional bump allocator over one caller-supplied buffer

use std::{
    alloc::Layout,
    cmp,
    fmt::Debug,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

use crate::{
    config::ALLOC_MIN_GRANULE,
    error::AllocError,
    util::{align_down, align_up, is_power_of_two, UsizePtr},
};

use super::Rewind;

const FIXED_ARENA_LOW_FILL: u8 = 0xa0;
const FIXED_ARENA_HIGH_FILL: u8 = 0xad;

/// Bump allocator that grows upward from the bottom and downward from the
/// top of a single buffer
///
/// Never grows and never owns memory. The low cursor is always at or below
/// the high cursor.
pub struct FixedArena<'buf> {
    base: NonNull<u8>,
    size: usize,
    /// Offset of the low cursor, grows up
    low: usize,
    /// Offset of the high cursor, grows down
    high: usize,
    _p: PhantomData<&'buf mut [u8]>,
}
// safety: this is a unique borrow of plain bytes
unsafe impl<'buf> Send for FixedArena<'buf> {}
impl<'buf> Default for FixedArena<'buf> {
    fn default() -> Self {
        Self::empty()
    }
}
impl<'buf> FixedArena<'buf> {
    pub fn new(buf: &'buf mut [u8]) -> Self {
        let mut ret = Self::empty();
        ret.init(buf);
        ret
    }

    /// An arena with zero capacity
    pub fn empty() -> Self {
        Self {
            base: NonNull::dangling(),
            size: 0,
            low: 0,
            high: 0,
            _p: PhantomData,
        }
    }

    pub fn init(&mut self, buf: &'buf mut [u8]) {
        self.base = NonNull::from(&mut *buf).cast::<u8>();
        self.size = buf.len();
        self.clear();
    }

    /// Forget the buffer
    pub fn clean_up(&mut self) {
        *self = Self::empty();
    }

    /// Rewind both cursors to the ends of the buffer
    pub fn clear(&mut self) {
        self.low = 0;
        self.high = self.size;
    }

    pub fn get_capacity(&self) -> usize {
        self.size
    }

    pub fn get_free(&self) -> usize {
        self.high - self.low
    }

    /// Bytes available to an allocation with the given alignment
    ///
    /// Alignment padding at both cursors is not counted as free.
    pub fn get_free_aligned(&self, alignment: usize) -> usize {
        let alignment = cmp::max(alignment, ALLOC_MIN_GRANULE);
        let low = align_up(self.addr_of(self.low), alignment);
        let high = align_down(self.addr_of(self.high), alignment);
        high.saturating_sub(low)
    }

    pub fn get_low_usage(&self) -> usize {
        self.low
    }

    pub fn get_high_usage(&self) -> usize {
        self.size - self.high
    }

    /// Align the low cursor. Never moves it past the high cursor.
    pub fn align(&mut self, alignment: usize) {
        debug_assert!(is_power_of_two(alignment));
        self.low = cmp::min(self.aligned_low(alignment), self.high);
    }

    /// Align the low cursor, zeroing the bytes skipped over
    pub fn align_clear_to_zero(&mut self, alignment: usize) {
        let old_low = self.low;
        self.align(alignment);
        unsafe {
            // safety: old_low..low lies within the buffer we borrow
            self.ptr_at(old_low)
                .as_ptr()
                .write_bytes(0, self.low - old_low);
        }
    }

    pub fn alloc(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(self.is_valid());
        debug_assert!(is_power_of_two(alignment));
        let size = cmp::max(size, ALLOC_MIN_GRANULE);
        let alignment = cmp::max(alignment, ALLOC_MIN_GRANULE);

        let start = self.aligned_low(alignment);
        match start.checked_add(size) {
            Some(end) if end <= self.high => {
                self.low = end;
                let ptr = self.ptr_at(start);
                if cfg!(debug_assertions) {
                    unsafe {
                        // safety: we just handed out exactly these bytes
                        ptr.as_ptr().write_bytes(FIXED_ARENA_LOW_FILL, size);
                    }
                }
                Ok(ptr)
            }
            _ => Err(self.out_of_memory(size, alignment)),
        }
    }

    pub fn alloc_high(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(self.is_valid());
        debug_assert!(is_power_of_two(alignment));
        let size = cmp::max(size, ALLOC_MIN_GRANULE);
        let alignment = cmp::max(alignment, ALLOC_MIN_GRANULE);

        let start = self
            .addr_of(self.high)
            .checked_sub(size)
            .map(|start| align_down(start, alignment))
            .filter(|&start| start >= self.addr_of(self.low));
        match start {
            Some(start) => {
                self.high = start - self.addr_of(0);
                let ptr = self.ptr_at(self.high);
                if cfg!(debug_assertions) {
                    unsafe {
                        // safety: we just handed out exactly these bytes
                        ptr.as_ptr().write_bytes(FIXED_ARENA_HIGH_FILL, size);
                    }
                }
                Ok(ptr)
            }
            None => Err(self.out_of_memory(size, alignment)),
        }
    }

    /// Move `value` into the low end. It will never be dropped by the arena.
    pub fn alloc_value<T>(&mut self, value: T) -> Result<NonNull<T>, AllocError> {
        let layout = Layout::new::<T>();
        let ptr = self.alloc(layout.size(), layout.align())?.cast::<T>();
        unsafe {
            // safety: freshly allocated, correctly sized and aligned for T
            ptr.as_ptr().write(value);
        }
        Ok(ptr)
    }

    /// Move `value` into the high end. It will never be dropped by the arena.
    pub fn alloc_high_value<T>(&mut self, value: T) -> Result<NonNull<T>, AllocError> {
        let layout = Layout::new::<T>();
        let ptr = self.alloc_high(layout.size(), layout.align())?.cast::<T>();
        unsafe {
            // safety: freshly allocated, correctly sized and aligned for T
            ptr.as_ptr().write(value);
        }
        Ok(ptr)
    }

    pub fn get_ptr(&self) -> NonNull<u8> {
        self.ptr_at(self.low)
    }

    pub fn get_high_ptr(&self) -> NonNull<u8> {
        self.ptr_at(self.high)
    }

    pub fn set_ptr(&mut self, ptr: NonNull<u8>) {
        let off = self.offset_of(ptr);
        debug_assert!(off <= self.high, "low cursor moved past high cursor");
        self.low = cmp::min(off, self.high);
    }

    pub fn set_high_ptr(&mut self, ptr: NonNull<u8>) {
        let off = self.offset_of(ptr);
        debug_assert!(off >= self.low && off <= self.size);
        self.high = off.clamp(self.low, self.size);
    }

    /// Restore the high cursor when the returned guard drops
    pub fn scoped_high(&mut self) -> ScopedHighArenaMem<'_, 'buf> {
        ScopedHighArenaMem::new(self)
    }

    pub fn is_valid(&self) -> bool {
        self.low <= self.high && self.high <= self.size
    }

    fn addr_of(&self, off: usize) -> usize {
        self.base.as_ptr() as usize + off
    }

    fn offset_of(&self, ptr: NonNull<u8>) -> usize {
        let off = (ptr.as_ptr() as usize).wrapping_sub(self.addr_of(0));
        debug_assert!(off <= self.size, "pointer not inside this arena");
        cmp::min(off, self.size)
    }

    fn aligned_low(&self, alignment: usize) -> usize {
        align_up(self.addr_of(self.low), alignment) - self.addr_of(0)
    }

    fn ptr_at(&self, off: usize) -> NonNull<u8> {
        debug_assert!(off <= self.size);
        // safety: off is at most one past the end of the buffer
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(off)) }
    }

    fn out_of_memory(&self, size: usize, alignment: usize) -> AllocError {
        let available = self.get_free_aligned(alignment);
        tracing::warn!(size, alignment, available, "fixed arena out of memory");
        AllocError::OutOfMemory {
            size,
            alignment,
            available,
        }
    }
}
impl<'buf> Rewind for FixedArena<'buf> {
    type Mark = NonNull<u8>;

    fn mark(&self) -> Self::Mark {
        self.get_ptr()
    }

    fn rewind(&mut self, mark: Self::Mark) {
        self.set_ptr(mark);
    }
}
impl<'buf> Debug for FixedArena<'buf> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedArena")
            .field("base", &UsizePtr::from(self.base))
            .field("size", &self.size)
            .field("low", &self.low)
            .field("high", &self.high)
            .finish()
    }
}

/// Restores a [FixedArena]'s high cursor on drop
pub struct ScopedHighArenaMem<'a, 'buf> {
    arena: &'a mut FixedArena<'buf>,
    mark: NonNull<u8>,
}
impl<'a, 'buf> ScopedHighArenaMem<'a, 'buf> {
    pub fn new(arena: &'a mut FixedArena<'buf>) -> Self {
        let mark = arena.get_high_ptr();
        Self { arena, mark }
    }
}
impl<'a, 'buf> Drop for ScopedHighArenaMem<'a, 'buf> {
    fn drop(&mut self) {
        self.arena.set_high_ptr(self.mark);
    }
}
impl<'a, 'buf> Deref for ScopedHighArenaMem<'a, 'buf> {
    type Target = FixedArena<'buf>;

    fn deref(&self) -> &Self::Target {
        self.arena
    }
}
impl<'a, 'buf> DerefMut for ScopedHighArenaMem<'a, 'buf> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.arena
    }
}
