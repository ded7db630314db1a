//! Fixed-capacity bump pool for a single type

use std::{
    alloc::{self, Layout},
    fmt::Debug,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

use crate::error::AllocError;

/// Hands out contiguous runs of uninitialized `T` storage from one buffer
///
/// Values are never constructed or dropped by the pool. [Self::clear]
/// makes all of the storage available again.
pub struct TypedStaticPool<T> {
    storage: NonNull<T>,
    capacity: usize,
    num_allocated: usize,
    _p: PhantomData<T>,
}
// safety: the pool exclusively owns its buffer
unsafe impl<T: Send> Send for TypedStaticPool<T> {}

impl<T> TypedStaticPool<T> {
    pub fn new(capacity: usize) -> Result<Self, AllocError> {
        let layout = Layout::array::<T>(capacity).map_err(|_| AllocError::LayoutOverflow)?;
        let storage = if layout.size() == 0 {
            NonNull::dangling()
        } else {
            // safety: layout has nonzero size
            NonNull::new(unsafe { alloc::alloc(layout) }.cast::<T>()).ok_or(
                AllocError::SystemAllocFailed {
                    size: layout.size(),
                    alignment: layout.align(),
                },
            )?
        };
        Ok(Self {
            storage,
            capacity,
            num_allocated: 0,
            _p: PhantomData,
        })
    }

    /// Storage for `n` contiguous `T`s, or `None` if it would exceed capacity
    pub fn allocate(&mut self, n: usize) -> Option<NonNull<T>> {
        let end = self.num_allocated.checked_add(n)?;
        if end > self.capacity {
            return None;
        }
        // safety: num_allocated <= capacity, so this stays in (or one past) the buffer
        let ptr = unsafe { NonNull::new_unchecked(self.storage.as_ptr().add(self.num_allocated)) };
        self.num_allocated = end;
        Some(ptr)
    }

    pub fn clear(&mut self) {
        self.num_allocated = 0;
    }

    /// Clear the pool when the returned guard drops
    pub fn scoped_clear(&mut self) -> TypedStaticPoolClearGuard<'_, T> {
        TypedStaticPoolClearGuard(self)
    }

    pub fn len(&self) -> usize {
        self.num_allocated
    }

    pub fn is_empty(&self) -> bool {
        self.num_allocated == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
impl<T> Drop for TypedStaticPool<T> {
    fn drop(&mut self) {
        if let Ok(layout) = Layout::array::<T>(self.capacity) {
            if layout.size() != 0 {
                unsafe {
                    // safety: allocated in new with this layout
                    alloc::dealloc(self.storage.as_ptr().cast::<u8>(), layout);
                }
            }
        }
    }
}
impl<T> Debug for TypedStaticPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedStaticPool")
            .field("type", &std::any::type_name::<T>())
            .field("capacity", &self.capacity)
            .field("num_allocated", &self.num_allocated)
            .finish()
    }
}

pub struct TypedStaticPoolClearGuard<'pool, T>(&'pool mut TypedStaticPool<T>);
impl<'pool, T> Drop for TypedStaticPoolClearGuard<'pool, T> {
    fn drop(&mut self) {
        self.0.clear();
    }
}
impl<'pool, T> Deref for TypedStaticPoolClearGuard<'pool, T> {
    type Target = TypedStaticPool<T>;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}
impl<'pool, T> DerefMut for TypedStaticPoolClearGuard<'pool, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0
    }
}
