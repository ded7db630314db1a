//! Minimal test-and-test-and-set spin lock
//!
//! Critical sections in this crate are a handful of stores (pushing onto a
//! free list, OR-ing bits into a pending-free bitmap), so spinning is
//! cheaper than parking. It also keeps the lock modelable under loom.

use std::{
    cell::UnsafeCell,
    fmt::Debug,
    ops::{Deref, DerefMut},
    sync::atomic::Ordering,
};

use crate::loom_testing::*;

pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}
// safety: the lock guarantees only one thread accesses `data` at a time,
// and the guard can hand the contents to whichever thread holds it
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if self.locked.load(Ordering::Relaxed) {
                spin_hint();
                continue;
            }
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockGuard(self);
            }
        }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard(self))
    }

    /// No locking needed, we have exclusive access
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}
impl<T> Debug for SpinLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // we don't know that the lock is held, so don't look inside
        f.debug_struct("SpinLock")
            .field("@addr", &(self as *const _))
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish()
    }
}

pub struct SpinLockGuard<'lock, T>(&'lock SpinLock<T>);
impl<'lock, T> Drop for SpinLockGuard<'lock, T> {
    fn drop(&mut self) {
        self.0.locked.store(false, Ordering::Release);
    }
}
impl<'lock, T> Deref for SpinLockGuard<'lock, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // safety: the lock is held for the lifetime of the guard
        unsafe { &*self.0.data.get() }
    }
}
impl<'lock, T> DerefMut for SpinLockGuard<'lock, T> {
    fn deref_mut(&mut self) -> &mut T {
        // safety: the lock is held for the lifetime of the guard
        unsafe { &mut *self.0.data.get() }
    }
}
impl<'lock, T: Debug> Debug for SpinLockGuard<'lock, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // lock is held, so we can print the contents
        f.debug_struct("SpinLockGuard")
            .field("@lock", &(self.0 as *const _))
            .field("data", &**self)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn spin_lock_basic() {
        let lock = SpinLock::new(5);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.try_lock().is_none());
        }
        assert_eq!(*lock.try_lock().unwrap(), 6);
        assert_eq!(lock.into_inner(), 6);
    }

    #[cfg(not(loom))]
    #[test]
    fn spin_lock_threads() {
        let lock = SpinLock::new(0usize);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(*lock.lock(), 4000);
    }

    #[cfg(loom)]
    #[test]
    fn spin_lock_loom() {
        loom::model(|| {
            let lock = &*Box::leak(Box::new(SpinLock::new(0usize)));

            let t0 = loom::thread::spawn(move || {
                *lock.lock() += 1;
            });
            let t1 = loom::thread::spawn(move || {
                *lock.lock() += 2;
            });

            t0.join().unwrap();
            t1.join().unwrap();

            assert_eq!(*lock.lock(), 3);
        })
    }
}
