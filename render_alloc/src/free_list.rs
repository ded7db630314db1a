//! LIFO free lists of reusable items
//!
//! Items are owned values (memory blocks, block indices) rather than
//! intrusive links threaded through the items themselves.

use std::fmt::Debug;

use crate::spin::SpinLock;

/// Single-threaded LIFO stack
#[derive(Debug)]
pub struct FreeList<T> {
    items: Vec<T>,
}
impl<T> Default for FreeList<T> {
    fn default() -> Self {
        Self::new()
    }
}
impl<T> FreeList<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    /// Most recently pushed item first
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    /// Detach the whole list and return it, oldest item first
    pub fn clear(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Thread-safe LIFO stack
///
/// Push and pop are linearizable. [Self::len] is a snapshot and is only
/// meaningful when no other thread is concurrently mutating the list.
pub struct ConcurrentFreeList<T> {
    inner: SpinLock<FreeList<T>>,
}
impl<T: Send> Default for ConcurrentFreeList<T> {
    fn default() -> Self {
        Self::new()
    }
}
impl<T: Send> ConcurrentFreeList<T> {
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(FreeList::new()),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: SpinLock::new(FreeList::with_capacity(capacity)),
        }
    }

    pub fn push(&self, item: T) {
        self.inner.lock().push(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.lock().pop()
    }

    /// Atomically detach every item
    pub fn clear(&self) -> Vec<T> {
        self.inner.lock().clear()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
impl<T> Debug for ConcurrentFreeList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentFreeList")
            .field("inner", &self.inner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn free_list_lifo() {
        let mut list = FreeList::new();
        assert!(list.is_empty());
        list.push(1);
        list.push(2);
        list.push(3);
        assert_eq!(list.len(), 3);
        assert_eq!(list.pop(), Some(3));
        assert_eq!(list.clear(), vec![1, 2]);
        assert!(list.is_empty());
        assert_eq!(list.pop(), None);
    }

    #[cfg(not(loom))]
    #[test]
    fn concurrent_free_list_threads() {
        let list = ConcurrentFreeList::with_capacity(4000);
        for i in 0..4000u32 {
            list.push(i);
        }
        let mut popped = std::thread::scope(|s| {
            let handles = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let mut mine = Vec::new();
                        while let Some(x) = list.pop() {
                            mine.push(x);
                            // give some back to exercise interleaved push/pop
                            if x % 3 == 0 {
                                list.push(x + 10000);
                            }
                        }
                        mine
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        assert!(list.is_empty());
        popped.sort_unstable();
        let mut expected = (0..4000u32)
            .chain((0..4000u32).filter(|x| x % 3 == 0).map(|x| x + 10000))
            .collect::<Vec<_>>();
        expected.sort_unstable();
        assert_eq!(popped, expected);
    }

    #[cfg(loom)]
    #[test]
    fn concurrent_free_list_loom() {
        loom::model(|| {
            let list = &*Box::leak(Box::new(ConcurrentFreeList::new()));
            list.push(0u32);

            let t0 = loom::thread::spawn(move || {
                list.push(1);
                list.pop()
            });
            let t1 = loom::thread::spawn(move || list.pop());

            let a = t0.join().unwrap();
            let b = t1.join().unwrap();
            let rest = list.clear();

            let mut all = a.into_iter().chain(b).chain(rest).collect::<Vec<_>>();
            all.sort_unstable();
            assert_eq!(all, vec![0, 1]);
        })
    }
}
