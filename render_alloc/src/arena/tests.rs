use super::*;

use crate::config::ARENA_DEFAULT_ALIGNMENT;

use std::sync::atomic::AtomicUsize as StdAtomicUsize;

fn small_pool(block_size: usize) -> Arc<ArenaBlockPool> {
    Arc::new(ArenaBlockPool::new(ArenaBlockPoolConfig::with_block_size(block_size)).unwrap())
}

#[cfg(not(loom))]
fn assert_send<T: Send>() {}
#[cfg(not(loom))]
fn assert_sync<T: Sync>() {}

#[cfg(not(loom))]
#[test]
fn arena_types_are_send() {
    assert_send::<ArenaBlock>();
    assert_send::<Arena>();
    assert_send::<FixedArena<'static>>();
    assert_send::<ArenaBlockPool>();
    assert_sync::<ArenaBlockPool>();
}

#[cfg(not(loom))]
#[test]
fn pool_reuses_blocks_lifo() {
    let pool = ArenaBlockPool::new(ArenaBlockPoolConfig::with_block_size(4096)).unwrap();
    let a = pool.allocate_block().unwrap();
    let b = pool.allocate_block().unwrap();
    assert_eq!(a.size(), 4096);
    assert_eq!(a.as_ptr().as_ptr() as usize % 64, 0);
    assert_ne!(a.as_ptr(), b.as_ptr());
    assert_eq!(pool.total_blocks(), 2);
    assert_eq!(pool.free_blocks(), 0);
    assert_eq!(pool.get_memory_usage(), 8192);

    let a_ptr = a.as_ptr();
    pool.free_block(a);
    assert_eq!(pool.free_blocks(), 1);
    let c = pool.allocate_block().unwrap();
    assert_eq!(c.as_ptr(), a_ptr);
    assert_eq!(pool.total_blocks(), 2);

    pool.free_block(b);
    pool.free_block(c);
    assert_eq!(pool.free_blocks(), 2);
    pool.clean_up();
    assert_eq!(pool.total_blocks(), 0);
    assert_eq!(pool.free_blocks(), 0);
    // again is fine
    pool.clean_up();
    assert_eq!(pool.total_blocks(), 0);
}

#[cfg(not(loom))]
#[test]
fn pool_show() {
    let pool = ArenaBlockPool::new(ArenaBlockPoolConfig::with_block_size(4096)).unwrap();
    let block = pool.allocate_block().unwrap();
    let s = pool.show();
    println!("{}", s);
    assert!(s.contains("numa node    = none"));
    assert!(s.contains("block size   = 4096 (4.00 KiB)"));
    assert!(s.contains("total blocks = 1"));
    assert!(s.contains("free blocks  = 0"));
    pool.free_block(block);
}

#[cfg(not(loom))]
#[test]
fn pool_rejects_bad_config() {
    assert_eq!(
        ArenaBlockPool::new(ArenaBlockPoolConfig::with_block_size(3000)).unwrap_err(),
        AllocError::InvalidConfig("block_size must be a non-zero power of two")
    );
}

#[cfg(not(loom))]
#[test]
fn pool_numa_callbacks() {
    let allocs = Arc::new(StdAtomicUsize::new(0));
    let frees = Arc::new(StdAtomicUsize::new(0));
    let numa = {
        let allocs = allocs.clone();
        let frees = frees.clone();
        NumaAffinity::new(
            3,
            move |size, alignment| {
                allocs.fetch_add(1, Ordering::SeqCst);
                let layout = Layout::from_size_align(size, alignment).unwrap();
                NonNull::new(unsafe { alloc::alloc(layout) })
            },
            move |ptr, size| {
                frees.fetch_add(1, Ordering::SeqCst);
                let layout = Layout::from_size_align(size, 64).unwrap();
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            },
        )
    };
    let pool = Arc::new(
        ArenaBlockPool::with_numa(ArenaBlockPoolConfig::with_block_size(4096), numa).unwrap(),
    );
    assert_eq!(pool.numa_node(), Some(3));
    assert!(pool.show().contains("numa node    = 3"));

    {
        let mut arena = Arena::with_pool(pool.clone()).unwrap();
        arena.alloc(3000, 16).unwrap();
        arena.alloc(3000, 16).unwrap();
        assert_eq!(arena.num_blocks(), 2);
    }
    assert_eq!(allocs.load(Ordering::SeqCst), 2);
    assert_eq!(frees.load(Ordering::SeqCst), 0);

    drop(pool);
    assert_eq!(frees.load(Ordering::SeqCst), 2);
}

#[cfg(not(loom))]
#[test]
fn pool_numa_alloc_failure() {
    let numa = NumaAffinity::new(0, |_, _| None, |_, _| {});
    let pool = ArenaBlockPool::with_numa(ArenaBlockPoolConfig::with_block_size(4096), numa)
        .unwrap();
    assert_eq!(
        pool.allocate_block().unwrap_err(),
        AllocError::SystemAllocFailed {
            size: 4096,
            alignment: 64
        }
    );
    assert_eq!(pool.total_blocks(), 0);
}

#[cfg(not(loom))]
#[test]
fn arena_uninitialized() {
    let mut arena = Arena::new();
    assert_eq!(arena.alloc(16, 16).unwrap_err(), AllocError::NotInitialized);
    assert_eq!(arena.get_ptr(), None);
    assert_eq!(arena.get_block_size(), 0);
    assert!(arena.is_valid());
    // rewinding an empty arena does nothing
    arena.set_ptr(None);
    assert_eq!(arena.num_blocks(), 0);
}

#[cfg(not(loom))]
#[test]
fn arena_init_and_clean_up() {
    let pool = small_pool(4096);
    let mut arena = Arena::new();
    arena.init(pool.clone()).unwrap();
    assert_eq!(arena.num_blocks(), 1);
    assert_eq!(arena.get_block_size(), 4096);
    assert_eq!(pool.total_blocks(), 1);
    assert_eq!(pool.free_blocks(), 0);

    arena.clean_up();
    assert_eq!(arena.num_blocks(), 0);
    assert!(arena.get_block_pool().is_none());
    assert_eq!(pool.free_blocks(), 1);
    assert_eq!(arena.alloc(4, 4).unwrap_err(), AllocError::NotInitialized);
}

#[cfg(not(loom))]
#[test]
fn arena_min_granule() {
    let pool = small_pool(4096);
    let mut arena = Arena::with_pool(pool).unwrap();
    let a = arena.alloc(1, 1).unwrap();
    let b = arena.alloc(1, 1).unwrap();
    assert_eq!(a.as_ptr() as usize % 4, 0);
    assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 4);
}

#[cfg(not(loom))]
#[test]
fn arena_alignment() {
    let pool = small_pool(16384);
    let mut arena = Arena::with_pool(pool).unwrap();
    for &alignment in &[4, 8, 16, 64, 4096] {
        for size in [1, 3, 17, 100] {
            let p = arena.alloc(size, alignment).unwrap();
            assert_eq!(p.as_ptr() as usize % alignment, 0);
            assert!(arena.is_valid_ptr(p));
        }
    }
}

#[cfg(not(loom))]
#[test]
fn arena_debug_fill() {
    let pool = small_pool(4096);
    let mut arena = Arena::with_pool(pool).unwrap();
    let p = arena.alloc(32, 16).unwrap();
    if cfg!(debug_assertions) {
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 32) };
        assert!(bytes.iter().all(|&b| b == 0xac));
    }
}

#[cfg(not(loom))]
#[test]
fn arena_grows_into_new_block() {
    let pool = small_pool(4096);
    let mut arena = Arena::with_pool(pool.clone()).unwrap();
    let a = arena.alloc(3000, 16).unwrap();
    let b = arena.alloc(3000, 16).unwrap();
    assert_eq!(arena.num_blocks(), 2);
    assert_eq!(pool.total_blocks(), 2);
    assert!(arena.is_valid_ptr(a));
    assert!(arena.is_valid_ptr(b));
    // b starts a fresh block
    assert_eq!(Some(b), arena.blocks.last().map(|block| block.as_ptr()));
}

#[cfg(not(loom))]
#[test]
fn arena_block_too_small() {
    let pool = small_pool(4096);
    let mut arena = Arena::with_pool(pool.clone()).unwrap();
    arena.alloc(100, 16).unwrap();
    let before = arena.get_ptr();

    let err = arena.alloc(5000, 16).unwrap_err();
    assert_eq!(
        err,
        AllocError::BlockTooSmall {
            size: 5000,
            alignment: 16,
            block_size: 4096
        }
    );
    // nothing changed, and the top-up block went back to the pool
    assert_eq!(arena.get_ptr(), before);
    assert_eq!(arena.num_blocks(), 1);
    assert_eq!(pool.total_blocks(), 2);
    assert_eq!(pool.free_blocks(), 1);

    // still usable
    let p = arena.alloc(100, 16).unwrap();
    assert!(arena.is_valid_ptr(p));
    assert_eq!(arena.num_blocks(), 1);
}

#[cfg(not(loom))]
#[test]
fn arena_set_ptr_releases_blocks() {
    let pool = small_pool(4096);
    let mut arena = Arena::with_pool(pool.clone()).unwrap();
    arena.alloc(100, 16).unwrap();
    let mark = arena.get_ptr();

    for _ in 0..3 {
        arena.alloc(3000, 16).unwrap();
    }
    assert_eq!(arena.num_blocks(), 3);

    arena.set_ptr(mark);
    assert_eq!(arena.num_blocks(), 1);
    assert_eq!(arena.get_ptr(), mark);
    assert_eq!(pool.free_blocks(), 2);
    assert!(arena.is_valid());
}

#[cfg(not(loom))]
#[test]
fn arena_set_ptr_none_keeps_one_block() {
    let pool = small_pool(4096);
    let mut arena = Arena::with_pool(pool.clone()).unwrap();
    let first = arena.alloc(3000, 16).unwrap();
    arena.alloc(3000, 16).unwrap();
    arena.alloc(3000, 16).unwrap();
    assert_eq!(arena.num_blocks(), 3);

    arena.set_ptr(None);
    assert_eq!(arena.num_blocks(), 1);
    assert_eq!(pool.free_blocks(), 2);
    // rewound to the very start of the oldest block
    assert_eq!(arena.alloc(3000, 16).unwrap(), first);
}

#[cfg(not(loom))]
#[test]
fn arena_clear() {
    let pool = small_pool(4096);
    let mut arena = Arena::with_pool(pool.clone()).unwrap();
    arena.alloc(3000, 16).unwrap();
    arena.alloc(3000, 16).unwrap();
    arena.clear().unwrap();
    assert_eq!(arena.num_blocks(), 1);
    assert_eq!(pool.total_blocks(), 2);
    assert_eq!(pool.free_blocks(), 1);
    assert_eq!(arena.get_ptr(), arena.blocks.last().map(|block| block.as_ptr()));
}

#[cfg(not(loom))]
#[test]
fn arena_is_valid_ptr() {
    let pool = small_pool(4096);
    let mut arena = Arena::with_pool(pool).unwrap();
    let a = arena.alloc(3000, 16).unwrap();
    let b = arena.alloc(100, 16).unwrap();
    assert!(arena.is_valid_ptr(a));
    assert!(arena.is_valid_ptr(b));

    // past the cursor in the active block
    let beyond = unsafe { NonNull::new_unchecked(b.as_ptr().add(200)) };
    assert!(!arena.is_valid_ptr(beyond));

    let local = 0u8;
    assert!(!arena.is_valid_ptr(NonNull::from(&local)));
}

#[cfg(not(loom))]
#[test]
fn arena_drop_returns_blocks() {
    let pool = small_pool(4096);
    {
        let mut arena = Arena::with_pool(pool.clone()).unwrap();
        arena.alloc(3000, 16).unwrap();
        arena.alloc(3000, 16).unwrap();
        assert_eq!(pool.free_blocks(), 0);
    }
    assert_eq!(pool.total_blocks(), 2);
    assert_eq!(pool.free_blocks(), 2);
}

#[cfg(not(loom))]
#[test]
fn arena_typed_allocs() {
    #[derive(Debug, Clone, Copy, PartialEq)]
    #[repr(align(32))]
    struct Vert {
        pos: [f32; 3],
        id: u32,
    }

    let pool = small_pool(4096);
    let mut arena = Arena::with_pool(pool).unwrap();
    let v = arena
        .alloc_value(Vert {
            pos: [1.0, 2.0, 3.0],
            id: 7,
        })
        .unwrap();
    assert_eq!(v.as_ptr() as usize % 32, 0);
    assert_eq!(unsafe { v.as_ref() }.id, 7);

    let arr = arena.alloc_array_with(10, |i| i as u64 * 3).unwrap();
    assert_eq!(arr.as_ptr() as usize % 8, 0);
    let arr = unsafe { std::slice::from_raw_parts(arr.as_ptr(), 10) };
    assert_eq!(arr, &[0, 3, 6, 9, 12, 15, 18, 21, 24, 27]);

    let zst = arena.alloc_value(()).unwrap();
    assert_eq!(zst.as_ptr() as usize % 4, 0);

    assert_eq!(
        arena.alloc_array_with(usize::MAX, |_| 0u64).unwrap_err(),
        AllocError::LayoutOverflow
    );

    let p = arena
        .alloc_layout(Layout::from_size_align(24, ARENA_DEFAULT_ALIGNMENT).unwrap())
        .unwrap();
    assert_eq!(p.as_ptr() as usize % ARENA_DEFAULT_ALIGNMENT, 0);

    let p = arena.alloc_default(3).unwrap();
    assert_eq!(p.as_ptr() as usize % ARENA_DEFAULT_ALIGNMENT, 0);
}

#[cfg(not(loom))]
#[test]
fn scoped_rollback_reuses_address() {
    let pool = small_pool(4096);
    let mut arena = Arena::with_pool(pool.clone()).unwrap();
    arena.alloc(40, 16).unwrap();

    let before = arena.get_ptr();
    let first_in_scope;
    {
        let mut scoped = arena.scoped();
        first_in_scope = scoped.alloc(64, 16).unwrap();
        // spill into more blocks
        for _ in 0..5 {
            scoped.alloc(2000, 16).unwrap();
        }
        assert!(scoped.num_blocks() > 1);
    }
    assert_eq!(arena.get_ptr(), before);
    assert_eq!(arena.num_blocks(), 1);
    assert_eq!(arena.alloc(64, 16).unwrap(), first_in_scope);
    assert_eq!(pool.free_blocks(), pool.total_blocks() - 1);
}

#[cfg(not(loom))]
#[test]
fn scoped_rollback_on_early_return() {
    fn fallible(arena: &mut Arena, fail: bool) -> Result<NonNull<u8>, AllocError> {
        let mut scoped = ScopedArenaMem::new(arena);
        let p = scoped.alloc(128, 16)?;
        if fail {
            return Err(scoped.alloc(1 << 20, 16).unwrap_err());
        }
        Ok(p)
    }

    let pool = small_pool(4096);
    let mut arena = Arena::with_pool(pool).unwrap();
    let before = arena.get_ptr();
    assert!(fallible(&mut arena, true).is_err());
    assert_eq!(arena.get_ptr(), before);
    let p = fallible(&mut arena, false).unwrap();
    assert_eq!(arena.get_ptr(), before);
    assert_eq!(Some(p), before);
}

#[cfg(not(loom))]
#[test]
fn scoped_rollback_nested() {
    let pool = small_pool(4096);
    let mut arena = Arena::with_pool(pool).unwrap();
    let outer_mark = arena.get_ptr();
    {
        let mut outer = arena.scoped();
        outer.alloc(100, 16).unwrap();
        let inner_mark = outer.get_ptr();
        {
            let mut inner = outer.scoped();
            inner.alloc(3000, 16).unwrap();
            inner.alloc(3000, 16).unwrap();
        }
        assert_eq!(outer.get_ptr(), inner_mark);
        assert_eq!(outer.num_blocks(), 1);
    }
    assert_eq!(arena.get_ptr(), outer_mark);
}

#[cfg(not(loom))]
#[test]
fn fixed_arena_both_ends() {
    let mut buf = vec![0u8; 1024];
    let mut arena = FixedArena::new(&mut buf);
    assert_eq!(arena.get_capacity(), 1024);
    assert_eq!(arena.get_free(), 1024);

    let lo = arena.alloc(100, 4).unwrap();
    let hi = arena.alloc_high(100, 4).unwrap();
    assert!((lo.as_ptr() as usize) + 100 <= hi.as_ptr() as usize);
    assert!(arena.get_low_usage() >= 100);
    assert!(arena.get_high_usage() >= 100);
    assert_eq!(hi, arena.get_high_ptr());
    assert!(arena.is_valid());

    if cfg!(debug_assertions) {
        let lo_bytes = unsafe { std::slice::from_raw_parts(lo.as_ptr(), 100) };
        let hi_bytes = unsafe { std::slice::from_raw_parts(hi.as_ptr(), 100) };
        assert!(lo_bytes.iter().all(|&b| b == 0xa0));
        assert!(hi_bytes.iter().all(|&b| b == 0xad));
    }

    arena.clear();
    assert_eq!(arena.get_free(), 1024);
}

#[cfg(not(loom))]
#[test]
fn fixed_arena_failure_rolls_back() {
    let mut buf = vec![0u8; 256];
    let mut arena = FixedArena::new(&mut buf);
    arena.alloc(100, 4).unwrap();
    arena.alloc_high(100, 4).unwrap();
    let low = arena.get_ptr();
    let high = arena.get_high_ptr();

    let err = arena.alloc(100, 4).unwrap_err();
    match err {
        AllocError::OutOfMemory {
            size,
            alignment,
            available,
        } => {
            assert_eq!(size, 100);
            assert_eq!(alignment, 4);
            assert!(available < 100);
        }
        _ => panic!("wrong error {:?}", err),
    }
    assert!(arena.alloc_high(100, 4).is_err());
    assert_eq!(arena.get_ptr(), low);
    assert_eq!(arena.get_high_ptr(), high);
    assert!(arena.is_valid());
}

#[cfg(not(loom))]
#[test]
fn fixed_arena_empty() {
    let mut arena = FixedArena::empty();
    assert_eq!(arena.get_capacity(), 0);
    assert!(arena.alloc(4, 4).is_err());
    assert!(arena.alloc_high(4, 4).is_err());
    assert!(arena.is_valid());
}

#[cfg(not(loom))]
#[test]
fn fixed_arena_free_aligned() {
    let mut buf = vec![0u8; 1024];
    let mut arena = FixedArena::new(&mut buf);
    arena.alloc(5, 4).unwrap();
    arena.alloc_high(3, 4).unwrap();

    for alignment in [4, 8, 16, 64, 256] {
        let free = arena.get_free_aligned(alignment);
        assert!(free <= arena.get_free());
        assert_eq!(free % alignment, 0);
        if free > 0 {
            // exactly that much can actually be allocated
            let mut scoped = arena.scoped();
            scoped.alloc(free, alignment).unwrap();
        }
    }
}

#[cfg(not(loom))]
#[test]
fn fixed_arena_scoped_guards() {
    let mut buf = vec![0u8; 1024];
    let mut arena = FixedArena::new(&mut buf);
    let low = arena.get_ptr();
    let high = arena.get_high_ptr();
    {
        let mut scoped = arena.scoped();
        scoped.alloc(200, 16).unwrap();
        {
            let mut scoped_high = scoped.scoped_high();
            scoped_high.alloc_high(300, 16).unwrap();
            scoped_high.alloc(10, 4).unwrap();
        }
        assert_eq!(scoped.get_high_ptr(), high);
    }
    assert_eq!(arena.get_ptr(), low);
    assert_eq!(arena.get_free(), 1024);
}

#[cfg(not(loom))]
#[test]
fn fixed_arena_align_clear_to_zero() {
    let mut buf = vec![0xffu8; 256];
    let base = buf.as_ptr() as usize;
    {
        let mut arena = FixedArena::new(&mut buf);
        arena.alloc(5, 4).unwrap();
        let low_before = arena.get_low_usage();
        arena.align_clear_to_zero(64);
        let low_after = arena.get_low_usage();
        assert_eq!((base + low_after) % 64, 0);
        assert!(low_after >= low_before);
    }
    let aligned = crate::util::align_up(base + 8, 64) - base;
    assert!(buf[8..aligned].iter().all(|&b| b == 0));
}

#[cfg(not(loom))]
#[test]
fn fixed_arena_typed_values() {
    let mut buf = vec![0u8; 256];
    let mut arena = FixedArena::new(&mut buf);
    let a = arena.alloc_value(0x1234_5678u32).unwrap();
    let b = arena.alloc_high_value(0xdead_beef_u64).unwrap();
    assert_eq!(unsafe { *a.as_ptr() }, 0x1234_5678);
    assert_eq!(unsafe { *b.as_ptr() }, 0xdead_beef);
    assert_eq!(b.as_ptr() as usize % 8, 0);
}

#[cfg(not(loom))]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    const ALIGNMENTS: [usize; 5] = [4, 8, 16, 64, 4096];

    fn check_disjoint(mut ranges: Vec<(usize, usize)>) {
        ranges.sort_unstable();
        for w in ranges.windows(2) {
            assert!(w[0].1 <= w[1].0, "overlap {:x?} {:x?}", w[0], w[1]);
        }
    }

    proptest! {
        #[test]
        fn arena_allocs_in_bounds_aligned_disjoint(
            reqs in prop::collection::vec((1usize..3000, 0usize..5), 1..200)
        ) {
            let pool = small_pool(8192);
            let mut arena = Arena::with_pool(pool).unwrap();
            let mut ranges = Vec::new();
            for (size, align_idx) in reqs {
                let alignment = ALIGNMENTS[align_idx];
                let p = arena.alloc(size, alignment).unwrap();
                let start = p.as_ptr() as usize;
                let end = start + cmp::max(size, 4);
                prop_assert_eq!(start % alignment, 0);
                prop_assert!(arena
                    .blocks
                    .iter()
                    .any(|block| start >= block.addr() && end <= block.end_addr()));
                prop_assert!(arena.is_valid_ptr(p));
                ranges.push((start, end));
            }
            check_disjoint(ranges);
        }

        #[test]
        fn fixed_arena_ends_never_overlap(
            reqs in prop::collection::vec((any::<bool>(), 1usize..200, 0usize..4), 1..100)
        ) {
            let mut buf = vec![0u8; 4096];
            let mut arena = FixedArena::new(&mut buf);
            let mut ranges = Vec::new();
            for (high, size, align_idx) in reqs {
                let alignment = ALIGNMENTS[align_idx];
                let res = if high {
                    arena.alloc_high(size, alignment)
                } else {
                    arena.alloc(size, alignment)
                };
                prop_assert!(arena.is_valid());
                if let Ok(p) = res {
                    let start = p.as_ptr() as usize;
                    prop_assert_eq!(start % alignment, 0);
                    ranges.push((start, start + cmp::max(size, 4)));
                }
            }
            check_disjoint(ranges);
        }
    }
}
