//! Concurrent pool allocator for fixed-size entries
//!
//! The pieces, bottom-up:
//!
//! * [MemBlock] tracks which of its entries are in use with a two-level
//!   bitmap, and takes frees from other threads through a locked side channel.
//! * [MemBlockManager] owns every block plus the memory behind them, checks
//!   blocks out to pools, and routes frees to the right block by address.
//! * [LocalUntypedMemPool] is the per-thread front end. It keeps a ring of
//!   checked-out blocks and only goes back to the manager when they are all
//!   full.
//!
//! The two type parameters pick the internal and leaf bitmap words, so e.g.
//! `MemBlock<u32, u64>` has 32 leaves of 64 entries each.

mod bits;
mod block;
mod local;
mod manager;

pub use bits::{BitWord, ConstGenericsHackWorkaround};
pub use block::MemBlock;
pub use local::{LocalUntypedMemPool, MemPool, PoolStats};
pub use manager::{BlockId, MemBlockManager};
