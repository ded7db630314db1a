//! Memory arenas and pool allocators for the renderer
//!
//! * [arena::Arena] is a single-threaded bump allocator that grows by checking
//!   blocks out of a shared [arena::ArenaBlockPool]. [arena::FixedArena]
//!   bump-allocates from both ends of one caller-supplied buffer.
//! * [mem_pool] allocates fixed-size entries from per-thread pools, where
//!   any thread may free any entry.
//! * [typed_pool::TypedStaticPool] is a fixed-capacity pool for one type.

pub mod arena;
pub mod config;
pub mod error;
pub mod free_list;
mod loom_testing;
pub mod mem_pool;
pub mod spin;
pub mod typed_pool;
pub mod util;

pub use error::AllocError;
