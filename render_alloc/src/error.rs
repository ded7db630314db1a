use thiserror::Error;

/// Errors returned by the arenas and pools in this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("allocation of {size} bytes (align {alignment}) does not fit in a {block_size} byte arena block")]
    BlockTooSmall {
        size: usize,
        alignment: usize,
        block_size: usize,
    },
    #[error("fixed arena out of memory: requested {size} bytes (align {alignment}), {available} bytes available")]
    OutOfMemory {
        size: usize,
        alignment: usize,
        available: usize,
    },
    #[error("system allocation of {size} bytes (align {alignment}) failed")]
    SystemAllocFailed { size: usize, alignment: usize },
    #[error("mem pool exhausted: requested {requested} entries, could only satisfy {satisfied}")]
    PoolExhausted { requested: usize, satisfied: usize },
    #[error("no free blocks left in the block manager")]
    NoFreeBlocks,
    #[error("allocator used before init")]
    NotInitialized,
    #[error("array layout overflows")]
    LayoutOverflow,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = AllocError::PoolExhausted {
            requested: 200,
            satisfied: 128,
        };
        assert_eq!(
            e.to_string(),
            "mem pool exhausted: requested 200 entries, could only satisfy 128"
        );
        assert_eq!(
            AllocError::InvalidConfig("block_size must be a power of two").to_string(),
            "invalid config: block_size must be a power of two"
        );
    }
}
