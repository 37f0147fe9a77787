use thiserror::Error;

use crate::header::Generation;

/// Failure of a GC heap allocation. Callers propagate it up to a boundary that
/// can report "out of memory" to the embedder.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    #[error("out of memory: could not map a slab for {requested} bytes in the {generation:?} generation")]
    OutOfMemory {
        generation: Generation,
        requested: usize,
    },
    #[error("object of {size} bytes exceeds the addressable object size")]
    ObjectTooLarge { size: usize },
    #[error("the {generation:?} generation is read-only")]
    ReadOnlyGeneration { generation: Generation },
    #[error("invalid configuration: {field} = {value}")]
    InvalidConfig { field: &'static str, value: usize },
}

/// Failure of the untraced chunk allocators.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BumpAllocError {
    #[error("failed to allocate a {size} byte chunk")]
    ChunkAllocation { size: usize },
    #[error("allocation of {size} bytes overflows the address space")]
    SizeOverflow { size: usize },
}
