//! Chunked bump allocator for untraced, short-lived data.
//!
//! Memory comes from a chain of heap chunks. Allocations bump downwards
//! inside the newest chunk; when it runs out a new chunk is pushed, sized to
//! the request if that exceeds the default chunk size. Nothing is freed
//! individually: all chunks are released when the allocator is dropped, and
//! values placed with [`BumpAllocator::alloc`] are never dropped.
//!
//! Bump memory is not scanned. It must never hold the only reference to a
//! heap object.

use std::{
    alloc::{self, Layout},
    cell::Cell,
    mem::{align_of, size_of},
    ptr::{self, NonNull},
    slice,
};

use crate::{
    error::BumpAllocError,
    util::{align_down, align_up, WORD_SIZE},
};

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Alignment of every chunk.
const CHUNK_ALIGN: usize = 16;

#[repr(C)]
struct ChunkHeader {
    next: Option<NonNull<ChunkHeader>>,
    size: usize,
}

/// Bytes at the start of every chunk reserved for the chain link.
pub const CHUNK_OVERHEAD: usize = align_up(size_of::<ChunkHeader>(), CHUNK_ALIGN);

pub struct BumpAllocator {
    head: Cell<Option<NonNull<ChunkHeader>>>,
    /// Next allocation ends here.
    cursor: Cell<*mut u8>,
    /// First usable byte of the current chunk.
    limit: Cell<*mut u8>,
    chunk_size: usize,
    allocated: Cell<usize>,
}

impl BumpAllocator {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        assert!(
            chunk_size > CHUNK_OVERHEAD,
            "chunk size {} leaves no usable space",
            chunk_size
        );
        Self {
            head: Cell::new(None),
            cursor: Cell::new(ptr::null_mut()),
            limit: Cell::new(ptr::null_mut()),
            chunk_size: align_up(chunk_size, CHUNK_ALIGN),
            allocated: Cell::new(0),
        }
    }

    /// Default size of a chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes handed out so far, including alignment.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.get()
    }

    /// Sizes of all chunks, newest first.
    pub fn chunk_sizes(&self) -> Vec<usize> {
        let mut sizes = Vec::new();
        let mut chunk = self.head.get();
        while let Some(header) = chunk {
            unsafe {
                sizes.push((*header.as_ptr()).size);
                chunk = (*header.as_ptr()).next;
            }
        }
        sizes
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_sizes().len()
    }

    fn try_bump(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let cursor = self.cursor.get() as usize;
        let start = align_down(cursor.checked_sub(size)?, align);
        if start < self.limit.get() as usize {
            return None;
        }
        self.cursor.set(start as *mut u8);
        self.allocated.set(self.allocated.get() + (cursor - start));
        NonNull::new(start as *mut u8)
    }

    /// Returns `size` bytes aligned to `align` (at least word aligned).
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, BumpAllocError> {
        debug_assert!(align.is_power_of_two());
        let align = align.max(WORD_SIZE);
        let size = size
            .max(1)
            .checked_add(WORD_SIZE - 1)
            .ok_or(BumpAllocError::SizeOverflow { size })?
            & !(WORD_SIZE - 1);
        if let Some(ptr) = self.try_bump(size, align) {
            return Ok(ptr);
        }
        let needed = size
            .checked_add(align)
            .ok_or(BumpAllocError::SizeOverflow { size })?;
        self.push_chunk(needed)?;
        self.try_bump(size, align)
            .ok_or(BumpAllocError::ChunkAllocation { size: needed })
    }

    fn push_chunk(&self, needed: usize) -> Result<(), BumpAllocError> {
        let size = if needed > self.chunk_size - CHUNK_OVERHEAD {
            needed
                .checked_add(CHUNK_OVERHEAD + CHUNK_ALIGN - 1)
                .ok_or(BumpAllocError::SizeOverflow { size: needed })?
                & !(CHUNK_ALIGN - 1)
        } else {
            self.chunk_size
        };
        let layout = Layout::from_size_align(size, CHUNK_ALIGN)
            .map_err(|_| BumpAllocError::SizeOverflow { size })?;
        let base = unsafe { alloc::alloc(layout) };
        let header = NonNull::new(base.cast::<ChunkHeader>())
            .ok_or(BumpAllocError::ChunkAllocation { size })?;
        unsafe {
            header.as_ptr().write(ChunkHeader {
                next: self.head.get(),
                size,
            });
            self.limit.set(base.add(CHUNK_OVERHEAD));
            self.cursor.set(base.add(size));
        }
        self.head.set(Some(header));
        tracing::trace!(target: "whisper::gc", size, "pushed bump chunk");
        Ok(())
    }

    /// Moves `value` into bump memory.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc<T>(&self, value: T) -> Result<&mut T, BumpAllocError> {
        let ptr = self.allocate(size_of::<T>(), align_of::<T>())?.cast::<T>();
        unsafe {
            ptr.as_ptr().write(value);
            Ok(&mut *ptr.as_ptr())
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> Result<&mut [T], BumpAllocError> {
        let bytes = size_of::<T>()
            .checked_mul(src.len())
            .ok_or(BumpAllocError::SizeOverflow { size: usize::MAX })?;
        let ptr = self.allocate(bytes, align_of::<T>())?.cast::<T>();
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len());
            Ok(slice::from_raw_parts_mut(ptr.as_ptr(), src.len()))
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn alloc_str(&self, src: &str) -> Result<&mut str, BumpAllocError> {
        let bytes = self.alloc_slice_copy(src.as_bytes())?;
        Ok(unsafe { std::str::from_utf8_unchecked_mut(bytes) })
    }
}

impl Default for BumpAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BumpAllocator {
    fn drop(&mut self) {
        let mut chunk = self.head.take();
        while let Some(header) = chunk {
            unsafe {
                let ChunkHeader { next, size } = header.as_ptr().read();
                alloc::dealloc(
                    header.as_ptr().cast(),
                    Layout::from_size_align_unchecked(size, CHUNK_ALIGN),
                );
                chunk = next;
            }
        }
    }
}
