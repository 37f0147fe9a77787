//! Size-class pool allocator layered on [`BumpAllocator`].
//!
//! Requests up to [`MAX_POOLED_WORDS`] words are rounded to a whole number of
//! words and served from a per-class free list, falling back to the bump
//! allocator when the list is empty. Freed blocks are pushed back on their
//! class's list. Larger requests go straight to the bump allocator and are
//! reclaimed only when the pool is dropped.

use std::{
    cell::Cell,
    mem::{align_of, size_of},
    ptr::{self, NonNull},
};

use crate::{
    bump::BumpAllocator,
    error::BumpAllocError,
    util::{div_ceil, WORD_SIZE},
};

pub const MAX_POOLED_WORDS: usize = 16;

struct FreeEntry {
    next: *mut FreeEntry,
}

pub struct PoolAllocator {
    bump: BumpAllocator,
    free_lists: [Cell<*mut FreeEntry>; MAX_POOLED_WORDS],
}

/// Size class (in words) of a `size` byte request, if pooled.
fn size_class(size: usize) -> Option<usize> {
    let words = div_ceil(size.max(1), WORD_SIZE);
    (words <= MAX_POOLED_WORDS).then_some(words)
}

impl PoolAllocator {
    pub fn new() -> Self {
        Self::with_bump(BumpAllocator::new())
    }

    pub fn with_bump(bump: BumpAllocator) -> Self {
        Self {
            bump,
            free_lists: std::array::from_fn(|_| Cell::new(ptr::null_mut())),
        }
    }

    pub fn bump(&self) -> &BumpAllocator {
        &self.bump
    }

    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, BumpAllocError> {
        match size_class(size) {
            Some(words) => {
                let list = &self.free_lists[words - 1];
                match NonNull::new(list.get()) {
                    Some(entry) => {
                        list.set(unsafe { (*entry.as_ptr()).next });
                        Ok(entry.cast())
                    }
                    None => self.bump.allocate(words * WORD_SIZE, WORD_SIZE),
                }
            }
            None => self.bump.allocate(size, WORD_SIZE),
        }
    }

    /// Returns a block to its size class.
    ///
    /// # Safety
    /// `ptr` must come from [`PoolAllocator::allocate`] on this pool with the
    /// same `size`, and must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        if let Some(words) = size_class(size) {
            let list = &self.free_lists[words - 1];
            let entry = ptr.cast::<FreeEntry>().as_ptr();
            (*entry).next = list.get();
            list.set(entry);
        }
    }

    /// Moves `value` into a pooled block.
    pub fn create<T>(&self, value: T) -> Result<NonNull<T>, BumpAllocError> {
        assert!(align_of::<T>() <= WORD_SIZE, "pooled values are word aligned");
        let ptr = self.allocate(size_of::<T>())?.cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Drops a value made by [`PoolAllocator::create`] and frees its block.
    ///
    /// # Safety
    /// `ptr` must come from `create::<T>` on this pool and not be used
    /// afterwards.
    pub unsafe fn destroy<T>(&self, ptr: NonNull<T>) {
        ptr::drop_in_place(ptr.as_ptr());
        self.free(ptr.cast(), size_of::<T>());
    }

    /// Blocks waiting on the free list of `size`'s class.
    pub fn free_count(&self, size: usize) -> usize {
        let Some(words) = size_class(size) else {
            return 0;
        };
        let mut count = 0;
        let mut entry = self.free_lists[words - 1].get();
        while !entry.is_null() {
            count += 1;
            entry = unsafe { (*entry).next };
        }
        count
    }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}
