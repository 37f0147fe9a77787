use std::{
    mem::{align_of, needs_drop, size_of},
    ptr::{self, NonNull},
};

use crate::{
    error::HeapError,
    format::{AllocFormat, FormatTable, HeapTraits},
    gcref::{Gc, UntypedGc},
    header::{AllocHeader, Generation, ALLOC_ALIGN},
    slab_list::SlabList,
    thread_context::ThreadContext,
};

/// A thread paired with the generation new objects are placed in.
#[derive(Clone, Copy)]
pub struct AllocationContext<'a> {
    cx: &'a ThreadContext,
    generation: Generation,
}

impl<'a> AllocationContext<'a> {
    pub(crate) fn new(cx: &'a ThreadContext, generation: Generation) -> Self {
        debug_assert!(
            matches!(generation, Generation::Hatchery | Generation::Tenured),
            "no allocation path targets the {:?} generation",
            generation
        );
        Self { cx, generation }
    }

    pub fn thread_context(&self) -> &'a ThreadContext {
        self.cx
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Allocates a `T` and moves `value` into it.
    pub fn create<T: HeapTraits>(&self, value: T) -> Result<Gc<T>, HeapError> {
        self.create_sized(size_of::<T>(), value)
    }

    /// Allocates `size` payload bytes, moves `value` into the front and zeroes
    /// the rest. Used by variable-length types whose trailing elements follow
    /// the fixed part.
    pub fn create_sized<T: HeapTraits>(&self, size: usize, value: T) -> Result<Gc<T>, HeapError> {
        self.cx.runtime().register_heap_format::<T>();
        let mut list = self.cx.slab_list(self.generation).borrow_mut();
        create_in(&mut list, size, value)
    }
}

impl std::fmt::Debug for AllocationContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationContext")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Allocation path shared by thread generations and the immortal generation.
/// The caller registers `T`'s format.
pub(crate) fn create_in<T: HeapTraits>(
    list: &mut SlabList,
    size: usize,
    value: T,
) -> Result<Gc<T>, HeapError> {
    check_layout::<T>(size);
    let header = list.create_raw(T::FORMAT, size, !T::IS_LEAF)?;
    Ok(unsafe { initialize(header, value) })
}

/// Same as [`create_in`], registering the format in `formats` first.
pub(crate) fn create_registered<T: HeapTraits>(
    list: &mut SlabList,
    formats: &FormatTable<AllocFormat>,
    size: usize,
    value: T,
) -> Result<Gc<T>, HeapError> {
    formats.register(T::FORMAT, crate::format::FormatEntry::for_heap::<T>());
    create_in(list, size, value)
}

fn check_layout<T: HeapTraits>(size: usize) {
    assert!(
        size >= size_of::<T>(),
        "{} needs {} bytes, {} requested",
        T::NAME,
        size_of::<T>(),
        size
    );
    assert!(
        align_of::<T>() <= ALLOC_ALIGN,
        "{} is over-aligned for the heap",
        T::NAME
    );
    debug_assert!(!needs_drop::<T>(), "{} has drop glue, heap objects are never dropped", T::NAME);
}

unsafe fn initialize<T>(header: NonNull<AllocHeader>, value: T) -> Gc<T> {
    let payload = header.as_ref().payload();
    payload.cast::<T>().write(value);
    let size = header.as_ref().size();
    if size > size_of::<T>() {
        ptr::write_bytes(payload.add(size_of::<T>()), 0, size - size_of::<T>());
    }
    UntypedGc::from_header(header).cast_unchecked()
}
