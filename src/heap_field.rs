//! Traced fields embedded in heap objects.
//!
//! A [`HeapField`] is the only way to mutate a traced field after its object
//! has been created. Every store runs the barrier hooks: [`notify_set_pre`]
//! before the write and [`notify_set_post`] after it.

use std::{cell::UnsafeCell, fmt};

use crate::{
    gcref::UntypedGc,
    header::Generation,
    rooting::{Handle, MutHandle},
    slab::Slab,
    trace::{ScanBounds, Scanner, Trace, Updater},
};

#[repr(transparent)]
pub struct HeapField<T> {
    value: UnsafeCell<T>,
}

impl<T> HeapField<T> {
    pub const fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    pub fn get(&self) -> T
    where
        T: Copy,
    {
        unsafe { *self.value.get() }
    }

    /// Stores `value`. `container` is the object this field lives in.
    pub fn set(&self, value: T, container: impl Into<UntypedGc>) {
        let container = container.into();
        notify_set_pre(container);
        unsafe { *self.value.get() = value };
        notify_set_post(container);
    }

    pub fn handle(&self) -> Handle<'_, T> {
        unsafe { Handle::from_raw(self.value.get()) }
    }

    /// Mutable handle whose stores go through the barrier for `container`.
    pub fn mut_handle(&self, container: impl Into<UntypedGc>) -> MutHandle<'_, T> {
        unsafe { MutHandle::from_raw(self.value.get(), Some(container.into())) }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.value.get()
    }
}

impl<T: Default> Default for HeapField<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for HeapField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HeapField").field(&self.get()).finish()
    }
}

unsafe impl<T: Trace> Trace for HeapField<T> {
    const IS_LEAF: bool = T::IS_LEAF;

    fn scan(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        unsafe { (*self.value.get()).scan(scanner, bounds) }
    }

    fn update(&mut self, updater: &mut dyn Updater, bounds: ScanBounds) {
        self.value.get_mut().update(updater, bounds)
    }
}

/// Hook run before a traced field of `container` is overwritten. Immortal
/// objects are read-only once created.
#[inline]
pub fn notify_set_pre(container: UntypedGc) {
    assert_ne!(
        container.generation(),
        Generation::Immortal,
        "immortal objects are read-only"
    );
    tracing::trace!(target: "whisper::gc::barrier", container = ?container, "field store");
}

/// Hook run after a traced field of `container` was overwritten. Marks the
/// container's card dirty unless it lives in the hatchery, which is scanned
/// in full.
#[inline]
pub fn notify_set_post(container: UntypedGc) {
    match container.generation() {
        Generation::Hatchery | Generation::Immortal => {}
        Generation::Nursery | Generation::Tenured => unsafe {
            let slab = Slab::containing(container.header_ptr().as_ptr());
            (*slab).mark_card_dirty(container.header().card());
        },
    }
}
