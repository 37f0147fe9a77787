//! Heap types every runtime needs: untraced byte blobs, arrays of untyped
//! references, and the runtime's immortal root object.

use std::{mem::size_of, ptr, slice};

use crate::{
    allocation::AllocationContext,
    error::HeapError,
    format::{AllocFormat, HeapTraits},
    gcref::{Gc, UntypedGc},
    heap_field::HeapField,
    trace::{ScanBounds, Scanner, Trace, Updater},
};

/// Variable-length untraced bytes. Always placed at the tail of a slab.
/// The bytes follow the fixed part in the same allocation.
#[repr(C)]
pub struct Blob {
    len: usize,
}

unsafe impl Trace for Blob {
    const IS_LEAF: bool = true;
}

unsafe impl HeapTraits for Blob {
    const FORMAT: AllocFormat = AllocFormat::BLOB;
    const NAME: &'static str = "Blob";
}

impl Blob {
    /// Fixed part of a blob of `len` bytes, for use with `create_sized`.
    pub fn with_len(len: usize) -> Self {
        Self { len }
    }

    /// Payload bytes of a blob of `len` bytes. `None` on overflow.
    pub fn payload_size(len: usize) -> Option<usize> {
        size_of::<Blob>().checked_add(len)
    }

    pub fn create(cx: &AllocationContext<'_>, bytes: &[u8]) -> Result<Gc<Blob>, HeapError> {
        let size = Self::payload_size(bytes.len())
            .ok_or(HeapError::ObjectTooLarge { size: bytes.len() })?;
        let blob = cx.create_sized(size, Self::with_len(bytes.len()))?;
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), blob.data_ptr(), bytes.len()) };
        Ok(blob)
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { (self as *const Self as *mut u8).add(size_of::<Self>()) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.data_ptr(), self.len) }
    }
}

type RefSlot = HeapField<Option<UntypedGc>>;

/// Fixed-length array of nullable untyped references. Slots start out null.
#[repr(C)]
pub struct RefArray {
    len: usize,
}

unsafe impl Trace for RefArray {
    fn scan(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        for index in 0..self.len {
            self.slot(index).scan(scanner, bounds);
        }
    }

    fn update(&mut self, updater: &mut dyn Updater, bounds: ScanBounds) {
        for index in 0..self.len {
            unsafe { (*self.slots_ptr().add(index)).update(updater, bounds) };
        }
    }
}

unsafe impl HeapTraits for RefArray {
    const FORMAT: AllocFormat = AllocFormat::REF_ARRAY;
    const NAME: &'static str = "RefArray";
}

impl RefArray {
    pub fn with_len(len: usize) -> Self {
        Self { len }
    }

    /// Payload bytes of an array of `len` slots. `None` on overflow.
    pub fn payload_size(len: usize) -> Option<usize> {
        len.checked_mul(size_of::<RefSlot>())?
            .checked_add(size_of::<RefArray>())
    }

    pub fn create(cx: &AllocationContext<'_>, len: usize) -> Result<Gc<RefArray>, HeapError> {
        let size = Self::payload_size(len).ok_or(HeapError::ObjectTooLarge {
            size: len.saturating_mul(size_of::<RefSlot>()),
        })?;
        cx.create_sized(size, Self::with_len(len))
    }

    fn slots_ptr(&self) -> *mut RefSlot {
        unsafe { (self as *const Self as *mut u8).add(size_of::<Self>()).cast() }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn slot(&self, index: usize) -> &HeapField<Option<UntypedGc>> {
        assert!(index < self.len, "index {} out of bounds for RefArray of {}", index, self.len);
        unsafe { &*self.slots_ptr().add(index) }
    }

    pub fn get(&self, index: usize) -> Option<UntypedGc> {
        self.slot(index).get()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<UntypedGc>> + '_ {
        (0..self.len).map(move |index| self.get(index))
    }
}

impl Gc<RefArray> {
    /// Stores `value` in slot `index` through the write barrier.
    pub fn set(self, index: usize, value: Option<UntypedGc>) {
        self.slot(index).set(value, self);
    }
}

/// Root object of a runtime, allocated in the immortal generation.
#[repr(C)]
pub struct RuntimeState {
    well_known: Gc<RefArray>,
}

unsafe impl Trace for RuntimeState {
    fn scan(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        self.well_known.scan(scanner, bounds);
    }

    fn update(&mut self, updater: &mut dyn Updater, bounds: ScanBounds) {
        self.well_known.update(updater, bounds);
    }
}

unsafe impl HeapTraits for RuntimeState {
    const FORMAT: AllocFormat = AllocFormat::RUNTIME_STATE;
    const NAME: &'static str = "RuntimeState";
}

impl RuntimeState {
    pub(crate) fn new(well_known: Gc<RefArray>) -> Self {
        Self { well_known }
    }

    /// Slots for objects every thread needs to reach without a root of its
    /// own. Read them through [`Runtime::well_known`](crate::runtime::Runtime::well_known).
    pub(crate) fn well_known(&self) -> Gc<RefArray> {
        self.well_known
    }
}
