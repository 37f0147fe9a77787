use crate::format::AllocFormat;
use modular_bitfield::prelude::*;
use std::mem::size_of;

/// Retention pools, in promotion order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Generation {
    /// Thread-local, freshest allocations.
    Hatchery = 0,
    /// Reserved for a minor collection stage. No allocation path targets it.
    Nursery = 1,
    /// Slabs retained for the life of the thread.
    Tenured = 2,
    /// Write-once objects populated before any thread registers.
    Immortal = 3,
}

impl Generation {
    pub const ALL: [Generation; 4] = [
        Generation::Hatchery,
        Generation::Nursery,
        Generation::Tenured,
        Generation::Immortal,
    ];

    /// The generation objects are promoted into, if any.
    pub fn promoted(self) -> Option<Generation> {
        match self {
            Generation::Hatchery => Some(Generation::Nursery),
            Generation::Nursery => Some(Generation::Tenured),
            Generation::Tenured | Generation::Immortal => None,
        }
    }
}

// AllocHeader prefixes every heap allocation.
//
// +------------+------+---------------------------------------------+
// | field      | bits |                                             |
// +------------+------+---------------------------------------------+
// | format     |   16 | Selects the dispatch entry. Never changes.  |
// | generation |    8 |                                             |
// | reserved   |    8 |                                             |
// | card       |   32 | Card of the header relative to alloc_top.   |
// | size       |   32 | Payload size in bytes, word aligned.        |
// | reserved   |   32 |                                             |
// +------------+------+---------------------------------------------+
//
// Fields are typed and read through accessors; nothing reinterprets the
// header as an integer.
#[repr(C, align(8))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocHeader {
    format: AllocFormat,
    generation: Generation,
    _reserved: u8,
    card: u32,
    size: u32,
    _padding: u32,
}

/// Bytes in front of every heap payload.
pub const HEADER_SIZE: usize = size_of::<AllocHeader>();

/// Alignment of every heap payload.
pub const ALLOC_ALIGN: usize = crate::util::WORD_SIZE;

impl AllocHeader {
    pub fn new(format: AllocFormat, generation: Generation, card: u32, size: u32) -> Self {
        Self {
            format,
            generation,
            _reserved: 0,
            card,
            size,
            _padding: 0,
        }
    }

    #[inline(always)]
    pub fn format(&self) -> AllocFormat {
        self.format
    }

    #[inline(always)]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[inline(always)]
    pub fn card(&self) -> u32 {
        self.card
    }

    /// Payload size in bytes, not counting the header.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Header plus payload.
    #[inline(always)]
    pub fn allocation_size(&self) -> usize {
        HEADER_SIZE + self.size()
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        (self as *const Self as usize + HEADER_SIZE) as _
    }

    /// # Safety
    /// `payload` must have been returned by a heap allocation.
    #[inline(always)]
    pub unsafe fn from_payload(payload: *const u8) -> *mut AllocHeader {
        payload.sub(HEADER_SIZE) as *mut AllocHeader
    }

    pub(crate) fn set_generation(&mut self, generation: Generation) {
        self.generation = generation;
    }
}

/// Per-card metadata byte stored in the slab header cards.
#[bitfield(bits = 8)]
#[derive(Clone, Copy)]
pub struct CardMeta {
    /// A traced field of an object starting in this card was written.
    pub dirty: bool,
    /// Reserved for cross-slab reference records.
    pub alien_refs: bool,
    #[skip]
    __: B6,
}

impl CardMeta {
    pub fn from_byte(byte: u8) -> Self {
        Self::from_bytes([byte])
    }

    pub fn to_byte(self) -> u8 {
        self.into_bytes()[0]
    }
}
