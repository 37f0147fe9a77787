//! Card-structured slabs.
//!
//! A slab is one mapped region split into 1 KiB cards. The leading header
//! cards hold the in-region [`SlabHeader`], one metadata byte per data card, a
//! reserved alien reference area, and finally a back-pointer word just below
//! `alloc_top`. The data cards follow:
//!
//! ```text
//! region start                       alloc_top                    alloc_bottom
//! | SlabHeader | card meta | alien | ^ | head objects -> ... <- tail objects |
//!                                    back-pointer to SlabHeader
//! ```
//!
//! Traced objects are bumped upwards from `alloc_top`, untraced ones
//! downwards from `alloc_bottom`. The slab is full when the cursors meet.

use std::{cmp::max, marker::PhantomData, mem::size_of, ptr::NonNull};

use crate::{
    gcref::UntypedGc,
    header::{AllocHeader, CardMeta, Generation},
    mmap::{page_size, Mmap},
    util::{align_up, div_ceil, is_aligned, WORD_SIZE},
};

pub const CARD_SIZE_LOG2: usize = 10;
pub const CARD_SIZE: usize = 1 << CARD_SIZE_LOG2;
pub const CARD_MASK: usize = CARD_SIZE - 1;

/// Minimum number of cards in a standard slab.
pub const STANDARD_SLAB_CARDS: usize = 64;

/// Bytes reserved in the header cards for cross-slab reference records.
pub const ALIEN_REF_AREA_SIZE: usize = 256;

const SLAB_MAGIC: u32 = 0x5357_4C42;
const UNASSIGNED_INDEX: u32 = u32::MAX;

/// Stable name of a slab inside its [`SlabList`](crate::slab_list::SlabList).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlabId {
    generation: Generation,
    index: u32,
}

impl SlabId {
    pub(crate) const fn new(generation: Generation, index: u32) -> Self {
        Self { generation, index }
    }

    pub fn generation(self) -> Generation {
        self.generation
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Header placed at the start of every slab region.
#[repr(C)]
pub struct SlabHeader {
    magic: u32,
    index: u32,
    generation: Generation,
    singleton: bool,
    header_cards: u32,
    data_cards: u32,
}

impl SlabHeader {
    pub fn is_valid(&self) -> bool {
        self.magic == SLAB_MAGIC
    }

    /// `None` until the slab has been pushed into a list.
    pub fn id(&self) -> Option<SlabId> {
        if self.index == UNASSIGNED_INDEX {
            None
        } else {
            Some(SlabId::new(self.generation, self.index))
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    pub fn header_cards(&self) -> usize {
        self.header_cards as usize
    }

    pub fn data_cards(&self) -> usize {
        self.data_cards as usize
    }

    pub fn alloc_top(&self) -> *mut u8 {
        (self as *const Self as usize + self.header_cards() * CARD_SIZE) as _
    }

    fn card_meta_ptr(&self, card: u32) -> *mut u8 {
        assert!(
            (card as usize) < self.data_cards(),
            "card {} out of range for a slab of {} data cards",
            card,
            self.data_cards
        );
        (self as *const Self as usize + size_of::<SlabHeader>() + card as usize) as _
    }

    pub fn card_meta(&self, card: u32) -> CardMeta {
        unsafe { CardMeta::from_byte(self.card_meta_ptr(card).read()) }
    }

    pub fn set_card_meta(&self, card: u32, meta: CardMeta) {
        unsafe { self.card_meta_ptr(card).write(meta.to_byte()) }
    }

    pub fn mark_card_dirty(&self, card: u32) {
        self.set_card_meta(card, self.card_meta(card).with_dirty(true));
    }
}

fn header_cards_for(data_cards: usize) -> usize {
    div_ceil(
        size_of::<SlabHeader>() + data_cards + ALIEN_REF_AREA_SIZE + WORD_SIZE,
        CARD_SIZE,
    )
}

fn page_cards() -> usize {
    max(page_size() / CARD_SIZE, 1)
}

/// Card split of a slab region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabGeometry {
    pub header_cards: usize,
    pub data_cards: usize,
}

impl SlabGeometry {
    /// Standard slab of at least `min_cards` cards, rounded to whole pages.
    pub fn standard(min_cards: usize) -> Self {
        let page_cards = page_cards();
        let total = align_up(max(min_cards, page_cards), page_cards);
        // Sizing the metadata for every card of the region over-reserves
        // slightly but never overlaps the data area.
        let header_cards = header_cards_for(total);
        Self {
            header_cards,
            data_cards: total - header_cards,
        }
    }

    /// Slab holding one allocation of `object_size` bytes, header included.
    pub fn singleton(object_size: usize) -> Self {
        let page_cards = page_cards();
        let data_cards = max(div_ceil(object_size, CARD_SIZE), 1);
        // Page rounding may add up to `page_cards` data cards.
        let header_cards = header_cards_for(data_cards + page_cards);
        let total = align_up(header_cards + data_cards, page_cards);
        Self {
            header_cards,
            data_cards: total - header_cards,
        }
    }

    pub fn total_cards(&self) -> usize {
        self.header_cards + self.data_cards
    }

    pub fn region_size(&self) -> usize {
        self.total_cards() * CARD_SIZE
    }

    /// Bytes available for allocations.
    pub fn capacity(&self) -> usize {
        self.data_cards * CARD_SIZE
    }

    /// Largest allocation (header included) placed in a standard slab. Larger
    /// requests get a singleton slab. A standard slab spans at least one page,
    /// so this is never below half a page.
    pub fn max_standard_object_size(&self) -> usize {
        self.capacity()
    }
}

/// Position of an object inside the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapLocation {
    pub slab: SlabId,
    /// Byte offset of the object header from the slab's `alloc_top`.
    pub offset: usize,
    pub card: u32,
}

/// Recovers the `(slab, offset)` location of `object` from its card number.
/// `None` when the owning slab is not linked in any list.
pub fn locate(object: UntypedGc) -> Option<HeapLocation> {
    unsafe {
        let slab = &*Slab::containing(object.header_ptr().as_ptr());
        Some(HeapLocation {
            slab: slab.id()?,
            offset: object.addr() - slab.alloc_top() as usize,
            card: object.header().card(),
        })
    }
}

pub struct Slab {
    region: Mmap,
    header_cards: usize,
    data_cards: usize,
    alloc_top: *mut u8,
    alloc_bottom: *mut u8,
    head_alloc: *mut u8,
    tail_alloc: *mut u8,
    generation: Generation,
    singleton: bool,
}

impl Slab {
    pub fn allocate_standard(generation: Generation) -> Option<Slab> {
        Self::allocate_standard_with(STANDARD_SLAB_CARDS, generation)
    }

    pub fn allocate_standard_with(min_cards: usize, generation: Generation) -> Option<Slab> {
        Self::create(SlabGeometry::standard(min_cards), generation, false)
    }

    /// Maps a slab large enough for exactly one allocation of `object_size`
    /// bytes, header included.
    pub fn allocate_singleton(object_size: usize, generation: Generation) -> Option<Slab> {
        Self::create(SlabGeometry::singleton(object_size), generation, true)
    }

    fn create(geometry: SlabGeometry, generation: Generation, singleton: bool) -> Option<Slab> {
        let header_cards = u32::try_from(geometry.header_cards).ok()?;
        let data_cards = u32::try_from(geometry.data_cards).ok()?;
        let region = Mmap::new(geometry.region_size(), false)?;
        let start = region.start();
        unsafe {
            start.cast::<SlabHeader>().write(SlabHeader {
                magic: SLAB_MAGIC,
                index: UNASSIGNED_INDEX,
                generation,
                singleton,
                header_cards,
                data_cards,
            });
            let alloc_top = start.add(geometry.header_cards * CARD_SIZE);
            debug_assert!(is_aligned(alloc_top as usize, CARD_SIZE));
            alloc_top
                .cast::<*mut SlabHeader>()
                .sub(1)
                .write(start.cast::<SlabHeader>());
            let alloc_bottom = alloc_top.add(geometry.capacity());
            debug_assert!(alloc_bottom <= region.end());
            tracing::trace!(
                target: "whisper::gc",
                region = ?start,
                size = region.size(),
                ?generation,
                singleton,
                "mapped slab"
            );
            Some(Slab {
                region,
                header_cards: geometry.header_cards,
                data_cards: geometry.data_cards,
                alloc_top,
                alloc_bottom,
                head_alloc: alloc_top,
                tail_alloc: alloc_bottom,
                generation,
                singleton,
            })
        }
    }

    pub fn header(&self) -> &SlabHeader {
        unsafe { &*self.region.start().cast::<SlabHeader>() }
    }

    pub(crate) fn assign_id(&mut self, id: SlabId) {
        debug_assert_eq!(id.generation, self.generation);
        unsafe {
            let header = self.region.start().cast::<SlabHeader>();
            (*header).index = id.index;
            (*header).generation = id.generation;
        }
    }

    pub fn id(&self) -> Option<SlabId> {
        self.header().id()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    pub fn region(&self) -> &Mmap {
        &self.region
    }

    pub fn region_size(&self) -> usize {
        self.region.size()
    }

    pub fn header_cards(&self) -> usize {
        self.header_cards
    }

    pub fn data_cards(&self) -> usize {
        self.data_cards
    }

    pub fn alloc_top(&self) -> *mut u8 {
        self.alloc_top
    }

    pub fn alloc_bottom(&self) -> *mut u8 {
        self.alloc_bottom
    }

    pub fn head_alloc(&self) -> *mut u8 {
        self.head_alloc
    }

    pub fn tail_alloc(&self) -> *mut u8 {
        self.tail_alloc
    }

    pub fn capacity(&self) -> usize {
        self.alloc_bottom as usize - self.alloc_top as usize
    }

    pub fn head_used(&self) -> usize {
        self.head_alloc as usize - self.alloc_top as usize
    }

    pub fn tail_used(&self) -> usize {
        self.alloc_bottom as usize - self.tail_alloc as usize
    }

    pub fn used_bytes(&self) -> usize {
        self.head_used() + self.tail_used()
    }

    pub fn free_bytes(&self) -> usize {
        self.tail_alloc as usize - self.head_alloc as usize
    }

    /// Whether `ptr` lies in the data area.
    pub fn contains(&self, ptr: *const u8) -> bool {
        ptr >= self.alloc_top as *const u8 && ptr < self.alloc_bottom as *const u8
    }

    /// Bumps the head cursor by `amount` bytes. Returns `None`, leaving both
    /// cursors untouched, when the head would pass the tail.
    pub fn allocate_head(&mut self, amount: usize) -> Option<NonNull<u8>> {
        debug_assert!(is_aligned(amount, WORD_SIZE), "unaligned slab request {}", amount);
        if amount > self.free_bytes() {
            return None;
        }
        let result = self.head_alloc;
        self.head_alloc = unsafe { self.head_alloc.add(amount) };
        NonNull::new(result)
    }

    /// Bumps the tail cursor down by `amount` bytes. Same failure rule as
    /// [`Slab::allocate_head`].
    pub fn allocate_tail(&mut self, amount: usize) -> Option<NonNull<u8>> {
        debug_assert!(is_aligned(amount, WORD_SIZE), "unaligned slab request {}", amount);
        if amount > self.free_bytes() {
            return None;
        }
        self.tail_alloc = unsafe { self.tail_alloc.sub(amount) };
        NonNull::new(self.tail_alloc)
    }

    /// Head for traced objects, tail for leaf objects.
    pub(crate) fn bump(&mut self, amount: usize, traced: bool) -> Option<NonNull<u8>> {
        if traced {
            self.allocate_head(amount)
        } else {
            self.allocate_tail(amount)
        }
    }

    /// Card of `ptr` relative to `alloc_top`. `ptr` must lie inside already
    /// allocated content.
    pub fn calculate_card_number(&self, ptr: *const u8) -> u32 {
        debug_assert!(self.contains(ptr), "{:p} is outside the slab data area", ptr);
        debug_assert!(
            ptr < self.head_alloc as *const u8 || ptr >= self.tail_alloc as *const u8,
            "{:p} is in unallocated space",
            ptr
        );
        ((ptr as usize - self.alloc_top as usize) >> CARD_SIZE_LOG2) as u32
    }

    /// Finds the slab header of the slab holding `header`.
    ///
    /// # Safety
    /// `header` must be a live allocation made in a slab.
    pub unsafe fn containing(header: *const AllocHeader) -> *mut SlabHeader {
        let card = (*header).card() as usize;
        let card_start = header as usize & !CARD_MASK;
        let alloc_top = card_start - card * CARD_SIZE;
        let slab = *((alloc_top - WORD_SIZE) as *const *mut SlabHeader);
        debug_assert!((*slab).is_valid(), "corrupt slab back-pointer for {:p}", header);
        slab
    }

    pub fn card_meta(&self, card: u32) -> CardMeta {
        self.header().card_meta(card)
    }

    pub fn mark_card_dirty(&self, card: u32) {
        self.header().mark_card_dirty(card)
    }

    pub fn clear_card_marks(&mut self) {
        for card in 0..self.data_cards as u32 {
            self.header().set_card_meta(card, CardMeta::new());
        }
    }

    pub fn dirty_cards(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.data_cards as u32).filter(move |&card| self.card_meta(card).dirty())
    }

    /// Every allocation, head region first. Valid only when all allocations
    /// were made through the heap's create paths, so each starts with an
    /// [`AllocHeader`].
    pub fn objects(&self) -> SlabObjects<'_> {
        SlabObjects {
            cursor: self.alloc_top,
            end: self.head_alloc,
            tail: Some((self.tail_alloc, self.alloc_bottom)),
            marker: PhantomData,
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects().count()
    }

    /// Moves the slab and every object in it to `generation`.
    pub(crate) fn retag(&mut self, generation: Generation) {
        self.generation = generation;
        unsafe {
            (*self.region.start().cast::<SlabHeader>()).generation = generation;
        }
        for object in self.objects() {
            unsafe { (*object.header_ptr().as_ptr()).set_generation(generation) }
        }
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        tracing::trace!(
            target: "whisper::gc",
            region = ?self.region.start(),
            size = self.region.size(),
            generation = ?self.generation,
            "releasing slab"
        );
    }
}

impl std::fmt::Debug for Slab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slab")
            .field("region", &self.region.start())
            .field("generation", &self.generation)
            .field("singleton", &self.singleton)
            .field("header_cards", &self.header_cards)
            .field("data_cards", &self.data_cards)
            .field("head_used", &self.head_used())
            .field("tail_used", &self.tail_used())
            .finish()
    }
}

pub struct SlabObjects<'a> {
    cursor: *mut u8,
    end: *mut u8,
    tail: Option<(*mut u8, *mut u8)>,
    marker: PhantomData<&'a Slab>,
}

impl Iterator for SlabObjects<'_> {
    type Item = UntypedGc;

    fn next(&mut self) -> Option<UntypedGc> {
        loop {
            if self.cursor < self.end {
                unsafe {
                    let header = self.cursor.cast::<AllocHeader>();
                    self.cursor = self.cursor.add((*header).allocation_size());
                    return Some(UntypedGc::from_header(NonNull::new_unchecked(header)));
                }
            }
            let (start, end) = self.tail.take()?;
            self.cursor = start;
            self.end = end;
        }
    }
}
