//! Format tags and the dispatch tables keyed by them.
//!
//! Every heap allocation carries an [`AllocFormat`] in its header and every
//! stack root records a [`StackFormat`]. Generic code that only holds an
//! untyped pointer recovers the concrete type's tracing behaviour by looking
//! the tag up in a [`FormatTable`]. Entries hold monomorphized function
//! pointers, so a lookup is one indexed load.

use std::{fmt, marker::PhantomData, sync::OnceLock};

use crate::trace::{ScanBounds, Scanner, Trace, Updater};

/// Highest tag value (exclusive) accepted by a [`FormatTable`].
pub const MAX_FORMATS: u16 = 1 << 10;

/// First tag value available to consumer subsystems.
pub const FIRST_USER_FORMAT: u16 = 64;

/// Tag selecting the layout and tracing behaviour of a heap allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct AllocFormat(u16);

impl AllocFormat {
    /// Untraced byte payload.
    pub const BLOB: Self = Self(1);
    /// Variable-length array of untyped references.
    pub const REF_ARRAY: Self = Self(2);
    /// Per-runtime root object living in the immortal generation.
    pub const RUNTIME_STATE: Self = Self(3);

    /// Tag number `index` of the consumer range.
    pub const fn user(index: u16) -> Self {
        assert!(index < MAX_FORMATS - FIRST_USER_FORMAT);
        Self(FIRST_USER_FORMAT + index)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for AllocFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AllocFormat({})", self.0)
    }
}

/// Tag selecting the tracing behaviour of a stack root's payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct StackFormat(u16);

impl StackFormat {
    /// Plain data with no embedded references.
    pub const LEAF: Self = Self(1);
    /// A single non-null heap reference.
    pub const GC_REF: Self = Self(2);
    /// A nullable heap reference.
    pub const OPTIONAL_GC_REF: Self = Self(3);

    pub const fn user(index: u16) -> Self {
        assert!(index < MAX_FORMATS - FIRST_USER_FORMAT);
        Self(FIRST_USER_FORMAT + index)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for StackFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StackFormat({})", self.0)
    }
}

/// Contract for any type allocated through
/// [`AllocationContext::create`](crate::allocation::AllocationContext::create).
///
/// # Safety
/// `FORMAT` must be unique to this type (sharing a tag requires an identical
/// layout and `NAME`), and the [`Trace`] impl must report every embedded
/// reference.
pub unsafe trait HeapTraits: Trace + Sized {
    const FORMAT: AllocFormat;
    const NAME: &'static str;
}

/// Contract for any type rooted through [`Local`](crate::rooting::Local).
///
/// # Safety
/// Same as [`HeapTraits`]: all types sharing a tag must share layout and
/// `NAME`.
pub unsafe trait StackTraits: Trace + Sized {
    const FORMAT: StackFormat;
    const NAME: &'static str;
}

pub type ScanFn = unsafe fn(*mut u8, &mut dyn Scanner, ScanBounds);
pub type UpdateFn = unsafe fn(*mut u8, &mut dyn Updater, ScanBounds);

/// Dispatch entry for one tag.
#[derive(Clone, Copy)]
pub struct FormatEntry {
    pub name: &'static str,
    pub is_leaf: bool,
    pub scan: ScanFn,
    pub update: UpdateFn,
}

impl FormatEntry {
    /// Entry for heap payloads of type `T`. The pointer passed to `scan`
    /// and `update` is the payload address.
    pub fn for_heap<T: HeapTraits>() -> Self {
        unsafe fn scan<T: Trace>(payload: *mut u8, scanner: &mut dyn Scanner, bounds: ScanBounds) {
            crate::trace::scan(&*(payload as *const T), scanner, bounds)
        }
        unsafe fn update<T: Trace>(
            payload: *mut u8,
            updater: &mut dyn Updater,
            bounds: ScanBounds,
        ) {
            crate::trace::update(&mut *(payload as *mut T), updater, bounds)
        }
        Self {
            name: T::NAME,
            is_leaf: T::IS_LEAF,
            scan: scan::<T>,
            update: update::<T>,
        }
    }
}

impl fmt::Debug for FormatEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatEntry")
            .field("name", &self.name)
            .field("is_leaf", &self.is_leaf)
            .finish()
    }
}

pub trait FormatTag: Copy + fmt::Debug {
    fn index(self) -> usize;
}

impl FormatTag for AllocFormat {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl FormatTag for StackFormat {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Fixed-capacity table of dispatch entries. Entries are written once and
/// read without locking.
pub struct FormatTable<F: FormatTag> {
    entries: Box<[OnceLock<FormatEntry>]>,
    marker: PhantomData<F>,
}

impl<F: FormatTag> FormatTable<F> {
    pub fn new() -> Self {
        Self {
            entries: (0..MAX_FORMATS).map(|_| OnceLock::new()).collect(),
            marker: PhantomData,
        }
    }

    /// Installs `entry` for `tag` unless one is present. Registering a
    /// different type name under an occupied tag is a programming error.
    pub fn register(&self, tag: F, entry: FormatEntry) -> &FormatEntry {
        let slot = self
            .entries
            .get(tag.index())
            .unwrap_or_else(|| panic!("format tag {:?} out of range", tag));
        let installed = slot.get_or_init(|| {
            tracing::trace!(target: "whisper::gc", tag = ?tag, name = entry.name, "registered format");
            entry
        });
        assert_eq!(
            installed.name, entry.name,
            "format tag {:?} is already registered for `{}`",
            tag, installed.name
        );
        installed
    }

    pub fn get(&self, tag: F) -> Option<&FormatEntry> {
        self.entries.get(tag.index()).and_then(|slot| slot.get())
    }

    /// Entry for `tag`. An unregistered tag means the header or root list
    /// is corrupt.
    pub fn lookup(&self, tag: F) -> &FormatEntry {
        match self.get(tag) {
            Some(entry) => entry,
            None => panic!("no dispatch entry for {:?}", tag),
        }
    }

    pub fn is_registered(&self, tag: F) -> bool {
        self.get(tag).is_some()
    }

    pub fn registered_count(&self) -> usize {
        self.entries.iter().filter(|slot| slot.get().is_some()).count()
    }

    /// Runs the Scan algorithm for the object at `ptr`.
    ///
    /// # Safety
    /// `ptr` must point at a live value of the type registered for `tag`.
    pub unsafe fn scan(&self, tag: F, ptr: *mut u8, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        let entry = self.lookup(tag);
        if entry.is_leaf {
            return;
        }
        (entry.scan)(ptr, scanner, bounds)
    }

    /// Runs the Update algorithm for the object at `ptr`.
    ///
    /// # Safety
    /// Same as [`FormatTable::scan`]; additionally no other reference to the
    /// object may be in use.
    pub unsafe fn update(
        &self,
        tag: F,
        ptr: *mut u8,
        updater: &mut dyn Updater,
        bounds: ScanBounds,
    ) {
        let entry = self.lookup(tag);
        if entry.is_leaf {
            return;
        }
        (entry.update)(ptr, updater, bounds)
    }
}

impl<F: FormatTag> Default for FormatTable<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcref::UntypedGc;

    struct Plain(#[allow(dead_code)] u64);
    unsafe impl Trace for Plain {
        const IS_LEAF: bool = true;
    }
    unsafe impl HeapTraits for Plain {
        const FORMAT: AllocFormat = AllocFormat::user(1);
        const NAME: &'static str = "Plain";
    }

    struct Other(#[allow(dead_code)] Option<UntypedGc>);
    unsafe impl Trace for Other {
        fn scan(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
            self.0.scan(scanner, bounds)
        }
        fn update(&mut self, updater: &mut dyn Updater, bounds: ScanBounds) {
            self.0.update(updater, bounds)
        }
    }
    unsafe impl HeapTraits for Other {
        const FORMAT: AllocFormat = AllocFormat::user(1);
        const NAME: &'static str = "Other";
    }

    #[test]
    fn user_tags_start_after_builtins() {
        assert_eq!(AllocFormat::user(0).raw(), FIRST_USER_FORMAT);
        assert!(AllocFormat::RUNTIME_STATE.raw() < FIRST_USER_FORMAT);
        assert_eq!(StackFormat::user(3).raw(), FIRST_USER_FORMAT + 3);
    }

    #[test]
    fn registration_is_idempotent() {
        let table = FormatTable::<AllocFormat>::new();
        assert!(!table.is_registered(Plain::FORMAT));
        table.register(Plain::FORMAT, FormatEntry::for_heap::<Plain>());
        table.register(Plain::FORMAT, FormatEntry::for_heap::<Plain>());
        assert_eq!(table.registered_count(), 1);
        let entry = table.lookup(Plain::FORMAT);
        assert_eq!(entry.name, "Plain");
        assert!(entry.is_leaf);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn conflicting_registration_panics() {
        let table = FormatTable::<AllocFormat>::new();
        table.register(Plain::FORMAT, FormatEntry::for_heap::<Plain>());
        table.register(Other::FORMAT, FormatEntry::for_heap::<Other>());
    }

    #[test]
    #[should_panic(expected = "no dispatch entry")]
    fn unknown_tag_is_fatal() {
        let table = FormatTable::<StackFormat>::new();
        table.lookup(StackFormat::user(9));
    }
}
