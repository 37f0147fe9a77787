//! The Scan and Update protocol.
//!
//! A [`Trace`] impl reports every embedded heap reference of a value. Scan
//! hands each in-bounds reference to a [`Scanner`]; Update hands it to an
//! [`Updater`] and rewrites the slot when a different pointer comes back.
//! Null references are never reported.

use std::cell::Cell;

use crate::gcref::{Gc, UntypedGc};

/// Receives `(slot, pointee)` for every live reference during a Scan.
pub trait Scanner {
    fn visit(&mut self, slot: *const UntypedGc, pointee: UntypedGc);
}

/// Receives `(slot, pointee)` during an Update and returns the relocated
/// pointer, or `pointee` itself when the object did not move.
pub trait Updater {
    fn update(&mut self, slot: *const UntypedGc, pointee: UntypedGc) -> UntypedGc;
}

impl<F: FnMut(*const UntypedGc, UntypedGc)> Scanner for F {
    fn visit(&mut self, slot: *const UntypedGc, pointee: UntypedGc) {
        self(slot, pointee)
    }
}

impl<F: FnMut(*const UntypedGc, UntypedGc) -> UntypedGc> Updater for F {
    fn update(&mut self, slot: *const UntypedGc, pointee: UntypedGc) -> UntypedGc {
        self(slot, pointee)
    }
}

/// Half-open address range `[start, end)` restricting which pointees are
/// reported. Compared against the pointee's header address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanBounds {
    start: usize,
    end: usize,
}

impl ScanBounds {
    /// Accepts every pointer.
    pub const ALL: ScanBounds = ScanBounds {
        start: 0,
        end: usize::MAX,
    };

    pub fn new(start: *const u8, end: *const u8) -> Self {
        debug_assert!(start <= end);
        Self {
            start: start as usize,
            end: end as usize,
        }
    }

    pub fn start(&self) -> *const u8 {
        self.start as _
    }

    pub fn end(&self) -> *const u8 {
        self.end as _
    }

    #[inline(always)]
    pub fn contains(&self, pointee: UntypedGc) -> bool {
        let addr = pointee.addr();
        addr >= self.start && addr < self.end
    }
}

/// Trait specifying how the substrate traverses a value of type `Self`.
///
/// # Safety
/// `scan` and `update` must recurse into every traced sub-field exactly once,
/// must not report non-pointer data, and must be idempotent. A type with
/// `IS_LEAF == true` must contain no references.
pub unsafe trait Trace {
    /// `true` when the type provably holds no references.
    const IS_LEAF: bool = false;

    fn scan(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        let _ = (scanner, bounds);
    }

    fn update(&mut self, updater: &mut dyn Updater, bounds: ScanBounds) {
        let _ = (updater, bounds);
    }
}

/// Scan entry point. Leaf types return without touching `value`.
#[inline]
pub fn scan<T: Trace + ?Sized>(value: &T, scanner: &mut dyn Scanner, bounds: ScanBounds) {
    if T::IS_LEAF {
        return;
    }
    value.scan(scanner, bounds)
}

/// Update entry point. Leaf types return without touching `value`.
#[inline]
pub fn update<T: Trace + ?Sized>(value: &mut T, updater: &mut dyn Updater, bounds: ScanBounds) {
    if T::IS_LEAF {
        return;
    }
    value.update(updater, bounds)
}

unsafe impl Trace for UntypedGc {
    fn scan(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        if bounds.contains(*self) {
            scanner.visit(self as *const UntypedGc, *self);
        }
    }

    fn update(&mut self, updater: &mut dyn Updater, bounds: ScanBounds) {
        if !bounds.contains(*self) {
            return;
        }
        let relocated = updater.update(self as *const UntypedGc, *self);
        if relocated != *self {
            *self = relocated;
        }
    }
}

unsafe impl<T> Trace for Gc<T> {
    fn scan(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        self.untyped_ref().scan(scanner, bounds)
    }

    fn update(&mut self, updater: &mut dyn Updater, bounds: ScanBounds) {
        self.untyped_mut().update(updater, bounds)
    }
}

unsafe impl<T: Trace> Trace for Option<T> {
    const IS_LEAF: bool = T::IS_LEAF;

    fn scan(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        if let Some(value) = self {
            value.scan(scanner, bounds);
        }
    }

    fn update(&mut self, updater: &mut dyn Updater, bounds: ScanBounds) {
        if let Some(value) = self {
            value.update(updater, bounds);
        }
    }
}

unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    const IS_LEAF: bool = T::IS_LEAF;

    fn scan(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        for elem in self.iter() {
            elem.scan(scanner, bounds);
        }
    }

    fn update(&mut self, updater: &mut dyn Updater, bounds: ScanBounds) {
        for elem in self.iter_mut() {
            elem.update(updater, bounds);
        }
    }
}

unsafe impl<T: Trace + Copy> Trace for Cell<T> {
    const IS_LEAF: bool = T::IS_LEAF;

    fn scan(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        unsafe { (*self.as_ptr()).scan(scanner, bounds) }
    }

    fn update(&mut self, updater: &mut dyn Updater, bounds: ScanBounds) {
        self.get_mut().update(updater, bounds)
    }
}

macro_rules! impl_leaf {
    ($($t:ty)*) => {
        $(
            unsafe impl Trace for $t {
                const IS_LEAF: bool = true;
            }
        )*
    };
}

impl_leaf!(
    ()
    bool char f32 f64
    u8 u16 u32 u64 u128 usize
    i8 i16 i32 i64 i128 isize
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        format::AllocFormat,
        header::{AllocHeader, Generation},
    };
    use std::ptr::NonNull;

    /// Stand-alone headers so references can be built without a heap.
    fn fake_objects(n: usize) -> Vec<Box<AllocHeader>> {
        (0..n)
            .map(|_| Box::new(AllocHeader::new(AllocFormat::BLOB, Generation::Hatchery, 0, 0)))
            .collect()
    }

    fn as_ref(header: &AllocHeader) -> UntypedGc {
        unsafe { UntypedGc::from_header(NonNull::from(header)) }
    }

    struct Triple {
        a: Option<UntypedGc>,
        b: u64,
        c: [Option<UntypedGc>; 2],
    }

    unsafe impl Trace for Triple {
        fn scan(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
            self.a.scan(scanner, bounds);
            self.b.scan(scanner, bounds);
            self.c.scan(scanner, bounds);
        }

        fn update(&mut self, updater: &mut dyn Updater, bounds: ScanBounds) {
            self.a.update(updater, bounds);
            self.b.update(updater, bounds);
            self.c.update(updater, bounds);
        }
    }

    #[test]
    fn leaf_flags_propagate() {
        assert!(<u32 as Trace>::IS_LEAF);
        assert!(<Option<[u8; 4]> as Trace>::IS_LEAF);
        assert!(!<Option<UntypedGc> as Trace>::IS_LEAF);
        assert!(!<[Gc<u8>; 3] as Trace>::IS_LEAF);
    }

    #[test]
    fn scan_visits_each_non_null_slot_once() {
        let objs = fake_objects(2);
        let value = Triple {
            a: Some(as_ref(&objs[0])),
            b: 99,
            c: [None, Some(as_ref(&objs[1]))],
        };
        let mut seen: Vec<(*const UntypedGc, UntypedGc)> = Vec::new();
        scan(&value, &mut |slot: *const UntypedGc, pointee: UntypedGc| seen.push((slot, pointee)), ScanBounds::ALL);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, value.a.as_ref().unwrap() as *const UntypedGc);
        assert_eq!(seen[0].1, as_ref(&objs[0]));
        assert_eq!(seen[1].0, value.c[1].as_ref().unwrap() as *const UntypedGc);
        assert_eq!(seen[1].1, as_ref(&objs[1]));

        let mut again: Vec<(*const UntypedGc, UntypedGc)> = Vec::new();
        scan(&value, &mut |slot: *const UntypedGc, pointee: UntypedGc| again.push((slot, pointee)), ScanBounds::ALL);
        assert_eq!(seen, again);
    }

    #[test]
    fn bounds_filter_pointees() {
        let objs = fake_objects(1);
        let target = as_ref(&objs[0]);
        let value = Triple {
            a: Some(target),
            b: 0,
            c: [None, None],
        };
        let addr = target.addr() as *const u8;
        let mut count = 0;
        let outside = ScanBounds::new(unsafe { addr.add(1) }, unsafe { addr.add(64) });
        scan(&value, &mut |_: *const UntypedGc, _: UntypedGc| count += 1, outside);
        assert_eq!(count, 0);
        let inside = ScanBounds::new(addr, unsafe { addr.add(1) });
        scan(&value, &mut |_: *const UntypedGc, _: UntypedGc| count += 1, inside);
        assert_eq!(count, 1);
    }

    #[test]
    fn update_rewrites_only_changed_slots() {
        let objs = fake_objects(3);
        let (from, keep, to) = (as_ref(&objs[0]), as_ref(&objs[1]), as_ref(&objs[2]));
        let mut value = Triple {
            a: Some(from),
            b: 5,
            c: [Some(keep), None],
        };
        let mut calls = 0;
        update(
            &mut value,
            &mut |_: *const UntypedGc, pointee: UntypedGc| {
                calls += 1;
                if pointee == from {
                    to
                } else {
                    pointee
                }
            },
            ScanBounds::ALL,
        );
        assert_eq!(calls, 2);
        assert_eq!(value.a, Some(to));
        assert_eq!(value.c[0], Some(keep));
        assert_eq!(value.c[1], None);
        assert_eq!(value.b, 5);
    }

    #[test]
    fn update_leaves_out_of_bounds_slots_alone() {
        let objs = fake_objects(2);
        let (from, to) = (as_ref(&objs[0]), as_ref(&objs[1]));
        let mut value = Triple {
            a: Some(from),
            b: 0,
            c: [None, None],
        };
        let empty = ScanBounds::new(std::ptr::null(), std::ptr::null());
        update(&mut value, &mut |_: *const UntypedGc, _: UntypedGc| to, empty);
        assert_eq!(value.a, Some(from));
    }
}
