use std::{mem::size_of, sync::Arc, thread};

use crate::{
    format::{AllocFormat, HeapTraits, StackFormat, StackTraits},
    gcref::{Gc, UntypedGc},
    header::{Generation, HEADER_SIZE},
    heap_field::HeapField,
    local,
    runtime::Runtime,
    trace::{ScanBounds, Scanner, Trace, Updater},
    util::{align_down, WORD_SIZE},
    Blob, Config, HeapError,
};

struct Pair {
    left: HeapField<Option<Gc<Pair>>>,
    right: HeapField<Option<Gc<Pair>>>,
    value: u64,
}

unsafe impl Trace for Pair {
    fn scan(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        self.left.scan(scanner, bounds);
        self.right.scan(scanner, bounds);
    }

    fn update(&mut self, updater: &mut dyn Updater, bounds: ScanBounds) {
        self.left.update(updater, bounds);
        self.right.update(updater, bounds);
    }
}

unsafe impl HeapTraits for Pair {
    const FORMAT: AllocFormat = AllocFormat::user(0);
    const NAME: &'static str = "Pair";
}

impl Pair {
    fn new(value: u64) -> Self {
        Self {
            left: HeapField::new(None),
            right: HeapField::new(None),
            value,
        }
    }
}

/// Two roots held in one stack slot.
struct RootPair {
    first: Option<Gc<Pair>>,
    second: Option<Gc<Pair>>,
}

unsafe impl Trace for RootPair {
    fn scan(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        self.first.scan(scanner, bounds);
        self.second.scan(scanner, bounds);
    }

    fn update(&mut self, updater: &mut dyn Updater, bounds: ScanBounds) {
        self.first.update(updater, bounds);
        self.second.update(updater, bounds);
    }
}

unsafe impl StackTraits for RootPair {
    const FORMAT: StackFormat = StackFormat::user(0);
    const NAME: &'static str = "RootPair";
}

fn runtime() -> Arc<Runtime> {
    Arc::new(Runtime::new(Config::default()).unwrap())
}

fn collect_scan(f: impl FnOnce(&mut dyn Scanner)) -> Vec<(*const UntypedGc, UntypedGc)> {
    let mut seen = Vec::new();
    f(&mut |slot: *const UntypedGc, pointee: UntypedGc| seen.push((slot, pointee)));
    seen
}

#[test]
fn tenured_slab_rolls_over_when_full() {
    let runtime = runtime();
    let cx = runtime.register_thread().unwrap();
    let tenured = cx.in_tenured();
    let (first, capacity) = {
        let list = cx.slab_list(Generation::Tenured).borrow();
        let id = list.current().unwrap();
        (id, list.get(id).unwrap().capacity())
    };

    let amount = align_down(capacity * 3 / 10, WORD_SIZE);
    let payload = amount - HEADER_SIZE;
    let mut blobs = Vec::new();
    for _ in 0..3 {
        let blob = tenured
            .create_sized(payload, Blob::with_len(payload - size_of::<Blob>()))
            .unwrap();
        assert_eq!(cx.locate(blob.untyped()).unwrap().slab, first);
        blobs.push(blob);
    }
    {
        let list = cx.slab_list(Generation::Tenured).borrow();
        let slab = list.get(first).unwrap();
        assert_eq!(slab.used_bytes(), 3 * amount);
        assert!(slab.used_bytes() * 10 <= capacity * 9);
        assert!(slab.free_bytes() < amount);
    }

    let fourth = tenured
        .create_sized(payload, Blob::with_len(payload - size_of::<Blob>()))
        .unwrap();
    let list = cx.slab_list(Generation::Tenured).borrow();
    assert_eq!(list.len(), 2);
    let second = list.current().unwrap();
    assert_ne!(second, first);
    assert_eq!(cx.locate(fourth.untyped()).unwrap().slab, second);
    assert_eq!(list.get(first).unwrap().object_count(), 3);
    assert!(blobs.iter().all(|blob| blob.generation() == Generation::Tenured));
}

#[test]
fn scanning_reports_every_edge_once() {
    let runtime = runtime();
    let cx = runtime.register_thread().unwrap();
    let hatchery = cx.in_hatchery();
    let a = hatchery.create(Pair::new(1)).unwrap();
    let b = hatchery.create(Pair::new(2)).unwrap();
    let c = hatchery.create(Pair::new(3)).unwrap();
    a.left.set(Some(b), a);
    a.right.set(Some(c), a);
    b.right.set(Some(c), b);
    c.left.set(Some(c), c);

    let edges = collect_scan(|s| cx.scan_generation(Generation::Hatchery, s, ScanBounds::ALL));
    let expected = vec![
        (a.left.as_ptr() as *const UntypedGc, b.untyped()),
        (a.right.as_ptr() as *const UntypedGc, c.untyped()),
        (b.right.as_ptr() as *const UntypedGc, c.untyped()),
        (c.left.as_ptr() as *const UntypedGc, c.untyped()),
    ];
    assert_eq!(edges, expected);

    let again = collect_scan(|s| cx.scan_generation(Generation::Hatchery, s, ScanBounds::ALL));
    assert_eq!(edges, again);
    assert_eq!((a.value, b.value, c.value), (1, 2, 3));
}

#[test]
fn leaf_objects_are_never_scanned() {
    let runtime = runtime();
    let cx = runtime.register_thread().unwrap();
    let blob = Blob::create(&cx.in_hatchery(), &[0xff; 64]).unwrap();
    let edges = collect_scan(|s| cx.scan_object(blob.untyped(), s, ScanBounds::ALL));
    assert!(edges.is_empty());
}

#[test]
fn bounds_select_a_generation() {
    let runtime = runtime();
    let cx = runtime.register_thread().unwrap();
    let young = cx.in_hatchery().create(Pair::new(0)).unwrap();
    let old = cx.in_tenured().create(Pair::new(1)).unwrap();
    let holder = cx.in_hatchery().create(Pair::new(2)).unwrap();
    holder.left.set(Some(young), holder);
    holder.right.set(Some(old), holder);

    let bounds = {
        let list = cx.slab_list(Generation::Tenured).borrow();
        let slab = list.get(list.current().unwrap()).unwrap();
        ScanBounds::new(slab.alloc_top(), slab.alloc_bottom())
    };
    let edges = collect_scan(|s| cx.scan_object(holder.untyped(), s, bounds));
    assert_eq!(edges, vec![(holder.right.as_ptr() as *const UntypedGc, old.untyped())]);
}

#[test]
fn relocation_updates_heap_and_stack() {
    let runtime = runtime();
    let cx = runtime.register_thread().unwrap();
    let hatchery = cx.in_hatchery();
    let a = hatchery.create(Pair::new(1)).unwrap();
    let b = hatchery.create(Pair::new(2)).unwrap();
    let other = hatchery.create(Pair::new(3)).unwrap();
    a.left.set(Some(b), a);
    a.right.set(Some(other), a);
    local!(root = &cx, b);
    local!(both = &cx, RootPair { first: Some(other), second: Some(b) });

    let copy = cx.in_tenured().create(Pair::new(b.value)).unwrap();
    let mut moved = 0;
    let mut relocate = |_: *const UntypedGc, pointee: UntypedGc| {
        if pointee == b.untyped() {
            moved += 1;
            copy.untyped()
        } else {
            pointee
        }
    };
    cx.update_roots(&mut relocate, ScanBounds::ALL);
    cx.update_generation(Generation::Hatchery, &mut relocate, ScanBounds::ALL)
        .unwrap();
    assert_eq!(moved, 3);

    assert!(root.get().ptr_eq(copy));
    assert!(both.first.unwrap().ptr_eq(other));
    assert!(both.second.unwrap().ptr_eq(copy));
    assert_eq!(a.left.get().map(Gc::untyped), Some(copy.untyped()));
    assert_eq!(a.right.get().map(Gc::untyped), Some(other.untyped()));
    assert_eq!(root.value, 2);
}

#[test]
fn immortal_generation_is_scanned_through_the_runtime() {
    let mut runtime = Runtime::new(Config::default()).unwrap();
    let name = runtime
        .create_immortal_sized(Blob::payload_size(3).unwrap(), Blob::with_len(3))
        .unwrap();
    runtime.set_well_known(1, Some(name.untyped()));
    let runtime = Arc::new(runtime);
    let cx = runtime.register_thread().unwrap();

    let edges = collect_scan(|s| cx.scan_generation(Generation::Immortal, s, ScanBounds::ALL));
    let pointees: Vec<UntypedGc> = edges.iter().map(|&(_, pointee)| pointee).collect();
    assert!(pointees.contains(&name.untyped()));
    assert_eq!(pointees.len(), 2);

    let result = cx.update_generation(
        Generation::Immortal,
        &mut |_: *const UntypedGc, pointee: UntypedGc| pointee,
        ScanBounds::ALL,
    );
    assert_eq!(
        result,
        Err(HeapError::ReadOnlyGeneration {
            generation: Generation::Immortal
        })
    );
    assert!(cx.thread_slab_list(Generation::Immortal).is_none());
}

#[test]
fn custom_stack_formats_dispatch() {
    let runtime = runtime();
    let cx = runtime.register_thread().unwrap();
    let x = cx.in_hatchery().create(Pair::new(1)).unwrap();
    local!(pair = &cx, RootPair { first: None, second: Some(x) });
    assert_eq!(pair.format(), StackFormat::user(0));
    assert!(runtime.stack_formats().is_registered(StackFormat::user(0)));
    let roots = collect_scan(|s| cx.scan_roots(s, ScanBounds::ALL));
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].1, x.untyped());
    assert_eq!(roots[0].0, pair.second.as_ref().unwrap() as *const Gc<Pair> as *const UntypedGc);
}

#[test]
fn objects_round_trip_through_their_cards() {
    let runtime = runtime();
    let cx = runtime.register_thread().unwrap();
    let hatchery = cx.in_hatchery();
    let mut objects = Vec::new();
    for i in 0..2000 {
        objects.push(hatchery.create(Pair::new(i)).unwrap().untyped());
    }
    let list = cx.slab_list(Generation::Hatchery).borrow();
    assert!(list.len() > 1);
    for object in objects {
        let location = cx.locate(object).unwrap();
        let slab = list.get(location.slab).unwrap();
        assert_eq!(slab.alloc_top() as usize + location.offset, object.addr());
        assert_eq!(location.card, slab.calculate_card_number(object.addr() as *const u8));
    }
}

#[test]
fn threads_have_private_heaps() {
    let runtime = runtime();
    let main = runtime.register_thread().unwrap();
    let here = main.in_hatchery().create(Pair::new(1)).unwrap();
    let remote = runtime.clone();
    let there = thread::spawn(move || {
        let cx = remote.register_thread().unwrap();
        let pair = cx.in_hatchery().create(Pair::new(2)).unwrap();
        let stats = cx.statistics();
        assert_eq!(stats.generation(Generation::Hatchery).objects, 1);
        assert_eq!(stats.threads, 2);
        pair.value
    })
    .join()
    .unwrap();
    assert_eq!(there, 2);
    assert_eq!(here.value, 1);
    assert_eq!(main.statistics().generation(Generation::Hatchery).objects, 1);
}

#[test]
fn oversized_requests_are_reported_not_panicked() {
    let runtime = runtime();
    let cx = runtime.register_thread().unwrap();
    let result = cx
        .in_tenured()
        .create_sized(usize::MAX - 64, Blob::with_len(0));
    assert!(result.is_err());
}
