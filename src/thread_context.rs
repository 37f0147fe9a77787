use std::{
    cell::{Cell, RefCell},
    ptr,
    sync::Arc,
    thread::{self, ThreadId},
};

use crate::{
    allocation::AllocationContext,
    error::HeapError,
    gcref::UntypedGc,
    header::Generation,
    rooting::LocalBase,
    runtime::Runtime,
    slab::{self, HeapLocation},
    slab_list::SlabList,
    statistics::{GenerationStatistics, HeapStatistics},
    trace::{ScanBounds, Scanner, Updater},
};

/// Per-thread heap: the thread's generations and its stack root list.
///
/// A context is bound to the thread that registered it and is neither `Send`
/// nor `Sync`. Allocation takes no locks.
pub struct ThreadContext {
    runtime: Arc<Runtime>,
    hatchery: RefCell<SlabList>,
    nursery: RefCell<SlabList>,
    tenured: RefCell<SlabList>,
    locals: Cell<*mut LocalBase>,
    thread: ThreadId,
}

impl ThreadContext {
    pub(crate) fn new(runtime: Arc<Runtime>) -> Result<Self, HeapError> {
        let config = runtime.config();
        let mut hatchery = SlabList::new(Generation::Hatchery, config);
        hatchery.add_standard_slab()?;
        let nursery = SlabList::new(Generation::Nursery, config);
        let mut tenured = SlabList::new(Generation::Tenured, config);
        tenured.add_standard_slab()?;
        Ok(Self {
            hatchery: RefCell::new(hatchery),
            nursery: RefCell::new(nursery),
            tenured: RefCell::new(tenured),
            locals: Cell::new(ptr::null_mut()),
            thread: thread::current().id(),
            runtime,
        })
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    pub fn in_hatchery(&self) -> AllocationContext<'_> {
        AllocationContext::new(self, Generation::Hatchery)
    }

    pub fn in_tenured(&self) -> AllocationContext<'_> {
        AllocationContext::new(self, Generation::Tenured)
    }

    /// Slab list of one of this thread's generations.
    ///
    /// # Panics
    /// For [`Generation::Immortal`], whose slabs belong to the [`Runtime`]
    /// (see [`Runtime::immortal`]). Use [`ThreadContext::thread_slab_list`]
    /// when the generation is not known statically.
    pub fn slab_list(&self, generation: Generation) -> &RefCell<SlabList> {
        match self.thread_slab_list(generation) {
            Some(list) => list,
            None => panic!("the immortal generation is owned by the runtime"),
        }
    }

    /// Slab list of `generation` if this thread owns it.
    pub fn thread_slab_list(&self, generation: Generation) -> Option<&RefCell<SlabList>> {
        match generation {
            Generation::Hatchery => Some(&self.hatchery),
            Generation::Nursery => Some(&self.nursery),
            Generation::Tenured => Some(&self.tenured),
            Generation::Immortal => None,
        }
    }

    pub fn locals_head(&self) -> *mut LocalBase {
        self.locals.get()
    }

    pub(crate) fn set_locals_head(&self, head: *mut LocalBase) {
        self.locals.set(head);
    }

    /// Removes `target` from the root list wherever it is.
    ///
    /// # Safety
    /// Every node in the list must be live.
    pub(crate) unsafe fn unlink_local(&self, target: *mut LocalBase) -> bool {
        let head = self.locals.get();
        if head == target {
            self.locals.set((*target).next);
            return true;
        }
        let mut node = head;
        while !node.is_null() {
            if (*node).next == target {
                (*node).next = (*target).next;
                return true;
            }
            node = (*node).next;
        }
        false
    }

    pub fn local_count(&self) -> usize {
        let mut count = 0;
        let mut node = self.locals.get();
        while !node.is_null() {
            count += 1;
            node = unsafe { (*node).next };
        }
        count
    }

    /// Runs Scan over every stack root, newest first.
    pub fn scan_roots(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        let formats = self.runtime.stack_formats();
        let mut node = self.locals.get();
        while !node.is_null() {
            unsafe {
                let next = (*node).next;
                formats.scan((*node).format, node.cast(), scanner, bounds);
                node = next;
            }
        }
    }

    /// Runs Update over every stack root, newest first.
    pub fn update_roots(&self, updater: &mut dyn Updater, bounds: ScanBounds) {
        let formats = self.runtime.stack_formats();
        let mut node = self.locals.get();
        while !node.is_null() {
            unsafe {
                let next = (*node).next;
                formats.update((*node).format, node.cast(), updater, bounds);
                node = next;
            }
        }
    }

    /// Runs Scan over the references held by `object`.
    pub fn scan_object(&self, object: UntypedGc, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        unsafe {
            self.runtime
                .heap_formats()
                .scan(object.format(), object.payload(), scanner, bounds)
        }
    }

    /// Runs Update over the references held by `object`.
    pub fn update_object(&self, object: UntypedGc, updater: &mut dyn Updater, bounds: ScanBounds) {
        unsafe {
            self.runtime
                .heap_formats()
                .update(object.format(), object.payload(), updater, bounds)
        }
    }

    /// Scans every object of `generation`. The immortal generation is the
    /// runtime's. The scanner must not allocate.
    pub fn scan_generation(
        &self,
        generation: Generation,
        scanner: &mut dyn Scanner,
        bounds: ScanBounds,
    ) {
        let list = match self.thread_slab_list(generation) {
            Some(list) => list.borrow(),
            None => return self.runtime.scan_immortal(scanner, bounds),
        };
        for (_, slab) in list.iter() {
            for object in slab.objects() {
                self.scan_object(object, scanner, bounds);
            }
        }
    }

    /// Updates every object of one of this thread's generations. The
    /// immortal generation is read-only once the runtime is shared. The
    /// updater must not allocate.
    pub fn update_generation(
        &self,
        generation: Generation,
        updater: &mut dyn Updater,
        bounds: ScanBounds,
    ) -> Result<(), HeapError> {
        let list = self
            .thread_slab_list(generation)
            .ok_or(HeapError::ReadOnlyGeneration { generation })?
            .borrow();
        for (_, slab) in list.iter() {
            for object in slab.objects() {
                self.update_object(object, updater, bounds);
            }
        }
        Ok(())
    }

    /// Slab and offset of `object`.
    pub fn locate(&self, object: UntypedGc) -> Option<HeapLocation> {
        slab::locate(object)
    }

    pub fn statistics(&self) -> HeapStatistics {
        let mut generations = [GenerationStatistics::default(); 4];
        for generation in [Generation::Hatchery, Generation::Nursery, Generation::Tenured] {
            generations[generation as usize] =
                GenerationStatistics::of(&self.slab_list(generation).borrow());
        }
        generations[Generation::Immortal as usize] =
            GenerationStatistics::of(self.runtime.immortal());
        HeapStatistics {
            generations,
            locals: self.local_count(),
            threads: self.runtime.thread_count(),
        }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        if !thread::panicking() {
            debug_assert!(
                self.locals.get().is_null(),
                "thread context dropped with live locals"
            );
        }
        self.runtime.unregister_thread(self.thread);
    }
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("thread", &self.thread)
            .field("hatchery", &self.hatchery)
            .field("tenured", &self.tenured)
            .field("locals", &self.local_count())
            .finish()
    }
}
