use std::{
    mem::size_of,
    sync::Arc,
    thread::{self, ThreadId},
};

use parking_lot::Mutex;

use crate::{
    allocation::create_registered,
    builtins::{RefArray, RuntimeState},
    bump::BumpAllocator,
    error::HeapError,
    format::{AllocFormat, FormatEntry, FormatTable, HeapTraits, StackFormat, StackTraits},
    gcref::{Gc, UntypedGc},
    header::Generation,
    slab_list::SlabList,
    thread_context::ThreadContext,
    trace::{ScanBounds, Scanner},
    Config,
};

/// Process-wide heap state shared by every registered thread.
///
/// The immortal generation is populated through `&mut Runtime` before the
/// runtime is wrapped in an [`Arc`]; afterwards it is only read.
pub struct Runtime {
    config: Config,
    immortal: SlabList,
    state: Gc<RuntimeState>,
    heap_formats: FormatTable<AllocFormat>,
    stack_formats: FormatTable<StackFormat>,
    threads: Mutex<Vec<ThreadId>>,
}

// The immortal slabs are never written once the runtime is shared, and the
// format tables and thread registry synchronize internally.
unsafe impl Send for Runtime {}
unsafe impl Sync for Runtime {}

impl Runtime {
    pub fn new(config: Config) -> Result<Self, HeapError> {
        config.validate()?;
        let mut immortal = SlabList::new(Generation::Immortal, &config);
        immortal.add_standard_slab()?;
        let heap_formats = FormatTable::new();
        let well_known_size =
            RefArray::payload_size(config.well_known_slots).ok_or(HeapError::InvalidConfig {
                field: "well_known_slots",
                value: config.well_known_slots,
            })?;
        let well_known = create_registered(
            &mut immortal,
            &heap_formats,
            well_known_size,
            RefArray::with_len(config.well_known_slots),
        )?;
        let state = create_registered(
            &mut immortal,
            &heap_formats,
            size_of::<RuntimeState>(),
            RuntimeState::new(well_known),
        )?;
        logln_if!(
            config.verbose,
            slots = config.well_known_slots,
            "initialized runtime"
        );
        Ok(Self {
            config,
            immortal,
            state,
            heap_formats,
            stack_formats: FormatTable::new(),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The runtime's root object. Its slots are read through
    /// [`Runtime::well_known`] and written only through
    /// [`Runtime::set_well_known`].
    pub fn state(&self) -> Gc<RuntimeState> {
        self.state
    }

    pub fn immortal(&self) -> &SlabList {
        &self.immortal
    }

    pub fn heap_formats(&self) -> &FormatTable<AllocFormat> {
        &self.heap_formats
    }

    pub fn stack_formats(&self) -> &FormatTable<StackFormat> {
        &self.stack_formats
    }

    /// Bump allocator with the configured chunk size.
    pub fn bump_allocator(&self) -> BumpAllocator {
        BumpAllocator::with_chunk_size(self.config.bump_chunk_size)
    }

    pub fn register_heap_format<T: HeapTraits>(&self) -> &FormatEntry {
        self.heap_formats
            .register(T::FORMAT, FormatEntry::for_heap::<T>())
    }

    pub fn register_stack_format<T: StackTraits>(&self) -> &FormatEntry {
        self.stack_formats
            .register(T::FORMAT, crate::rooting::stack_entry::<T>())
    }

    /// Allocates a write-once object in the immortal generation.
    pub fn create_immortal<T: HeapTraits>(&mut self, value: T) -> Result<Gc<T>, HeapError> {
        self.create_immortal_sized(size_of::<T>(), value)
    }

    pub fn create_immortal_sized<T: HeapTraits>(
        &mut self,
        size: usize,
        value: T,
    ) -> Result<Gc<T>, HeapError> {
        create_registered(&mut self.immortal, &self.heap_formats, size, value)
    }

    /// Stores `value` in well-known slot `index` of the runtime state. Only
    /// immortal objects may be published this way.
    pub fn set_well_known(&mut self, index: usize, value: Option<UntypedGc>) {
        if let Some(object) = value {
            assert_eq!(
                object.generation(),
                Generation::Immortal,
                "well-known slots only hold immortal objects"
            );
        }
        let slot = self.state.well_known().slot(index).as_ptr();
        // Immortal containers bypass the barrier; `&mut self` excludes readers.
        unsafe { *slot = value };
    }

    pub fn well_known(&self, index: usize) -> Option<UntypedGc> {
        self.state.well_known().get(index)
    }

    pub fn well_known_slots(&self) -> usize {
        self.state.well_known().len()
    }

    /// Scans every immortal object.
    pub fn scan_immortal(&self, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        for (_, slab) in self.immortal.iter() {
            for object in slab.objects() {
                unsafe {
                    self.heap_formats
                        .scan(object.format(), object.payload(), scanner, bounds)
                };
            }
        }
    }

    /// Creates the calling thread's heap and registers it.
    pub fn register_thread(self: &Arc<Self>) -> Result<ThreadContext, HeapError> {
        let cx = ThreadContext::new(self.clone())?;
        let id = thread::current().id();
        let count = {
            let mut threads = self.threads.lock();
            threads.push(id);
            threads.len()
        };
        logln_if!(self.config.verbose, thread = ?id, count, "registered thread");
        Ok(cx)
    }

    pub(crate) fn unregister_thread(&self, id: ThreadId) {
        let mut threads = self.threads.lock();
        if let Some(pos) = threads.iter().position(|&registered| registered == id) {
            threads.swap_remove(pos);
        }
        tracing::debug!(target: "whisper::gc", thread = ?id, count = threads.len(), "unregistered thread");
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("immortal", &self.immortal)
            .field("threads", &self.thread_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::Blob;

    #[test]
    fn new_runtime_has_immortal_state() {
        let runtime = Runtime::new(Config::default()).unwrap();
        let state = runtime.state();
        assert_eq!(state.generation(), Generation::Immortal);
        assert_eq!(state.format(), AllocFormat::RUNTIME_STATE);
        assert_eq!(runtime.well_known_slots(), Config::default().well_known_slots);
        assert!(runtime.heap_formats().is_registered(AllocFormat::REF_ARRAY));
        assert_eq!(runtime.immortal().len(), 1);
        assert_eq!(runtime.thread_count(), 0);
        assert_eq!(runtime.bump_allocator().chunk_size(), Config::default().bump_chunk_size);
    }

    #[test]
    fn immortal_objects_are_published_before_sharing() {
        let mut runtime = Runtime::new(Config::default()).unwrap();
        let name = runtime.create_immortal_sized(
            size_of::<Blob>() + 5,
            Blob::with_len(5),
        );
        let name = name.unwrap();
        assert_eq!(name.generation(), Generation::Immortal);
        runtime.set_well_known(0, Some(name.untyped()));
        let runtime = Arc::new(runtime);
        assert_eq!(runtime.well_known(0), Some(name.untyped()));
        assert_eq!(runtime.well_known(1), None);

        let mut seen = Vec::new();
        runtime.scan_immortal(
            &mut |_: *const UntypedGc, pointee: UntypedGc| seen.push(pointee),
            ScanBounds::ALL,
        );
        assert!(seen.contains(&name.untyped()));
        assert!(seen.contains(&runtime.state().well_known().untyped()));
    }

    #[test]
    #[should_panic(expected = "only hold immortal objects")]
    fn young_objects_cannot_be_published() {
        let mut runtime = Runtime::new(Config::default()).unwrap();
        let other = Arc::new(Runtime::new(Config::default()).unwrap());
        let cx = other.register_thread().unwrap();
        let young = Blob::create(&cx.in_hatchery(), b"young").unwrap();
        runtime.set_well_known(0, Some(young.untyped()));
    }

    #[test]
    fn shared_runtime_keeps_well_known_slots_read_only() {
        let mut runtime = Runtime::new(Config::default()).unwrap();
        let name = runtime
            .create_immortal_sized(Blob::payload_size(4).unwrap(), Blob::with_len(4))
            .unwrap();
        runtime.set_well_known(3, Some(name.untyped()));
        let runtime = Arc::new(runtime);
        let cx = runtime.register_thread().unwrap();
        let young = Blob::create(&cx.in_hatchery(), b"young").unwrap();

        let array = runtime.state().well_known();
        let store = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            array.set(0, Some(young.untyped()))
        }));
        assert!(store.is_err());
        assert_eq!(runtime.well_known(0), None);
        assert_eq!(runtime.well_known(3), Some(name.untyped()));
        assert_eq!(runtime.well_known(3).unwrap().generation(), Generation::Immortal);
    }

    #[test]
    fn invalid_configs_fail_at_startup() {
        let config = Config {
            bump_chunk_size: 8,
            ..Config::default()
        };
        assert_eq!(
            Runtime::new(config).unwrap_err(),
            HeapError::InvalidConfig {
                field: "bump_chunk_size",
                value: 8
            }
        );
        let config = Config {
            well_known_slots: usize::MAX,
            ..Config::default()
        };
        assert!(matches!(
            Runtime::new(config),
            Err(HeapError::InvalidConfig { field: "well_known_slots", .. })
        ));
    }

    #[test]
    fn threads_register_and_unregister() {
        let runtime = Arc::new(Runtime::new(Config::default()).unwrap());
        {
            let _a = runtime.register_thread().unwrap();
            assert_eq!(runtime.thread_count(), 1);
            let remote = runtime.clone();
            thread::spawn(move || {
                let _b = remote.register_thread().unwrap();
                assert_eq!(remote.thread_count(), 2);
            })
            .join()
            .unwrap();
            assert_eq!(runtime.thread_count(), 1);
        }
        assert_eq!(runtime.thread_count(), 0);
    }
}
