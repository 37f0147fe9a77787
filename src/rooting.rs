//! Stack rooting.
//!
//! Each [`Local`] links a [`LocalCell`] living in the native stack frame into
//! its thread's intrusive list of roots. The list is strictly LIFO: a `Local`
//! is expected to be dropped exactly when it is the most recently registered
//! live root, which scoping gives for free when roots are declared with
//! [`local!`](crate::local).
//!
//! ```ignore
//! local!(array = &cx, RefArray::create(&cx.in_hatchery(), 4)?);
//! array.set(0, Some(other.untyped()));
//! ```

use std::{
    cell::UnsafeCell,
    fmt,
    marker::{PhantomData, PhantomPinned},
    ops::Deref,
    pin::Pin,
    ptr::{self, NonNull},
};

use crate::{
    allocation::AllocationContext,
    format::{FormatEntry, StackFormat, StackTraits},
    gcref::{Gc, UntypedGc},
    heap_field::{notify_set_post, notify_set_pre},
    thread_context::ThreadContext,
    trace::{self, ScanBounds, Scanner, Updater},
};

/// Header shared by every registered stack root.
#[repr(C)]
pub struct LocalBase {
    pub(crate) thread_context: *const ThreadContext,
    pub(crate) next: *mut LocalBase,
    pub(crate) format: StackFormat,
}

impl LocalBase {
    pub fn format(&self) -> StackFormat {
        self.format
    }

    pub fn next(&self) -> *mut LocalBase {
        self.next
    }
}

/// Storage for one stack root. Must stay pinned while registered.
#[repr(C)]
pub struct LocalCell<T: StackTraits> {
    base: LocalBase,
    value: UnsafeCell<T>,
    _pin: PhantomPinned,
}

impl<T: StackTraits> LocalCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            base: LocalBase {
                thread_context: ptr::null(),
                next: ptr::null_mut(),
                format: T::FORMAT,
            },
            value: UnsafeCell::new(value),
            _pin: PhantomPinned,
        }
    }
}

impl<T: StackTraits> Drop for LocalCell<T> {
    fn drop(&mut self) {
        // Still linked only if its `Local` was leaked.
        let cx = self.base.thread_context;
        if !cx.is_null() {
            unsafe { (*cx).unlink_local(&mut self.base) };
        }
    }
}

/// Dispatch entry for roots holding a `T`. The pointer passed to `scan` and
/// `update` is the root's [`LocalBase`].
pub(crate) fn stack_entry<T: StackTraits>() -> FormatEntry {
    unsafe fn scan<T: StackTraits>(node: *mut u8, scanner: &mut dyn Scanner, bounds: ScanBounds) {
        let cell = node.cast::<LocalCell<T>>();
        trace::scan(&*(*cell).value.get(), scanner, bounds)
    }
    unsafe fn update<T: StackTraits>(node: *mut u8, updater: &mut dyn Updater, bounds: ScanBounds) {
        let cell = node.cast::<LocalCell<T>>();
        trace::update(&mut *(*cell).value.get(), updater, bounds)
    }
    FormatEntry {
        name: T::NAME,
        is_leaf: T::IS_LEAF,
        scan: scan::<T>,
        update: update::<T>,
    }
}

/// Anything that names the thread whose root list a [`Local`] joins.
pub trait RootContext<'a> {
    fn into_thread_context(self) -> &'a ThreadContext;
}

impl<'a> RootContext<'a> for &'a ThreadContext {
    fn into_thread_context(self) -> &'a ThreadContext {
        self
    }
}

impl<'a> RootContext<'a> for AllocationContext<'a> {
    fn into_thread_context(self) -> &'a ThreadContext {
        AllocationContext::thread_context(&self)
    }
}

impl<'a> RootContext<'a> for &AllocationContext<'a> {
    fn into_thread_context(self) -> &'a ThreadContext {
        AllocationContext::thread_context(self)
    }
}

/// A registered stack root. Values reachable from a `Local` stay visible to
/// root scanning until it is dropped.
pub struct Local<'a, T: StackTraits> {
    cx: &'a ThreadContext,
    cell: NonNull<LocalCell<T>>,
    marker: PhantomData<&'a mut LocalCell<T>>,
}

impl<'a, T: StackTraits> Local<'a, T> {
    /// Registers `cell` as the newest root of `cx`'s thread.
    pub fn new<C: RootContext<'a>>(cx: C, cell: Pin<&'a mut LocalCell<T>>) -> Self {
        let cx = cx.into_thread_context();
        cx.runtime().register_stack_format::<T>();
        let cell = unsafe { NonNull::from(cell.get_unchecked_mut()) };
        let base = cell.as_ptr().cast::<LocalBase>();
        unsafe {
            assert!(
                (*base).thread_context.is_null(),
                "LocalCell is already registered"
            );
            (*base).thread_context = cx;
            (*base).next = cx.locals_head();
        }
        cx.set_locals_head(base);
        Self {
            cx,
            cell,
            marker: PhantomData,
        }
    }

    fn value_ptr(&self) -> *mut T {
        unsafe { (*self.cell.as_ptr()).value.get() }
    }

    fn base(&self) -> *mut LocalBase {
        self.cell.as_ptr().cast()
    }

    pub fn thread_context(&self) -> &'a ThreadContext {
        self.cx
    }

    pub fn format(&self) -> StackFormat {
        T::FORMAT
    }

    pub fn get(&self) -> T
    where
        T: Copy,
    {
        unsafe { *self.value_ptr() }
    }

    pub fn set(&mut self, value: T) {
        unsafe { *self.value_ptr() = value }
    }

    pub fn handle(&self) -> Handle<'_, T> {
        unsafe { Handle::from_raw(self.value_ptr()) }
    }

    pub fn mut_handle(&mut self) -> MutHandle<'_, T> {
        unsafe { MutHandle::from_raw(self.value_ptr(), None) }
    }
}

impl<T: StackTraits> Deref for Local<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.value_ptr() }
    }
}

impl<T: StackTraits> Drop for Local<'_, T> {
    fn drop(&mut self) {
        let base = self.base();
        let in_order = self.cx.locals_head() == base;
        unsafe {
            self.cx.unlink_local(base);
            (*base).thread_context = ptr::null();
            (*base).next = ptr::null_mut();
        }
        if !in_order && cfg!(debug_assertions) && !std::thread::panicking() {
            panic!("Local dropped out of LIFO order");
        }
    }
}

impl<T: StackTraits + fmt::Debug> fmt::Debug for Local<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Local").field(&**self).finish()
    }
}

/// Read-only alias of a rooted value or a heap field. Does not register a
/// root of its own.
pub struct Handle<'a, T> {
    ptr: *const T,
    marker: PhantomData<&'a T>,
}

impl<'a, T> Handle<'a, T> {
    /// # Safety
    /// `ptr` must stay valid for `'a` and be reachable by root scanning.
    pub unsafe fn from_raw(ptr: *const T) -> Self {
        Self {
            ptr,
            marker: PhantomData,
        }
    }

    pub fn get(&self) -> T
    where
        T: Copy,
    {
        unsafe { *self.ptr }
    }
}

impl<T> Clone for Handle<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<'_, T> {}

impl<T> Deref for Handle<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.ptr }
    }
}

/// Writable alias of a rooted value or a heap field. Stores into a heap
/// field run the container's barrier hooks.
pub struct MutHandle<'a, T> {
    ptr: *mut T,
    container: Option<UntypedGc>,
    marker: PhantomData<&'a mut T>,
}

impl<'a, T> MutHandle<'a, T> {
    /// # Safety
    /// `ptr` must stay valid for `'a`; `container` must be the object holding
    /// `ptr` when it points into the heap.
    pub unsafe fn from_raw(ptr: *mut T, container: Option<UntypedGc>) -> Self {
        Self {
            ptr,
            container,
            marker: PhantomData,
        }
    }

    pub fn get(&self) -> T
    where
        T: Copy,
    {
        unsafe { *self.ptr }
    }

    pub fn set(&mut self, value: T) {
        match self.container {
            Some(container) => {
                notify_set_pre(container);
                unsafe { *self.ptr = value };
                notify_set_post(container);
            }
            None => unsafe { *self.ptr = value },
        }
    }

    pub fn handle(&self) -> Handle<'_, T> {
        unsafe { Handle::from_raw(self.ptr) }
    }
}

/// Declares a rooted local.
///
/// `local!(name = cx, value)` pins a [`LocalCell`] in the current frame and
/// binds `name` to the [`Local`] registered for it. `cx` is a
/// `&ThreadContext` or an `AllocationContext`.
#[macro_export]
macro_rules! local {
    ($name:ident = $cx:expr, $value:expr) => {
        let $name = ::core::pin::pin!($crate::rooting::LocalCell::new($value));
        #[allow(unused_mut)]
        let mut $name = $crate::rooting::Local::new($cx, $name);
    };
}

macro_rules! impl_leaf_root {
    ($($t:ty)*) => {
        $(
            unsafe impl StackTraits for $t {
                const FORMAT: StackFormat = StackFormat::LEAF;
                const NAME: &'static str = "Leaf";
            }
        )*
    };
}

impl_leaf_root!(
    bool char f32 f64
    u8 u16 u32 u64 usize
    i8 i16 i32 i64 isize
);

unsafe impl<T> StackTraits for Gc<T> {
    const FORMAT: StackFormat = StackFormat::GC_REF;
    const NAME: &'static str = "GcRef";
}

unsafe impl StackTraits for UntypedGc {
    const FORMAT: StackFormat = StackFormat::GC_REF;
    const NAME: &'static str = "GcRef";
}

unsafe impl<T> StackTraits for Option<Gc<T>> {
    const FORMAT: StackFormat = StackFormat::OPTIONAL_GC_REF;
    const NAME: &'static str = "OptionalGcRef";
}

unsafe impl StackTraits for Option<UntypedGc> {
    const FORMAT: StackFormat = StackFormat::OPTIONAL_GC_REF;
    const NAME: &'static str = "OptionalGcRef";
}
