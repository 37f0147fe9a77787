use std::{
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    ops::Deref,
    ptr::NonNull,
};

use crate::{
    format::{AllocFormat, HeapTraits},
    header::{AllocHeader, Generation},
};

/// Untyped reference to a heap allocation. Points at the allocation's header;
/// the payload follows it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct UntypedGc {
    header: NonNull<AllocHeader>,
}

impl UntypedGc {
    /// # Safety
    /// `header` must point at an initialized allocation header.
    #[inline(always)]
    pub unsafe fn from_header(header: NonNull<AllocHeader>) -> Self {
        Self { header }
    }

    #[inline(always)]
    pub fn header(&self) -> &AllocHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline(always)]
    pub fn header_ptr(&self) -> NonNull<AllocHeader> {
        self.header
    }

    /// Address of the header, used for bounds checks.
    #[inline(always)]
    pub fn addr(&self) -> usize {
        self.header.as_ptr() as usize
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        self.header().payload()
    }

    #[inline(always)]
    pub fn format(&self) -> AllocFormat {
        self.header().format()
    }

    #[inline(always)]
    pub fn generation(&self) -> Generation {
        self.header().generation()
    }

    /// Typed view of this reference when its format tag matches `T`.
    pub fn downcast<T: HeapTraits>(self) -> Option<Gc<T>> {
        if self.format() == T::FORMAT {
            Some(Gc {
                raw: self,
                marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// # Safety
    /// The allocation must hold a `T`.
    pub unsafe fn cast_unchecked<T>(self) -> Gc<T> {
        Gc {
            raw: self,
            marker: PhantomData,
        }
    }
}

impl fmt::Debug for UntypedGc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UntypedGc({:p})", self.header)
    }
}

impl fmt::Pointer for UntypedGc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.header)
    }
}

/// Typed reference to a heap allocation holding a `T`.
///
/// `Gc<T>` is a bare pointer: it does not keep its referent alive. Values
/// that must survive across allocation points belong in a
/// [`Local`](crate::rooting::Local) or in a traced field of a rooted object.
#[repr(transparent)]
pub struct Gc<T> {
    raw: UntypedGc,
    marker: PhantomData<*const T>,
}

impl<T> Gc<T> {
    #[inline(always)]
    pub fn untyped(self) -> UntypedGc {
        self.raw
    }

    #[inline(always)]
    pub(crate) fn untyped_ref(&self) -> &UntypedGc {
        &self.raw
    }

    #[inline(always)]
    pub(crate) fn untyped_mut(&mut self) -> &mut UntypedGc {
        &mut self.raw
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut T {
        self.raw.payload().cast()
    }

    #[inline(always)]
    pub fn header(&self) -> &AllocHeader {
        self.raw.header()
    }

    #[inline(always)]
    pub fn generation(self) -> Generation {
        self.raw.generation()
    }

    #[inline(always)]
    pub fn format(self) -> AllocFormat {
        self.raw.format()
    }

    pub fn ptr_eq(self, other: Gc<T>) -> bool {
        self.raw == other.raw
    }
}

impl<T> Deref for Gc<T> {
    type Target = T;
    #[inline(always)]
    fn deref(&self) -> &T {
        unsafe { &*self.as_ptr() }
    }
}

impl<T> Copy for Gc<T> {}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Gc<T> {}

impl<T> Hash for Gc<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state)
    }
}

impl<T> From<Gc<T>> for UntypedGc {
    fn from(value: Gc<T>) -> Self {
        value.raw
    }
}

impl<T> fmt::Pointer for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.raw)
    }
}

impl<T: fmt::Debug> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", **self)
    }
}

impl<T: fmt::Display> fmt::Display for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", **self)
    }
}
