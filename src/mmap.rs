//! Page-granularity anonymous memory mappings.
//!
//! Everything the heap hands out ultimately lives in regions obtained here. The
//! free functions mirror the raw interface (`null`/`false` on failure) while
//! [`Mmap`] owns a region and unmaps it on drop.

use std::sync::OnceLock;

/// Size of a host page in bytes.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(sys::page_size)
}

/// Maps `bytes` of zeroed, private, anonymous memory. `bytes` is rounded up to
/// whole pages. Returns null if the mapping fails.
pub fn allocate_mapped_memory(bytes: usize, allow_exec: bool) -> *mut u8 {
    if bytes == 0 {
        return std::ptr::null_mut();
    }
    let bytes = crate::util::align_up(bytes, page_size());
    unsafe { sys::map(bytes, allow_exec) }
}

/// Releases a mapping created by [`allocate_mapped_memory`]. `bytes` must be
/// the size passed when the region was mapped.
pub fn release_mapped_memory(ptr: *mut u8, bytes: usize) -> bool {
    if ptr.is_null() {
        return false;
    }
    let bytes = crate::util::align_up(bytes, page_size());
    unsafe { sys::unmap(ptr, bytes) }
}

/// Owned mapped region.
pub struct Mmap {
    start: *mut u8,
    end: *mut u8,
    size: usize,
}

impl Mmap {
    /// Maps a new region of at least `size` bytes. `None` when the host refuses.
    pub fn new(size: usize, allow_exec: bool) -> Option<Self> {
        let size = crate::util::align_up(size, page_size());
        let start = allocate_mapped_memory(size, allow_exec);
        if start.is_null() {
            tracing::warn!(target: "whisper::gc", size, "anonymous mapping failed");
            return None;
        }
        Some(Self {
            start,
            end: unsafe { start.add(size) },
            size,
        })
    }

    pub fn start(&self) -> *mut u8 {
        self.start
    }

    pub fn end(&self) -> *mut u8 {
        self.end
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: *const u8) -> bool {
        addr >= self.start as *const u8 && addr < self.end as *const u8
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        let released = release_mapped_memory(self.start, self.size);
        debug_assert!(released, "failed to unmap region at {:p}", self.start);
    }
}

#[cfg(unix)]
mod sys {
    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    }

    pub unsafe fn map(bytes: usize, allow_exec: bool) -> *mut u8 {
        let mut prot = libc::PROT_READ | libc::PROT_WRITE;
        if allow_exec {
            prot |= libc::PROT_EXEC;
        }
        let map = libc::mmap(
            core::ptr::null_mut(),
            bytes as _,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if map == libc::MAP_FAILED {
            return core::ptr::null_mut();
        }
        map as *mut u8
    }

    pub unsafe fn unmap(ptr: *mut u8, bytes: usize) -> bool {
        libc::munmap(ptr as *mut _, bytes as _) == 0
    }
}

#[cfg(windows)]
mod sys {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
        winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_READWRITE},
    };

    pub fn page_size() -> usize {
        unsafe {
            let mut info: SYSTEM_INFO = core::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        }
    }

    pub unsafe fn map(bytes: usize, allow_exec: bool) -> *mut u8 {
        let prot = if allow_exec {
            PAGE_EXECUTE_READWRITE
        } else {
            PAGE_READWRITE
        };
        let mem = VirtualAlloc(null_mut(), bytes, MEM_RESERVE | MEM_COMMIT, prot);
        mem as *mut u8
    }

    pub unsafe fn unmap(ptr: *mut u8, _bytes: usize) -> bool {
        VirtualFree(ptr.cast(), 0, MEM_RELEASE) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_release_round_trip() {
        let size = page_size() * 2;
        let ptr = allocate_mapped_memory(size, false);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);
        unsafe {
            // anonymous mappings come back zeroed
            assert_eq!(*ptr, 0);
            *ptr.add(size - 1) = 7;
            assert_eq!(*ptr.add(size - 1), 7);
        }
        assert!(release_mapped_memory(ptr, size));
    }

    #[test]
    fn zero_sized_and_null_requests_fail() {
        assert!(allocate_mapped_memory(0, false).is_null());
        assert!(!release_mapped_memory(std::ptr::null_mut(), 4096));
    }

    #[test]
    fn owned_region_rounds_to_pages() {
        let map = Mmap::new(10, false).unwrap();
        assert_eq!(map.size(), page_size());
        assert!(map.contains(map.start()));
        assert!(!map.contains(map.end()));
    }
}
