//! Memory obtained from the operating system.
//!
//! Arenas and the nursery are mapped with anonymous `mmap`, so they start out
//! zeroed. Large objects come from the global allocator.

use std::{alloc::Layout, ptr::NonNull};

use object::WORD;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap and munmap
    /// # Safety
    /// see valid mmap and munmap usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;
    }

    /// posix memory allocation using mmap
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// posix memory deallocation using munmap
    /// # Safety
    /// must be allocated by mmap
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Maps `size` bytes of zeroed, page-aligned memory.
#[must_use]
#[cfg(unix)]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: a fresh anonymous mapping has no preconditions
    let ptr = unsafe { unix::anonymous_mmap(size) };
    NonNull::new(ptr)
}

/// # Safety
/// `ptr` and `size` must come from a single [`map_memory`] call.
#[cfg(unix)]
pub unsafe fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from mmap allocation
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}

#[must_use]
#[cfg(not(unix))]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    let layout = Layout::from_size_align(size, OS_PAGE_SIZE).ok()?;
    // SAFETY: layout has a non-zero size, checked by every caller
    NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
}

/// # Safety
/// `ptr` and `size` must come from a single [`map_memory`] call.
#[cfg(not(unix))]
pub unsafe fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: same layout as in map_memory
    unsafe {
        let layout = Layout::from_size_align_unchecked(size, OS_PAGE_SIZE);
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

#[inline]
fn raw_layout(size: usize) -> Option<Layout> {
    Layout::from_size_align(size, WORD).ok()
}

/// Allocates `size` zeroed, word-aligned bytes from the system allocator.
#[must_use]
pub fn raw_malloc(size: usize) -> Option<NonNull<u8>> {
    debug_assert!(size > 0);
    let layout = raw_layout(size)?;
    // SAFETY: size is non-zero
    NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
}

/// # Safety
/// `ptr` and `size` must come from a single [`raw_malloc`] call.
pub unsafe fn raw_free(ptr: NonNull<u8>, size: usize) {
    // SAFETY: the layout was valid when the block was allocated
    unsafe {
        let layout = Layout::from_size_align_unchecked(size, WORD);
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}
