use std::ptr::NonNull;

use object::{Address, WORD};

use crate::{
    arena::ArenaAllocator,
    error::{GcError, GcResult},
    system::{raw_free, raw_malloc},
};

/// Arena allocator that hands every block straight to the system allocator
/// and remembers it in a list. Slower than [`crate::ArenaCollection`], but
/// has no page bookkeeping at all, which makes it useful for testing the
/// collector in isolation.
#[derive(Debug)]
pub struct SimpleArenaCollection {
    small_request_threshold: usize,
    blocks: Vec<(NonNull<u8>, usize)>,
    total_memory_used: usize,
}

impl SimpleArenaCollection {
    pub fn new(small_request_threshold: usize) -> Self {
        Self {
            small_request_threshold,
            blocks: Vec::new(),
            total_memory_used: 0,
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl ArenaAllocator for SimpleArenaCollection {
    fn malloc(&mut self, size: usize) -> GcResult<Address> {
        debug_assert!(size > 0 && size <= self.small_request_threshold);
        debug_assert!(size.is_multiple_of(WORD));
        let block = raw_malloc(size).ok_or(GcError::OutOfMemory { size })?;
        self.blocks.push((block, size));
        self.total_memory_used += size;
        Ok(Address::from_ptr(block.as_ptr()))
    }

    fn mass_free(&mut self, ok_to_free: &mut dyn FnMut(Address) -> bool) {
        let mut total = 0;
        self.blocks.retain(|&(block, size)| {
            if ok_to_free(Address::from_ptr(block.as_ptr())) {
                // SAFETY: the block came from raw_malloc with this size
                unsafe { raw_free(block, size) };
                false
            } else {
                total += size;
                true
            }
        });
        self.total_memory_used = total;
    }

    fn total_memory_used(&self) -> usize {
        self.total_memory_used
    }
}

impl Drop for SimpleArenaCollection {
    fn drop(&mut self) {
        for (block, size) in self.blocks.drain(..) {
            // SAFETY: the block came from raw_malloc with this size
            unsafe { raw_free(block, size) };
        }
    }
}
