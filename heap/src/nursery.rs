use std::ptr::NonNull;

use object::Address;

use crate::{
    error::{GcError, GcResult},
    system::{map_memory, unmap_memory},
};

/// The young generation: one contiguous region filled by bumping a pointer.
///
/// `[start, free)` holds the objects allocated since the last minor
/// collection, `[free, top)` is untouched zeroed memory.
#[derive(Debug)]
pub struct Nursery {
    start: NonNull<u8>,
    size: usize,
    free: Address,
    top: Address,
}

impl Nursery {
    pub fn new(size: usize) -> GcResult<Self> {
        let start = map_memory(size).ok_or(GcError::OutOfMemory { size })?;
        let base = Address::from_ptr(start.as_ptr());
        Ok(Self {
            start,
            size,
            free: base,
            top: base.add(size),
        })
    }

    /// Reserves `size` bytes, or returns `None` when the nursery is full.
    #[inline(always)]
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        let result = self.free;
        if size > self.top.offset_from(result) {
            return None;
        }
        self.free = result.add(size);
        Some(result)
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        self.start() <= addr && addr < self.top
    }

    /// Zeroes the used part and makes the whole nursery available again.
    pub fn reset(&mut self) {
        let used = self.used_bytes();
        // SAFETY: [start, free) lies inside the mapping
        unsafe { self.start.as_ptr().write_bytes(0, used) };
        self.free = self.start();
    }

    /// Shrinks the most recent allocation ending at `end` back to `new_end`.
    /// Returns false if something was allocated after it.
    pub fn try_shrink_last(&mut self, end: Address, new_end: Address) -> bool {
        if end != self.free || new_end > end {
            return false;
        }
        // SAFETY: the released tail lies inside the mapping
        unsafe { new_end.as_ptr::<u8>().write_bytes(0, end.offset_from(new_end)) };
        self.free = new_end;
        true
    }

    #[inline(always)]
    pub fn start(&self) -> Address {
        Address::from_ptr(self.start.as_ptr())
    }

    #[inline(always)]
    pub fn free(&self) -> Address {
        self.free
    }

    #[inline(always)]
    pub fn top(&self) -> Address {
        self.top
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn used_bytes(&self) -> usize {
        self.free.offset_from(self.start())
    }

    pub fn remaining_bytes(&self) -> usize {
        self.top.offset_from(self.free)
    }

    pub fn is_empty(&self) -> bool {
        self.free == self.start()
    }
}

impl Drop for Nursery {
    fn drop(&mut self) {
        // SAFETY: the nursery was mapped with exactly this size
        unsafe { unmap_memory(self.start, self.size) };
    }
}

#[cfg(test)]
mod tests {
    use object::WORD;

    use super::*;

    #[test]
    fn test_bump_allocation() {
        let mut nursery = Nursery::new(16 * WORD).unwrap();
        let first = nursery.allocate(2 * WORD).unwrap();
        let second = nursery.allocate(3 * WORD).unwrap();

        assert_eq!(first, nursery.start());
        assert_eq!(second, first.add(2 * WORD));
        assert_eq!(nursery.used_bytes(), 5 * WORD);
        assert_eq!(nursery.remaining_bytes(), 11 * WORD);
        assert!(nursery.contains(first));
        assert!(nursery.contains(nursery.top().sub(1)));
        assert!(!nursery.contains(nursery.top()));
        assert!(!nursery.contains(Address::NULL));
    }

    #[test]
    fn test_overflow_returns_none() {
        let mut nursery = Nursery::new(4 * WORD).unwrap();
        assert!(nursery.allocate(3 * WORD).is_some());
        assert!(nursery.allocate(2 * WORD).is_none());
        // a failed request leaves the pointer untouched
        assert_eq!(nursery.remaining_bytes(), WORD);
        assert!(nursery.allocate(WORD).is_some());
        assert!(nursery.allocate(WORD).is_none());
    }

    #[test]
    fn test_reset_zeroes_used_part() {
        let mut nursery = Nursery::new(8 * WORD).unwrap();
        let obj = nursery.allocate(4 * WORD).unwrap();
        unsafe { obj.add(WORD).store(0xabcdusize) };

        nursery.reset();
        assert!(nursery.is_empty());
        assert_eq!(nursery.free(), nursery.start());
        assert_eq!(unsafe { obj.add(WORD).load::<usize>() }, 0);
    }

    #[test]
    fn test_shrink_last_allocation() {
        let mut nursery = Nursery::new(8 * WORD).unwrap();
        let obj = nursery.allocate(4 * WORD).unwrap();
        unsafe { obj.add(3 * WORD).store(1usize) };
        assert!(nursery.try_shrink_last(obj.add(4 * WORD), obj.add(2 * WORD)));
        assert_eq!(nursery.used_bytes(), 2 * WORD);
        assert_eq!(unsafe { obj.add(3 * WORD).load::<usize>() }, 0);

        let _other = nursery.allocate(WORD).unwrap();
        assert!(!nursery.try_shrink_last(obj.add(2 * WORD), obj.add(WORD)));
    }
}
