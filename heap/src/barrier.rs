//! Write barriers: keep the remembered sets exact across pointer stores.

use std::{ptr, sync::Arc};

use log::trace;
use object::{Address, GcFlags};

use crate::minimark::{MiniMark, header};

impl MiniMark {
    /// Must run before `new_value` is stored into a GC pointer field of
    /// `addr_struct`. Costs one flag test unless `addr_struct` is an old
    /// object that has no young pointers yet.
    #[inline(always)]
    pub fn write_barrier(&mut self, new_value: Address, addr_struct: Address) {
        if header(addr_struct).has_flag(GcFlags::NO_YOUNG_PTRS) {
            self.remember_young_pointer(addr_struct, new_value);
        }
    }

    #[cold]
    #[inline(never)]
    fn remember_young_pointer(&mut self, addr_struct: Address, new_value: Address) {
        debug_assert!(
            !self.is_in_nursery(addr_struct),
            "nursery object {addr_struct:?} with NO_YOUNG_PTRS"
        );
        let hdr = header(addr_struct);
        if self.is_in_nursery(new_value) {
            trace!(target: "gc", "remembering {addr_struct:?}");
            self.old_objects_pointing_to_young.push(addr_struct);
            hdr.remove_flag(GcFlags::NO_YOUNG_PTRS);
        } else if new_value.is_null() {
            return;
        }
        // a prebuilt object now points into the heap, even if only to another
        // prebuilt object: it becomes a root of the major collection
        if hdr.has_flag(GcFlags::NO_HEAP_PTRS) {
            hdr.remove_flag(GcFlags::NO_HEAP_PTRS);
            self.prebuilt_root_objects.push(addr_struct);
        }
    }

    /// Barrier for stores the mutator cannot describe one by one: assumes
    /// `addr_struct` now holds young pointers.
    pub fn assume_young_pointers(&mut self, addr_struct: Address) {
        let hdr = header(addr_struct);
        if hdr.has_flag(GcFlags::NO_YOUNG_PTRS) {
            self.old_objects_pointing_to_young.push(addr_struct);
            hdr.remove_flag(GcFlags::NO_YOUNG_PTRS);
        }
        if hdr.has_flag(GcFlags::NO_HEAP_PTRS) {
            hdr.remove_flag(GcFlags::NO_HEAP_PTRS);
            self.prebuilt_root_objects.push(addr_struct);
        }
    }

    /// Barrier for copying `length` items from `source[source_start..]` into
    /// `dest[dest_start..]` in bulk.
    ///
    /// Transfers the "may hold young pointers" and "may hold heap pointers"
    /// state of `source` to `dest` with at most one remembered-set entry, or
    /// copies the card marks between two aligned arrays with cards. Returns
    /// true when a raw memory copy is then safe; false means the caller must
    /// store the items one by one through [`Self::write_barrier_from_array`].
    pub fn write_barrier_before_copy(
        &mut self,
        source: Address,
        dest: Address,
        source_start: usize,
        dest_start: usize,
        length: usize,
    ) -> bool {
        let dest_hdr = header(dest);
        if !dest_hdr.has_flag(GcFlags::NO_YOUNG_PTRS) {
            // young, or already remembered
            return true;
        }
        let source_hdr = header(source);
        if source_hdr.has_flag(GcFlags::HAS_CARDS) {
            if !source_hdr.has_flag(GcFlags::NO_YOUNG_PTRS) {
                // young pointers anywhere in the source
                return false;
            }
            if source_hdr.has_flag(GcFlags::CARDS_SET) {
                if !dest_hdr.has_flag(GcFlags::HAS_CARDS) {
                    return false;
                }
                if source_start != 0 || dest_start != 0 {
                    // the card marks would not line up
                    return false;
                }
                self.manually_copy_card_bits(source, dest, length);
                return true;
            }
        }
        if !source_hdr.has_flag(GcFlags::NO_YOUNG_PTRS) {
            self.old_objects_pointing_to_young.push(dest);
            dest_hdr.remove_flag(GcFlags::NO_YOUNG_PTRS);
        }
        if dest_hdr.has_flag(GcFlags::NO_HEAP_PTRS)
            && !source_hdr.has_flag(GcFlags::NO_HEAP_PTRS)
        {
            dest_hdr.remove_flag(GcFlags::NO_HEAP_PTRS);
            self.prebuilt_root_objects.push(dest);
        }
        true
    }

    /// Stores `value` into the pointer field at `offset` of `obj`.
    ///
    /// # Safety
    /// `offset` must be a GC pointer field of `obj`.
    #[inline(always)]
    pub unsafe fn write_pointer(&mut self, obj: Address, offset: usize, value: Address) {
        self.write_barrier(value, obj);
        // SAFETY: guaranteed by the caller
        unsafe { obj.add(offset).store_address(value) };
    }

    /// Reads the pointer field at `offset` of `obj`.
    ///
    /// # Safety
    /// `offset` must be a GC pointer field of `obj`.
    #[inline(always)]
    pub unsafe fn read_pointer(&self, obj: Address, offset: usize) -> Address {
        // SAFETY: guaranteed by the caller
        unsafe { obj.add(offset).load_address() }
    }

    /// Copies `length` items from `source[source_start..]` to
    /// `dest[dest_start..]`. Both arrays must be of the same type.
    ///
    /// # Safety
    /// Both ranges must lie within the arrays.
    pub unsafe fn arraycopy(
        &mut self,
        source: Address,
        dest: Address,
        source_start: usize,
        dest_start: usize,
        length: usize,
    ) {
        let type_id = header(source).type_id();
        debug_assert_eq!(type_id, header(dest).type_id());
        let types = Arc::clone(&self.types);
        let info = types.get(type_id);
        let Some(varsize) = &info.varsize else {
            return;
        };
        let item_size = varsize.item_size;
        let from = source.add(info.fixed_size + source_start * item_size);
        let to = dest.add(info.fixed_size + dest_start * item_size);

        if self.write_barrier_before_copy(source, dest, source_start, dest_start, length) {
            // SAFETY: guaranteed by the caller; the ranges may overlap
            unsafe {
                ptr::copy(from.as_ptr::<u8>(), to.as_ptr::<u8>(), length * item_size);
            }
            return;
        }

        let copy_item = |gc: &mut Self, i: usize| {
            let src_item = from.add(i * item_size);
            let dst_item = to.add(i * item_size);
            // SAFETY: guaranteed by the caller
            unsafe {
                for &offset in &varsize.offsets_in_item {
                    let value = src_item.add(offset).load_address();
                    gc.write_barrier_from_array(value, dest, dest_start + i);
                }
                ptr::copy(src_item.as_ptr::<u8>(), dst_item.as_ptr::<u8>(), item_size);
            }
        };
        if source == dest && dest_start > source_start {
            for i in (0..length).rev() {
                copy_item(&mut *self, i);
            }
        } else {
            for i in 0..length {
                copy_item(&mut *self, i);
            }
        }
    }
}
