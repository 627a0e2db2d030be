//! Minor collection: copy the live nursery objects out, then empty it.

use std::sync::Arc;

use log::{debug, trace};
use object::{
    Address, GcFlags, HEADER_SIZE, forwarding_address, round_up_to_word,
    set_forwarded,
};

use crate::{
    error::fatal_error,
    minimark::{MiniMark, header},
    roots::RootProvider,
    types::TypeTable,
};

impl MiniMark {
    pub(crate) fn minor_collection(&mut self, roots: &mut dyn RootProvider) {
        let used = self.nursery.used_bytes();
        let promoted_before = self.stats.promoted_bytes;
        debug!(
            target: "gc",
            "minor collection #{}: {used} bytes in the nursery",
            self.stats.minor_collections + 1
        );

        let types = Arc::clone(&self.types);
        self.collect_roots_in_nursery(&types, roots);
        if !self.old_objects_with_cards_set.is_empty() {
            self.collect_cardrefs_to_nursery(&types);
        }
        self.collect_oldrefs_to_nursery(&types);
        if !self.young_objects_with_weakrefs.is_empty() {
            self.invalidate_young_weakrefs(&types);
        }
        self.young_objects_shadows.clear();
        self.nursery.reset();
        self.stats.minor_collections += 1;

        debug!(
            target: "gc",
            "minor collection done: {} bytes promoted, {} bytes outside the nursery",
            self.stats.promoted_bytes - promoted_before,
            self.total_memory_used()
        );
        if self.settings.debug_checks {
            self.debug_check_consistency(roots);
        }
    }

    fn collect_roots_in_nursery(
        &mut self,
        types: &TypeTable,
        roots: &mut dyn RootProvider,
    ) {
        roots.visit_stack_roots(&mut |slot| self.trace_drag_out(types, slot));
        roots.visit_static_nongc_roots(&mut |slot| self.trace_drag_out(types, slot));
    }

    /// Drains the remembered set. Copying an object pushes the copy, so this
    /// runs until no reachable young object is left behind.
    fn collect_oldrefs_to_nursery(&mut self, types: &TypeTable) {
        while let Some(obj) = self.old_objects_pointing_to_young.pop() {
            debug_assert!(!self.is_in_nursery(obj));
            header(obj).add_flag(GcFlags::NO_YOUNG_PTRS);
            // SAFETY: remembered objects are live old objects
            unsafe { types.trace(obj, &mut |slot| self.trace_drag_out(types, slot)) };
        }
    }

    /// Copies the young object referenced by `slot` out of the nursery (once)
    /// and updates `slot` to the new address.
    pub(crate) fn trace_drag_out(&mut self, types: &TypeTable, slot: &mut Address) {
        let obj = *slot;
        if !self.is_in_nursery(obj) {
            return;
        }
        let hdr = header(obj);
        if hdr.is_forwarded() {
            // SAFETY: obj is a forwarding stub
            *slot = unsafe { forwarding_address(obj) };
            return;
        }

        // SAFETY: obj is a live nursery object
        let size = unsafe { types.object_size(obj) };
        let totalsize = round_up_to_word(HEADER_SIZE + size);
        let newhdr = if hdr.has_flag(GcFlags::HAS_SHADOW) {
            // id() already reserved the target
            hdr.remove_flag(GcFlags::HAS_SHADOW);
            match self.young_objects_shadows.get(&obj) {
                Some(&shadow) => shadow.sub(HEADER_SIZE),
                None => fatal_error("HAS_SHADOW object without a shadow"),
            }
        } else {
            match self.ac.malloc(totalsize) {
                Ok(block) => block,
                Err(err) => fatal_error(&format!("cannot promote a young object: {err}")),
            }
        };

        let newobj = newhdr.add(HEADER_SIZE);
        // SAFETY: both blocks hold totalsize bytes and do not overlap; the
        // nursery object is at least MIN_NURSERY_OBJECT_SIZE
        unsafe {
            std::ptr::copy_nonoverlapping(
                obj.sub(HEADER_SIZE).as_ptr::<u8>(),
                newhdr.as_ptr::<u8>(),
                totalsize,
            );
            set_forwarded(obj, newobj);
        }
        trace!(target: "gc", "promoted {obj:?} -> {newobj:?} ({totalsize} bytes)");
        *slot = newobj;
        self.stats.promoted_bytes += totalsize;
        // the copy may still reference young objects
        self.old_objects_pointing_to_young.push(newobj);
    }

    /// Weakref holders that survived move to the old list with their target
    /// updated, or cleared if the target died.
    fn invalidate_young_weakrefs(&mut self, types: &TypeTable) {
        while let Some(obj) = self.young_objects_with_weakrefs.pop() {
            if !header(obj).is_forwarded() {
                // the holder itself died
                continue;
            }
            // SAFETY: obj is a forwarding stub
            let obj = unsafe { forwarding_address(obj) };
            let offset = match types.weakpointer_offset(header(obj).type_id()) {
                Some(offset) => offset,
                None => fatal_error("weakref holder without a weak pointer"),
            };
            let slot = obj.add(offset);
            // SAFETY: offset is the weak pointer field of obj
            let target = unsafe { slot.load_address() };
            if target.is_null() {
                continue;
            }
            if self.is_in_nursery(target) {
                if header(target).is_forwarded() {
                    // SAFETY: target is a forwarding stub; slot is writable
                    unsafe { slot.store_address(forwarding_address(target)) };
                } else {
                    // SAFETY: slot is writable
                    unsafe { slot.store_address(Address::NULL) };
                    continue;
                }
            }
            self.old_objects_with_weakrefs.push(obj);
        }
    }
}
