//! Major collection: mark everything reachable, sweep the rest in place.
//!
//! Finalizers are ordered with a three-state walk encoded in two flags:
//!
//! ```text
//! state 0: neither flag             not reached
//! state 1: FINALIZATION_ORDERING    reached from a finalizer object only
//! state 2: both                     finalizable, kept alive for its finalizer
//! state 3: VISITED                  reachable, or kept alive by state 2
//! ```

use std::{collections::VecDeque, mem, sync::Arc};

use log::{debug, warn};
use object::{Address, GcFlags, Header};

use crate::{
    error::{GcError, GcResult, fatal_error},
    minimark::{MiniMark, header},
    roots::RootProvider,
    system::raw_free,
    types::TypeTable,
};

impl MiniMark {
    /// Full mark and sweep of the memory outside the nursery, which must be
    /// empty. `reserving` is the size of the allocation that triggered it.
    pub(crate) fn major_collection(
        &mut self,
        roots: &mut dyn RootProvider,
        reserving: usize,
    ) -> GcResult<()> {
        assert!(self.nursery.is_empty(), "nursery not empty in major_collection()");
        debug!(
            target: "gc",
            "major collection #{}: {} bytes in arenas, {} bytes in large objects",
            self.stats.major_collections + 1,
            self.ac.total_memory_used(),
            self.rawmalloced_total_size
        );
        let before = self.total_memory_used();

        let types = Arc::clone(&self.types);
        self.collect_roots(roots);
        self.visit_all_objects(&types);
        if !self.objects_with_finalizers.is_empty() {
            self.deal_with_objects_with_finalizers(&types);
        }
        debug_assert!(self.objects_to_trace.is_empty());
        if !self.old_objects_with_weakrefs.is_empty() {
            self.invalidate_old_weakrefs(&types);
        }

        self.free_unvisited_rawmalloc_objects();
        self.ac.mass_free(&mut |hdr| {
            // SAFETY: every arena block starts with a header
            let hdr = unsafe { &*hdr.as_ptr::<Header>() };
            if hdr.has_flag(GcFlags::VISITED) {
                hdr.remove_flag(GcFlags::VISITED);
                false
            } else {
                true
            }
        });
        for &obj in &self.prebuilt_root_objects {
            header(obj).remove_flag(GcFlags::VISITED);
        }
        self.stats.major_collections += 1;

        let total = self.total_memory_used();
        debug!(
            target: "gc",
            "major collection done: {} bytes freed, {total} bytes in use",
            before.saturating_sub(total)
        );
        if self.settings.debug_checks {
            self.debug_check_consistency(roots);
        }

        self.next_major_collection_threshold = (total as f64
            * self.settings.major_collection_threshold)
            .max(self.min_heap_size)
            + reserving as f64;
        if self.max_heap_size > 0 {
            let limit = self.max_heap_size as f64;
            if self.next_major_collection_threshold > limit {
                self.next_major_collection_threshold = limit;
            }
            if (total + reserving) as f64 >= limit {
                if self.max_heap_size_already_raised {
                    fatal_error("using too much memory, aborting");
                }
                self.max_heap_size_already_raised = true;
                warn!(
                    target: "gc",
                    "heap limit of {} bytes reached with {total} bytes in use",
                    self.max_heap_size
                );
                return Err(GcError::HeapLimitExceeded {
                    used: total,
                    limit: self.max_heap_size,
                });
            }
        }
        self.max_heap_size_already_raised = false;
        debug!(
            target: "gc",
            "next major collection at {} bytes",
            self.next_major_collection_threshold as usize
        );

        self.execute_finalizers(roots);
        Ok(())
    }

    fn collect_roots(&mut self, roots: &mut dyn RootProvider) {
        self.objects_to_trace
            .extend_from_slice(&self.prebuilt_root_objects);
        let pending = &mut self.objects_to_trace;
        roots.visit_stack_roots(&mut |slot| pending.push(*slot));
        roots.visit_static_nongc_roots(&mut |slot| pending.push(*slot));
        // objects waiting for their finalizer stay alive
        pending.extend(self.run_finalizers.iter().copied());
    }

    fn visit_all_objects(&mut self, types: &TypeTable) {
        while let Some(obj) = self.objects_to_trace.pop() {
            self.visit(types, obj);
        }
    }

    fn visit(&mut self, types: &TypeTable, obj: Address) {
        if obj.is_null() {
            return;
        }
        let hdr = header(obj);
        // prebuilt objects never written to cannot lead into the heap
        if hdr.has_any(GcFlags::VISITED | GcFlags::NO_HEAP_PTRS) {
            return;
        }
        debug_assert!(!self.is_in_nursery(obj), "young object {obj:?} reached by a major collection");
        hdr.add_flag(GcFlags::VISITED);
        let pending = &mut self.objects_to_trace;
        // SAFETY: obj is a live object
        unsafe { types.trace(obj, &mut |slot| pending.push(*slot)) };
    }

    // ── Finalizers ────────────────────────────────────────────────────

    /// Splits the objects with finalizers into those still reachable and
    /// those whose finalizer must run, keeping what the latter reference
    /// alive. A finalizer object reachable from another unreachable finalizer
    /// object waits for a later collection.
    fn deal_with_objects_with_finalizers(&mut self, types: &TypeTable) {
        let mut new_with_finalizer = VecDeque::new();
        let mut marked = VecDeque::new();
        let mut pending = Vec::new();

        while let Some(x) = self.objects_with_finalizers.pop_front() {
            debug_assert_ne!(finalization_state(x), 1);
            if header(x).has_flag(GcFlags::VISITED) {
                new_with_finalizer.push_back(x);
                continue;
            }
            marked.push_back(x);
            pending.push(x);
            while let Some(y) = pending.pop() {
                if y.is_null() || header(y).has_flag(GcFlags::NO_HEAP_PTRS) {
                    continue;
                }
                match finalization_state(y) {
                    0 => {
                        header(y).add_flag(GcFlags::FINALIZATION_ORDERING);
                        // SAFETY: y is a live object
                        unsafe { types.trace(y, &mut |slot| pending.push(*slot)) };
                    }
                    2 => self.recursively_bump_finalization_state_from_2_to_3(types, y),
                    _ => {}
                }
            }
            self.recursively_bump_finalization_state_from_1_to_2(types, x);
        }

        while let Some(x) = marked.pop_front() {
            let state = finalization_state(x);
            debug_assert!(state >= 2);
            if state == 2 {
                self.run_finalizers.push_back(x);
                self.recursively_bump_finalization_state_from_2_to_3(types, x);
            } else {
                new_with_finalizer.push_back(x);
            }
        }
        self.objects_with_finalizers = new_with_finalizer;
    }

    /// Marks `obj` and everything it reaches, turning state 1 into 2 and
    /// state 0 into 3.
    fn recursively_bump_finalization_state_from_1_to_2(
        &mut self,
        types: &TypeTable,
        obj: Address,
    ) {
        debug_assert_eq!(finalization_state(obj), 1);
        self.objects_to_trace.push(obj);
        self.visit_all_objects(types);
    }

    fn recursively_bump_finalization_state_from_2_to_3(
        &mut self,
        types: &TypeTable,
        obj: Address,
    ) {
        let mut pending = mem::take(&mut self.tmpstack);
        pending.push(obj);
        while let Some(y) = pending.pop() {
            if y.is_null() {
                continue;
            }
            let hdr = header(y);
            if hdr.has_flag(GcFlags::FINALIZATION_ORDERING) {
                hdr.remove_flag(GcFlags::FINALIZATION_ORDERING);
                // SAFETY: y is a live object
                unsafe { types.trace(y, &mut |slot| pending.push(*slot)) };
            }
        }
        self.tmpstack = pending;
    }

    /// Runs the finalizers found by the last major collection. Allocations
    /// done by finalizers only trigger minor collections.
    pub(crate) fn execute_finalizers(&mut self, roots: &mut dyn RootProvider) {
        if self.finalizer_lock {
            return;
        }
        self.finalizer_lock = true;
        while let Some(obj) = self.run_finalizers.pop_front() {
            let type_id = header(obj).type_id();
            if let Some(finalizer) = self.types.finalizer(type_id) {
                finalizer(self, roots, obj);
                self.stats.finalizers_run += 1;
            }
        }
        self.finalizer_lock = false;
    }

    // ── Weakrefs and sweeping ─────────────────────────────────────────

    fn invalidate_old_weakrefs(&mut self, types: &TypeTable) {
        let holders = mem::take(&mut self.old_objects_with_weakrefs);
        for obj in holders {
            if !header(obj).has_flag(GcFlags::VISITED) {
                // the holder itself dies
                continue;
            }
            let Some(offset) = types.weakpointer_offset(header(obj).type_id()) else {
                continue;
            };
            let slot = obj.add(offset);
            // SAFETY: offset is the weak pointer field of obj
            let target = unsafe { slot.load_address() };
            if target.is_null() {
                continue;
            }
            if header(target).has_any(GcFlags::VISITED | GcFlags::NO_HEAP_PTRS) {
                self.old_objects_with_weakrefs.push(obj);
            } else {
                // SAFETY: slot is writable
                unsafe { slot.store_address(Address::NULL) };
            }
        }
    }

    fn free_unvisited_rawmalloc_objects(&mut self) {
        let objects = mem::take(&mut self.rawmalloced_objects);
        let mut survivors = Vec::with_capacity(objects.len());
        for raw in objects {
            let hdr = header(raw.obj);
            if hdr.has_flag(GcFlags::VISITED) {
                hdr.remove_flag(GcFlags::VISITED);
                survivors.push(raw);
                continue;
            }
            self.rawmalloced_total_size -= raw.size;
            // SAFETY: allocated by external_malloc with this size
            unsafe { raw_free(raw.block, raw.size) };
        }
        self.rawmalloced_objects = survivors;
    }
}

/// Finalization state of `obj`, see the module documentation.
fn finalization_state(obj: Address) -> u8 {
    let hdr = header(obj);
    match (
        hdr.has_flag(GcFlags::VISITED),
        hdr.has_flag(GcFlags::FINALIZATION_ORDERING),
    ) {
        (false, false) => 0,
        (false, true) => 1,
        (true, true) => 2,
        (true, false) => 3,
    }
}
