//! The MiniMark generational collector.
//!
//! Young objects are bump-allocated in the nursery and copied out by a minor
//! collection. Everything outside the nursery stays put: small objects live
//! in an [`ArenaAllocator`], large ones are individually allocated, and both
//! are reclaimed by a non-moving mark and sweep major collection.
//!
//! The collector is single-threaded. Collections happen synchronously inside
//! allocation calls or [`MiniMark::collect`].

use std::{collections::VecDeque, ptr::NonNull, sync::Arc};

use log::{debug, info};
use object::{
    Address, GcFlags, HEADER_SIZE, Header, MIN_NURSERY_OBJECT_SIZE, TypeId,
    header_of, init_header, round_up_to_word,
};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    arena::{ArenaAllocator, ArenaCollection},
    config::GcSettings,
    error::{GcError, GcResult, fatal_error},
    nursery::Nursery,
    roots::RootProvider,
    system::{raw_free, raw_malloc},
    types::TypeTable,
};

// ── Public API types ──────────────────────────────────────────────────

/// Which collection [`MiniMark::collect`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Empty the nursery only.
    Minor,
    /// Empty the nursery, then mark and sweep everything else.
    Major,
}

/// Counters describing the collector's work so far.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GcStats {
    pub minor_collections: usize,
    pub major_collections: usize,
    /// Bytes copied out of the nursery.
    pub promoted_bytes: usize,
    pub finalizers_run: usize,
    pub arena_memory: usize,
    pub rawmalloced_memory: usize,
    pub next_major_collection_threshold: usize,
}

/// A large object and the system block holding it, card bytes included.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawObject {
    pub obj: Address,
    pub block: NonNull<u8>,
    pub size: usize,
}

/// Header of `obj`. Every address handed to the collector is a valid object.
#[inline(always)]
pub(crate) fn header<'a>(obj: Address) -> &'a Header {
    // SAFETY: callers only pass object addresses
    unsafe { header_of(obj) }
}

// ── Collector ─────────────────────────────────────────────────────────

pub struct MiniMark {
    pub(crate) settings: GcSettings,
    pub(crate) types: Arc<TypeTable>,
    pub(crate) nursery: Nursery,
    pub(crate) ac: Box<dyn ArenaAllocator>,

    /// Objects outside the nursery that may point into it. Filled by the
    /// write barrier and by evacuation, drained by the minor collection.
    pub(crate) old_objects_pointing_to_young: Vec<Address>,
    /// Arrays with `CARDS_SET`.
    pub(crate) old_objects_with_cards_set: Vec<Address>,
    /// Prebuilt objects written to at least once.
    pub(crate) prebuilt_root_objects: Vec<Address>,
    /// Objects allocated with the system allocator.
    pub(crate) rawmalloced_objects: Vec<RawObject>,
    pub(crate) rawmalloced_total_size: usize,
    /// Prebuilt objects created by this collector, freed when it drops.
    pub(crate) prebuilt_storage: Vec<(NonNull<u8>, usize)>,

    pub(crate) objects_with_finalizers: VecDeque<Address>,
    pub(crate) run_finalizers: VecDeque<Address>,
    pub(crate) finalizer_lock: bool,

    pub(crate) young_objects_with_weakrefs: Vec<Address>,
    pub(crate) old_objects_with_weakrefs: Vec<Address>,

    /// Shadows reserved by `id()` for nursery objects.
    pub(crate) young_objects_shadows: FxHashMap<Address, Address>,

    /// Mark stack of the major collection.
    pub(crate) objects_to_trace: Vec<Address>,
    pub(crate) tmpstack: Vec<Address>,

    pub(crate) next_major_collection_threshold: f64,
    /// Lower bound of the threshold: the initial one.
    pub(crate) min_heap_size: f64,
    pub(crate) max_heap_size: usize,
    pub(crate) max_heap_size_already_raised: bool,
    pub(crate) stats: GcStats,
}

impl MiniMark {
    /// Creates a collector backed by an [`ArenaCollection`].
    pub fn new(settings: GcSettings, types: Arc<TypeTable>) -> GcResult<Self> {
        settings.validate()?;
        let ac = ArenaCollection::new(
            settings.arena_size,
            settings.page_size,
            settings.small_request_threshold,
        );
        Self::with_arena(settings, types, Box::new(ac))
    }

    /// Creates a collector on top of any arena implementation.
    pub fn with_arena(
        settings: GcSettings,
        types: Arc<TypeTable>,
        ac: Box<dyn ArenaAllocator>,
    ) -> GcResult<Self> {
        settings.validate()?;
        types.check_weakref_sizes(settings.small_request_threshold)?;
        let nursery = Nursery::new(settings.nursery_size)?;
        let min_heap_size =
            settings.nursery_size as f64 * settings.major_collection_threshold;
        let mut next_major_collection_threshold = min_heap_size;
        let max_heap_size = settings.max_heap_size;
        if max_heap_size > 0 {
            next_major_collection_threshold =
                next_major_collection_threshold.min(max_heap_size as f64);
        }
        info!(
            target: "gc",
            "minimark: nursery {} bytes, small objects up to {} bytes, {} types",
            settings.nursery_size,
            settings.small_request_threshold,
            types.len()
        );

        Ok(Self {
            settings,
            types,
            nursery,
            ac,
            old_objects_pointing_to_young: Vec::new(),
            old_objects_with_cards_set: Vec::new(),
            prebuilt_root_objects: Vec::new(),
            rawmalloced_objects: Vec::new(),
            rawmalloced_total_size: 0,
            prebuilt_storage: Vec::new(),
            objects_with_finalizers: VecDeque::new(),
            run_finalizers: VecDeque::new(),
            finalizer_lock: false,
            young_objects_with_weakrefs: Vec::new(),
            old_objects_with_weakrefs: Vec::new(),
            young_objects_shadows: FxHashMap::default(),
            objects_to_trace: Vec::new(),
            tmpstack: Vec::new(),
            next_major_collection_threshold,
            min_heap_size,
            max_heap_size,
            max_heap_size_already_raised: false,
            stats: GcStats::default(),
        })
    }

    pub fn settings(&self) -> &GcSettings {
        &self.settings
    }

    pub fn types(&self) -> &Arc<TypeTable> {
        &self.types
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocates a zeroed fixed-size object of `size` bytes (header
    /// excluded).
    ///
    /// Objects with a finalizer, and large objects, never go to the nursery.
    /// Weakref-carrying objects must be small and must get their weak
    /// pointer stored before the next allocation.
    pub fn malloc_fixedsize_clear(
        &mut self,
        roots: &mut dyn RootProvider,
        type_id: TypeId,
        size: usize,
        needs_finalizer: bool,
        contains_weakptr: bool,
    ) -> GcResult<Address> {
        debug_assert_eq!(size, self.types.fixed_size(type_id));
        let totalsize = round_up_to_word(HEADER_SIZE + size);

        if needs_finalizer {
            assert!(!contains_weakptr, "finalizer combined with a weak pointer");
            let obj = self.malloc_nonmovable_total(roots, type_id, 0, totalsize)?;
            self.objects_with_finalizers.push_back(obj);
            return Ok(obj);
        }
        if totalsize > self.settings.small_request_threshold {
            assert!(!contains_weakptr, "weak pointer in a large object");
            return self.external_malloc(roots, type_id, 0, totalsize);
        }

        let totalsize = totalsize.max(MIN_NURSERY_OBJECT_SIZE);
        let result = self.nursery_reserve(roots, totalsize)?;
        // SAFETY: the reserved block is zeroed and at least one word long
        unsafe { init_header(result, type_id, GcFlags::empty()) };
        let obj = result.add(HEADER_SIZE);
        if contains_weakptr {
            self.young_objects_with_weakrefs.push(obj);
        }
        Ok(obj)
    }

    /// Allocates a zeroed array-like object with `length` items of
    /// `itemsize` bytes after a fixed part of `size` bytes.
    pub fn malloc_varsize_clear(
        &mut self,
        roots: &mut dyn RootProvider,
        type_id: TypeId,
        length: usize,
        size: usize,
        itemsize: usize,
        offset_to_length: usize,
    ) -> GcResult<Address> {
        let totalsize = itemsize
            .checked_mul(length)
            .and_then(|varsize| varsize.checked_add(HEADER_SIZE + size))
            .and_then(|total| total.checked_next_multiple_of(object::WORD))
            .ok_or(GcError::SizeOverflow {
                length,
                item_size: itemsize,
            })?;

        let obj = if totalsize > self.settings.small_request_threshold {
            self.external_malloc(roots, type_id, length, totalsize)?
        } else {
            let totalsize = totalsize.max(MIN_NURSERY_OBJECT_SIZE);
            let result = self.nursery_reserve(roots, totalsize)?;
            // SAFETY: the reserved block is zeroed and at least one word long
            unsafe { init_header(result, type_id, GcFlags::empty()) };
            result.add(HEADER_SIZE)
        };
        // SAFETY: offset_to_length lies inside the fixed part
        unsafe { obj.add(offset_to_length).store(length) };
        Ok(obj)
    }

    /// Allocates an instance of `type_id`, taking sizes and the finalizer
    /// and weakref properties from the type table. `length` is ignored for
    /// fixed-size types.
    pub fn malloc(
        &mut self,
        roots: &mut dyn RootProvider,
        type_id: TypeId,
        length: usize,
    ) -> GcResult<Address> {
        let types = Arc::clone(&self.types);
        let info = types.get(type_id);
        match &info.varsize {
            None => self.malloc_fixedsize_clear(
                roots,
                type_id,
                info.fixed_size,
                info.finalizer.is_some(),
                info.weakptr_offset.is_some(),
            ),
            Some(varsize) => self.malloc_varsize_clear(
                roots,
                type_id,
                length,
                info.fixed_size,
                varsize.item_size,
                varsize.offset_to_length,
            ),
        }
    }

    pub fn can_malloc_nonmovable(&self) -> bool {
        true
    }

    /// Allocates an object that will never move. Types with a finalizer are
    /// registered for finalization as usual.
    pub fn malloc_nonmovable(
        &mut self,
        roots: &mut dyn RootProvider,
        type_id: TypeId,
        length: usize,
    ) -> GcResult<Address> {
        let types = Arc::clone(&self.types);
        let info = types.get(type_id);
        assert!(
            info.weakptr_offset.is_none(),
            "weakref objects are always allocated young"
        );
        let size = types.instance_size(type_id, length)?;
        let totalsize = size
            .checked_add(HEADER_SIZE)
            .and_then(|total| total.checked_next_multiple_of(object::WORD))
            .ok_or(GcError::SizeOverflow {
                length,
                item_size: types.varsize_item_size(type_id),
            })?;
        let obj = self.malloc_nonmovable_total(roots, type_id, length, totalsize)?;
        if let Some(varsize) = &info.varsize {
            // SAFETY: offset_to_length lies inside the fixed part
            unsafe { obj.add(varsize.offset_to_length).store(length) };
        }
        if info.finalizer.is_some() {
            self.objects_with_finalizers.push_back(obj);
        }
        Ok(obj)
    }

    #[inline(always)]
    fn nursery_reserve(
        &mut self,
        roots: &mut dyn RootProvider,
        totalsize: usize,
    ) -> GcResult<Address> {
        match self.nursery.allocate(totalsize) {
            Some(result) => Ok(result),
            None => self.collect_and_reserve(roots, totalsize),
        }
    }

    /// Slow path of nursery allocation: collect, then reserve `totalsize`.
    #[cold]
    #[inline(never)]
    fn collect_and_reserve(
        &mut self,
        roots: &mut dyn RootProvider,
        totalsize: usize,
    ) -> GcResult<Address> {
        self.minor_collection(roots);

        if self.total_memory_used() as f64 > self.next_major_collection_threshold
            && !self.finalizer_lock
        {
            self.major_collection(roots, 0)?;
            // finalizers may have refilled the nursery
            if self.nursery.remaining_bytes() < totalsize {
                self.minor_collection(roots);
            }
        }

        match self.nursery.allocate(totalsize) {
            Some(result) => Ok(result),
            None => fatal_error("nursery exhausted right after a minor collection"),
        }
    }

    /// Runs a minor collection plus, if memory grew too much, a major one
    /// before reserving `reserving` bytes outside the nursery.
    fn full_collect_if_needed(
        &mut self,
        roots: &mut dyn RootProvider,
        reserving: usize,
    ) -> GcResult<()> {
        if self.finalizer_lock {
            return Ok(());
        }
        let projected = self.total_memory_used().saturating_add(reserving);
        if projected as f64 > self.next_major_collection_threshold {
            self.minor_collection(roots);
            self.major_collection(roots, reserving)?;
        }
        Ok(())
    }

    /// Allocates a large object with the system allocator. Arrays of GC
    /// pointers get card marker words in front of the header.
    fn external_malloc(
        &mut self,
        roots: &mut dyn RootProvider,
        type_id: TypeId,
        length: usize,
        totalsize: usize,
    ) -> GcResult<Address> {
        let (cardheadersize, flags) = if self.settings.card_page_indices > 0
            && self.types.has_gcptr_in_varsize(type_id)
        {
            let cardheadersize = object::WORD * self.card_marking_words_for_length(length);
            (cardheadersize, GcFlags::NO_YOUNG_PTRS | GcFlags::HAS_CARDS)
        } else {
            (0, GcFlags::NO_YOUNG_PTRS)
        };
        let allocsize = totalsize
            .checked_add(cardheadersize)
            .ok_or(GcError::OutOfMemory { size: totalsize })?;

        self.full_collect_if_needed(roots, allocsize)?;
        let block = raw_malloc(allocsize).ok_or(GcError::OutOfMemory { size: allocsize })?;
        self.rawmalloced_total_size += allocsize;
        let result = Address::from_ptr(block.as_ptr()).add(cardheadersize);
        // SAFETY: the block is zeroed and holds the cards and the object
        unsafe { init_header(result, type_id, flags) };
        let obj = result.add(HEADER_SIZE);
        self.rawmalloced_objects.push(RawObject {
            obj,
            block,
            size: allocsize,
        });
        Ok(obj)
    }

    fn malloc_nonmovable_total(
        &mut self,
        roots: &mut dyn RootProvider,
        type_id: TypeId,
        length: usize,
        totalsize: usize,
    ) -> GcResult<Address> {
        if totalsize > self.settings.small_request_threshold {
            return self.external_malloc(roots, type_id, length, totalsize);
        }
        self.full_collect_if_needed(roots, totalsize)?;
        let result = self.ac.malloc(totalsize)?;
        // SAFETY: the arena block is `totalsize` bytes long
        unsafe {
            result.as_ptr::<u8>().write_bytes(0, totalsize);
            init_header(result, type_id, GcFlags::NO_YOUNG_PTRS);
        }
        Ok(result.add(HEADER_SIZE))
    }

    // ── Queries ───────────────────────────────────────────────────────

    #[inline(always)]
    pub fn is_in_nursery(&self, addr: Address) -> bool {
        self.nursery.contains(addr)
    }

    /// Only nursery objects can still move.
    pub fn can_move(&self, obj: Address) -> bool {
        self.is_in_nursery(obj)
    }

    pub fn nursery(&self) -> &Nursery {
        &self.nursery
    }

    /// Size of `obj` in bytes, header excluded.
    pub fn get_size(&self, obj: Address) -> usize {
        // SAFETY: obj is a live object
        unsafe { self.types.object_size(obj) }
    }

    pub fn type_id_of(&self, obj: Address) -> TypeId {
        header(obj).type_id()
    }

    pub fn flags_of(&self, obj: Address) -> GcFlags {
        header(obj).flags()
    }

    /// Memory in use outside the nursery.
    pub fn total_memory_used(&self) -> usize {
        self.ac.total_memory_used() + self.rawmalloced_total_size
    }

    pub fn stats(&self) -> GcStats {
        GcStats {
            arena_memory: self.ac.total_memory_used(),
            rawmalloced_memory: self.rawmalloced_total_size,
            next_major_collection_threshold: self.next_major_collection_threshold
                as usize,
            ..self.stats
        }
    }

    /// Objects whose finalizer is due but has not run yet.
    pub fn pending_finalizers(&self) -> impl Iterator<Item = Address> + '_ {
        self.run_finalizers.iter().copied()
    }

    /// Objects with a finalizer that are not known to be unreachable.
    pub fn objects_with_finalizers(&self) -> impl Iterator<Item = Address> + '_ {
        self.objects_with_finalizers.iter().copied()
    }

    // ── Mutator operations ────────────────────────────────────────────

    /// Runs a minor collection, followed by a major one for
    /// [`Generation::Major`]. A major collection requested while finalizers
    /// run is deferred.
    pub fn collect(
        &mut self,
        roots: &mut dyn RootProvider,
        generation: Generation,
    ) -> GcResult<()> {
        self.minor_collection(roots);
        if generation == Generation::Major {
            if self.finalizer_lock {
                debug!(target: "gc", "major collection deferred: finalizers running");
            } else {
                self.major_collection(roots, 0)?;
            }
        }
        Ok(())
    }

    pub fn set_max_heap_size(&mut self, size: usize) {
        self.max_heap_size = size;
        if size > 0 && self.next_major_collection_threshold > size as f64 {
            self.next_major_collection_threshold = size as f64;
        }
        info!(target: "gc", "max heap size set to {size} bytes");
    }

    /// Shortens an array still in the nursery. Returns false for objects
    /// that can no longer shrink.
    pub fn shrink_array(&mut self, obj: Address, new_length: usize) -> bool {
        if !self.is_in_nursery(obj) {
            return false;
        }
        let type_id = header(obj).type_id();
        let Some(varsize) = &self.types.get(type_id).varsize else {
            return false;
        };
        let offset_to_length = varsize.offset_to_length;
        // SAFETY: the length word lies inside the fixed part
        let old_length: usize = unsafe { obj.add(offset_to_length).load() };
        if new_length > old_length {
            return false;
        }

        let old_size = self.get_size(obj);
        // SAFETY: see above
        unsafe { obj.add(offset_to_length).store(new_length) };
        let new_size = self.get_size(obj);

        let old_total = round_up_to_word(HEADER_SIZE + old_size).max(MIN_NURSERY_OBJECT_SIZE);
        let new_total = round_up_to_word(HEADER_SIZE + new_size).max(MIN_NURSERY_OBJECT_SIZE);
        let start = obj.sub(HEADER_SIZE);
        self.nursery
            .try_shrink_last(start.add(old_total), start.add(new_total));
        true
    }

    /// Creates an immortal object outside all collected spaces, as if it had
    /// been built ahead of time. A `hash` makes `identity_hash` return that
    /// value instead of the address.
    pub fn prebuilt_object(
        &mut self,
        type_id: TypeId,
        length: usize,
        hash: Option<usize>,
    ) -> GcResult<Address> {
        let size = self.types.instance_size(type_id, length)?;
        let body = round_up_to_word(HEADER_SIZE + size);
        let totalsize = body + if hash.is_some() { object::WORD } else { 0 };
        let block = raw_malloc(totalsize).ok_or(GcError::OutOfMemory { size: totalsize })?;
        self.prebuilt_storage.push((block, totalsize));

        let result = Address::from_ptr(block.as_ptr());
        let mut flags = GcFlags::NO_HEAP_PTRS | GcFlags::NO_YOUNG_PTRS;
        if hash.is_some() {
            flags |= GcFlags::HAS_SHADOW;
        }
        let obj = result.add(HEADER_SIZE);
        // SAFETY: the block holds the header, the body and the hash word
        unsafe {
            init_header(result, type_id, flags);
            if let Some(varsize) = &self.types.get(type_id).varsize {
                obj.add(varsize.offset_to_length).store(length);
            }
            if let Some(hash) = hash {
                result.add(body).store(hash);
            }
        }
        Ok(obj)
    }

    // ── Debugging ─────────────────────────────────────────────────────

    /// Asserts the header invariants on everything reachable from the roots,
    /// the prebuilt roots and the finalizer queues. Only meaningful right
    /// after a collection, while the nursery is empty.
    pub fn debug_check_consistency(&self, roots: &mut dyn RootProvider) {
        let mut pending: Vec<Address> = Vec::new();
        roots.visit_stack_roots(&mut |slot| pending.push(*slot));
        roots.visit_static_nongc_roots(&mut |slot| pending.push(*slot));
        pending.extend_from_slice(&self.prebuilt_root_objects);
        pending.extend(self.objects_with_finalizers.iter().copied());
        pending.extend(self.run_finalizers.iter().copied());

        let mut seen = FxHashSet::default();
        while let Some(obj) = pending.pop() {
            if obj.is_null() || !seen.insert(obj) {
                continue;
            }
            self.debug_check_object(obj);
            // SAFETY: obj passed the header checks above
            unsafe { self.types.trace(obj, &mut |slot| pending.push(*slot)) };
        }
    }

    fn debug_check_object(&self, obj: Address) {
        assert!(!self.is_in_nursery(obj), "object {obj:?} in the nursery after a collection");
        let hdr = header(obj);
        assert!(!hdr.is_forwarded(), "reference {obj:?} to a forwarding stub");
        assert!(
            (hdr.type_id().index()) < self.types.len(),
            "object {obj:?} has an unknown type id"
        );
        let flags = hdr.flags();
        assert!(
            flags.contains(GcFlags::NO_YOUNG_PTRS),
            "object {obj:?} lacks NO_YOUNG_PTRS"
        );
        assert!(!flags.contains(GcFlags::VISITED), "object {obj:?} still VISITED");
        assert!(
            !flags.contains(GcFlags::FINALIZATION_ORDERING),
            "object {obj:?} still has FINALIZATION_ORDERING"
        );
        assert!(!flags.contains(GcFlags::CARDS_SET), "object {obj:?} still has CARDS_SET");
    }
}

impl Drop for MiniMark {
    fn drop(&mut self) {
        for raw in self.rawmalloced_objects.drain(..) {
            // SAFETY: allocated by external_malloc with this size
            unsafe { raw_free(raw.block, raw.size) };
        }
        for (block, totalsize) in self.prebuilt_storage.drain(..) {
            // SAFETY: allocated by prebuilt_object with this size
            unsafe { raw_free(block, totalsize) };
        }
    }
}

impl std::fmt::Debug for MiniMark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiniMark")
            .field("nursery", &self.nursery)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
