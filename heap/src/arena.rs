//! Non-moving storage for small objects that left the nursery.
//!
//! Terminology: the memory is split into *arenas* obtained from the OS, each
//! arena is split into *pages*, and each page serves *blocks* of a single
//! size class. A page starts with a [`PageHeader`]; the rest is blocks.
//!
//! Free blocks of a page form a singly linked list, kept in address order,
//! that ends with a pointer to the first never-used block (or to the page
//! end). Free pages of an arena are linked the same way through their first
//! word.

use std::ptr::{self, NonNull};

use log::{debug, trace};
use object::{Address, WORD};

use crate::{
    error::{GcError, GcResult},
    system::{map_memory, unmap_memory},
};

/// Storage for objects that never move once allocated.
pub trait ArenaAllocator {
    /// Returns an uninitialized block of `size` bytes. `size` is a non-zero
    /// multiple of the word size, at most the small request threshold.
    fn malloc(&mut self, size: usize) -> GcResult<Address>;

    /// Calls `ok_to_free` once with the start of every allocated block and
    /// releases the blocks for which it returns true.
    fn mass_free(&mut self, ok_to_free: &mut dyn FnMut(Address) -> bool);

    /// Bytes currently handed out.
    fn total_memory_used(&self) -> usize;
}

#[repr(C)]
struct PageHeader {
    /// Next page of the same size class and state.
    nextpage: *mut PageHeader,
    arena: *mut ArenaHeader,
    /// Number of blocks in the free list, not counting never-used ones.
    nfree: usize,
    /// Head of the free list, or the first never-used block.
    freeblock: *mut u8,
}

pub const PAGE_HEADER_SIZE: usize = size_of::<PageHeader>();

struct ArenaHeader {
    base: NonNull<u8>,
    nfreepages: usize,
    totalpages: usize,
    /// Chain of free pages; in the current arena it ends in the first
    /// uninitialized page.
    freepages: *mut u8,
    nextarena: *mut ArenaHeader,
}

/// Page-based allocator with one free list per size class.
pub struct ArenaCollection {
    arena_size: usize,
    page_size: usize,
    small_request_threshold: usize,

    /// Pages with free blocks, indexed by size class (size / WORD).
    page_for_size: Vec<*mut PageHeader>,
    /// Pages without free blocks.
    full_page_for_size: Vec<*mut PageHeader>,
    nblocks_for_size: Vec<usize>,

    max_pages_per_arena: usize,
    /// Arenas other than the current one, indexed by their free page count.
    arenas_lists: Vec<*mut ArenaHeader>,
    /// Arena that new pages come from.
    current_arena: *mut ArenaHeader,
    /// No list below this index holds an arena.
    min_empty_nfreepages: usize,
    num_uninitialized_pages: usize,
    num_arenas: usize,
    total_memory_used: usize,
}

impl ArenaCollection {
    pub fn new(
        arena_size: usize,
        page_size: usize,
        small_request_threshold: usize,
    ) -> Self {
        assert!(page_size.is_multiple_of(WORD));
        assert!(small_request_threshold.is_multiple_of(WORD));
        assert!(page_size >= PAGE_HEADER_SIZE + small_request_threshold);
        assert!(arena_size >= 2 * page_size);

        let length = small_request_threshold / WORD + 1;
        let mut nblocks_for_size = vec![0; length];
        for (size_class, nblocks) in nblocks_for_size.iter_mut().enumerate().skip(1) {
            *nblocks = (page_size - PAGE_HEADER_SIZE) / (WORD * size_class);
        }
        let max_pages_per_arena = arena_size / page_size;

        Self {
            arena_size,
            page_size,
            small_request_threshold,
            page_for_size: vec![ptr::null_mut(); length],
            full_page_for_size: vec![ptr::null_mut(); length],
            nblocks_for_size,
            max_pages_per_arena,
            arenas_lists: vec![ptr::null_mut(); max_pages_per_arena],
            current_arena: ptr::null_mut(),
            min_empty_nfreepages: max_pages_per_arena,
            num_uninitialized_pages: 0,
            num_arenas: 0,
            total_memory_used: 0,
        }
    }

    /// Number of arenas currently mapped.
    pub fn arena_count(&self) -> usize {
        self.num_arenas
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Blocks of `size` bytes that fit into one page.
    pub fn blocks_per_page(&self, size: usize) -> usize {
        self.nblocks_for_size[size / WORD]
    }

    fn allocate_new_page(&mut self, size_class: usize) -> GcResult<*mut PageHeader> {
        if self.current_arena.is_null() {
            self.allocate_new_arena()?;
        }
        let arena = self.current_arena;
        // SAFETY: current_arena is a live arena with at least one free or
        // uninitialized page
        unsafe {
            let result = (*arena).freepages;
            let freepages = if (*arena).nfreepages > 0 {
                (*arena).nfreepages -= 1;
                *result.cast::<*mut u8>()
            } else {
                debug_assert!(self.num_uninitialized_pages > 0);
                self.num_uninitialized_pages -= 1;
                if self.num_uninitialized_pages > 0 {
                    result.add(self.page_size)
                } else {
                    ptr::null_mut()
                }
            };
            (*arena).freepages = freepages;
            if freepages.is_null() {
                // arena full: park it in the list of arenas without free pages
                debug_assert_eq!((*arena).nfreepages, 0);
                (*arena).nextarena = self.arenas_lists[0];
                self.arenas_lists[0] = arena;
                self.current_arena = ptr::null_mut();
            }

            let page = result.cast::<PageHeader>();
            page.write(PageHeader {
                nextpage: ptr::null_mut(),
                arena,
                nfree: 0,
                freeblock: result.add(PAGE_HEADER_SIZE),
            });
            debug_assert!(self.page_for_size[size_class].is_null());
            self.page_for_size[size_class] = page;
            Ok(page)
        }
    }

    /// Picks the non-full arena with the fewest free pages.
    fn pick_next_arena(&mut self) -> bool {
        let mut i = self.min_empty_nfreepages;
        while i < self.max_pages_per_arena {
            let arena = self.arenas_lists[i];
            if !arena.is_null() {
                // SAFETY: arenas in the lists are live
                unsafe {
                    self.arenas_lists[i] = (*arena).nextarena;
                    (*arena).nextarena = ptr::null_mut();
                }
                self.current_arena = arena;
                self.min_empty_nfreepages = i;
                return true;
            }
            i += 1;
            self.min_empty_nfreepages = i;
        }
        false
    }

    fn allocate_new_arena(&mut self) -> GcResult<()> {
        if self.pick_next_arena() {
            return Ok(());
        }
        // nothing to reuse: rehash first, then map fresh memory
        self.rehash_arenas_lists();
        if self.pick_next_arena() {
            return Ok(());
        }

        let base = map_memory(self.arena_size).ok_or(GcError::OutOfMemory {
            size: self.arena_size,
        })?;
        let start = base.as_ptr() as usize;
        let firstpage = start.next_multiple_of(self.page_size);
        let npages = (start + self.arena_size - firstpage) / self.page_size;
        debug_assert!(npages > 0);

        let arena = Box::into_raw(Box::new(ArenaHeader {
            base,
            nfreepages: 0,
            totalpages: npages,
            freepages: firstpage as *mut u8,
            nextarena: ptr::null_mut(),
        }));
        self.num_uninitialized_pages = npages;
        self.current_arena = arena;
        self.num_arenas += 1;
        debug!(target: "gc", "mapped arena #{} with {npages} pages", self.num_arenas);
        Ok(())
    }

    /// Re-sorts the arenas by free page count, releasing fully free ones.
    fn rehash_arenas_lists(&mut self) {
        let mut lists = vec![ptr::null_mut(); self.max_pages_per_arena];
        let old = std::mem::take(&mut self.arenas_lists);
        for mut arena in old {
            while !arena.is_null() {
                // SAFETY: every arena in the lists is a live boxed header
                unsafe {
                    let nextarena = (*arena).nextarena;
                    if (*arena).nfreepages == (*arena).totalpages {
                        self.free_arena(arena);
                    } else {
                        let n = (*arena).nfreepages;
                        debug_assert!(n < self.max_pages_per_arena);
                        (*arena).nextarena = lists[n];
                        lists[n] = arena;
                    }
                    arena = nextarena;
                }
            }
        }
        self.arenas_lists = lists;
        self.min_empty_nfreepages = 1;
    }

    /// # Safety
    /// `arena` must be a live arena that is in no list.
    unsafe fn free_arena(&mut self, arena: *mut ArenaHeader) {
        // SAFETY: the header came from Box::into_raw
        let header = unsafe { Box::from_raw(arena) };
        // SAFETY: base was mapped with arena_size bytes
        unsafe { unmap_memory(header.base, self.arena_size) };
        self.num_arenas -= 1;
        trace!(target: "gc", "released arena at {:p}", header.base);
    }

    fn mass_free_in_pages(
        &mut self,
        size_class: usize,
        ok_to_free: &mut dyn FnMut(Address) -> bool,
    ) {
        let nblocks = self.nblocks_for_size[size_class];
        let block_size = size_class * WORD;
        let old_full = std::mem::replace(
            &mut self.full_page_for_size[size_class],
            ptr::null_mut(),
        );
        let old_partial =
            std::mem::replace(&mut self.page_for_size[size_class], ptr::null_mut());

        let mut remaining_full: *mut PageHeader = ptr::null_mut();
        let mut remaining_partial: *mut PageHeader = ptr::null_mut();
        for mut page in [old_full, old_partial] {
            while !page.is_null() {
                // SAFETY: pages in the size class lists are live
                unsafe {
                    let surviving = self.walk_page(page, block_size, ok_to_free);
                    let nextpage = (*page).nextpage;
                    if surviving == nblocks {
                        (*page).nextpage = remaining_full;
                        remaining_full = page;
                    } else if surviving > 0 {
                        (*page).nextpage = remaining_partial;
                        remaining_partial = page;
                    } else {
                        self.free_page(page);
                    }
                    page = nextpage;
                }
            }
        }
        self.full_page_for_size[size_class] = remaining_full;
        self.page_for_size[size_class] = remaining_partial;
    }

    /// Frees the unwanted blocks of `page`, keeping the free list in address
    /// order. Returns the number of surviving blocks.
    ///
    /// # Safety
    /// `page` must be a live page serving `block_size` blocks.
    unsafe fn walk_page(
        &mut self,
        page: *mut PageHeader,
        block_size: usize,
        ok_to_free: &mut dyn FnMut(Address) -> bool,
    ) -> usize {
        // SAFETY: guaranteed by the caller; every block before the
        // never-used area is either allocated or on the free list
        unsafe {
            let mut freeblock = (*page).freeblock;
            let mut prevfreeblockat: *mut *mut u8 = &raw mut (*page).freeblock;
            let mut obj = page.cast::<u8>().add(PAGE_HEADER_SIZE);
            let mut skip_free_blocks = (*page).nfree;
            let mut surviving = 0;

            loop {
                if obj == freeblock {
                    if skip_free_blocks == 0 {
                        // reached the never-used area
                        break;
                    }
                    skip_free_blocks -= 1;
                    prevfreeblockat = obj.cast::<*mut u8>();
                    freeblock = *prevfreeblockat;
                } else {
                    debug_assert!(freeblock > obj, "free blocks linked out of order");
                    if ok_to_free(Address::from_ptr(obj)) {
                        *prevfreeblockat = obj;
                        prevfreeblockat = obj.cast::<*mut u8>();
                        *prevfreeblockat = freeblock;
                        (*page).nfree += 1;
                    } else {
                        surviving += 1;
                    }
                }
                obj = obj.add(block_size);
            }

            self.total_memory_used += surviving * block_size;
            surviving
        }
    }

    /// # Safety
    /// `page` must be a live page that is in no list.
    unsafe fn free_page(&mut self, page: *mut PageHeader) {
        // SAFETY: guaranteed by the caller
        unsafe {
            let arena = (*page).arena;
            (*arena).nfreepages += 1;
            let pageaddr = page.cast::<u8>();
            *pageaddr.cast::<*mut u8>() = (*arena).freepages;
            (*arena).freepages = pageaddr;
        }
    }
}

impl ArenaAllocator for ArenaCollection {
    fn malloc(&mut self, size: usize) -> GcResult<Address> {
        debug_assert!(size > 0 && size <= self.small_request_threshold);
        debug_assert!(size.is_multiple_of(WORD));
        let size_class = size / WORD;

        let mut page = self.page_for_size[size_class];
        if page.is_null() {
            page = self.allocate_new_page(size_class)?;
        }
        self.total_memory_used += size;

        // SAFETY: page is a live page of this size class with a free block
        unsafe {
            let result = (*page).freeblock;
            let freeblock = if (*page).nfree > 0 {
                (*page).nfree -= 1;
                *result.cast::<*mut u8>()
            } else {
                result.add(size)
            };
            (*page).freeblock = freeblock;

            let used = freeblock as usize - page as usize;
            if used > self.page_size - size {
                // no room left: move the page to the full list
                self.page_for_size[size_class] = (*page).nextpage;
                (*page).nextpage = self.full_page_for_size[size_class];
                self.full_page_for_size[size_class] = page;
            }
            Ok(Address::from_ptr(result))
        }
    }

    fn mass_free(&mut self, ok_to_free: &mut dyn FnMut(Address) -> bool) {
        self.total_memory_used = 0;
        for size_class in (1..self.page_for_size.len()).rev() {
            self.mass_free_in_pages(size_class, ok_to_free);
        }
        self.rehash_arenas_lists();
        debug!(
            target: "gc",
            "arenas after sweep: {} mapped, {} bytes in use",
            self.num_arenas, self.total_memory_used
        );
    }

    fn total_memory_used(&self) -> usize {
        self.total_memory_used
    }
}

impl Drop for ArenaCollection {
    fn drop(&mut self) {
        let mut arenas = std::mem::take(&mut self.arenas_lists);
        arenas.push(std::mem::replace(&mut self.current_arena, ptr::null_mut()));
        for mut arena in arenas {
            while !arena.is_null() {
                // SAFETY: every arena is owned by this collection
                unsafe {
                    let nextarena = (*arena).nextarena;
                    self.free_arena(arena);
                    arena = nextarena;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn create_test_arenas() -> ArenaCollection {
        // 4 pages of 16 words, blocks up to 8 words
        ArenaCollection::new(64 * WORD, 16 * WORD, 8 * WORD)
    }

    fn tag(block: Address, value: usize) {
        unsafe { block.store(value) };
    }

    #[test]
    fn test_malloc_returns_distinct_aligned_blocks() {
        let mut ac = create_test_arenas();
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let block = ac.malloc(2 * WORD).unwrap();
            assert!(block.is_aligned(WORD));
            assert!(seen.insert(block), "block {block:?} handed out twice");
        }
        assert_eq!(ac.total_memory_used(), 40 * WORD);
        assert_eq!(ac.arena_count(), 1);
    }

    #[test]
    fn test_blocks_within_a_page_are_contiguous() {
        let mut ac = create_test_arenas();
        let first = ac.malloc(3 * WORD).unwrap();
        let second = ac.malloc(3 * WORD).unwrap();
        assert_eq!(second.offset_from(first), 3 * WORD);
        assert_eq!(
            first.as_usize() % ac.page_size(),
            PAGE_HEADER_SIZE,
            "first block follows the page header"
        );
    }

    #[test]
    fn test_mass_free_reuses_freed_blocks() {
        let mut ac = create_test_arenas();
        let blocks: Vec<_> = (0..6).map(|_| ac.malloc(2 * WORD).unwrap()).collect();
        for (i, &block) in blocks.iter().enumerate() {
            tag(block, i);
        }

        let mut visited = 0;
        ac.mass_free(&mut |block| {
            visited += 1;
            (unsafe { block.load::<usize>() }) % 2 == 1
        });
        assert_eq!(visited, 6);
        assert_eq!(ac.total_memory_used(), 3 * 2 * WORD);

        // the freed odd blocks come back first, in address order
        let reused: Vec<_> = (0..3).map(|_| ac.malloc(2 * WORD).unwrap()).collect();
        assert_eq!(reused, vec![blocks[1], blocks[3], blocks[5]]);

        // survivors were left untouched
        for &block in &[blocks[0], blocks[2], blocks[4]] {
            assert_eq!(unsafe { block.load::<usize>() } % 2, 0);
        }
    }

    #[test]
    fn test_full_pages_are_swept() {
        let mut ac = create_test_arenas();
        let per_page = ac.blocks_per_page(4 * WORD);
        let blocks: Vec<_> =
            (0..per_page * 2).map(|_| ac.malloc(4 * WORD).unwrap()).collect();
        for &block in &blocks {
            tag(block, 1);
        }
        tag(blocks[0], 0);

        ac.mass_free(&mut |block| unsafe { block.load::<usize>() } == 0);
        assert_eq!(ac.total_memory_used(), (per_page * 2 - 1) * 4 * WORD);
        assert_eq!(ac.malloc(4 * WORD).unwrap(), blocks[0]);
    }

    #[test]
    fn test_empty_arenas_are_returned() {
        let mut ac = create_test_arenas();
        // enough pages for three arenas
        for size_class in 1..=8 {
            for _ in 0..ac.blocks_per_page(size_class * WORD) {
                ac.malloc(size_class * WORD).unwrap();
            }
        }
        for _ in 0..ac.blocks_per_page(WORD) * 4 {
            ac.malloc(WORD).unwrap();
        }
        assert!(ac.arena_count() >= 3, "got {} arenas", ac.arena_count());

        ac.mass_free(&mut |_| true);
        assert_eq!(ac.total_memory_used(), 0);
        assert!(
            ac.arena_count() <= 1,
            "only the current arena may stay mapped, got {}",
            ac.arena_count()
        );

        // the collection is still usable afterwards
        let block = ac.malloc(WORD).unwrap();
        tag(block, 7);
        ac.mass_free(&mut |_| false);
        assert_eq!(ac.total_memory_used(), WORD);
    }

    #[test]
    fn test_free_pages_are_reused_by_other_size_classes() {
        let mut ac = create_test_arenas();
        let per_page = ac.blocks_per_page(2 * WORD);
        for _ in 0..per_page {
            ac.malloc(2 * WORD).unwrap();
        }
        ac.mass_free(&mut |_| true);

        let arenas = ac.arena_count();
        for _ in 0..ac.blocks_per_page(5 * WORD) {
            ac.malloc(5 * WORD).unwrap();
        }
        assert_eq!(ac.arena_count(), arenas, "freed page should be recycled");
    }
}
