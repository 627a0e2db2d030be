#![allow(dead_code)]

use std::cell::RefCell;

use heap::{
    Address, ArenaCollection, GcSettings, MiniMark, RootProvider, ShadowStack,
    SimpleArenaCollection, TypeId, TypeInfo, TypeTableBuilder, WORD,
};

// ── Test object layouts ───────────────────────────────────────────────

/// `node { value, prev, next }`
pub const NODE: TypeId = TypeId::new(0);
pub const VALUE: usize = 0;
pub const PREV: usize = WORD;
pub const NEXT: usize = 2 * WORD;

/// `array { length, items: [ptr] }`
pub const ARRAY: TypeId = TypeId::new(1);
pub const ARRAY_ITEMS: usize = WORD;

/// `weakref { target (weak) }`
pub const WEAKREF: TypeId = TypeId::new(2);
pub const WEAK_TARGET: usize = 0;

/// `resource { value, ptr }` with a finalizer recording `value`.
pub const RESOURCE: TypeId = TypeId::new(3);
pub const RESOURCE_PTR: usize = WORD;

/// `big { ptr, 7 data words }`: always outside the nursery.
pub const BIG: TypeId = TypeId::new(4);

/// `bytes { length, items: [u8] }`
pub const BYTES: TypeId = TypeId::new(5);

/// `greedy { value }` whose finalizer allocates and asks for a major
/// collection.
pub const GREEDY: TypeId = TypeId::new(6);

thread_local! {
    static FINALIZED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    static MAJORS_SEEN_BY_FINALIZER: RefCell<Vec<(usize, usize)>> =
        const { RefCell::new(Vec::new()) };
}

fn record_value(_gc: &mut MiniMark, _roots: &mut dyn RootProvider, obj: Address) {
    let value = unsafe { obj.add(VALUE).load::<usize>() };
    FINALIZED.with(|f| f.borrow_mut().push(value));
}

fn allocate_and_collect(gc: &mut MiniMark, roots: &mut dyn RootProvider, obj: Address) {
    let majors_before = gc.stats().major_collections;
    for i in 0..64usize {
        let node = gc.malloc(roots, NODE, 0).expect("allocation in finalizer");
        unsafe { node.store(i) };
    }
    gc.collect(roots, heap::Generation::Major)
        .expect("collect in finalizer");
    let majors_after = gc.stats().major_collections;
    MAJORS_SEEN_BY_FINALIZER.with(|m| m.borrow_mut().push((majors_before, majors_after)));
    record_value(gc, roots, obj);
}

/// Values recorded by finalizers so far, oldest first, then cleared.
pub fn take_finalized() -> Vec<usize> {
    FINALIZED.with(|f| std::mem::take(&mut *f.borrow_mut()))
}

pub fn take_majors_seen_by_finalizer() -> Vec<(usize, usize)> {
    MAJORS_SEEN_BY_FINALIZER.with(|m| std::mem::take(&mut *m.borrow_mut()))
}

pub fn create_test_types() -> std::sync::Arc<heap::TypeTable> {
    let mut builder = TypeTableBuilder::new();
    let ids = [
        builder.register(TypeInfo::fixed("node", 3 * WORD).with_gc_pointers(&[PREV, NEXT])),
        builder.register(
            TypeInfo::varsize("array", WORD, WORD, 0).with_item_gc_pointers(&[0]),
        ),
        builder.register(TypeInfo::fixed("weakref", WORD).with_weakptr(WEAK_TARGET)),
        builder.register(
            TypeInfo::fixed("resource", 2 * WORD)
                .with_gc_pointers(&[RESOURCE_PTR])
                .with_finalizer(record_value),
        ),
        builder.register(TypeInfo::fixed("big", 8 * WORD).with_gc_pointers(&[0])),
        builder.register(TypeInfo::varsize("bytes", WORD, 1, 0)),
        builder.register(TypeInfo::fixed("greedy", WORD).with_finalizer(allocate_and_collect)),
    ];
    let expected = [NODE, ARRAY, WEAKREF, RESOURCE, BIG, BYTES, GREEDY];
    for (id, expected) in ids.into_iter().zip(expected) {
        assert_eq!(id.expect("valid test type"), expected);
    }
    builder.build()
}

/// Tiny spaces so that tests hit every collection path quickly.
pub fn create_test_settings() -> GcSettings {
    GcSettings {
        nursery_size: 32 * WORD,
        major_collection_threshold: 2.5,
        small_request_threshold: 5 * WORD,
        page_size: 16 * WORD,
        arena_size: 64 * WORD,
        max_heap_size: 0,
        card_page_indices: 4,
        debug_checks: true,
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ArenaKind {
    Pages,
    Simple,
}

pub struct TestEnv {
    pub gc: MiniMark,
    pub roots: ShadowStack,
}

pub fn create_test_env(kind: ArenaKind) -> TestEnv {
    let settings = create_test_settings();
    let types = create_test_types();
    let gc = match kind {
        ArenaKind::Pages => MiniMark::new(settings, types),
        ArenaKind::Simple => {
            let ac = SimpleArenaCollection::new(settings.small_request_threshold);
            MiniMark::with_arena(settings, types, Box::new(ac))
        }
    }
    .expect("test collector");
    take_finalized();
    take_majors_seen_by_finalizer();
    TestEnv {
        gc,
        roots: ShadowStack::new(),
    }
}

/// Runs `scenario` once per arena implementation.
pub fn for_each_arena(scenario: fn(&mut TestEnv)) {
    for kind in [ArenaKind::Pages, ArenaKind::Simple] {
        let mut env = create_test_env(kind);
        scenario(&mut env);
    }
}

/// Builds the collector with an explicit page allocator, for tests that need
/// its settings changed.
pub fn create_env_with(settings: GcSettings) -> TestEnv {
    let ac = ArenaCollection::new(
        settings.arena_size,
        settings.page_size,
        settings.small_request_threshold,
    );
    let gc = MiniMark::with_arena(settings, create_test_types(), Box::new(ac))
        .expect("test collector");
    TestEnv {
        gc,
        roots: ShadowStack::new(),
    }
}

// ── Object helpers ────────────────────────────────────────────────────

impl TestEnv {
    /// Allocates a node holding `value`. Unrooted addresses are stale after
    /// the next allocation.
    pub fn node(&mut self, value: usize) -> Address {
        let obj = self.gc.malloc(&mut self.roots, NODE, 0).expect("node");
        unsafe { obj.add(VALUE).store(value) };
        obj
    }

    /// Allocates a node and roots it, returning the root index.
    pub fn rooted_node(&mut self, value: usize) -> usize {
        let obj = self.node(value);
        self.roots.push(obj)
    }

    pub fn array(&mut self, length: usize) -> Address {
        self.gc.malloc(&mut self.roots, ARRAY, length).expect("array")
    }

    pub fn root(&self, index: usize) -> Address {
        self.roots.get(index)
    }

    pub fn value(&self, obj: Address) -> usize {
        unsafe { obj.add(VALUE).load::<usize>() }
    }

    pub fn get(&self, obj: Address, offset: usize) -> Address {
        unsafe { self.gc.read_pointer(obj, offset) }
    }

    pub fn set(&mut self, obj: Address, offset: usize, value: Address) {
        unsafe { self.gc.write_pointer(obj, offset, value) };
    }

    pub fn item(&self, array: Address, index: usize) -> Address {
        self.get(array, ARRAY_ITEMS + index * WORD)
    }

    pub fn set_item(&mut self, array: Address, index: usize, value: Address) {
        self.gc.write_barrier_from_array(value, array, index);
        unsafe { array.add(ARRAY_ITEMS + index * WORD).store_address(value) };
    }

    pub fn length(&self, array: Address) -> usize {
        unsafe { array.load::<usize>() }
    }

    pub fn minor(&mut self) {
        self.gc
            .collect(&mut self.roots, heap::Generation::Minor)
            .expect("minor collection");
    }

    pub fn major(&mut self) {
        self.gc
            .collect(&mut self.roots, heap::Generation::Major)
            .expect("major collection");
    }
}

/// Small deterministic generator for randomized tests.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    pub fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}
