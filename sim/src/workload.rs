//! Synthetic mutators that exercise the collector.
//!
//! Every workload keeps its live objects in a [`ShadowStack`] and re-reads
//! them from there after each allocation, the way a compiled mutator would
//! reload spilled roots after a call into the collector.

use std::{cell::Cell, sync::Arc};

use clap::ValueEnum;
use heap::{
    Address, GcResult, Generation, MiniMark, RootProvider, ShadowStack, TypeId,
    TypeInfo, TypeTable, TypeTableBuilder, WORD,
};
use log::{debug, info};

/// `cons { value, car, cdr }`
const VALUE: usize = 0;
const CAR: usize = WORD;
const CDR: usize = 2 * WORD;
/// `array { length, items }` and `buffer { length, bytes }`
const ITEMS: usize = WORD;
/// `resource { handle, payload }`
const PAYLOAD: usize = WORD;

const LIST_LENGTH: usize = 1000;
const LONG_LIVED_TREE_DEPTH: usize = 12;
const TEMP_TREE_DEPTH: usize = 10;
const WEAK_BATCH: usize = 100;
const WEAK_KEEP_EVERY: usize = 10;
const RESOURCE_BATCH: usize = 100;
const MIXED_SLOTS: usize = 64;
const MIXED_STEPS: usize = 2000;

thread_local! {
    static FINALIZED: Cell<usize> = const { Cell::new(0) };
}

fn count_finalized(_gc: &mut MiniMark, _roots: &mut dyn RootProvider, _obj: Address) {
    FINALIZED.with(|count| count.set(count.get() + 1));
}

fn finalized_count() -> usize {
    FINALIZED.with(Cell::get)
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    /// One long list per iteration, the previous one becomes garbage
    List,
    /// Temporary binary trees next to a long-lived one
    Tree,
    /// Weak references to objects that mostly die
    Weakrefs,
    /// Unreachable objects with finalizers
    Finalizers,
    /// Random mix of everything, with identity checks
    Mixed,
}

/// The simulator's object types.
#[derive(Debug, Clone)]
pub struct SimTypes {
    pub table: Arc<TypeTable>,
    pub cons: TypeId,
    pub array: TypeId,
    pub weakref: TypeId,
    pub resource: TypeId,
    pub buffer: TypeId,
}

pub fn build_types() -> GcResult<SimTypes> {
    let mut builder = TypeTableBuilder::new();
    let cons = builder.register(TypeInfo::fixed("cons", 3 * WORD).with_gc_pointers(&[CAR, CDR]))?;
    let array = builder.register(
        TypeInfo::varsize("array", WORD, WORD, 0).with_item_gc_pointers(&[0]),
    )?;
    let weakref = builder.register(TypeInfo::fixed("weakref", WORD).with_weakptr(0))?;
    let resource = builder.register(
        TypeInfo::fixed("resource", 2 * WORD)
            .with_gc_pointers(&[PAYLOAD])
            .with_finalizer(count_finalized),
    )?;
    let buffer = builder.register(TypeInfo::varsize("buffer", WORD, 1, 0))?;
    Ok(SimTypes {
        table: builder.build(),
        cons,
        array,
        weakref,
        resource,
        buffer,
    })
}

/// Small deterministic generator, so that runs are reproducible.
struct Rng(u64);

impl Rng {
    fn below(&mut self, bound: usize) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 33) % bound as u64) as usize
    }
}

pub struct Simulation {
    gc: MiniMark,
    roots: ShadowStack,
    types: SimTypes,
    rng: Rng,
}

impl Simulation {
    pub fn new(gc: MiniMark, types: SimTypes) -> Self {
        Self {
            gc,
            roots: ShadowStack::new(),
            types,
            rng: Rng(0x6d69_6e69_6d61_726b),
        }
    }

    pub fn gc(&self) -> &MiniMark {
        &self.gc
    }

    /// Runs `workload` and returns how many objects were verified.
    pub fn run(&mut self, workload: Workload, iterations: usize) -> GcResult<usize> {
        info!("running {workload:?} for {iterations} iterations");
        let verified = match workload {
            Workload::List => self.run_list(iterations)?,
            Workload::Tree => self.run_tree(iterations)?,
            Workload::Weakrefs => self.run_weakrefs(iterations)?,
            Workload::Finalizers => self.run_finalizers(iterations)?,
            Workload::Mixed => self.run_mixed(iterations)?,
        };
        self.roots.clear();
        Ok(verified)
    }

    // ── Helpers ───────────────────────────────────────────────────────

    /// Allocates a cons cell whose `cdr` is the object rooted at `cdr_slot`.
    fn cons(&mut self, value: usize, cdr_slot: Option<usize>) -> GcResult<Address> {
        let cell = self.gc.malloc(&mut self.roots, self.types.cons, 0)?;
        let cdr = cdr_slot.map_or(Address::NULL, |slot| self.roots.get(slot));
        unsafe {
            cell.add(VALUE).store(value);
            self.gc.write_pointer(cell, CDR, cdr);
        }
        Ok(cell)
    }

    fn value(obj: Address) -> usize {
        unsafe { obj.add(VALUE).load::<usize>() }
    }

    fn field(&self, obj: Address, offset: usize) -> Address {
        unsafe { self.gc.read_pointer(obj, offset) }
    }

    fn set_item(&mut self, array: Address, index: usize, value: Address) {
        self.gc.write_barrier_from_array(value, array, index);
        unsafe { array.add(ITEMS + index * WORD).store_address(value) };
    }

    fn item(&self, array: Address, index: usize) -> Address {
        self.field(array, ITEMS + index * WORD)
    }

    // ── Workloads ─────────────────────────────────────────────────────

    fn run_list(&mut self, iterations: usize) -> GcResult<usize> {
        let mut verified = 0;
        for iteration in 0..iterations {
            let head = self.roots.push(Address::NULL);
            for i in 0..LIST_LENGTH {
                let cell = self.cons(i, Some(head))?;
                self.roots.set(head, cell);
            }

            let mut cell = self.roots.get(head);
            let mut expected = LIST_LENGTH;
            while !cell.is_null() {
                expected -= 1;
                assert_eq!(Self::value(cell), expected, "list cell corrupted");
                cell = self.field(cell, CDR);
                verified += 1;
            }
            assert_eq!(expected, 0, "list too short");
            self.roots.truncate(head);
            debug!("list iteration {iteration} verified");
        }
        Ok(verified)
    }

    fn build_tree(&mut self, depth: usize) -> GcResult<Address> {
        if depth == 0 {
            return Ok(Address::NULL);
        }
        let left = self.build_tree(depth - 1)?;
        let left_slot = self.roots.push(left);
        let right = self.build_tree(depth - 1)?;
        let right_slot = self.roots.push(right);

        let node = self.cons(depth, Some(right_slot))?;
        let left = self.roots.get(left_slot);
        unsafe { self.gc.write_pointer(node, CAR, left) };
        self.roots.truncate(left_slot);
        Ok(node)
    }

    fn check_tree(&self, node: Address, depth: usize) -> usize {
        if depth == 0 {
            assert!(node.is_null(), "tree too deep");
            return 0;
        }
        assert_eq!(Self::value(node), depth, "tree node corrupted");
        1 + self.check_tree(self.field(node, CAR), depth - 1)
            + self.check_tree(self.field(node, CDR), depth - 1)
    }

    fn run_tree(&mut self, iterations: usize) -> GcResult<usize> {
        let long_lived = self.build_tree(LONG_LIVED_TREE_DEPTH)?;
        let long_lived = self.roots.push(long_lived);
        let mut verified = 0;
        for _ in 0..iterations {
            let temp = self.build_tree(TEMP_TREE_DEPTH)?;
            verified += self.check_tree(temp, TEMP_TREE_DEPTH);
        }
        self.gc.collect(&mut self.roots, Generation::Major)?;
        verified += self.check_tree(self.roots.get(long_lived), LONG_LIVED_TREE_DEPTH);
        Ok(verified)
    }

    fn run_weakrefs(&mut self, iterations: usize) -> GcResult<usize> {
        let mut alive_total = 0;
        for _ in 0..iterations {
            let weaks = self.gc.malloc(&mut self.roots, self.types.array, WEAK_BATCH)?;
            let weaks = self.roots.push(weaks);
            let keep = self
                .gc
                .malloc(&mut self.roots, self.types.array, WEAK_BATCH / WEAK_KEEP_EVERY)?;
            let keep = self.roots.push(keep);

            for i in 0..WEAK_BATCH {
                let target = self.cons(i, None)?;
                let target = self.roots.push(target);
                let weak = self.gc.malloc(&mut self.roots, self.types.weakref, 0)?;
                // young weakrefs must get their target before anything else
                // is allocated
                let target = self.roots.get(target);
                unsafe { weak.store_address(target) };
                let weaks = self.roots.get(weaks);
                self.set_item(weaks, i, weak);
                if i % WEAK_KEEP_EVERY == 0 {
                    let keep = self.roots.get(keep);
                    self.set_item(keep, i / WEAK_KEEP_EVERY, target);
                }
                self.roots.pop();
            }
            self.gc.collect(&mut self.roots, Generation::Major)?;

            let weaks_obj = self.roots.get(weaks);
            let mut alive = 0;
            for i in 0..WEAK_BATCH {
                let weak = self.item(weaks_obj, i);
                let target = unsafe { weak.load_address() };
                if target.is_null() {
                    continue;
                }
                assert_eq!(Self::value(target) % WEAK_KEEP_EVERY, 0, "dead target kept");
                alive += 1;
            }
            assert_eq!(alive, WEAK_BATCH / WEAK_KEEP_EVERY, "live target lost");
            alive_total += alive;
            self.roots.truncate(weaks);
        }
        Ok(alive_total)
    }

    fn run_finalizers(&mut self, iterations: usize) -> GcResult<usize> {
        let before = finalized_count();
        for _ in 0..iterations {
            for i in 0..RESOURCE_BATCH {
                let payload = self.cons(i, None)?;
                let payload = self.roots.push(payload);
                let resource = self.gc.malloc(&mut self.roots, self.types.resource, 0)?;
                unsafe {
                    resource.store(i);
                    self.gc.write_pointer(resource, PAYLOAD, self.roots.get(payload));
                }
                self.roots.pop();
            }
            self.gc.collect(&mut self.roots, Generation::Major)?;
        }
        let finalized = finalized_count() - before;
        assert_eq!(finalized, iterations * RESOURCE_BATCH, "finalizer missed");
        Ok(finalized)
    }

    fn run_mixed(&mut self, iterations: usize) -> GcResult<usize> {
        let base = self.roots.len();
        for _ in 0..MIXED_SLOTS {
            self.roots.push(Address::NULL);
        }
        let mut ids: Vec<Option<usize>> = vec![None; MIXED_SLOTS];
        let mut verified = 0;

        for _ in 0..iterations * MIXED_STEPS {
            let slot = self.rng.below(MIXED_SLOTS);
            match self.rng.below(16) {
                0..=6 => {
                    let other = base + self.rng.below(MIXED_SLOTS);
                    let cell = self.cons(slot, Some(other))?;
                    self.roots.set(base + slot, cell);
                    ids[slot] = None;
                }
                7 | 8 => {
                    let length = self.rng.below(64);
                    let array = self.gc.malloc(&mut self.roots, self.types.array, length)?;
                    for i in 0..length.min(4) {
                        let other = base + self.rng.below(MIXED_SLOTS);
                        let item = self.roots.get(other);
                        self.set_item(array, i, item);
                    }
                    self.roots.set(base + slot, array);
                    ids[slot] = None;
                }
                9 => {
                    let length = self.rng.below(4096);
                    let buffer = self.gc.malloc(&mut self.roots, self.types.buffer, length)?;
                    self.roots.set(base + slot, buffer);
                    ids[slot] = None;
                }
                10 | 11 => {
                    let obj = self.roots.get(base + slot);
                    if obj.is_null() {
                        continue;
                    }
                    let id = self.gc.id(obj);
                    if let Some(previous) = ids[slot] {
                        assert_eq!(previous, id, "id changed while the object lived");
                        verified += 1;
                    }
                    ids[slot] = Some(id);
                }
                12 => {
                    self.roots.set(base + slot, Address::NULL);
                    ids[slot] = None;
                }
                13 | 14 => {
                    let obj = self.roots.get(base + slot);
                    if !obj.is_null() && self.gc.type_id_of(obj) == self.types.cons {
                        let target = self.roots.get(base + self.rng.below(MIXED_SLOTS));
                        unsafe { self.gc.write_pointer(obj, CAR, target) };
                    }
                }
                _ => {
                    let generation = if self.rng.below(4) == 0 {
                        Generation::Major
                    } else {
                        Generation::Minor
                    };
                    self.gc.collect(&mut self.roots, generation)?;
                }
            }
        }
        self.roots.truncate(base);
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heap::{GcSettings, SimpleArenaCollection};

    fn create_test_settings() -> GcSettings {
        GcSettings {
            nursery_size: 64 * WORD,
            major_collection_threshold: 2.0,
            small_request_threshold: 8 * WORD,
            page_size: 32 * WORD,
            arena_size: 256 * WORD,
            max_heap_size: 0,
            card_page_indices: 4,
            debug_checks: true,
        }
    }

    fn create_simulation(simple_arena: bool) -> Simulation {
        let types = build_types().expect("valid types");
        let settings = create_test_settings();
        let gc = if simple_arena {
            let ac = SimpleArenaCollection::new(settings.small_request_threshold);
            MiniMark::with_arena(settings, Arc::clone(&types.table), Box::new(ac))
        } else {
            MiniMark::new(settings, Arc::clone(&types.table))
        };
        Simulation::new(gc.expect("collector"), types)
    }

    #[test]
    fn test_list_workload() {
        let mut sim = create_simulation(false);
        let verified = sim.run(Workload::List, 3).expect("list workload");
        assert_eq!(verified, 3 * LIST_LENGTH);
        assert!(sim.gc().stats().minor_collections > 0);
    }

    #[test]
    fn test_tree_workload() {
        let mut sim = create_simulation(false);
        let verified = sim.run(Workload::Tree, 2).expect("tree workload");
        let tree_size = |depth: u32| (1usize << depth) - 1;
        assert_eq!(
            verified,
            2 * tree_size(TEMP_TREE_DEPTH as u32) + tree_size(LONG_LIVED_TREE_DEPTH as u32)
        );
        assert!(sim.gc().stats().major_collections > 0);
    }

    #[test]
    fn test_weakrefs_workload() {
        let mut sim = create_simulation(true);
        let verified = sim.run(Workload::Weakrefs, 2).expect("weakrefs workload");
        assert_eq!(verified, 2 * WEAK_BATCH / WEAK_KEEP_EVERY);
    }

    #[test]
    fn test_finalizers_workload() {
        let mut sim = create_simulation(false);
        let verified = sim.run(Workload::Finalizers, 2).expect("finalizers workload");
        assert_eq!(verified, 2 * RESOURCE_BATCH);
    }

    #[test]
    fn test_mixed_workload_on_both_arenas() {
        for simple_arena in [false, true] {
            let mut sim = create_simulation(simple_arena);
            sim.run(Workload::Mixed, 1).expect("mixed workload");
            sim.gc
                .collect(&mut sim.roots, Generation::Major)
                .expect("final collection");
            assert_eq!(sim.gc().total_memory_used(), 0, "garbage left behind");
        }
    }
}
