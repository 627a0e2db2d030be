use object::Address;

/// Mutators implement this to expose their roots to the collector.
///
/// Each visitor receives the root slot itself, so a collection can rewrite
/// it in place when the referenced object moves. Null slots may be passed;
/// the collector ignores them.
pub trait RootProvider {
    /// Slots on the mutator's stack(s).
    fn visit_stack_roots(&mut self, visitor: &mut dyn FnMut(&mut Address));

    /// Slots inside static non-GC data that hold GC references.
    fn visit_static_nongc_roots(&mut self, _visitor: &mut dyn FnMut(&mut Address)) {}

    /// Slots of prebuilt GC objects. The write barrier already tracks every
    /// mutated prebuilt object, so this collector never asks for them.
    fn visit_static_gc_roots(&mut self, _visitor: &mut dyn FnMut(&mut Address)) {}
}

/// A simple root provider: a stack of slots plus a table of static slots.
#[derive(Debug, Default, Clone)]
pub struct ShadowStack {
    slots: Vec<Address>,
    statics: Vec<Address>,
}

impl ShadowStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a root and returns its slot index.
    pub fn push(&mut self, obj: Address) -> usize {
        self.slots.push(obj);
        self.slots.len() - 1
    }

    pub fn pop(&mut self) -> Option<Address> {
        self.slots.pop()
    }

    /// Current value of a slot. Re-read after anything that may collect.
    pub fn get(&self, index: usize) -> Address {
        self.slots[index]
    }

    pub fn set(&mut self, index: usize, obj: Address) {
        self.slots[index] = obj;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.slots.truncate(len);
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Adds a static root, i.e. a slot in non-GC memory.
    pub fn push_static(&mut self, obj: Address) -> usize {
        self.statics.push(obj);
        self.statics.len() - 1
    }

    pub fn get_static(&self, index: usize) -> Address {
        self.statics[index]
    }

    pub fn set_static(&mut self, index: usize, obj: Address) {
        self.statics[index] = obj;
    }
}

impl RootProvider for ShadowStack {
    fn visit_stack_roots(&mut self, visitor: &mut dyn FnMut(&mut Address)) {
        self.slots.iter_mut().for_each(visitor);
    }

    fn visit_static_nongc_roots(&mut self, visitor: &mut dyn FnMut(&mut Address)) {
        self.statics.iter_mut().for_each(visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadow_stack_slots() {
        let mut roots = ShadowStack::new();
        let a = roots.push(Address::from_usize(0x10));
        let b = roots.push(Address::from_usize(0x20));
        let s = roots.push_static(Address::from_usize(0x30));

        roots.visit_stack_roots(&mut |slot| *slot = slot.add(1));
        roots.visit_static_nongc_roots(&mut |slot| *slot = slot.add(2));

        assert_eq!(roots.get(a), Address::from_usize(0x11));
        assert_eq!(roots.get(b), Address::from_usize(0x21));
        assert_eq!(roots.get_static(s), Address::from_usize(0x32));
        assert_eq!(roots.pop(), Some(Address::from_usize(0x21)));
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn test_static_gc_roots_default_to_nothing() {
        let mut roots = ShadowStack::new();
        roots.push(Address::from_usize(0x10));
        let mut count = 0;
        roots.visit_static_gc_roots(&mut |_| count += 1);
        assert_eq!(count, 0);
    }
}
