//! `id()` and identity hashes that survive the move out of the nursery.
//!
//! A young object asked for its identity gets a block reserved outside the
//! nursery right away (its *shadow*). The shadow address is the identity, and
//! the next minor collection copies the object into exactly that block.

use object::{Address, GcFlags, HEADER_SIZE, round_up_to_word};

use crate::{
    error::fatal_error,
    minimark::{MiniMark, header},
};

impl MiniMark {
    /// A unique integer for `obj`, stable for its whole lifetime.
    pub fn id(&mut self, obj: Address) -> usize {
        self.id_or_identity_hash(obj, false)
    }

    /// Like [`Self::id`], except that prebuilt objects created with a hash
    /// return that hash.
    pub fn identity_hash(&mut self, obj: Address) -> usize {
        self.id_or_identity_hash(obj, true)
    }

    fn id_or_identity_hash(&mut self, obj: Address, use_prebuilt_hash: bool) -> usize {
        if obj.is_null() {
            return 0;
        }
        let hdr = header(obj);
        if self.is_in_nursery(obj) {
            return self.young_object_shadow(obj).as_usize();
        }
        // outside the nursery HAS_SHADOW marks a prebuilt object with a
        // trailing hash word
        if use_prebuilt_hash && hdr.has_flag(GcFlags::HAS_SHADOW) {
            let body = round_up_to_word(self.get_size(obj));
            // SAFETY: prebuilt_object reserved the word after the body
            return unsafe { obj.add(body).load::<usize>() };
        }
        obj.as_usize()
    }

    /// Returns the shadow of a young object, reserving it on first use.
    fn young_object_shadow(&mut self, obj: Address) -> Address {
        let hdr = header(obj);
        if hdr.has_flag(GcFlags::HAS_SHADOW) {
            return match self.young_objects_shadows.get(&obj) {
                Some(&shadow) => shadow,
                None => fatal_error("HAS_SHADOW object without a shadow"),
            };
        }

        let totalsize = round_up_to_word(HEADER_SIZE + self.get_size(obj));
        let shadowhdr = match self.ac.malloc(totalsize) {
            Ok(block) => block,
            Err(err) => fatal_error(&format!("cannot reserve a shadow: {err}")),
        };
        // if the object dies young, the next major collection frees this
        // SAFETY: the arena block is at least one word long
        unsafe { shadowhdr.store(0usize) };
        let shadow = shadowhdr.add(HEADER_SIZE);
        hdr.add_flag(GcFlags::HAS_SHADOW);
        self.young_objects_shadows.insert(obj, shadow);
        shadow
    }
}
