//! Card marking for large arrays.
//!
//! An array allocated outside the nursery whose items hold GC pointers gets
//! one marker bit per `card_page_indices` items. The bits live in whole words
//! in front of the header, byte 0 right before it:
//!
//! ```text
//! [ ... card byte 1 ][ card byte 0 ][ header ][ fixed part ][ items ... ]
//! ```
//!
//! Storing a young pointer into such an array only marks the card of the
//! item, so the next minor collection scans the marked cards instead of the
//! whole array.

use log::trace;
use object::{Address, GcFlags, HEADER_SIZE};

use crate::{
    minimark::{MiniMark, header},
    types::TypeTable,
};

impl MiniMark {
    /// Words of card bits in front of an array of `length` items.
    pub(crate) fn card_marking_words_for_length(&self, length: usize) -> usize {
        length.div_ceil(usize::BITS as usize * self.settings.card_page_indices)
    }

    pub(crate) fn card_marking_bytes_for_length(&self, length: usize) -> usize {
        length.div_ceil(8 * self.settings.card_page_indices)
    }

    fn array_length(&self, obj: Address) -> usize {
        let offset = self.types.varsize_offset_to_length(header(obj).type_id());
        // SAFETY: obj is a live array, its length word is in the fixed part
        unsafe { obj.add(offset).load() }
    }

    #[inline(always)]
    fn card_address(obj: Address, byte_index: usize) -> Address {
        obj.sub(HEADER_SIZE + 1 + byte_index)
    }

    /// Card marker byte `byte_index` of an array with `HAS_CARDS`. Bit `n`
    /// covers items `(8 * byte_index + n) * card_page_indices` onwards.
    pub fn card_byte(&self, obj: Address, byte_index: usize) -> u8 {
        assert!(header(obj).has_flag(GcFlags::HAS_CARDS), "{obj:?} has no cards");
        assert!(byte_index < self.card_marking_bytes_for_length(self.array_length(obj)));
        // SAFETY: the byte lies inside the card area of obj
        unsafe { Self::card_address(obj, byte_index).load() }
    }

    /// Write barrier for storing `new_value` into item `index` of
    /// `addr_array`. Behaves like [`Self::write_barrier`], except that
    /// arrays with cards only get the card of `index` marked.
    #[inline(always)]
    pub fn write_barrier_from_array(
        &mut self,
        new_value: Address,
        addr_array: Address,
        index: usize,
    ) {
        if header(addr_array).has_flag(GcFlags::NO_YOUNG_PTRS) {
            self.remember_young_pointer_from_array(addr_array, index, new_value);
        }
    }

    #[cold]
    #[inline(never)]
    fn remember_young_pointer_from_array(
        &mut self,
        addr_array: Address,
        index: usize,
        new_value: Address,
    ) {
        let hdr = header(addr_array);
        if !hdr.has_flag(GcFlags::HAS_CARDS) {
            self.write_barrier(new_value, addr_array);
            return;
        }
        if !self.is_in_nursery(new_value) {
            return;
        }
        let card = index >> self.settings.card_page_indices.trailing_zeros();
        let addr_byte = Self::card_address(addr_array, card >> 3);
        let bitmask = 1u8 << (card & 7);
        // SAFETY: index is an item of the array, so the byte is in its card area
        unsafe {
            let byte: u8 = addr_byte.load();
            if byte & bitmask != 0 {
                return;
            }
            addr_byte.store(byte | bitmask);
        }
        if !hdr.has_flag(GcFlags::CARDS_SET) {
            trace!(target: "gc", "cards set on {addr_array:?}");
            hdr.add_flag(GcFlags::CARDS_SET);
            self.old_objects_with_cards_set.push(addr_array);
        }
    }

    /// ORs the card bits covering the first `length` items of `source`
    /// into `dest`. Both arrays have cards.
    pub(crate) fn manually_copy_card_bits(
        &mut self,
        source: Address,
        dest: Address,
        length: usize,
    ) {
        for i in 0..self.card_marking_bytes_for_length(length) {
            // SAFETY: both arrays hold at least `length` items
            unsafe {
                let byte: u8 = Self::card_address(source, i).load();
                let dest_byte = Self::card_address(dest, i);
                dest_byte.store(dest_byte.load::<u8>() | byte);
            }
        }
        let dest_hdr = header(dest);
        if !dest_hdr.has_flag(GcFlags::CARDS_SET) {
            dest_hdr.add_flag(GcFlags::CARDS_SET);
            self.old_objects_with_cards_set.push(dest);
        }
    }

    /// Drags the young objects referenced from marked cards out of the
    /// nursery and clears every card. Arrays that lost `NO_YOUNG_PTRS` are
    /// in the remembered set and get traced whole afterwards.
    pub(crate) fn collect_cardrefs_to_nursery(&mut self, types: &TypeTable) {
        let card_page_indices = self.settings.card_page_indices;
        while let Some(obj) = self.old_objects_with_cards_set.pop() {
            let hdr = header(obj);
            debug_assert!(hdr.has_flag(GcFlags::CARDS_SET));
            hdr.remove_flag(GcFlags::CARDS_SET);
            let length = self.array_length(obj);
            let bytes = self.card_marking_bytes_for_length(length);
            let scan = hdr.has_flag(GcFlags::NO_YOUNG_PTRS);

            let mut interval_start = 0;
            for i in 0..bytes {
                let addr_byte = Self::card_address(obj, i);
                // SAFETY: the byte lies inside the card area of obj
                let mut cardbyte: u8 = unsafe { addr_byte.load() };
                // SAFETY: see above
                unsafe { addr_byte.store(0u8) };
                let next_byte_start = interval_start + 8 * card_page_indices;
                while scan && cardbyte != 0 {
                    let interval_stop = interval_start + card_page_indices;
                    if cardbyte & 1 != 0 {
                        // SAFETY: obj is a live old array
                        unsafe {
                            types.trace_items(obj, interval_start, interval_stop, &mut |slot| {
                                self.trace_drag_out(types, slot)
                            })
                        };
                    }
                    interval_start = interval_stop;
                    cardbyte >>= 1;
                }
                interval_start = next_byte_start;
            }
        }
    }
}
