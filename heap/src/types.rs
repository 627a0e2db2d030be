//! Per-type layout descriptors consumed by the collector.
//!
//! The table is built once, frozen, and shared read-only with the collector.
//! Object layout, relative to the object address (just past the header):
//!
//! ```text
//! [ fixed part: fixed_size bytes ][ item 0 ][ item 1 ] ...
//! ```
//!
//! Varsize objects store their length as a word inside the fixed part.

use std::{fmt, sync::Arc};

use object::{Address, HEADER_SIZE, TypeId, WORD, header_of, round_up_to_word};

use crate::{
    error::{GcError, GcResult},
    minimark::MiniMark,
    roots::RootProvider,
};

/// Called once for an unreachable object whose type has a finalizer. The
/// object stays valid for the duration of the call.
pub type FinalizerFn =
    fn(gc: &mut MiniMark, roots: &mut dyn RootProvider, obj: Address);

/// Layout of the variable part of an array-like type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarsizeInfo {
    pub item_size: usize,
    /// Offset of the length word inside the fixed part.
    pub offset_to_length: usize,
    /// Offsets of GC pointers inside one item.
    pub offsets_in_item: Vec<usize>,
}

#[derive(Clone)]
pub struct TypeInfo {
    pub name: String,
    pub fixed_size: usize,
    pub gc_pointer_offsets: Vec<usize>,
    pub varsize: Option<VarsizeInfo>,
    /// Offset of the single weak pointer of a weakref-carrying type. The
    /// slot is not traced.
    pub weakptr_offset: Option<usize>,
    pub finalizer: Option<FinalizerFn>,
}

impl TypeInfo {
    pub fn fixed(name: impl Into<String>, fixed_size: usize) -> Self {
        Self {
            name: name.into(),
            fixed_size,
            gc_pointer_offsets: Vec::new(),
            varsize: None,
            weakptr_offset: None,
            finalizer: None,
        }
    }

    pub fn varsize(
        name: impl Into<String>,
        fixed_size: usize,
        item_size: usize,
        offset_to_length: usize,
    ) -> Self {
        Self {
            varsize: Some(VarsizeInfo {
                item_size,
                offset_to_length,
                offsets_in_item: Vec::new(),
            }),
            ..Self::fixed(name, fixed_size)
        }
    }

    pub fn with_gc_pointers(mut self, offsets: &[usize]) -> Self {
        self.gc_pointer_offsets.extend_from_slice(offsets);
        self
    }

    /// GC pointer offsets inside each item. Only meaningful for varsize types.
    pub fn with_item_gc_pointers(mut self, offsets: &[usize]) -> Self {
        if let Some(varsize) = self.varsize.as_mut() {
            varsize.offsets_in_item.extend_from_slice(offsets);
        }
        self
    }

    pub fn with_weakptr(mut self, offset: usize) -> Self {
        self.weakptr_offset = Some(offset);
        self
    }

    pub fn with_finalizer(mut self, finalizer: FinalizerFn) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    fn check(&self) -> Result<(), &'static str> {
        let word_slot_fits = |offset: usize, limit: usize| {
            offset.is_multiple_of(WORD) && offset + WORD <= limit
        };
        if !self
            .gc_pointer_offsets
            .iter()
            .all(|&offset| word_slot_fits(offset, self.fixed_size))
        {
            return Err("GC pointer offset misaligned or outside the fixed part");
        }
        if let Some(weak) = self.weakptr_offset {
            if !word_slot_fits(weak, self.fixed_size) {
                return Err("weak pointer offset misaligned or outside the fixed part");
            }
            if self.gc_pointer_offsets.contains(&weak) {
                return Err("weak pointer overlaps a traced GC pointer");
            }
            if self.finalizer.is_some() {
                return Err("a type cannot have both a finalizer and a weak pointer");
            }
        }
        if let Some(varsize) = &self.varsize {
            if self.finalizer.is_some() {
                return Err("varsize types cannot have a finalizer");
            }
            if self.weakptr_offset.is_some() {
                return Err("varsize types cannot hold a weak pointer");
            }
            if !word_slot_fits(varsize.offset_to_length, self.fixed_size) {
                return Err("length offset misaligned or outside the fixed part");
            }
            if self.gc_pointer_offsets.contains(&varsize.offset_to_length) {
                return Err("length word overlaps a GC pointer");
            }
            if !varsize.offsets_in_item.is_empty() {
                if !self.fixed_size.is_multiple_of(WORD)
                    || !varsize.item_size.is_multiple_of(WORD)
                {
                    return Err("items holding GC pointers must be word aligned");
                }
                if !varsize
                    .offsets_in_item
                    .iter()
                    .all(|&offset| word_slot_fits(offset, varsize.item_size))
                {
                    return Err("item GC pointer offset misaligned or outside the item");
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("name", &self.name)
            .field("fixed_size", &self.fixed_size)
            .field("gc_pointer_offsets", &self.gc_pointer_offsets)
            .field("varsize", &self.varsize)
            .field("weakptr_offset", &self.weakptr_offset)
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}

/// Collects type descriptors before the collector exists.
#[derive(Debug, Default)]
pub struct TypeTableBuilder {
    infos: Vec<TypeInfo>,
}

impl TypeTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, info: TypeInfo) -> GcResult<TypeId> {
        let index = u16::try_from(self.infos.len()).map_err(|_| {
            GcError::InvalidType {
                name: info.name.clone(),
                reason: "too many types",
            }
        })?;
        info.check().map_err(|reason| GcError::InvalidType {
            name: info.name.clone(),
            reason,
        })?;
        self.infos.push(info);
        Ok(TypeId::new(index))
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Freezes the table. No type can be added afterwards.
    pub fn build(self) -> Arc<TypeTable> {
        Arc::new(TypeTable {
            infos: self.infos.into_boxed_slice(),
        })
    }
}

/// Immutable table of type descriptors, indexed by [`TypeId`].
#[derive(Debug)]
pub struct TypeTable {
    infos: Box<[TypeInfo]>,
}

impl TypeTable {
    #[inline(always)]
    pub fn get(&self, type_id: TypeId) -> &TypeInfo {
        &self.infos[type_id.index()]
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn is_varsize(&self, type_id: TypeId) -> bool {
        self.get(type_id).varsize.is_some()
    }

    pub fn fixed_size(&self, type_id: TypeId) -> usize {
        self.get(type_id).fixed_size
    }

    pub fn offsets_to_gc_pointers(&self, type_id: TypeId) -> &[usize] {
        &self.get(type_id).gc_pointer_offsets
    }

    pub fn varsize_item_size(&self, type_id: TypeId) -> usize {
        self.get(type_id).varsize.as_ref().map_or(0, |v| v.item_size)
    }

    pub fn varsize_offset_to_length(&self, type_id: TypeId) -> usize {
        self.get(type_id)
            .varsize
            .as_ref()
            .map_or(0, |v| v.offset_to_length)
    }

    pub fn varsize_offsets_to_gcpointers_in_var_part(
        &self,
        type_id: TypeId,
    ) -> &[usize] {
        self.get(type_id)
            .varsize
            .as_ref()
            .map(|v| v.offsets_in_item.as_slice())
            .unwrap_or(&[])
    }

    pub fn weakpointer_offset(&self, type_id: TypeId) -> Option<usize> {
        self.get(type_id).weakptr_offset
    }

    pub fn finalizer(&self, type_id: TypeId) -> Option<FinalizerFn> {
        self.get(type_id).finalizer
    }

    /// True for array types whose items hold GC pointers.
    pub fn has_gcptr_in_varsize(&self, type_id: TypeId) -> bool {
        self.get(type_id)
            .varsize
            .as_ref()
            .is_some_and(|v| !v.offsets_in_item.is_empty())
    }

    /// Weakref objects are always allocated young, so they must fit the
    /// nursery's small requests.
    pub fn check_weakref_sizes(&self, small_request_threshold: usize) -> GcResult<()> {
        for info in self.infos.iter() {
            if info.weakptr_offset.is_none() {
                continue;
            }
            if round_up_to_word(HEADER_SIZE + info.fixed_size) > small_request_threshold {
                return Err(GcError::InvalidType {
                    name: info.name.clone(),
                    reason: "weakref types must be small objects",
                });
            }
        }
        Ok(())
    }

    /// Size in bytes of an instance with `length` items, header excluded.
    pub fn instance_size(
        &self,
        type_id: TypeId,
        length: usize,
    ) -> GcResult<usize> {
        let info = self.get(type_id);
        match &info.varsize {
            None => Ok(info.fixed_size),
            Some(varsize) => varsize
                .item_size
                .checked_mul(length)
                .and_then(|items| items.checked_add(info.fixed_size))
                .ok_or(GcError::SizeOverflow {
                    length,
                    item_size: varsize.item_size,
                }),
        }
    }

    /// Size of `obj` in bytes, header excluded.
    ///
    /// # Safety
    /// `obj` must be a live object (not a forwarding stub).
    pub unsafe fn object_size(&self, obj: Address) -> usize {
        // SAFETY: guaranteed by the caller
        let info = self.get(unsafe { header_of(obj) }.type_id());
        match &info.varsize {
            None => info.fixed_size,
            Some(varsize) => {
                // SAFETY: the length word lies inside the fixed part
                let length: usize =
                    unsafe { obj.add(varsize.offset_to_length).load() };
                info.fixed_size + varsize.item_size * length
            }
        }
    }

    /// Calls `visitor` with every non-null GC pointer slot of `obj`. The weak
    /// pointer slot is skipped.
    ///
    /// # Safety
    /// `obj` must be a live object (not a forwarding stub).
    pub unsafe fn trace(
        &self,
        obj: Address,
        visitor: &mut dyn FnMut(&mut Address),
    ) {
        // SAFETY: guaranteed by the caller
        let info = self.get(unsafe { header_of(obj) }.type_id());
        for &offset in &info.gc_pointer_offsets {
            // SAFETY: offsets were checked against the fixed size
            let slot = unsafe { obj.add(offset).as_slot() };
            if !slot.is_null() {
                visitor(slot);
            }
        }
        if info.varsize.is_some() {
            // SAFETY: guaranteed by the caller
            unsafe { self.trace_items(obj, 0, usize::MAX, visitor) };
        }
    }

    /// Like [`Self::trace`], restricted to the pointers of the items in
    /// `start..stop` of an array. `stop` is capped at the array length.
    ///
    /// # Safety
    /// `obj` must be a live array object.
    pub unsafe fn trace_items(
        &self,
        obj: Address,
        start: usize,
        stop: usize,
        visitor: &mut dyn FnMut(&mut Address),
    ) {
        // SAFETY: guaranteed by the caller
        let info = self.get(unsafe { header_of(obj) }.type_id());
        let Some(varsize) = &info.varsize else {
            return;
        };
        if varsize.offsets_in_item.is_empty() {
            return;
        }
        // SAFETY: the length word lies inside the fixed part
        let length: usize = unsafe { obj.add(varsize.offset_to_length).load() };
        let stop = stop.min(length);
        let mut item = obj.add(info.fixed_size + start * varsize.item_size);
        for _ in start..stop {
            for &offset in &varsize.offsets_in_item {
                // SAFETY: offsets were checked against the item size
                let slot = unsafe { item.add(offset).as_slot() };
                if !slot.is_null() {
                    visitor(slot);
                }
            }
            item = item.add(varsize.item_size);
        }
    }
}
