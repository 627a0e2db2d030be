use core::cell::Cell;

use bitflags::bitflags;

use crate::address::{Address, WORD};

/// First flag bit: flags live in the upper half of the header word.
const FIRST_GCFLAG: usize = 1 << (usize::BITS / 2);
const TYPE_ID_MASK: usize = FIRST_GCFLAG - 1;

bitflags! {
    /// Collector flags stored in the upper half of the header word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GcFlags: usize {
        /// The object holds no pointer into the nursery. Young objects never
        /// carry it; the write barrier clears it on old objects.
        const NO_YOUNG_PTRS = FIRST_GCFLAG;
        /// Prebuilt object that was never written to, so it cannot point
        /// into the heap. Implies `NO_YOUNG_PTRS`.
        const NO_HEAP_PTRS = FIRST_GCFLAG << 1;
        /// Transient mark bit of the major collection.
        const VISITED = FIRST_GCFLAG << 2;
        /// Young object with a reserved shadow, or prebuilt object with a
        /// stored identity hash in a trailing word.
        const HAS_SHADOW = FIRST_GCFLAG << 3;
        /// Transient bit of the finalizer ordering pass.
        const FINALIZATION_ORDERING = FIRST_GCFLAG << 4;
        /// Large array with card marker bytes in front of its header.
        const HAS_CARDS = FIRST_GCFLAG << 5;
        /// At least one card of a `HAS_CARDS` array is marked.
        const CARDS_SET = FIRST_GCFLAG << 6;
    }
}

/// Index into the collector's type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(u16);

impl TypeId {
    #[inline(always)]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Header value of a nursery object that was copied out. The word after
/// the header then holds the new address.
pub const FORWARDED_TID: usize = usize::MAX;

/// The one-word header in front of every heap object.
///
/// ```text
/// low half:  type id
/// high half: GcFlags
/// ```
///
/// A header equal to [`FORWARDED_TID`] marks a forwarding stub.
#[repr(transparent)]
pub struct Header {
    tid: Cell<usize>,
}

const _: () = assert!(size_of::<Header>() == WORD);

pub const HEADER_SIZE: usize = size_of::<Header>();

/// Smallest block handed out by the nursery: room for the forwarding stub.
pub const MIN_NURSERY_OBJECT_SIZE: usize = HEADER_SIZE + WORD;

impl Header {
    pub const fn new(type_id: TypeId, flags: GcFlags) -> Self {
        Self {
            tid: Cell::new(type_id.0 as usize | flags.bits()),
        }
    }

    #[inline(always)]
    pub fn type_id(&self) -> TypeId {
        debug_assert!(!self.is_forwarded(), "type id of a forwarding stub");
        TypeId((self.tid.get() & TYPE_ID_MASK) as u16)
    }

    #[inline(always)]
    pub fn raw(&self) -> usize {
        self.tid.get()
    }

    #[inline(always)]
    pub fn set_raw(&self, tid: usize) {
        self.tid.set(tid);
    }

    // ── flags ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn flags(&self) -> GcFlags {
        GcFlags::from_bits_retain(self.tid.get() & !TYPE_ID_MASK)
    }

    /// True if every flag in `flag` is set.
    #[inline(always)]
    pub fn has_flag(&self, flag: GcFlags) -> bool {
        self.tid.get() & flag.bits() == flag.bits()
    }

    /// True if at least one flag in `flags` is set.
    #[inline(always)]
    pub fn has_any(&self, flags: GcFlags) -> bool {
        self.tid.get() & flags.bits() != 0
    }

    #[inline(always)]
    pub fn add_flag(&self, flag: GcFlags) {
        self.tid.set(self.tid.get() | flag.bits());
    }

    #[inline(always)]
    pub fn remove_flag(&self, flag: GcFlags) {
        self.tid.set(self.tid.get() & !flag.bits());
    }

    // ── forwarding ─────────────────────────────────────────────────

    #[inline(always)]
    pub fn is_forwarded(&self) -> bool {
        self.tid.get() == FORWARDED_TID
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_forwarded() {
            return f.write_str("Header(forwarded)");
        }
        f.debug_struct("Header")
            .field("type_id", &self.type_id())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Header of the object at `obj`.
///
/// # Safety
/// `obj` must be an object address, i.e. be preceded by a header.
#[inline(always)]
pub unsafe fn header_of<'a>(obj: Address) -> &'a Header {
    // SAFETY: guaranteed by the caller
    unsafe { &*obj.sub(HEADER_SIZE).as_ptr::<Header>() }
}

/// Writes a fresh header at `hdr` (the start of the allocated block).
///
/// # Safety
/// `hdr` must be writable for one word.
#[inline(always)]
pub unsafe fn init_header(hdr: Address, type_id: TypeId, flags: GcFlags) {
    // SAFETY: guaranteed by the caller
    unsafe { hdr.store(Header::new(type_id, flags)) }
}

/// Turns `obj` into a forwarding stub pointing at `new_obj`.
///
/// # Safety
/// `obj` must be a nursery object of at least [`MIN_NURSERY_OBJECT_SIZE`].
#[inline(always)]
pub unsafe fn set_forwarded(obj: Address, new_obj: Address) {
    // SAFETY: guaranteed by the caller
    unsafe {
        header_of(obj).set_raw(FORWARDED_TID);
        obj.store_address(new_obj);
    }
}

/// # Safety
/// `obj` must be a forwarding stub.
#[inline(always)]
pub unsafe fn forwarding_address(obj: Address) -> Address {
    // SAFETY: guaranteed by the caller
    unsafe {
        debug_assert!(header_of(obj).is_forwarded());
        obj.load_address()
    }
}
