use core::fmt;

/// Size of a machine word in bytes.
pub const WORD: usize = size_of::<usize>();

/// Rounds `size` up to the next multiple of [`WORD`].
#[inline(always)]
pub const fn round_up_to_word(size: usize) -> usize {
    align_up(size, WORD)
}

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// A raw address inside (or outside) the managed heap.
///
/// Object references point just past the object's header, so the header of
/// `obj` lives at `obj - HEADER_SIZE`. The null address is never a valid
/// object.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

const _: () = assert!(size_of::<Address>() == WORD);

impl Address {
    pub const NULL: Self = Self(0);

    #[inline(always)]
    pub const fn from_usize(raw: usize) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    #[inline(always)]
    pub const fn sub(self, bytes: usize) -> Self {
        Self(self.0 - bytes)
    }

    /// Distance in bytes from `base` up to `self`.
    #[inline(always)]
    pub const fn offset_from(self, base: Self) -> usize {
        debug_assert!(self.0 >= base.0);
        self.0 - base.0
    }

    #[inline(always)]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// # Safety
    /// `self` must be valid for reads of `T` and suitably aligned.
    #[inline(always)]
    pub unsafe fn load<T: Copy>(self) -> T {
        // SAFETY: guaranteed by the caller
        unsafe { self.as_ptr::<T>().read() }
    }

    /// # Safety
    /// `self` must be valid for writes of `T` and suitably aligned.
    #[inline(always)]
    pub unsafe fn store<T>(self, value: T) {
        // SAFETY: guaranteed by the caller
        unsafe { self.as_ptr::<T>().write(value) }
    }

    /// # Safety
    /// `self` must point to a readable word.
    #[inline(always)]
    pub unsafe fn load_address(self) -> Address {
        // SAFETY: guaranteed by the caller
        unsafe { self.load::<Address>() }
    }

    /// # Safety
    /// `self` must point to a writable word.
    #[inline(always)]
    pub unsafe fn store_address(self, value: Address) {
        // SAFETY: guaranteed by the caller
        unsafe { self.store(value) }
    }

    /// Reinterprets the word at `self` as a mutable reference slot.
    ///
    /// # Safety
    /// `self` must point to a word that is not aliased for `'a`.
    #[inline(always)]
    pub unsafe fn as_slot<'a>(self) -> &'a mut Address {
        // SAFETY: guaranteed by the caller
        unsafe { &mut *self.as_ptr::<Address>() }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
