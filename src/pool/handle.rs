//! Object handle encoding.

use std::fmt;

/// Mask extracting the slot index from a raw handle value.
const HANDLE_INDEX_MASK: u64 = 0xffff_ffff;

/// Opaque identifier of a live pooled object.
///
/// The low 32 bits carry the slot index within the owning pool; the high
/// 32 bits carry the slot generation at allocation time. The pool kind is
/// validated on lookup rather than encoded into the value, so a handle is
/// meaningless without the pool it came from.
///
/// A handle stays valid exactly as long as the object's reference count is
/// above zero; afterwards lookups fail with `InvalidHandle`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(u64);

impl Handle {
    /// The reserved nil handle. Never returned by an allocation.
    pub const NONE: Handle = Handle(u64::MAX);

    /// Build a handle from a slot index and its generation.
    #[inline]
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Handle(((generation as u64) << 32) | index as u64)
    }

    /// Slot index within the owning pool.
    #[inline]
    pub(crate) fn index(self) -> u32 {
        (self.0 & HANDLE_INDEX_MASK) as u32
    }

    /// Slot generation at the time this handle was issued.
    #[inline]
    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The raw handle value, e.g. for embedding into a wire header.
    #[inline]
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Rebuild a handle from a raw value previously obtained from
    /// [`as_raw`](Self::as_raw). The result is validated on lookup.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Handle::NONE {
            write!(f, "Handle(NONE)")
        } else {
            write!(f, "Handle({}:{})", self.index(), self.generation())
        }
    }
}
