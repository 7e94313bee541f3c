use crate::memory_address::AddressVisitor;
use crate::{MemoryAddress, PAGE_SHIFT, PageSize};
use core::fmt;
use core::ops::{Add, AddAssign};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Physical memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **physical** addresses:
/// the location of a page-table frame, of an individual entry within one, or of
/// a mapped data page. Like [`VirtualAddress`](super::VirtualAddress), this type
/// carries intent and prevents accidental VA↔PA mix-ups.
///
/// ### Notes
/// - Page-table entries and `satp` store a **physical page number** (the
///   address shifted right by 12); use [`PhysicalAddress::ppn`] and
///   [`PhysicalAddress::from_ppn`] to convert.
///
/// ### Examples
/// ```rust
/// # use mmu_addresses::*;
/// let pa = PhysicalAddress::new(0x8020_1042);
/// assert_eq!(pa.ppn(), 0x80201);
/// assert_eq!(pa.align_down(PageSize::Size4K), PhysicalAddress::from_ppn(0x80201));
/// assert_eq!(pa.offset(PageSize::Size4K), 0x42);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(pub(crate) MemoryAddress);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(MemoryAddress::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    /// The address of the 4 KiB frame with page number `ppn`.
    #[inline]
    #[must_use]
    pub const fn from_ppn(ppn: u64) -> Self {
        Self::new(ppn << PAGE_SHIFT)
    }

    /// Physical page number (address without the 12 offset bits).
    #[inline]
    #[must_use]
    pub const fn ppn(self) -> u64 {
        self.as_u64() >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, size: PageSize) -> Self {
        Self(self.0.align_down(size))
    }

    #[inline]
    #[must_use]
    pub const fn offset(self, size: PageSize) -> u64 {
        self.0.offset(size)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, size: PageSize) -> bool {
        self.0.is_aligned(size)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.as_u64())
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<PhysicalAddress> for u64 {
    #[inline]
    fn from(v: PhysicalAddress) -> Self {
        v.as_u64()
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Serialize for PhysicalAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PhysicalAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AddressVisitor).map(Self::new)
    }
}
