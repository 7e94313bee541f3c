use crate::memory_address::AddressVisitor;
use crate::{MemoryAddress, PageSize, PagingMode};
use core::fmt;
use core::ops::{Add, AddAssign};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Virtual memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **virtual** addresses.
/// Only the low [`PagingMode::va_bits`] bits take part in translation; the
/// generator never sign-extends, so a valid test-case VA is always below
/// [`PagingMode::va_limit`].
///
/// ### Examples
/// ```rust
/// # use mmu_addresses::*;
/// let mode = PagingMode::Sv32;
/// let va = VirtualAddress::new(0x0040_3000);
/// assert_eq!(va.vpn(mode, 1), 1);
/// assert_eq!(va.vpn(mode, 0), 3);
/// assert_eq!(va.with_vpn(mode, 1, 2).as_u64(), 0x0080_3000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(pub(crate) MemoryAddress);

impl VirtualAddress {
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

    /// `VPN[level]`, the index into the table at `level`.
    #[inline]
    #[must_use]
    pub const fn vpn(self, mode: PagingMode, level: u8) -> u64 {
        mode.vpn(self.as_u64(), level)
    }

    /// This address with `VPN[level]` replaced by `index`.
    #[inline]
    #[must_use]
    pub const fn with_vpn(self, mode: PagingMode, level: u8, index: u64) -> Self {
        Self::new(mode.with_vpn(self.as_u64(), level, index))
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

    /// Returns `true` if the address is translatable in `mode`.
    #[inline]
    #[must_use]
    pub const fn fits(self, mode: PagingMode) -> bool {
        self.as_u64() < mode.va_limit()
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

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.as_u64())
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<VirtualAddress> for u64 {
    #[inline]
    fn from(v: VirtualAddress) -> Self {
        v.as_u64()
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Serialize for VirtualAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VirtualAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AddressVisitor).map(Self::new)
    }
}
