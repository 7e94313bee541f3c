//! # RISC-V Paging Modes
//!
//! | Mode | Levels | VPN bits | VA bits | PA bits | PTE bytes | Leaf PPN widths | `satp.MODE` |
//! |------|--------|----------|---------|---------|-----------|-----------------|-------------|
//! | Sv32 | 2 | 10 | 32 | 34 | 4 | 10, 12 | 1 |
//! | Sv39 | 3 | 9 | 39 | 56 | 8 | 9, 9, 26 | 8 |
//! | Sv48 | 4 | 9 | 48 | 56 | 8 | 9, 9, 9, 17 | 9 |
//! | Sv57 | 5 | 9 | 57 | 56 | 8 | 9, 9, 9, 9, 8 | 10 |
//!
//! Levels follow the privileged spec: level `levels() - 1` is the root table,
//! level 0 the deepest one.

use crate::{PAGE_SHIFT, PageSize, low_mask};
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A RISC-V virtual-memory translation scheme.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PagingMode {
    /// Two-level, 32-bit scheme.
    Sv32,
    /// Three-level, 39-bit virtual addresses.
    Sv39,
    /// Four-level, 48-bit virtual addresses.
    Sv48,
    /// Five-level, 57-bit virtual addresses.
    Sv57,
}

const SV32_PPN_WIDTHS: [u32; 2] = [10, 12];
const SV39_PPN_WIDTHS: [u32; 3] = [9, 9, 26];
const SV48_PPN_WIDTHS: [u32; 4] = [9, 9, 9, 17];
const SV57_PPN_WIDTHS: [u32; 5] = [9, 9, 9, 9, 8];

const SV32_PAGE_SIZES: [PageSize; 2] = [PageSize::Size4K, PageSize::Size4M];
const SV39_PAGE_SIZES: [PageSize; 3] = [PageSize::Size4K, PageSize::Size2M, PageSize::Size1G];
const SV48_PAGE_SIZES: [PageSize; 4] = [
    PageSize::Size4K,
    PageSize::Size2M,
    PageSize::Size1G,
    PageSize::Size512G,
];
const SV57_PAGE_SIZES: [PageSize; 5] = [
    PageSize::Size4K,
    PageSize::Size2M,
    PageSize::Size1G,
    PageSize::Size512G,
    PageSize::Size256T,
];

impl PagingMode {
    pub const ALL: [Self; 4] = [Self::Sv32, Self::Sv39, Self::Sv48, Self::Sv57];

    /// Number of page-table levels.
    #[inline]
    #[must_use]
    pub const fn levels(self) -> u8 {
        match self {
            Self::Sv32 => 2,
            Self::Sv39 => 3,
            Self::Sv48 => 4,
            Self::Sv57 => 5,
        }
    }

    /// Level number of the root table.
    #[inline]
    #[must_use]
    pub const fn root_level(self) -> u8 {
        self.levels() - 1
    }

    /// Width of one VPN field (the index into a table).
    #[inline]
    #[must_use]
    pub const fn vpn_bits(self) -> u32 {
        match self {
            Self::Sv32 => 10,
            _ => 9,
        }
    }

    #[inline]
    #[must_use]
    pub const fn va_bits(self) -> u32 {
        match self {
            Self::Sv32 => 32,
            Self::Sv39 => 39,
            Self::Sv48 => 48,
            Self::Sv57 => 57,
        }
    }

    #[inline]
    #[must_use]
    pub const fn pa_bits(self) -> u32 {
        match self {
            Self::Sv32 => 34,
            _ => 56,
        }
    }

    /// Exclusive upper bound of the virtual address space.
    #[inline]
    #[must_use]
    pub const fn va_limit(self) -> u64 {
        1 << self.va_bits()
    }

    /// Exclusive upper bound of the physical address space.
    #[inline]
    #[must_use]
    pub const fn pa_limit(self) -> u64 {
        1 << self.pa_bits()
    }

    /// Size of one page-table entry in bytes.
    #[inline]
    #[must_use]
    pub const fn pte_bytes(self) -> u64 {
        match self {
            Self::Sv32 => 4,
            _ => 8,
        }
    }

    /// Entries in one 4 KiB table.
    #[inline]
    #[must_use]
    pub const fn entries_per_table(self) -> u64 {
        1 << self.vpn_bits()
    }

    /// Widths of the leaf PPN sub-fields, `PPN[0]` first.
    #[inline]
    #[must_use]
    pub const fn ppn_widths(self) -> &'static [u32] {
        match self {
            Self::Sv32 => &SV32_PPN_WIDTHS,
            Self::Sv39 => &SV39_PPN_WIDTHS,
            Self::Sv48 => &SV48_PPN_WIDTHS,
            Self::Sv57 => &SV57_PPN_WIDTHS,
        }
    }

    /// Total PPN width (22 bits in `Sv32`, 44 bits otherwise).
    #[must_use]
    pub const fn ppn_bits(self) -> u32 {
        match self {
            Self::Sv32 => 22,
            _ => 44,
        }
    }

    /// Bit offset of `PPN[field]` within a page number.
    #[must_use]
    pub fn ppn_field_shift(self, field: usize) -> u32 {
        self.ppn_widths().iter().take(field).sum()
    }

    /// Extract `PPN[field]` from a full page number.
    #[must_use]
    pub fn ppn_field(self, ppn: u64, field: usize) -> u64 {
        match self.ppn_widths().get(field) {
            Some(&width) => (ppn >> self.ppn_field_shift(field)) & low_mask(width),
            None => 0,
        }
    }

    /// Replace `PPN[field]` in a full page number; excess value bits are dropped.
    #[must_use]
    pub fn with_ppn_field(self, ppn: u64, field: usize, value: u64) -> u64 {
        let Some(&width) = self.ppn_widths().get(field) else {
            return ppn;
        };
        let shift = self.ppn_field_shift(field);
        let mask = low_mask(width) << shift;
        (ppn & !mask) | ((value << shift) & mask)
    }

    /// The value written to `satp.MODE` to enable this scheme.
    #[inline]
    #[must_use]
    pub const fn satp_mode(self) -> u8 {
        match self {
            Self::Sv32 => 1,
            Self::Sv39 => 8,
            Self::Sv48 => 9,
            Self::Sv57 => 10,
        }
    }

    /// Page sizes a leaf can map, indexed by level (level 0 first).
    #[must_use]
    pub const fn page_sizes(self) -> &'static [PageSize] {
        match self {
            Self::Sv32 => &SV32_PAGE_SIZES,
            Self::Sv39 => &SV39_PAGE_SIZES,
            Self::Sv48 => &SV48_PAGE_SIZES,
            Self::Sv57 => &SV57_PAGE_SIZES,
        }
    }

    /// The level whose leaf maps `size`, or `None` if this mode lacks it.
    #[must_use]
    pub fn leaf_level(self, size: PageSize) -> Option<u8> {
        self.page_sizes()
            .iter()
            .position(|&s| s == size)
            .and_then(|level| u8::try_from(level).ok())
    }

    /// The page size mapped by a leaf at `level`.
    #[must_use]
    pub fn page_size_at(self, level: u8) -> Option<PageSize> {
        self.page_sizes().get(usize::from(level)).copied()
    }

    /// Number of entries in a walk that ends with a leaf of `size`.
    #[must_use]
    pub fn walk_len(self, size: PageSize) -> Option<usize> {
        self.leaf_level(size)
            .map(|level| usize::from(self.levels() - level))
    }

    /// Bit position of `VPN[level]` in a virtual address.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn vpn_shift(self, level: u8) -> u32 {
        PAGE_SHIFT + self.vpn_bits() * level as u32
    }

    /// `VPN[level]` of a raw virtual address.
    #[inline]
    #[must_use]
    pub const fn vpn(self, va: u64, level: u8) -> u64 {
        (va >> self.vpn_shift(level)) & low_mask(self.vpn_bits())
    }

    /// Replace `VPN[level]` of a raw virtual address.
    #[inline]
    #[must_use]
    pub const fn with_vpn(self, va: u64, level: u8, index: u64) -> u64 {
        let shift = self.vpn_shift(level);
        let mask = low_mask(self.vpn_bits()) << shift;
        (va & !mask) | ((index << shift) & mask)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sv32 => "Sv32",
            Self::Sv39 => "Sv39",
            Self::Sv48 => "Sv48",
            Self::Sv57 => "Sv57",
        }
    }

    /// Look a mode up by its virtual-address width (32, 39, 48, 57).
    #[must_use]
    pub fn from_va_bits(bits: u64) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| u64::from(mode.va_bits()) == bits)
    }
}

impl fmt::Display for PagingMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a paging mode name is not recognized.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized paging mode")]
pub struct ParsePagingModeError;

impl FromStr for PagingMode {
    type Err = ParsePagingModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s
            .strip_prefix("Sv")
            .or_else(|| s.strip_prefix("sv"))
            .or_else(|| s.strip_prefix("SV"))
            .unwrap_or(s);
        digits
            .parse::<u64>()
            .ok()
            .and_then(Self::from_va_bits)
            .ok_or(ParsePagingModeError)
    }
}

impl Serialize for PagingMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PagingMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ModeVisitor;

        impl serde::de::Visitor<'_> for ModeVisitor {
            type Value = PagingMode;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a paging mode such as 39 or \"Sv39\"")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<PagingMode, E> {
                PagingMode::from_va_bits(v)
                    .ok_or_else(|| E::invalid_value(serde::de::Unexpected::Unsigned(v), &self))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<PagingMode, E> {
                u64::try_from(v)
                    .ok()
                    .and_then(PagingMode::from_va_bits)
                    .ok_or_else(|| E::invalid_value(serde::de::Unexpected::Signed(v), &self))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<PagingMode, E> {
                v.parse()
                    .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_any(ModeVisitor)
    }
}
