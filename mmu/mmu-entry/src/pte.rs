use crate::Flag;
use bitfield_struct::bitfield;
use core::fmt::{self, Write};
use mmu_addresses::{PagingMode, PhysicalAddress, low_mask};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single RISC-V page-table entry in its raw bitfield form.
///
/// This structure models the **64-bit superset** used by `Sv39`, `Sv48` and
/// `Sv57`. `Sv32` entries are four bytes wide and use the low 32 bits only;
/// their 22-bit PPN occupies bits 10–31, which lines up with the low part of
/// the 44-bit PPN field here. Accessors that depend on the PPN width take the
/// [`PagingMode`].
///
/// ### Overview
/// A valid entry either:
/// - points to a **next-level table** when `R = W = X = 0`, or
/// - is a **leaf** mapping a page (or a superpage above level 0) otherwise.
///
/// ### Bit layout
///
/// | Bits   | Name    | Meaning |
/// |--------|---------|---------|
/// | 0      | `V`     | Valid |
/// | 1      | `R`     | Readable |
/// | 2      | `W`     | Writable |
/// | 3      | `X`     | Executable |
/// | 4      | `U`     | User-mode accessible |
/// | 5      | `G`     | Global mapping |
/// | 6      | `A`     | Accessed |
/// | 7      | `D`     | Dirty |
/// | 8–9    | `RSW`   | Reserved for supervisor software |
/// | 10–53  | `PPN`   | Physical page number (`PPN[0]` lowest) |
/// | 54–60  | -       | Reserved, must be zero |
/// | 61–62  | `PBMT`  | Page-based memory types (`Svpbmt`) |
/// | 63     | `N`     | NAPOT translation contiguity (`Svnapot`) |
///
/// ### Example
/// ```rust
/// # use mmu_entry::{Flag, PteBits};
/// # use mmu_addresses::PagingMode;
/// let mode = PagingMode::Sv39;
/// let pte = PteBits::pointer(mode, 0x80201);
/// assert!(pte.is_pointer());
///
/// let leaf = pte.with_flag(Flag::R, true).with_flag(Flag::W, true);
/// assert!(leaf.is_leaf());
/// assert_eq!(leaf.ppn_field(mode, 0), 0x001);
/// assert_eq!(leaf.ppn_field(mode, 1), 0x001);
/// assert_eq!(leaf.ppn_field(mode, 2), 0x2);
/// assert_eq!(leaf.raw(mode), (0x80201 << 10) | 0b111);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq, Hash)]
pub struct PteBits {
    /// Valid (V, bit 0).
    ///
    /// A clear V bit makes the whole entry invalid; all other bits are then
    /// ignored by hardware.
    pub valid: bool,

    /// Readable (R, bit 1).
    pub readable: bool,

    /// Writable (W, bit 2).
    ///
    /// `W = 1, R = 0` is a reserved encoding.
    pub writable: bool,

    /// Executable (X, bit 3).
    pub executable: bool,

    /// User (U, bit 4).
    pub user: bool,

    /// Global (G, bit 5).
    ///
    /// On a pointer entry, all mappings in the subtree are global as well.
    pub global: bool,

    /// Accessed (A, bit 6).
    pub accessed: bool,

    /// Dirty (D, bit 7). Must be zero on pointer entries.
    pub dirty: bool,

    /// Supervisor-software bits (RSW, bits 8..=9). Ignored by hardware.
    #[bits(2)]
    pub rsw: u8,

    /// Physical page number (bits 10..=53).
    #[bits(44)]
    ppn_bits: u64,

    /// Reserved (bits 54..=60).
    #[bits(7)]
    __: u8,

    /// Page-based memory type (PBMT, bits 61..=62).
    #[bits(2)]
    pub pbmt: u8,

    /// NAPOT (N, bit 63).
    pub napot: bool,
}

impl PteBits {
    /// A valid pointer entry to the table with page number `ppn`.
    #[inline]
    #[must_use]
    pub fn pointer(mode: PagingMode, ppn: u64) -> Self {
        Self::new().with_valid(true).with_ppn(mode, ppn)
    }

    /// Read one attribute bit.
    #[inline]
    #[must_use]
    pub const fn flag(self, flag: Flag) -> bool {
        (self.into_bits() >> flag.bit()) & 1 == 1
    }

    /// Return a copy with one attribute bit set or cleared.
    #[inline]
    #[must_use]
    pub const fn with_flag(self, flag: Flag, on: bool) -> Self {
        let mask = 1 << flag.bit();
        let bits = self.into_bits();
        Self::from_bits(if on { bits | mask } else { bits & !mask })
    }

    #[inline]
    pub const fn set_flag(&mut self, flag: Flag, on: bool) {
        *self = self.with_flag(flag, on);
    }

    /// The `X W R` triple as a 3-bit value (`X` is the most significant bit).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn xwr(self) -> u8 {
        ((self.into_bits() >> 1) & 0b111) as u8
    }

    /// Return a copy with the `X W R` triple replaced.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn with_xwr(self, xwr: u8) -> Self {
        let bits = self.into_bits() & !(0b111 << 1);
        Self::from_bits(bits | (((xwr & 0b111) as u64) << 1))
    }

    /// Returns `true` if any of `R` or `X` is set, i.e. the walk stops here.
    ///
    /// A `W`-only entry is reserved; it counts as a leaf as well since a walker
    /// would not descend through it.
    #[inline]
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        self.xwr() != 0
    }

    /// Returns `true` for a valid entry with `R = W = X = 0`.
    #[inline]
    #[must_use]
    pub const fn is_pointer(self) -> bool {
        self.valid() && self.xwr() == 0
    }

    /// The physical page number, limited to the mode's PPN width.
    #[inline]
    #[must_use]
    pub const fn ppn(self, mode: PagingMode) -> u64 {
        self.ppn_bits() & low_mask(mode.ppn_bits())
    }

    /// Return a copy with the PPN replaced; bits beyond the mode's width are dropped.
    #[inline]
    #[must_use]
    pub const fn with_ppn(self, mode: PagingMode, ppn: u64) -> Self {
        self.with_ppn_bits(ppn & low_mask(mode.ppn_bits()))
    }

    #[inline]
    pub const fn set_ppn(&mut self, mode: PagingMode, ppn: u64) {
        *self = self.with_ppn(mode, ppn);
    }

    /// `PPN[field]` according to the mode's field widths.
    #[must_use]
    pub fn ppn_field(self, mode: PagingMode, field: usize) -> u64 {
        mode.ppn_field(self.ppn(mode), field)
    }

    /// Return a copy with `PPN[field]` replaced.
    #[must_use]
    pub fn with_ppn_field(self, mode: PagingMode, field: usize, value: u64) -> Self {
        self.with_ppn(mode, mode.with_ppn_field(self.ppn(mode), field, value))
    }

    /// The physical address the entry points at (child table or mapped page).
    #[inline]
    #[must_use]
    pub const fn target(self, mode: PagingMode) -> PhysicalAddress {
        PhysicalAddress::from_ppn(self.ppn(mode))
    }

    /// The entry as stored in memory: 32 bits wide in `Sv32`, 64 bits otherwise.
    #[inline]
    #[must_use]
    pub const fn raw(self, mode: PagingMode) -> u64 {
        match mode {
            PagingMode::Sv32 => self.into_bits() & low_mask(32),
            _ => self.into_bits(),
        }
    }
}

impl fmt::Display for PteBits {
    /// `ppn` followed by `DAGUXWRV`, clear bits shown as `-`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} ", self.ppn_bits())?;
        for flag in Flag::ALL[..8].iter().rev() {
            f.write_char(if self.flag(*flag) {
                flag.as_str().chars().next().unwrap_or('?')
            } else {
                '-'
            })?;
        }
        if self.rsw() != 0 {
            write!(f, " rsw={}", self.rsw())?;
        }
        Ok(())
    }
}

impl Serialize for PteBits {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.into_bits())
    }
}

impl<'de> Deserialize<'de> for PteBits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(Self::from_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_named_bits() {
        let pte = PteBits::new()
            .with_flag(Flag::V, true)
            .with_flag(Flag::G, true)
            .with_flag(Flag::Rsw1, true);
        assert!(pte.valid());
        assert!(pte.global());
        assert_eq!(pte.rsw(), 0b10);
        assert_eq!(pte.into_bits(), 0b10_0010_0001);

        let cleared = pte.with_flag(Flag::G, false);
        assert!(!cleared.global());
    }

    #[test]
    fn xwr_triple() {
        let pte = PteBits::new().with_valid(true).with_xwr(0b101);
        assert!(pte.executable());
        assert!(!pte.writable());
        assert!(pte.readable());
        assert_eq!(pte.xwr(), 0b101);
        assert!(pte.is_leaf());
        assert!(!pte.with_xwr(0).is_leaf());
        assert!(pte.with_xwr(0).is_pointer());
    }

    #[test]
    fn sv32_ppn_is_22_bits() {
        let mode = PagingMode::Sv32;
        let pte = PteBits::pointer(mode, 0x3f_ffff);
        assert_eq!(pte.ppn(mode), 0x3f_ffff);
        assert_eq!(pte.ppn_field(mode, 0), 0x3ff);
        assert_eq!(pte.ppn_field(mode, 1), 0xfff);
        assert_eq!(pte.raw(mode), 0xffff_fc01);

        let overflow = PteBits::pointer(mode, 0x40_0000);
        assert_eq!(overflow.ppn(mode), 0);
    }

    #[test]
    fn sv57_top_field() {
        let mode = PagingMode::Sv57;
        let pte = PteBits::new().with_ppn_field(mode, 4, 0xff);
        assert_eq!(pte.ppn(mode), 0xff << 36);
        assert_eq!(pte.target(mode).as_u64(), 0xff << 48);
    }

    #[test]
    fn display_lists_flags() {
        let pte = PteBits::pointer(PagingMode::Sv39, 0x80000)
            .with_flag(Flag::R, true)
            .with_flag(Flag::D, true);
        assert_eq!(pte.to_string(), "0x80000 D-----RV");
    }

    #[test]
    fn serializes_as_raw_bits() {
        let pte = PteBits::pointer(PagingMode::Sv39, 1);
        assert_eq!(serde_json::to_string(&pte).unwrap(), "1025");
    }
}
