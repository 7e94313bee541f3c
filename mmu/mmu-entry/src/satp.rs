use bitfield_struct::bitfield;
use mmu_addresses::{PagingMode, PhysicalAddress, low_mask};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// `satp`: Supervisor Address Translation and Protection (RV64).
///
/// Holds the root table's physical page number, the address-space identifier
/// and the translation scheme.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Satp64 {
    /// Bits 0–43: root table physical base >> 12.
    #[bits(44)]
    pub ppn: u64,

    /// Bits 44–59: address-space identifier.
    #[bits(16)]
    pub asid: u16,

    /// Bits 60–63: translation scheme (8 = `Sv39`, 9 = `Sv48`, 10 = `Sv57`).
    #[bits(4)]
    pub mode: u8,
}

/// `satp` for RV32 (`Sv32`).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct Satp32 {
    /// Bits 0–21: root table physical base >> 12.
    #[bits(22)]
    pub ppn: u32,

    /// Bits 22–30: address-space identifier.
    #[bits(9)]
    pub asid: u16,

    /// Bit 31: translation enabled (`Sv32`).
    pub mode: bool,
}

/// A root-table pointer for any paging mode.
///
/// ```rust
/// # use mmu_entry::Satp;
/// # use mmu_addresses::{PagingMode, PhysicalAddress};
/// let satp = Satp::new(PagingMode::Sv39, 1, 0x80000);
/// assert_eq!(satp.raw(), (8 << 60) | (1 << 44) | 0x80000);
/// assert_eq!(satp.root(), PhysicalAddress::new(0x8000_0000));
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Satp {
    pub mode: PagingMode,
    pub asid: u16,
    pub ppn: u64,
}

impl Satp {
    #[must_use]
    pub const fn new(mode: PagingMode, asid: u16, ppn: u64) -> Self {
        Self { mode, asid, ppn }
    }

    /// Number of ASID bits available in `mode`.
    #[must_use]
    pub const fn asid_bits(mode: PagingMode) -> u32 {
        match mode {
            PagingMode::Sv32 => 9,
            _ => 16,
        }
    }

    /// The physical address of the root table.
    #[must_use]
    pub const fn root(self) -> PhysicalAddress {
        PhysicalAddress::from_ppn(self.ppn)
    }

    /// The register value; out-of-range PPN or ASID bits are dropped.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_lossless)]
    pub const fn raw(self) -> u64 {
        let asid = self.asid & (low_mask(Self::asid_bits(self.mode)) as u16);
        match self.mode {
            PagingMode::Sv32 => {
                let reg = Satp32::new()
                    .with_ppn((self.ppn & low_mask(22)) as u32)
                    .with_asid(asid)
                    .with_mode(true);
                reg.into_bits() as u64
            }
            mode => Satp64::new()
                .with_ppn(self.ppn & low_mask(44))
                .with_asid(asid)
                .with_mode(mode.satp_mode())
                .into_bits(),
        }
    }
}

impl Serialize for Satp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Satp", 4)?;
        s.serialize_field("mode", &self.mode)?;
        s.serialize_field("asid", &self.asid)?;
        s.serialize_field("ppn", &self.ppn)?;
        s.serialize_field("raw", &self.raw())?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sv32_layout() {
        let satp = Satp::new(PagingMode::Sv32, 0x1ff, 0x3f_ffff);
        assert_eq!(satp.raw(), 0xffff_ffff);
        let satp = Satp::new(PagingMode::Sv32, 0, 0x12345);
        assert_eq!(satp.raw(), 0x8001_2345);
    }

    #[test]
    fn mode_field_per_scheme() {
        assert_eq!(Satp::new(PagingMode::Sv48, 0, 0).raw() >> 60, 9);
        assert_eq!(Satp::new(PagingMode::Sv57, 0, 0).raw() >> 60, 10);
    }

    #[test]
    fn asid_is_truncated_for_sv32() {
        let satp = Satp::new(PagingMode::Sv32, 0x3ff, 0);
        assert_eq!(Satp32::from_bits(satp.raw() as u32).asid(), 0x1ff);
    }

    #[test]
    fn serializes_with_raw_value() {
        let satp = Satp::new(PagingMode::Sv39, 0, 1);
        let json = serde_json::to_string(&satp).unwrap();
        assert_eq!(
            json,
            format!("{{\"mode\":\"Sv39\",\"asid\":0,\"ppn\":1,\"raw\":{}}}", (8u64 << 60) | 1)
        );
    }
}
