//! Output model of a run: one [`GeneratedCase`] per successful request, a
//! [`RequestFailure`] per failed one, collected in a [`GenerationReport`].

use crate::error::{GenerationError, SpecPosition};
use crate::pool::{AddressPool, EntryRole};
use crate::spec::ErrorKind;
use mmu_addresses::{PageSize, PagingMode, PhysicalAddress, VirtualAddress};
use mmu_entry::{PteBits, Satp};
use serde::{Serialize, Serializer};
use std::fmt;
use std::ops::Range;

/// One entry of a translation walk.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct WalkEntry {
    /// RISC-V level; the root is `levels - 1`.
    pub level: u8,
    /// Base of the table holding the entry.
    pub table: PhysicalAddress,
    /// Index of the entry within its table.
    pub index: u64,
    /// Physical address of the entry.
    pub address: PhysicalAddress,
    pub pte: PteBits,
    /// The entry existed before this case and was left unchanged.
    pub shared: bool,
}

/// A concrete translation produced for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedCase {
    /// Position among all requests of the run.
    pub ordinal: usize,
    /// Index of the template in `test_cases`.
    pub spec_index: usize,
    pub mode: PagingMode,
    pub pagesize: PageSize,
    pub satp: Satp,
    pub va: VirtualAddress,
    pub pa: PhysicalAddress,
    /// Root first, leaf last.
    pub entries: Vec<WalkEntry>,
    pub error: Option<ErrorKind>,
    /// The physical page is also mapped by an earlier case.
    pub aliased: bool,
}

impl GeneratedCase {
    /// The final entry of the walk.
    #[must_use]
    pub fn leaf(&self) -> Option<&WalkEntry> {
        self.entries.last()
    }

    /// The walk's pointer entries, root first.
    #[must_use]
    pub fn pointers(&self) -> &[WalkEntry] {
        self.entries.split_last().map_or(&[], |(_, pointers)| pointers)
    }

    /// Returns `true` if the leaf maps more than 4 KiB.
    #[must_use]
    pub const fn is_superpage(&self) -> bool {
        self.pagesize.is_superpage()
    }
}

/// Formats the walk as a single line:
/// `SATP: <ppn> VA: <va> -> [=><entry addresses> <leaf ppn>] -> <pa>`.
impl fmt::Display for GeneratedCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ppn_width = hex_width(self.mode.ppn_bits());
        let va_width = hex_width(self.mode.va_bits());
        let pa_width = hex_width(self.mode.pa_bits());

        write!(
            f,
            "SATP: {:#0ppn_width$x} VA: {:#0va_width$x} -> [=>",
            self.satp.ppn,
            self.va.as_u64()
        )?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:#0pa_width$x}", entry.address.as_u64())?;
        }
        if let Some(leaf) = self.leaf() {
            write!(f, " {:#0ppn_width$x}", leaf.pte.ppn(self.mode))?;
        }
        write!(f, "] -> {:#0pa_width$x}", self.pa.as_u64())?;
        if let Some(kind) = self.error {
            write!(f, " INVALID: {kind}")?;
        }
        Ok(())
    }
}

/// A request that produced no case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("request #{ordinal} ({position}) failed: {error}")]
pub struct RequestFailure {
    pub ordinal: usize,
    pub spec_index: usize,
    #[serde(skip)]
    pub position: SpecPosition,
    #[source]
    pub error: GenerationError,
}

impl RequestFailure {
    #[must_use]
    pub const fn new(ordinal: usize, spec_index: usize, error: GenerationError) -> Self {
        Self {
            ordinal,
            spec_index,
            position: SpecPosition::TestCase(spec_index),
            error,
        }
    }
}

/// A page-table entry in the final table contents.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct TableEntry {
    pub address: PhysicalAddress,
    pub level: u8,
    pub pte: PteBits,
    /// Written as a leaf (an injected error may make it look otherwise).
    pub leaf: bool,
    /// The entry as stored in memory (`Sv32` uses the low 32 bits).
    pub raw: u64,
}

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationReport {
    pub mode: PagingMode,
    pub seed: u64,
    #[serde(serialize_with = "hex_range")]
    pub data: Range<u64>,
    #[serde(serialize_with = "hex_range")]
    pub tables: Range<u64>,
    /// One result per request, in request order.
    pub cases: Vec<Result<GeneratedCase, RequestFailure>>,
    /// Final table contents, by entry address.
    pub page_tables: Vec<TableEntry>,
}

impl GenerationReport {
    pub(crate) fn new(
        seed: u64,
        pool: &AddressPool,
        cases: Vec<Result<GeneratedCase, RequestFailure>>,
    ) -> Self {
        let mode = pool.mode();
        let page_tables = pool
            .entries()
            .iter()
            .map(|(&address, entry)| TableEntry {
                address,
                level: entry.level,
                pte: entry.pte,
                leaf: entry.role == EntryRole::Leaf,
                raw: entry.pte.raw(mode),
            })
            .collect();
        Self {
            mode,
            seed,
            data: pool.bounds().data.clone(),
            tables: pool.bounds().tables.clone(),
            cases,
            page_tables,
        }
    }

    /// The successfully generated cases.
    pub fn generated(&self) -> impl Iterator<Item = &GeneratedCase> {
        self.cases.iter().filter_map(|c| c.as_ref().ok())
    }

    /// The failed requests.
    pub fn failures(&self) -> impl Iterator<Item = &RequestFailure> {
        self.cases.iter().filter_map(|c| c.as_ref().err())
    }
}

/// A text dump: header, one line per request, then the page tables.
impl fmt::Display for GenerationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pa_width = hex_width(self.mode.pa_bits());
        writeln!(
            f,
            "Mode: {}, seed: {}, data: [{:#x}, {:#x}), tables: [{:#x}, {:#x})",
            self.mode, self.seed, self.data.start, self.data.end, self.tables.start, self.tables.end
        )?;
        writeln!(f)?;
        writeln!(f, "Walks:")?;
        for (i, case) in self.cases.iter().enumerate() {
            match case {
                Ok(case) => writeln!(f, "{i}\t{case}")?,
                Err(failure) => writeln!(f, "{i}\tFAILED ({}): {}", failure.position, failure.error)?,
            }
        }
        writeln!(f)?;
        writeln!(f, "PTEs:")?;
        for entry in &self.page_tables {
            writeln!(
                f,
                "{:#0pa_width$x}\tL{}\t{}",
                entry.address.as_u64(),
                entry.level,
                entry.pte
            )?;
        }
        Ok(())
    }
}

/// Digits for a `#0…x` format of a `bits`-wide value, `0x` included.
const fn hex_width(bits: u32) -> usize {
    bits.div_ceil(4) as usize + 2
}

fn hex_range<S: Serializer>(range: &Range<u64>, serializer: S) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeStruct;
    let mut s = serializer.serialize_struct("Range", 2)?;
    s.serialize_field("start", &format!("{:#x}", range.start))?;
    s.serialize_field("end", &format!("{:#x}", range.end))?;
    s.end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmu_entry::Flag;

    fn sample() -> GeneratedCase {
        let mode = PagingMode::Sv39;
        let root = PhysicalAddress::new(0x8000_0000);
        let leaf = PteBits::new()
            .with_flag(Flag::V, true)
            .with_flag(Flag::R, true)
            .with_ppn(mode, 0x80002);
        GeneratedCase {
            ordinal: 0,
            spec_index: 0,
            mode,
            pagesize: PageSize::Size2M,
            satp: Satp::new(mode, 0, root.ppn()),
            va: VirtualAddress::new(0x4020_0000),
            pa: PhysicalAddress::new(0x8020_0000),
            entries: vec![
                WalkEntry {
                    level: 2,
                    table: root,
                    index: 1,
                    address: root + 8,
                    pte: PteBits::pointer(mode, 0x80001),
                    shared: false,
                },
                WalkEntry {
                    level: 1,
                    table: PhysicalAddress::new(0x8000_1000),
                    index: 1,
                    address: PhysicalAddress::new(0x8000_1008),
                    pte: leaf,
                    shared: false,
                },
            ],
            error: None,
            aliased: false,
        }
    }

    #[test]
    fn ministring() {
        let case = sample();
        assert_eq!(
            case.to_string(),
            "SATP: 0x00000080000 VA: 0x0040200000 -> [=>0x00000080000008 0x00000080001008 0x00000080002] -> 0x00000080200000"
        );
        let case = GeneratedCase {
            error: Some(ErrorKind::MarkInvalid),
            ..case
        };
        assert!(case.to_string().ends_with(" INVALID: mark_invalid"));
    }

    #[test]
    fn leaf_and_pointers() {
        let case = sample();
        assert_eq!(case.leaf().map(|e| e.level), Some(1));
        assert_eq!(case.pointers().len(), 1);
        assert!(case.is_superpage());
    }

    #[test]
    fn failure_message() {
        let failure = RequestFailure::new(4, 2, GenerationError::NoApplicableError);
        assert_eq!(
            failure.to_string(),
            "request #4 (test_cases[2]) failed: none of the requested error kinds applies to this walk"
        );
    }

    #[test]
    fn hex_widths() {
        assert_eq!(hex_width(44), 13);
        assert_eq!(hex_width(22), 8);
        assert_eq!(hex_width(39), 12);
    }
}
