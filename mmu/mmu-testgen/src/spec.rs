//! # Test-case configuration model
//!
//! The declarative input of a run: a [`Config`] with run-wide bounds and an
//! ordered list of [`TestCaseSpec`] templates. Every template field is
//! optional; fields that may be a value, a list of candidates or absent are a
//! [`Choice`].
//!
//! ## JSON shape
//!
//! ```json
//! {
//!   "mode": "Sv39",
//!   "lower_bound": "0x8000_0000",
//!   "memory_size": "0x1000_0000",
//!   "test_cases": [
//!     { "repeats": 4 },
//!     { "pagesize": ["4K", "2M"], "attributes": { "U": 1, "G": 0.25 } },
//!     { "satp": { "ppn": 524288 }, "va": "0x4000_0000", "reuse_pte": 0.5 },
//!     { "satp.ppn": "0x80100", "va": { "vpn": [null, 3], "offset": "0x10" } },
//!     { "errors": { "p": 1, "types": ["mark_invalid", "write_no_read"], "weights": [3, 1] } },
//!     { "errors": { "mark_invalid": 0.5, "leaf_as_pointer": 0.5 } }
//!   ]
//! }
//! ```
//!
//! Validation happens up front, before any allocation: [`Config::validate`]
//! checks the run-wide bounds and every template, and returns the resolved
//! [`Bounds`] the address pool works in.

use crate::error::{SpecError, SpecPosition};
use crate::pool::{AddressConstraint, Bounds};
use crate::random::{Probability, RandomDraws};
use mmu_addresses::{
    FRAME_SIZE, PAGE_SHIFT, PageSize, PagingMode, PhysicalAddress, VirtualAddress, low_mask,
};
use mmu_entry::{Flag, Satp};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use utils_spec_derive::SpecBuilder;

/// Upper limit on the number of slots a single `page_range` may enumerate.
pub const MAX_PAGE_RANGE_SLOTS: usize = 65_536;

/// Flag name to probability. `0` clears, `1` sets, anything between is drawn.
pub type Attributes = BTreeMap<Flag, Probability>;

/// A field that is either left to chance, fixed, or picked from candidates.
///
/// In JSON, `null` (or an absent field) is [`Choice::Random`], a scalar is
/// [`Choice::Fixed`] and an array is [`Choice::OneOf`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Choice<T> {
    #[default]
    Random,
    Fixed(T),
    OneOf(Vec<T>),
}

impl<T> Choice<T> {
    #[must_use]
    pub const fn is_random(&self) -> bool {
        matches!(self, Self::Random)
    }

    /// Every value this choice can resolve to; empty for [`Choice::Random`].
    #[must_use]
    pub fn candidates(&self) -> &[T] {
        match self {
            Self::Random => &[],
            Self::Fixed(value) => std::slice::from_ref(value),
            Self::OneOf(values) => values,
        }
    }

    #[must_use]
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Choice<U> {
        match self {
            Self::Random => Choice::Random,
            Self::Fixed(value) => Choice::Fixed(f(value)),
            Self::OneOf(values) => Choice::OneOf(values.into_iter().map(f).collect()),
        }
    }
}

impl<T: Clone> Choice<T> {
    /// Resolve to a concrete value; `None` means "draw it during placement".
    ///
    /// [`Choice::OneOf`] takes one draw; the other variants take none.
    pub fn resolve(&self, draws: &mut RandomDraws) -> Option<T> {
        match self {
            Self::Random => None,
            Self::Fixed(value) => Some(value.clone()),
            Self::OneOf(values) => draws.choose_one(values).cloned(),
        }
    }
}

impl<T> From<T> for Choice<T> {
    fn from(value: T) -> Self {
        Self::Fixed(value)
    }
}

impl<T> From<Vec<T>> for Choice<T> {
    fn from(values: Vec<T>) -> Self {
        Self::OneOf(values)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Choice<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<T> {
            Many(Vec<T>),
            One(T),
        }

        Ok(match Option::<Repr<T>>::deserialize(deserializer)? {
            None => Self::Random,
            Some(Repr::One(value)) => Self::Fixed(value),
            Some(Repr::Many(values)) => Self::OneOf(values),
        })
    }
}

/// A page number written as an integer or a `"0x…"` string.
struct Number(u64);

impl<'de> Deserialize<'de> for Number {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        mmu_addresses::serde_u64::deserialize(deserializer).map(Self)
    }
}

/// A [`Choice`] of page numbers in either notation.
fn page_numbers<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Choice<u64>, D::Error> {
    Choice::<Number>::deserialize(deserializer).map(|choice| choice.map(|n| n.0))
}

/// Page-number fields and page offset of a partially given address.
#[derive(Debug, Clone, Default, PartialEq, Eq, SpecBuilder)]
pub struct AddressFields {
    /// `VPN`/`PPN` fields, field `0` first; `None` fields are drawn.
    pub pages: Vec<Option<u64>>,
    /// The low 12 bits.
    pub offset: Option<u64>,
}

/// An address given whole, or field by field.
///
/// The field form is `{ "vpn": [...], "offset": ... }` for virtual and
/// `{ "ppn": [...], "offset": ... }` for physical addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSpec<A> {
    Whole(A),
    Fields(AddressFields),
}

impl From<VirtualAddress> for Choice<AddressSpec<VirtualAddress>> {
    fn from(va: VirtualAddress) -> Self {
        Self::Fixed(AddressSpec::Whole(va))
    }
}

impl From<PhysicalAddress> for Choice<AddressSpec<PhysicalAddress>> {
    fn from(pa: PhysicalAddress) -> Self {
        Self::Fixed(AddressSpec::Whole(pa))
    }
}

impl<A> From<AddressFields> for Choice<AddressSpec<A>> {
    fn from(fields: AddressFields) -> Self {
        Self::Fixed(AddressSpec::Fields(fields))
    }
}

impl AddressSpec<VirtualAddress> {
    /// The virtual address bits this spec fixes; `None` if they contradict.
    #[must_use]
    pub fn constraint(&self, mode: PagingMode) -> Option<AddressConstraint> {
        match self {
            Self::Whole(va) => Some(AddressConstraint::within(mode.va_bits(), va.as_u64())),
            Self::Fields(fields) => {
                let mut c = offset_constraint(fields.offset);
                c.fix_vpns(mode, &fields.pages).then_some(c)
            }
        }
    }
}

impl AddressSpec<PhysicalAddress> {
    /// The physical address bits this spec fixes; `None` if they contradict.
    #[must_use]
    pub fn constraint(&self, mode: PagingMode) -> Option<AddressConstraint> {
        match self {
            Self::Whole(pa) => Some(AddressConstraint::within(mode.pa_bits(), pa.as_u64())),
            Self::Fields(fields) => {
                let mut c = offset_constraint(fields.offset);
                c.fix_ppns(mode, &fields.pages).then_some(c)
            }
        }
    }
}

fn offset_constraint(offset: Option<u64>) -> AddressConstraint {
    offset.map_or_else(AddressConstraint::default, |offset| {
        AddressConstraint::within(PAGE_SHIFT, offset)
    })
}

impl<'de> Deserialize<'de> for AddressSpec<VirtualAddress> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Fields {
            #[serde(default)]
            vpn: Vec<Option<u64>>,
            #[serde(default, deserialize_with = "mmu_addresses::serde_u64::deserialize_option")]
            offset: Option<u64>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Whole(VirtualAddress),
            Fields(Fields),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Whole(va) => Self::Whole(va),
            Repr::Fields(f) => Self::Fields(AddressFields {
                pages: f.vpn,
                offset: f.offset,
            }),
        })
    }
}

impl<'de> Deserialize<'de> for AddressSpec<PhysicalAddress> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Fields {
            #[serde(default)]
            ppn: Vec<Option<u64>>,
            #[serde(default, deserialize_with = "mmu_addresses::serde_u64::deserialize_option")]
            offset: Option<u64>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Whole(PhysicalAddress),
            Fields(Fields),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Whole(pa) => Self::Whole(pa),
            Repr::Fields(f) => Self::Fields(AddressFields {
                pages: f.ppn,
                offset: f.offset,
            }),
        })
    }
}

pub type VaChoice = Choice<AddressSpec<VirtualAddress>>;
pub type PaChoice = Choice<AddressSpec<PhysicalAddress>>;

/// Constraints on one entry of the walk, root-adjacent first.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, SpecBuilder)]
#[serde(default, deny_unknown_fields)]
pub struct PteSpec {
    /// Physical address of the entry itself. Fixes both the table frame
    /// (aligned down to 4 KiB) and the index within it.
    pub address: Choice<PhysicalAddress>,
    /// Per-field overrides of the target's page number, `PPN[0]` first. The
    /// target is the child table for a pointer, the mapped page for the leaf.
    pub ppns: Vec<Choice<u64>>,
    pub attributes: Attributes,
}

/// Constraints on the root table pointer.
///
/// Written as `{ "ppn": …, "asid": … }` or as a bare page number; page
/// numbers may be `"0x…"` strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, SpecBuilder)]
#[serde(from = "SatpRepr")]
pub struct SatpSpec {
    pub ppn: Choice<u64>,
    pub asid: u16,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SatpRepr {
    Ppn(Choice<Number>),
    Register(SatpRegister),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SatpRegister {
    #[serde(default, deserialize_with = "page_numbers")]
    ppn: Choice<u64>,
    #[serde(default)]
    asid: u16,
}

impl From<SatpRepr> for SatpSpec {
    fn from(repr: SatpRepr) -> Self {
        match repr {
            SatpRepr::Ppn(ppn) => Self {
                ppn: ppn.map(|n| n.0),
                asid: 0,
            },
            SatpRepr::Register(SatpRegister { ppn, asid }) => Self { ppn, asid },
        }
    }
}

/// `satp` with the dotted `satp.ppn` and `satp.asid` keys folded in.
fn merge_satp(satp: Option<&SatpSpec>, ppn: &Choice<u64>, asid: Option<u16>) -> Option<SatpSpec> {
    if satp.is_none() && ppn.is_random() && asid.is_none() {
        return None;
    }
    let mut merged = satp.cloned().unwrap_or_default();
    if !ppn.is_random() {
        merged.ppn = ppn.clone();
    }
    if let Some(asid) = asid {
        merged.asid = asid;
    }
    Some(merged)
}

/// A sequence of physical addresses, one per generated case.
///
/// Slot `0` is `start` (default: the lower memory bound); slot `i + 1` is
/// slot `i` plus `step` (default: the page size chosen for slot `i`). The
/// range has `num_pages` slots, or runs until `end` (default: the end of
/// memory), whichever comes first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, SpecBuilder)]
#[serde(default, deny_unknown_fields)]
pub struct PageRange {
    pub start: Option<PhysicalAddress>,
    pub end: Option<PhysicalAddress>,
    #[serde(deserialize_with = "mmu_addresses::serde_u64::deserialize_option")]
    pub num_pages: Option<u64>,
    #[serde(deserialize_with = "mmu_addresses::serde_u64::deserialize_option")]
    pub step: Option<u64>,
}

/// Overrides for one case of a template, keyed by its index.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, SpecBuilder)]
#[serde(deny_unknown_fields)]
pub struct SpecialCase {
    pub index: usize,
    #[serde(default)]
    pub ptes: Vec<PteSpec>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub va: VaChoice,
    #[serde(default)]
    pub pa: PaChoice,
}

/// A deliberate defect injected into an otherwise valid walk.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Leaf `V = 0`.
    MarkInvalid,
    /// Leaf `W = 1, R = 0`.
    WriteNoRead,
    /// A pointer entry of the walk has `G = 1` while the leaf has `G = 0`.
    GlobalNonglobal,
    /// Leaf `X = W = R = 0`, so it reads as a pointer.
    LeafAsPointer,
    /// A superpage leaf with a non-zero `PPN[0]`.
    UnclearedSuperpage,
}

impl ErrorKind {
    pub const ALL: [Self; 5] = [
        Self::MarkInvalid,
        Self::WriteNoRead,
        Self::GlobalNonglobal,
        Self::LeafAsPointer,
        Self::UnclearedSuperpage,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MarkInvalid => "mark_invalid",
            Self::WriteNoRead => "write_no_read",
            Self::GlobalNonglobal => "global_nonglobal",
            Self::LeafAsPointer => "leaf_as_pointer",
            Self::UnclearedSuperpage => "uncleared_superpage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn always() -> Probability {
    Probability::ALWAYS
}

/// Error-injection policy of a template.
///
/// Either weighted, as `{ "p": …, "types": […], "weights": […] }`, or a map
/// of per-kind switches such as `{ "mark_invalid": 0.5 }`.
///
/// `p` defaults to `1`. An empty `types` list means every kind; an empty
/// `weights` list weighs all listed types equally.
#[derive(Debug, Clone, PartialEq, Deserialize, SpecBuilder)]
#[serde(from = "ErrorRepr")]
pub struct ErrorSpec {
    pub p: Probability,
    pub types: Vec<ErrorKind>,
    pub weights: Vec<f64>,
    /// Per-kind switches, each drawn on its own. Replaces `p`, `types` and
    /// `weights` when not empty.
    pub switches: BTreeMap<ErrorKind, Probability>,
}

impl Default for ErrorSpec {
    fn default() -> Self {
        Self {
            p: Probability::ALWAYS,
            types: Vec::new(),
            weights: Vec::new(),
            switches: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorRepr {
    Weighted(WeightedErrors),
    Switches(BTreeMap<ErrorKind, Probability>),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WeightedErrors {
    #[serde(default = "always")]
    p: Probability,
    #[serde(default)]
    types: Vec<ErrorKind>,
    #[serde(default)]
    weights: Vec<f64>,
}

impl From<ErrorRepr> for ErrorSpec {
    fn from(repr: ErrorRepr) -> Self {
        match repr {
            ErrorRepr::Weighted(WeightedErrors { p, types, weights }) => Self {
                p,
                types,
                weights,
                switches: BTreeMap::new(),
            },
            ErrorRepr::Switches(switches) => Self {
                switches,
                ..Self::default()
            },
        }
    }
}

impl ErrorSpec {
    /// Decide whether a request gets a defect, and the kinds to pick it from.
    ///
    /// Switches are drawn one by one in kind order and the kinds that fired
    /// weigh the same. Otherwise `p` is drawn once.
    pub fn draw(&self, draws: &mut RandomDraws) -> Option<Vec<(ErrorKind, f64)>> {
        if self.switches.is_empty() {
            return draws.bernoulli(self.p).then(|| self.weighted_kinds());
        }
        let fired: Vec<(ErrorKind, f64)> = self
            .switches
            .iter()
            .filter_map(|(&kind, &p)| draws.bernoulli(p).then_some((kind, 1.0)))
            .collect();
        (!fired.is_empty()).then_some(fired)
    }

    /// The kinds and weights to choose from, with defaults filled in.
    #[must_use]
    pub fn weighted_kinds(&self) -> Vec<(ErrorKind, f64)> {
        let kinds: &[ErrorKind] = if self.types.is_empty() {
            &ErrorKind::ALL
        } else {
            &self.types
        };
        kinds
            .iter()
            .enumerate()
            .map(|(i, &kind)| (kind, self.weights.get(i).copied().unwrap_or(1.0)))
            .collect()
    }
}

/// A template for one class of generated cases.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, SpecBuilder)]
#[serde(default, deny_unknown_fields)]
pub struct TestCaseSpec {
    /// Number of cases (default 1). Mutually exclusive with `page_range`.
    pub repeats: Option<u32>,
    pub ptes: Vec<PteSpec>,
    /// Leaf PPN overrides, merged under the leaf [`PteSpec`]'s own `ppns`.
    pub ppns: Vec<Choice<u64>>,
    /// Leaf attributes, merged under the leaf [`PteSpec`]'s own `attributes`.
    pub attributes: Attributes,
    pub satp: Option<SatpSpec>,
    /// Shorthand for `satp.ppn`; wins over it.
    #[serde(rename = "satp.ppn", deserialize_with = "page_numbers")]
    pub satp_ppn: Choice<u64>,
    /// Shorthand for `satp.asid`; wins over it.
    #[serde(rename = "satp.asid")]
    pub satp_asid: Option<u16>,
    pub va: VaChoice,
    pub pa: PaChoice,
    pub same_va_pa: Probability,
    pub aliasing: Probability,
    pub reuse_pte: Probability,
    pub reuse_satp: Probability,
    /// Leaf size; 4 KiB when absent.
    pub pagesize: Choice<PageSize>,
    pub page_range: Option<PageRange>,
    pub special: Vec<SpecialCase>,
    pub errors: Option<ErrorSpec>,
}

/// Run-wide parameters and the ordered list of templates.
#[derive(Debug, Clone, PartialEq, Deserialize, SpecBuilder)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub mode: PagingMode,
    /// Size of the data region; defaults to everything above `lower_bound`.
    #[serde(
        default,
        deserialize_with = "mmu_addresses::serde_u64::deserialize_option"
    )]
    pub memory_size: Option<u64>,
    #[serde(default)]
    pub lower_bound: PhysicalAddress,
    /// Lower bound for page-table frames.
    #[serde(default)]
    pub pte_min: Option<PhysicalAddress>,
    /// Exclusive upper bound for page-table frames.
    #[serde(default)]
    pub pte_max: Option<PhysicalAddress>,
    /// Root used by every case that does not pick its own.
    #[serde(default)]
    pub satp: Option<SatpSpec>,
    #[spec(skip)]
    #[serde(default, rename = "satp.ppn", deserialize_with = "page_numbers")]
    pub satp_ppn: Choice<u64>,
    #[spec(skip)]
    #[serde(default, rename = "satp.asid")]
    pub satp_asid: Option<u16>,
    #[serde(default)]
    pub test_cases: Vec<TestCaseSpec>,
}

impl Config {
    #[must_use]
    pub const fn new(mode: PagingMode) -> Self {
        Self {
            mode,
            memory_size: None,
            lower_bound: PhysicalAddress::zero(),
            pte_min: None,
            pte_max: None,
            satp: None,
            satp_ppn: Choice::Random,
            satp_asid: None,
            test_cases: Vec::new(),
        }
    }

    /// The run-wide root, if any.
    #[must_use]
    pub fn resolved_satp(&self) -> Option<SatpSpec> {
        merge_satp(self.satp.as_ref(), &self.satp_ppn, self.satp_asid)
    }

    /// Check the run-wide fields and every template.
    ///
    /// # Errors
    /// Returns [`SpecError::InvalidSpec`] naming the first offending position.
    pub fn validate(&self) -> Result<Bounds, SpecError> {
        let bounds = self.bounds()?;
        if let Some(satp) = self.resolved_satp() {
            validate_satp(self.mode, &satp, SpecPosition::Config)?;
        }
        for (index, spec) in self.test_cases.iter().enumerate() {
            spec.validate(self.mode, SpecPosition::TestCase(index))?;
        }
        Ok(bounds)
    }

    fn bounds(&self) -> Result<Bounds, SpecError> {
        let at = SpecPosition::Config;
        let limit = self.mode.pa_limit();
        let lower = self.lower_bound.as_u64();
        if lower >= limit {
            return Err(SpecError::invalid(
                at,
                format!("lower_bound {lower:#x} beyond the {}-bit physical space", self.mode.pa_bits()),
            ));
        }

        let size = self.memory_size.unwrap_or(limit - lower);
        if size == 0 {
            return Err(SpecError::invalid(at, "memory_size is zero"));
        }
        let end = lower
            .checked_add(size)
            .filter(|&end| end <= limit)
            .ok_or_else(|| {
                SpecError::invalid(
                    at,
                    format!("memory range {lower:#x} + {size:#x} exceeds the physical address space"),
                )
            })?;

        let tables = if self.pte_min.is_some() || self.pte_max.is_some() {
            let min = self.pte_min.map_or(lower, PhysicalAddress::as_u64);
            let max = self.pte_max.map_or(end, PhysicalAddress::as_u64);
            if min >= max {
                return Err(SpecError::invalid(
                    at,
                    format!("pte_min {min:#x} is not below pte_max {max:#x}"),
                ));
            }
            if max > limit {
                return Err(SpecError::invalid(
                    at,
                    format!("pte_max {max:#x} exceeds the physical address space"),
                ));
            }
            min..max
        } else {
            lower..end
        };

        let first_frame = mmu_addresses::align_down(tables.start + (FRAME_SIZE - 1), FRAME_SIZE);
        if first_frame + FRAME_SIZE > tables.end {
            return Err(SpecError::invalid(
                at,
                "page-table range cannot hold a single 4 KiB frame",
            ));
        }

        Ok(Bounds {
            data: lower..end,
            tables,
        })
    }
}

impl TestCaseSpec {
    /// Check one template against the paging mode.
    ///
    /// `ptes` must fit the walk of every page size the template may draw.
    /// Slot counts of an open-ended `page_range` are checked during expansion.
    ///
    /// # Errors
    /// Returns [`SpecError::InvalidSpec`] at `at`.
    pub fn validate(&self, mode: PagingMode, at: SpecPosition) -> Result<(), SpecError> {
        let mut shortest = (PageSize::Size4K, usize::from(mode.levels()));
        for &size in non_empty("pagesize", &self.pagesize, at)? {
            let walk = mode.walk_len(size).ok_or_else(|| {
                SpecError::invalid(at, format!("page size {size} does not exist in {mode}"))
            })?;
            if walk < shortest.1 {
                shortest = (size, walk);
            }
        }

        validate_ptes(mode, &self.ptes, shortest, at)?;
        validate_ppns(mode, "ppns", &self.ppns, at)?;
        validate_va(mode, &self.va, at)?;
        validate_pa(mode, &self.pa, at)?;
        if let Some(satp) = self.resolved_satp() {
            validate_satp(mode, &satp, at)?;
        }

        if let Some(range) = &self.page_range {
            if self.repeats.is_some() {
                return Err(SpecError::invalid(at, "page_range replaces repeats; give only one"));
            }
            validate_page_range(range, at)?;
        }

        let mut seen = std::collections::BTreeSet::new();
        for special in &self.special {
            if !seen.insert(special.index) {
                return Err(SpecError::invalid(
                    at,
                    format!("special index {} given twice", special.index),
                ));
            }
            if let Some(count) = self.known_case_count()
                && special.index >= count
            {
                return Err(SpecError::invalid(
                    at,
                    format!("special index {} out of range for {count} cases", special.index),
                ));
            }
            validate_ptes(mode, &special.ptes, shortest, at)?;
            validate_va(mode, &special.va, at)?;
            validate_pa(mode, &special.pa, at)?;
        }

        if let Some(errors) = &self.errors {
            validate_errors(errors, at)?;
        }

        Ok(())
    }

    /// The template's root, if any.
    #[must_use]
    pub fn resolved_satp(&self) -> Option<SatpSpec> {
        merge_satp(self.satp.as_ref(), &self.satp_ppn, self.satp_asid)
    }

    /// The number of cases, if known without drawing page sizes.
    #[must_use]
    pub fn known_case_count(&self) -> Option<usize> {
        match &self.page_range {
            None => usize::try_from(self.repeats.unwrap_or(1)).ok(),
            Some(range) => range
                .num_pages
                .and_then(|n| usize::try_from(n).ok()),
        }
    }
}

fn non_empty<'a, T>(
    field: &str,
    choice: &'a Choice<T>,
    at: SpecPosition,
) -> Result<&'a [T], SpecError> {
    match choice {
        Choice::OneOf(values) if values.is_empty() => Err(SpecError::invalid(
            at,
            format!("empty candidate list for `{field}`"),
        )),
        choice => Ok(choice.candidates()),
    }
}

/// `shortest` is the page size with the shortest walk the template may draw.
fn validate_ptes(
    mode: PagingMode,
    ptes: &[PteSpec],
    shortest: (PageSize, usize),
    at: SpecPosition,
) -> Result<(), SpecError> {
    let (size, walk) = shortest;
    if ptes.len() > walk {
        return Err(SpecError::invalid(
            at,
            format!("{} ptes given, a {size} page in {mode} has a walk of {walk}", ptes.len()),
        ));
    }
    for pte in ptes {
        for address in non_empty("ptes.address", &pte.address, at)? {
            if address.as_u64() >= mode.pa_limit() {
                return Err(SpecError::invalid(
                    at,
                    format!("entry address {address} beyond the physical address space"),
                ));
            }
            if address.as_u64() % mode.pte_bytes() != 0 {
                return Err(SpecError::invalid(
                    at,
                    format!("entry address {address} is not {}-byte aligned", mode.pte_bytes()),
                ));
            }
        }
        validate_ppns(mode, "ptes.ppns", &pte.ppns, at)?;
    }
    Ok(())
}

fn validate_ppns(
    mode: PagingMode,
    field: &str,
    ppns: &[Choice<u64>],
    at: SpecPosition,
) -> Result<(), SpecError> {
    let widths = mode.ppn_widths();
    if ppns.len() > widths.len() {
        return Err(SpecError::invalid(
            at,
            format!("{} `{field}` fields given, {mode} has {}", ppns.len(), widths.len()),
        ));
    }
    for (i, (choice, &width)) in ppns.iter().zip(widths).enumerate() {
        for &value in non_empty(field, choice, at)? {
            if value > low_mask(width) {
                return Err(SpecError::invalid(
                    at,
                    format!("`{field}[{i}]` value {value:#x} exceeds {width} bits"),
                ));
            }
        }
    }
    Ok(())
}

fn validate_va(mode: PagingMode, va: &VaChoice, at: SpecPosition) -> Result<(), SpecError> {
    for va in non_empty("va", va, at)? {
        match va {
            AddressSpec::Whole(va) if !va.fits(mode) => {
                return Err(SpecError::invalid(
                    at,
                    format!("virtual address {va} exceeds {} bits", mode.va_bits()),
                ));
            }
            AddressSpec::Whole(_) => {}
            AddressSpec::Fields(fields) => {
                let widths = vec![mode.vpn_bits(); usize::from(mode.levels())];
                validate_fields(mode, "va.vpn", &widths, fields, at)?;
            }
        }
    }
    Ok(())
}

fn validate_pa(mode: PagingMode, pa: &PaChoice, at: SpecPosition) -> Result<(), SpecError> {
    for pa in non_empty("pa", pa, at)? {
        match pa {
            AddressSpec::Whole(pa) if pa.as_u64() >= mode.pa_limit() => {
                return Err(SpecError::invalid(
                    at,
                    format!("physical address {pa} exceeds {} bits", mode.pa_bits()),
                ));
            }
            AddressSpec::Whole(_) => {}
            AddressSpec::Fields(fields) => {
                validate_fields(mode, "pa.ppn", mode.ppn_widths(), fields, at)?;
            }
        }
    }
    Ok(())
}

fn validate_fields(
    mode: PagingMode,
    field: &str,
    widths: &[u32],
    fields: &AddressFields,
    at: SpecPosition,
) -> Result<(), SpecError> {
    if fields.pages.len() > widths.len() {
        return Err(SpecError::invalid(
            at,
            format!("{} `{field}` fields given, {mode} has {}", fields.pages.len(), widths.len()),
        ));
    }
    for (i, (value, &width)) in fields.pages.iter().zip(widths).enumerate() {
        if let Some(value) = *value
            && value > low_mask(width)
        {
            return Err(SpecError::invalid(
                at,
                format!("`{field}[{i}]` value {value:#x} exceeds {width} bits"),
            ));
        }
    }
    if let Some(offset) = fields.offset
        && offset > low_mask(PAGE_SHIFT)
    {
        return Err(SpecError::invalid(
            at,
            format!("page offset {offset:#x} exceeds {PAGE_SHIFT} bits"),
        ));
    }
    Ok(())
}

fn validate_satp(mode: PagingMode, satp: &SatpSpec, at: SpecPosition) -> Result<(), SpecError> {
    for &ppn in non_empty("satp.ppn", &satp.ppn, at)? {
        if ppn > low_mask(mode.ppn_bits()) {
            return Err(SpecError::invalid(
                at,
                format!("satp.ppn {ppn:#x} exceeds {} bits", mode.ppn_bits()),
            ));
        }
    }
    if u64::from(satp.asid) > low_mask(Satp::asid_bits(mode)) {
        return Err(SpecError::invalid(
            at,
            format!("satp.asid {:#x} exceeds {} bits", satp.asid, Satp::asid_bits(mode)),
        ));
    }
    Ok(())
}

fn validate_page_range(range: &PageRange, at: SpecPosition) -> Result<(), SpecError> {
    if range.step == Some(0) {
        return Err(SpecError::invalid(at, "page_range.step is zero"));
    }
    if let (Some(start), Some(end)) = (range.start, range.end)
        && start >= end
    {
        return Err(SpecError::invalid(
            at,
            format!("page_range.start {start} is not below page_range.end {end}"),
        ));
    }
    if let Some(n) = range.num_pages
        && !usize::try_from(n).is_ok_and(|n| n <= MAX_PAGE_RANGE_SLOTS)
    {
        return Err(SpecError::invalid(
            at,
            format!("page_range has {n} slots, at most {MAX_PAGE_RANGE_SLOTS} are allowed"),
        ));
    }
    Ok(())
}

fn validate_errors(errors: &ErrorSpec, at: SpecPosition) -> Result<(), SpecError> {
    if !errors.switches.is_empty() {
        if !errors.types.is_empty() || !errors.weights.is_empty() {
            return Err(SpecError::invalid(
                at,
                "error switches replace types and weights; give only one form",
            ));
        }
        return Ok(());
    }
    if !errors.weights.is_empty() {
        let types = if errors.types.is_empty() {
            ErrorKind::ALL.len()
        } else {
            errors.types.len()
        };
        if errors.weights.len() != types {
            return Err(SpecError::invalid(
                at,
                format!("{} error weights given for {types} types", errors.weights.len()),
            ));
        }
    }
    if errors.weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(SpecError::invalid(at, "error weights must be finite and non-negative"));
    }
    if errors.weighted_kinds().iter().all(|(_, w)| *w <= 0.0) {
        return Err(SpecError::invalid(at, "every error type has weight zero"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Config {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn choice_from_json_shapes() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(default)]
            a: Choice<PageSize>,
            b: Choice<PageSize>,
            c: Choice<PageSize>,
            d: Choice<PageSize>,
        }
        let h: Holder =
            serde_json::from_str(r#"{ "b": null, "c": "2M", "d": ["4K", "1G"] }"#).unwrap();
        assert_eq!(h.a, Choice::Random);
        assert_eq!(h.b, Choice::Random);
        assert_eq!(h.c, Choice::Fixed(PageSize::Size2M));
        assert_eq!(h.d, Choice::OneOf(vec![PageSize::Size4K, PageSize::Size1G]));
    }

    #[test]
    fn parses_a_full_config() {
        let config = parse(
            r#"{
                "mode": 39,
                "lower_bound": "0x8000_0000",
                "memory_size": "0x1000_0000",
                "pte_min": "0x8000_0000",
                "pte_max": "0x8010_0000",
                "test_cases": [
                    { "repeats": 2, "attributes": { "U": 1, "rsw0": 0.5 } },
                    {
                        "satp": 524288,
                        "ptes": [{ "address": "0x80000ff8", "ppns": [null, [1, 2]] }],
                        "pagesize": ["4K", "2M"],
                        "errors": { "types": ["write_no_read"] }
                    },
                    { "satp": { "ppn": [1, 2], "asid": 3 }, "page_range": { "num_pages": 4, "step": 8192 } }
                ]
            }"#,
        );
        assert_eq!(config.mode, PagingMode::Sv39);
        assert_eq!(config.memory_size, Some(0x1000_0000));
        assert_eq!(config.test_cases.len(), 3);

        let first = &config.test_cases[0];
        assert_eq!(first.attributes.get(&Flag::U), Some(&Probability::ALWAYS));
        assert_eq!(first.attributes.get(&Flag::Rsw0), Some(&Probability::new(0.5)));

        let second = &config.test_cases[1];
        assert_eq!(second.satp.as_ref().unwrap().ppn, Choice::Fixed(524_288));
        assert_eq!(second.ptes[0].ppns, vec![Choice::Random, Choice::OneOf(vec![1, 2])]);
        assert!(second.errors.as_ref().unwrap().p.is_always());

        let third = &config.test_cases[2];
        let satp = third.satp.as_ref().unwrap();
        assert_eq!(satp.asid, 3);
        assert_eq!(satp.ppn, Choice::OneOf(vec![1, 2]));
        assert_eq!(third.page_range.as_ref().unwrap().step, Some(8192));

        let bounds = config.validate().unwrap();
        assert_eq!(bounds.data, 0x8000_0000..0x9000_0000);
        assert_eq!(bounds.tables, 0x8000_0000..0x8010_0000);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_str::<Config>(r#"{ "mode": 39, "test_cases": [{ "repeat": 2 }] }"#);
        assert!(result.is_err());
    }

    #[test]
    fn default_memory_spans_the_physical_space() {
        let bounds = Config::new(PagingMode::Sv48)
            .with_lower_bound(PhysicalAddress::new(0x1000))
            .validate()
            .unwrap();
        assert_eq!(bounds.data, 0x1000..(1 << 56));
        assert_eq!(bounds.tables, bounds.data);
    }

    #[test]
    fn rejects_contradictory_bounds() {
        let config = Config::new(PagingMode::Sv39)
            .with_pte_min(PhysicalAddress::new(0x9000))
            .with_pte_max(PhysicalAddress::new(0x8000));
        assert!(config.validate().is_err());

        let config = Config::new(PagingMode::Sv32)
            .with_lower_bound(PhysicalAddress::new(1 << 33))
            .with_memory_size((1_u64 << 33) + 1);
        assert_eq!(config.validate().unwrap_err().position(), SpecPosition::Config);
    }

    #[test]
    fn rejects_page_sizes_foreign_to_the_mode() {
        let config = Config::new(PagingMode::Sv39).with_test_cases(vec![
            TestCaseSpec::default(),
            TestCaseSpec::default().with_pagesize(PageSize::Size4M),
        ]);
        let err = config.validate().unwrap_err();
        assert_eq!(err.position(), SpecPosition::TestCase(1));
    }

    #[test]
    fn rejects_empty_candidate_lists() {
        let spec = TestCaseSpec::default().with_va(VaChoice::OneOf(Vec::new()));
        assert!(spec.validate(PagingMode::Sv39, SpecPosition::TestCase(0)).is_err());
    }

    #[test]
    fn rejects_mismatched_error_weights() {
        let spec = TestCaseSpec::default().with_errors(
            ErrorSpec::default()
                .with_types(vec![ErrorKind::MarkInvalid, ErrorKind::WriteNoRead])
                .with_weights(vec![1.0]),
        );
        assert!(spec.validate(PagingMode::Sv39, SpecPosition::TestCase(0)).is_err());

        let spec = TestCaseSpec::default()
            .with_errors(ErrorSpec::default().with_types(vec![ErrorKind::MarkInvalid]).with_weights(vec![0.0]));
        assert!(spec.validate(PagingMode::Sv39, SpecPosition::TestCase(0)).is_err());
    }

    #[test]
    fn rejects_special_index_out_of_range() {
        let spec = TestCaseSpec::default()
            .with_repeats(3_u32)
            .with_special(vec![SpecialCase::default().with_index(3_usize)]);
        assert!(spec.validate(PagingMode::Sv39, SpecPosition::TestCase(0)).is_err());
    }

    #[test]
    fn rejects_oversized_page_ranges() {
        let spec = TestCaseSpec::default()
            .with_page_range(PageRange::default().with_num_pages(65_537_u64));
        assert!(spec.validate(PagingMode::Sv39, SpecPosition::TestCase(0)).is_err());
    }

    #[test]
    fn rejects_misaligned_entry_addresses() {
        let spec = TestCaseSpec::default()
            .with_ptes(vec![PteSpec::default().with_address(PhysicalAddress::new(0x8000_0004))]);
        assert!(spec.validate(PagingMode::Sv39, SpecPosition::TestCase(0)).is_err());
        assert!(spec.validate(PagingMode::Sv32, SpecPosition::TestCase(0)).is_ok());
    }

    #[test]
    fn dotted_satp_keys_accept_hex() {
        let config = parse(
            r#"{
                "mode": "Sv39",
                "satp.ppn": "0x80010",
                "test_cases": [
                    { "satp.ppn": "0x80100", "satp.asid": 4 },
                    { "satp": { "ppn": 1, "asid": 1 }, "satp.ppn": 524800 },
                    { "satp": ["0x80300", 525056] }
                ]
            }"#,
        );
        assert_eq!(config.resolved_satp().unwrap().ppn, Choice::Fixed(0x8_0010));

        let first = config.test_cases[0].resolved_satp().unwrap();
        assert_eq!((first.ppn, first.asid), (Choice::Fixed(0x8_0100), 4));

        let second = config.test_cases[1].resolved_satp().unwrap();
        assert_eq!((second.ppn, second.asid), (Choice::Fixed(0x8_0200), 1));

        let third = config.test_cases[2].resolved_satp().unwrap();
        assert_eq!(third.ppn, Choice::OneOf(vec![0x8_0300, 0x8_0300]));

        assert_eq!(TestCaseSpec::default().resolved_satp(), None);
    }

    #[test]
    fn satp_register_rejects_unknown_fields() {
        let result = serde_json::from_str::<Config>(
            r#"{ "mode": 39, "test_cases": [{ "satp": { "ppn": 1, "asdi": 2 } }] }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn ptes_must_fit_every_page_size() {
        let ptes = vec![PteSpec::default(); 2];
        let spec = TestCaseSpec::default()
            .with_pagesize(vec![PageSize::Size4K, PageSize::Size1G])
            .with_ptes(ptes.clone());
        let err = spec.validate(PagingMode::Sv39, SpecPosition::TestCase(0)).unwrap_err();
        assert!(err.to_string().contains("a 1G page in Sv39 has a walk of 1"));

        let spec = spec.with_pagesize(vec![PageSize::Size4K, PageSize::Size2M]);
        assert!(spec.validate(PagingMode::Sv39, SpecPosition::TestCase(0)).is_ok());

        let spec = TestCaseSpec::default()
            .with_pagesize(PageSize::Size1G)
            .with_special(vec![SpecialCase::default().with_ptes(ptes)]);
        assert!(spec.validate(PagingMode::Sv39, SpecPosition::TestCase(0)).is_err());
    }

    #[test]
    fn partial_addresses() {
        let config = parse(
            r#"{
                "mode": "Sv39",
                "test_cases": [
                    { "va": { "vpn": [null, 3, 1], "offset": "0x10" }, "pa": { "ppn": [5] } },
                    { "va": [{ "offset": 8 }, "0x1000"] }
                ]
            }"#,
        );
        let first = &config.test_cases[0];
        let Choice::Fixed(va) = &first.va else { panic!("expected a fixed va") };
        let va = va.constraint(PagingMode::Sv39).unwrap();
        assert_eq!(va.apply(0), 0x4060_0010);
        assert!(!va.fixes_range(PAGE_SHIFT, 21));

        let Choice::Fixed(pa) = &first.pa else { panic!("expected a fixed pa") };
        assert_eq!(pa.constraint(PagingMode::Sv39).unwrap().apply(0), 0x5000);

        assert_eq!(
            config.test_cases[1].va,
            Choice::OneOf(vec![
                AddressSpec::Fields(AddressFields::default().with_offset(8_u64)),
                AddressSpec::Whole(VirtualAddress::new(0x1000)),
            ])
        );
        assert!(config.validate().is_ok());

        let bad = TestCaseSpec::default().with_va(AddressFields::default().with_pages(vec![Some(0x200)]));
        assert!(bad.validate(PagingMode::Sv39, SpecPosition::TestCase(0)).is_err());
        let bad = TestCaseSpec::default().with_pa(AddressFields::default().with_offset(0x1000_u64));
        assert!(bad.validate(PagingMode::Sv39, SpecPosition::TestCase(0)).is_err());
    }

    #[test]
    fn error_switches() {
        let config = parse(
            r#"{ "mode": "Sv39", "test_cases": [{ "errors": { "mark_invalid": 1, "write_no_read": 0 } }] }"#,
        );
        let errors = config.test_cases[0].errors.clone().unwrap();
        assert_eq!(errors.switches.len(), 2);
        assert!(errors.types.is_empty());

        let mut draws = RandomDraws::from_seed(3);
        assert_eq!(errors.draw(&mut draws), Some(vec![(ErrorKind::MarkInvalid, 1.0)]));
        assert_eq!(draws.draws(), 2);

        let off = ErrorSpec::default().with_switches(BTreeMap::from([(
            ErrorKind::LeafAsPointer,
            Probability::NEVER,
        )]));
        assert_eq!(off.draw(&mut draws), None);

        let mixed = TestCaseSpec::default().with_errors(off.with_types(vec![ErrorKind::MarkInvalid]));
        assert!(mixed.validate(PagingMode::Sv39, SpecPosition::TestCase(0)).is_err());

        let mixed = serde_json::from_str::<ErrorSpec>(r#"{ "p": 1, "mark_invalid": 1 }"#);
        assert!(mixed.is_err());
    }

    #[test]
    fn error_kind_defaults() {
        let all = ErrorSpec::default().weighted_kinds();
        assert_eq!(all.len(), ErrorKind::ALL.len());
        assert!(all.iter().all(|(_, w)| (*w - 1.0).abs() < f64::EPSILON));

        let kind: ErrorKind = serde_json::from_str("\"uncleared_superpage\"").unwrap();
        assert_eq!(kind, ErrorKind::UnclearedSuperpage);
    }
}
