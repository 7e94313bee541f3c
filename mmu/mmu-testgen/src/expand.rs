//! # Test-Case Expander
//!
//! Turns each [`TestCaseSpec`] into concrete [`Request`]s: `repeats` of them,
//! or one per `page_range` slot. Every [`Choice`] is resolved here, `special`
//! overrides are applied by index and the per-request switches
//! (`same_va_pa`, `aliasing`, `reuse_pte`, `reuse_satp`, `errors.p`) are drawn.
//!
//! Addresses become [`AddressConstraint`]s: whatever a template leaves open
//! is drawn during placement.

use crate::error::{SpecError, SpecPosition};
use crate::pool::{AddressConstraint, Bounds};
use crate::random::RandomDraws;
use crate::spec::{
    Attributes, Choice, Config, ErrorKind, MAX_PAGE_RANGE_SLOTS, PageRange, PteSpec, SpecialCase,
    TestCaseSpec,
};
use log::debug;
use mmu_addresses::{PageSize, PagingMode, PhysicalAddress};

/// Resolved constraints on one entry of the walk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryPlan {
    /// Physical address of the entry itself.
    pub address: Option<PhysicalAddress>,
    /// `PPN` field overrides of the entry's target, `PPN[0]` first.
    pub ppns: Vec<Option<u64>>,
    pub attributes: Attributes,
}

/// One concrete request, ready for the builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Position among all requests of the run.
    pub ordinal: usize,
    /// Index of the template in `test_cases`.
    pub spec_index: usize,
    /// Index of the request within its template (the `special` key).
    pub index: usize,
    pub pagesize: PageSize,
    /// Virtual address bits fixed by the template.
    pub va: AddressConstraint,
    /// Physical address bits fixed by the template or the `page_range` slot.
    pub pa: AddressConstraint,
    /// Forced root table page number.
    pub satp_ppn: Option<u64>,
    /// `ASID` given by the template.
    pub asid: Option<u16>,
    /// One plan per walk entry, root first; the last one is the leaf.
    pub entries: Vec<EntryPlan>,
    pub same_va_pa: bool,
    pub aliasing: bool,
    pub reuse_pte: bool,
    pub reuse_satp: bool,
    /// Kinds to choose from when error injection fired for this request.
    pub inject: Option<Vec<(ErrorKind, f64)>>,
}

impl Request {
    /// The leaf's plan.
    #[must_use]
    pub fn leaf(&self) -> Option<&EntryPlan> {
        self.entries.last()
    }

    #[must_use]
    pub const fn position(&self) -> SpecPosition {
        SpecPosition::TestCase(self.spec_index)
    }
}

/// Expand every template of `config` in order.
///
/// `bounds` must come from [`Config::validate`].
///
/// # Errors
/// [`SpecError::InvalidSpec`] for problems that only show once page sizes are
/// drawn: a walk the chosen page size cannot have, an open-ended `page_range`
/// with too many slots, or a `special` index beyond the resulting count.
pub fn expand(
    config: &Config,
    bounds: &Bounds,
    draws: &mut RandomDraws,
) -> Result<Vec<Request>, SpecError> {
    let mut requests = Vec::new();
    for (spec_index, spec) in config.test_cases.iter().enumerate() {
        let before = requests.len();
        expand_case(config.mode, spec, spec_index, bounds, draws, &mut requests)?;
        debug!(
            "test_cases[{spec_index}] expanded to {} requests",
            requests.len() - before
        );
    }
    Ok(requests)
}

fn expand_case(
    mode: PagingMode,
    spec: &TestCaseSpec,
    spec_index: usize,
    bounds: &Bounds,
    draws: &mut RandomDraws,
    out: &mut Vec<Request>,
) -> Result<(), SpecError> {
    let at = SpecPosition::TestCase(spec_index);
    let first = out.len();

    match &spec.page_range {
        None => {
            for index in 0..spec.known_case_count().unwrap_or(1) {
                let request = resolve(mode, spec, spec_index, index, None, draws, out.len())?;
                out.push(request);
            }
        }
        Some(range) => {
            let mut slots = Slots::new(range, bounds);
            let mut index = 0;
            while let Some(slot) = slots.next_slot() {
                if index >= MAX_PAGE_RANGE_SLOTS {
                    return Err(SpecError::invalid(
                        at,
                        format!("page_range has more than {MAX_PAGE_RANGE_SLOTS} slots"),
                    ));
                }
                let request = resolve(mode, spec, spec_index, index, Some(slot), draws, out.len())?;
                slots.advance(request.pagesize);
                out.push(request);
                index += 1;
            }
        }
    }

    let count = out.len() - first;
    if let Some(special) = spec.special.iter().find(|s| s.index >= count) {
        return Err(SpecError::invalid(
            at,
            format!("special index {} out of range for {count} cases", special.index),
        ));
    }
    Ok(())
}

/// Physical addresses of a `page_range`.
struct Slots {
    next: Option<u64>,
    end: u64,
    remaining: Option<u64>,
    step: Option<u64>,
}

impl Slots {
    fn new(range: &PageRange, bounds: &Bounds) -> Self {
        Self {
            next: Some(range.start.map_or(bounds.data.start, PhysicalAddress::as_u64)),
            end: range.end.map_or(bounds.data.end, PhysicalAddress::as_u64),
            remaining: range.num_pages,
            step: range.step,
        }
    }

    fn next_slot(&self) -> Option<PhysicalAddress> {
        if self.remaining == Some(0) {
            return None;
        }
        self.next
            .filter(|&addr| addr < self.end)
            .map(PhysicalAddress::new)
    }

    /// Move past the slot just used, whose page size was `size`.
    fn advance(&mut self, size: PageSize) {
        let step = self.step.unwrap_or_else(|| size.bytes());
        self.next = self.next.and_then(|addr| addr.checked_add(step));
        self.remaining = self.remaining.map(|n| n.saturating_sub(1));
    }
}

/// Resolve one request. Draw order: addresses, page size, root, entries,
/// then the switches.
fn resolve(
    mode: PagingMode,
    spec: &TestCaseSpec,
    spec_index: usize,
    index: usize,
    slot: Option<PhysicalAddress>,
    draws: &mut RandomDraws,
    ordinal: usize,
) -> Result<Request, SpecError> {
    let at = SpecPosition::TestCase(spec_index);
    let special = spec.special.iter().find(|s| s.index == index);

    let contradiction = |what: &str| SpecError::invalid(at, format!("{what} fields contradict"));
    let va = match overridden(&spec.va, special.map(|s| &s.va)).resolve(draws) {
        Some(va) => va.constraint(mode).ok_or_else(|| contradiction("va"))?,
        None => AddressConstraint::default(),
    };
    let pa = match slot {
        Some(slot) => AddressConstraint::within(mode.pa_bits(), slot.as_u64()),
        None => match overridden(&spec.pa, special.map(|s| &s.pa)).resolve(draws) {
            Some(pa) => pa.constraint(mode).ok_or_else(|| contradiction("pa"))?,
            None => AddressConstraint::default(),
        },
    };

    let pagesize = draw_pagesize(&spec.pagesize, &pa, draws);
    let walk_len = mode.walk_len(pagesize).ok_or_else(|| {
        SpecError::invalid(at, format!("page size {pagesize} does not exist in {mode}"))
    })?;

    let (satp_ppn, asid) = match spec.resolved_satp() {
        Some(satp) => (satp.ppn.resolve(draws), Some(satp.asid)),
        None => (None, None),
    };

    let specs = merge_ptes(&spec.ptes, special.map_or(&[], |s| s.ptes.as_slice()));
    if specs.len() > walk_len {
        return Err(SpecError::invalid(
            at,
            format!(
                "{} ptes given, a {pagesize} page in {mode} has a walk of {walk_len}",
                specs.len()
            ),
        ));
    }

    let mut entries = Vec::with_capacity(walk_len);
    for i in 0..walk_len {
        let pte = specs.get(i);
        let mut plan = EntryPlan {
            address: pte.and_then(|p| p.address.resolve(draws)),
            ppns: pte.map(|p| resolve_ppns(&p.ppns, draws)).unwrap_or_default(),
            attributes: pte.map(|p| p.attributes.clone()).unwrap_or_default(),
        };
        if i + 1 == walk_len {
            leaf_plan(&mut plan, spec, special, draws);
        }
        entries.push(plan);
    }

    let same_va_pa = draws.bernoulli(spec.same_va_pa);
    let aliasing = draws.bernoulli(spec.aliasing);
    let reuse_pte = draws.bernoulli(spec.reuse_pte);
    let reuse_satp = draws.bernoulli(spec.reuse_satp);
    let inject = spec.errors.as_ref().and_then(|errors| errors.draw(draws));

    Ok(Request {
        ordinal,
        spec_index,
        index,
        pagesize,
        va,
        pa,
        satp_ppn,
        asid,
        entries,
        same_va_pa,
        aliasing,
        reuse_pte,
        reuse_satp,
        inject,
    })
}

/// Draw a page size a leaf can map `pa` with.
///
/// Candidates the fixed physical bits are misaligned for are skipped; when
/// none is left, the draw is made among all of them and the builder reports
/// the misalignment.
fn draw_pagesize(
    choice: &Choice<PageSize>,
    pa: &AddressConstraint,
    draws: &mut RandomDraws,
) -> PageSize {
    let fitting: Vec<PageSize> = choice
        .candidates()
        .iter()
        .copied()
        .filter(|&size| pa.aligns_to(size))
        .collect();
    let drawn = match choice {
        Choice::OneOf(_) if !fitting.is_empty() => draws.choose_one(&fitting).copied(),
        choice => choice.resolve(draws),
    };
    drawn.unwrap_or(PageSize::Size4K)
}

/// Merge the template's leaf `ppns`/`attributes` under the leaf entry's own.
fn leaf_plan(
    plan: &mut EntryPlan,
    spec: &TestCaseSpec,
    special: Option<&SpecialCase>,
    draws: &mut RandomDraws,
) {
    let base = resolve_ppns(&spec.ppns, draws);
    let own = std::mem::take(&mut plan.ppns);
    let fields = base.len().max(own.len());
    plan.ppns = (0..fields)
        .map(|i| own.get(i).copied().flatten().or_else(|| base.get(i).copied().flatten()))
        .collect();

    let mut attributes = spec.attributes.clone();
    if let Some(special) = special {
        attributes.extend(special.attributes.iter().map(|(&f, &p)| (f, p)));
    }
    attributes.append(&mut plan.attributes);
    plan.attributes = attributes;
}

/// Overlay `special` entries onto the template's, position by position.
fn merge_ptes(base: &[PteSpec], special: &[PteSpec]) -> Vec<PteSpec> {
    let len = base.len().max(special.len());
    (0..len)
        .map(|i| match (base.get(i), special.get(i)) {
            (Some(base), Some(over)) => {
                let mut merged = base.clone();
                if !over.address.is_random() {
                    merged.address = over.address.clone();
                }
                for (j, ppn) in over.ppns.iter().enumerate() {
                    if ppn.is_random() {
                        continue;
                    }
                    if j >= merged.ppns.len() {
                        merged.ppns.resize(j + 1, Choice::Random);
                    }
                    merged.ppns[j] = ppn.clone();
                }
                merged
                    .attributes
                    .extend(over.attributes.iter().map(|(&f, &p)| (f, p)));
                merged
            }
            (Some(only), None) | (None, Some(only)) => only.clone(),
            (None, None) => PteSpec::default(),
        })
        .collect()
}

fn resolve_ppns(ppns: &[Choice<u64>], draws: &mut RandomDraws) -> Vec<Option<u64>> {
    ppns.iter().map(|c| c.resolve(draws)).collect()
}

/// The `special` value when it is given, the template's otherwise.
fn overridden<'a, T>(base: &'a Choice<T>, special: Option<&'a Choice<T>>) -> &'a Choice<T> {
    special.filter(|c| !c.is_random()).unwrap_or(base)
}
