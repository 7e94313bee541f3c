//! # Address Pool
//!
//! Run-wide allocation state: virtual reservations, physical reservations
//! (data pages and page-table frames), the page-table contents and the
//! registries used for reuse and aliasing.
//!
//! All changes of a request are staged in a [`Transaction`] and only applied
//! by [`AddressPool::commit`]. A request that fails simply drops its
//! transaction and leaves the pool untouched.
//!
//! Placement works on [`AddressConstraint`]s: the bits a request fixes (a
//! forced address, forced VPN indices, PPN overrides) are kept, the remaining
//! page-number bits are drawn.

use crate::case::GeneratedCase;
use crate::error::{GenerationError, Space};
use crate::random::RandomDraws;
use crate::spec::ErrorKind;
use log::trace;
use mmu_addresses::{PAGE_SHIFT, PageSize, PagingMode, PhysicalAddress, VirtualAddress, low_mask};
use mmu_entry::PteBits;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

/// Random draws per placement before giving up with [`GenerationError::PoolExhausted`].
pub const MAX_PLACEMENT_ATTEMPTS: usize = 64;

/// Validated physical bounds of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bounds {
    /// Data pages: `[lower_bound, lower_bound + memory_size)`.
    pub data: Range<u64>,
    /// Page-table frames: `[pte_min, pte_max)`, or the data range.
    pub tables: Range<u64>,
}

/// What a physical reservation holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A mapped page.
    Data { size: PageSize },
    /// A page table at `level`, reachable from `root`.
    Table { level: u8, root: PhysicalAddress },
}

/// A physical reservation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub bytes: u64,
    pub frame: Frame,
    /// Number of mappings; above 1 only for aliased data pages.
    pub refs: u32,
}

/// The role an entry plays in the tables.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryRole {
    Pointer { child: PhysicalAddress },
    Leaf,
}

/// A page-table entry as written by a committed case.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub pte: PteBits,
    pub level: u8,
    pub role: EntryRole,
    /// Defect injected by the case that wrote this leaf.
    pub error: Option<ErrorKind>,
}

/// Registry record of a pointer entry, used by `reuse_pte`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PointerInfo {
    pub root: PhysicalAddress,
    pub level: u8,
    /// The VA bits that select this entry (`VPN[root..=level]`); lower bits zero.
    pub prefix: VirtualAddress,
}

/// Something [`AddressPool::reuse`] can hand out.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Reusable {
    Root(PhysicalAddress),
    Pointer {
        address: PhysicalAddress,
        entry: StoredEntry,
        info: PointerInfo,
    },
}

/// Selection for [`AddressPool::reuse`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReuseKind {
    /// Any root table.
    Root,
    /// A pointer entry above `leaf_level`, optionally restricted to one root.
    Pointer {
        leaf_level: u8,
        root: Option<PhysicalAddress>,
    },
}

/// Address bits fixed by a request.
///
/// ```rust
/// # use mmu_testgen::AddressConstraint;
/// let mut c = AddressConstraint::default();
/// assert!(c.fix(0xff0, 0x120));
/// assert!(c.fix(0xf000, 0x3000));
/// assert!(!c.fix(0x0f0, 0x030)); // contradicts 0x120
/// assert_eq!(c.apply(0xffff_ffff), 0xffff_312f);
/// ```
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct AddressConstraint {
    mask: u64,
    value: u64,
}

impl AddressConstraint {
    /// The constraint of a fully known address.
    #[must_use]
    pub const fn exact(address: u64) -> Self {
        Self {
            mask: u64::MAX,
            value: address,
        }
    }

    /// The constraint of an address of `bits` significant bits.
    #[must_use]
    pub const fn within(bits: u32, address: u64) -> Self {
        let mask = low_mask(bits);
        Self {
            mask,
            value: address & mask,
        }
    }

    #[must_use]
    pub const fn mask(&self) -> u64 {
        self.mask
    }

    /// Returns `true` if no bit is fixed.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.mask == 0
    }

    /// Only the fixed bits at and above bit `bits`.
    #[must_use]
    pub const fn above(&self, bits: u32) -> Self {
        let keep = !low_mask(bits);
        Self {
            mask: self.mask & keep,
            value: self.value & keep,
        }
    }

    /// Only the fixed bits below bit `bits`.
    #[must_use]
    pub const fn below(&self, bits: u32) -> Self {
        let keep = low_mask(bits);
        Self {
            mask: self.mask & keep,
            value: self.value & keep,
        }
    }

    /// Returns `true` if no page-number bit below `size` is fixed to one,
    /// that is, a leaf of `size` can map the constrained page.
    #[must_use]
    pub const fn aligns_to(&self, size: PageSize) -> bool {
        self.value & low_mask(size.shift()) & !low_mask(PAGE_SHIFT) == 0
    }

    /// Fix the bits in `mask` to `value`; `false` if they contradict earlier bits.
    pub const fn fix(&mut self, mask: u64, value: u64) -> bool {
        let value = value & mask;
        let overlap = self.mask & mask;
        if self.value & overlap != value & overlap {
            return false;
        }
        self.mask |= mask;
        self.value |= value;
        true
    }

    /// Merge another constraint into this one; `false` on contradiction.
    pub const fn merge(&mut self, other: &Self) -> bool {
        self.fix(other.mask, other.value)
    }

    /// Overwrite the fixed bits of `address`.
    #[must_use]
    pub const fn apply(&self, address: u64) -> u64 {
        (address & !self.mask) | self.value
    }

    /// Returns `true` if all bits in `[lo, hi)` are fixed.
    #[must_use]
    pub const fn fixes_range(&self, lo: u32, hi: u32) -> bool {
        let wanted = low_mask(hi) & !low_mask(lo);
        self.mask & wanted == wanted
    }

    /// The fixed value, for error reporting.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }

    /// Returns `true` if `address` has all fixed bits.
    #[must_use]
    pub const fn admits(&self, address: u64) -> bool {
        address & self.mask == self.value
    }

    /// Fix `VPN[level]` of a virtual address.
    pub const fn fix_vpn(&mut self, mode: PagingMode, level: u8, index: u64) -> bool {
        let shift = mode.vpn_shift(level);
        self.fix(low_mask(mode.vpn_bits()) << shift, index << shift)
    }

    /// Fix every given `VPN` field, `VPN[0]` first; `None` entries stay free.
    pub fn fix_vpns(&mut self, mode: PagingMode, vpns: &[Option<u64>]) -> bool {
        (0..mode.levels())
            .zip(vpns)
            .filter_map(|(level, v)| v.map(|v| (level, v)))
            .all(|(level, v)| self.fix_vpn(mode, level, v))
    }

    /// Fix `PPN[field]` of a physical address.
    pub fn fix_ppn_field(&mut self, mode: PagingMode, field: usize, value: u64) -> bool {
        let Some(&width) = mode.ppn_widths().get(field) else {
            return true;
        };
        let shift = PAGE_SHIFT + mode.ppn_field_shift(field);
        self.fix(low_mask(width) << shift, value << shift)
    }

    /// Fix every given `PPN` field; `None` entries stay free.
    pub fn fix_ppns(&mut self, mode: PagingMode, ppns: &[Option<u64>]) -> bool {
        ppns.iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (i, v)))
            .all(|(i, v)| self.fix_ppn_field(mode, i, v))
    }
}

/// Purpose of a physical reservation request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Purpose {
    Data,
    /// A root table; its frame is its own root.
    Root { level: u8 },
    Table { level: u8, root: PhysicalAddress },
}

/// Staged changes of one request.
#[derive(Debug, Default)]
pub struct Transaction {
    virt: BTreeMap<u64, u64>,
    phys: BTreeMap<u64, Reservation>,
    aliases: BTreeMap<u64, u32>,
    entries: BTreeMap<PhysicalAddress, StoredEntry>,
    pointers: BTreeMap<PhysicalAddress, PointerInfo>,
    roots: BTreeSet<PhysicalAddress>,
}

impl Transaction {
    /// Register a freshly reserved root table.
    pub fn add_root(&mut self, root: PhysicalAddress) {
        self.roots.insert(root);
    }

    fn stage_physical(&mut self, base: u64, bytes: u64, frame: Frame) {
        trace!("staging {frame:?} at {base:#x} ({bytes:#x} bytes)");
        self.phys.insert(
            base,
            Reservation {
                bytes,
                frame,
                refs: 1,
            },
        );
    }

    /// Returns `true` if nothing has been staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.virt.is_empty()
            && self.phys.is_empty()
            && self.aliases.is_empty()
            && self.entries.is_empty()
    }
}

/// The allocation state of a run.
#[derive(Debug)]
pub struct AddressPool {
    mode: PagingMode,
    bounds: Bounds,
    virt: BTreeMap<u64, u64>,
    phys: BTreeMap<u64, Reservation>,
    entries: BTreeMap<PhysicalAddress, StoredEntry>,
    pointers: BTreeMap<PhysicalAddress, PointerInfo>,
    roots: BTreeSet<PhysicalAddress>,
}

impl AddressPool {
    #[must_use]
    pub const fn new(mode: PagingMode, bounds: Bounds) -> Self {
        Self {
            mode,
            bounds,
            virt: BTreeMap::new(),
            phys: BTreeMap::new(),
            entries: BTreeMap::new(),
            pointers: BTreeMap::new(),
            roots: BTreeSet::new(),
        }
    }

    #[must_use]
    pub const fn mode(&self) -> PagingMode {
        self.mode
    }

    #[must_use]
    pub const fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Apply all staged changes.
    pub fn commit(&mut self, txn: Transaction) {
        self.virt.extend(txn.virt);
        self.phys.extend(txn.phys);
        for (base, extra) in txn.aliases {
            if let Some(reservation) = self.phys.get_mut(&base) {
                reservation.refs += extra;
            }
        }
        self.entries.extend(txn.entries);
        self.pointers.extend(txn.pointers);
        self.roots.extend(txn.roots);
    }

    /// Committed page-table contents, keyed by entry address.
    #[must_use]
    pub const fn entries(&self) -> &BTreeMap<PhysicalAddress, StoredEntry> {
        &self.entries
    }

    /// Committed physical reservations, keyed by base address.
    #[must_use]
    pub const fn reservations(&self) -> &BTreeMap<u64, Reservation> {
        &self.phys
    }

    /// Committed virtual reservations as `(base, bytes)`.
    pub fn virtual_reservations(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.virt.iter().map(|(&base, &bytes)| (base, bytes))
    }

    /// Committed root tables.
    #[must_use]
    pub const fn roots(&self) -> &BTreeSet<PhysicalAddress> {
        &self.roots
    }

    /// The entry stored at `address`, staged or committed.
    #[must_use]
    pub fn entry(&self, txn: &Transaction, address: PhysicalAddress) -> Option<StoredEntry> {
        txn.entries
            .get(&address)
            .or_else(|| self.entries.get(&address))
            .copied()
    }

    /// The reservation starting exactly at `base`, staged or committed.
    #[must_use]
    pub fn reservation(&self, txn: &Transaction, base: PhysicalAddress) -> Option<Reservation> {
        txn.phys
            .get(&base.as_u64())
            .or_else(|| self.phys.get(&base.as_u64()))
            .copied()
    }

    /// Reserve a virtual page of `size` satisfying `constraint`.
    ///
    /// # Errors
    /// - [`GenerationError::AddressConflict`] if a fully fixed address is taken.
    /// - [`GenerationError::PoolExhausted`] if no random placement was found.
    pub fn reserve_virtual(
        &self,
        txn: &mut Transaction,
        size: PageSize,
        constraint: &AddressConstraint,
        draws: &mut RandomDraws,
    ) -> Result<VirtualAddress, GenerationError> {
        let region = 0..self.mode.va_limit();
        let va = self.place(Space::Virtual, &region, size, constraint, draws, |addr| {
            self.virt_free(txn, addr, size)
        })?;
        txn.virt.insert(align(va, size), size.bytes());
        Ok(VirtualAddress::new(va))
    }

    /// Reserve a data page or a table frame satisfying `constraint`.
    ///
    /// # Errors
    /// - [`GenerationError::AddressConflict`] if a fully fixed address is taken.
    /// - [`GenerationError::BoundsViolation`] if a fully fixed address is out of bounds.
    /// - [`GenerationError::PoolExhausted`] if no random placement was found.
    pub fn reserve_physical(
        &self,
        txn: &mut Transaction,
        purpose: Purpose,
        size: PageSize,
        constraint: &AddressConstraint,
        draws: &mut RandomDraws,
    ) -> Result<PhysicalAddress, GenerationError> {
        let (space, region) = match purpose {
            Purpose::Data => (Space::Data, &self.bounds.data),
            Purpose::Root { .. } | Purpose::Table { .. } => (Space::Table, &self.bounds.tables),
        };
        let pa = self.place(space, region, size, constraint, draws, |addr| {
            self.phys_free(txn, addr, size)
        })?;
        let frame = match purpose {
            Purpose::Data => Frame::Data { size },
            Purpose::Root { level } => {
                txn.add_root(PhysicalAddress::new(pa));
                Frame::Table {
                    level,
                    root: PhysicalAddress::new(pa),
                }
            }
            Purpose::Table { level, root } => Frame::Table { level, root },
        };
        txn.stage_physical(align(pa, size), size.bytes(), frame);
        Ok(PhysicalAddress::new(pa))
    }

    /// Reserve a virtual page and a data page at the same address.
    ///
    /// # Errors
    /// As [`reserve_virtual`](Self::reserve_virtual) and
    /// [`reserve_physical`](Self::reserve_physical).
    pub fn reserve_identity(
        &self,
        txn: &mut Transaction,
        size: PageSize,
        constraint: &AddressConstraint,
        draws: &mut RandomDraws,
    ) -> Result<u64, GenerationError> {
        let region = self.bounds.data.start..self.bounds.data.end.min(self.mode.va_limit());
        if region.is_empty() {
            return Err(GenerationError::PoolExhausted {
                space: Space::Virtual,
                attempts: 0,
            });
        }
        let addr = self.place(Space::Data, &region, size, constraint, draws, |addr| {
            self.virt_free(txn, addr, size) && self.phys_free(txn, addr, size)
        })?;
        txn.virt.insert(align(addr, size), size.bytes());
        txn.stage_physical(align(addr, size), size.bytes(), Frame::Data { size });
        Ok(addr)
    }

    /// Map a committed data page once more and bump its reference count.
    ///
    /// Aliasing is intentional overlap; no collision check is made.
    ///
    /// # Errors
    /// [`GenerationError::AddressConflict`] if `existing` is not a committed data page.
    pub fn alias_physical(
        &self,
        txn: &mut Transaction,
        existing: PhysicalAddress,
    ) -> Result<PhysicalAddress, GenerationError> {
        match self.phys.get(&existing.as_u64()) {
            Some(Reservation {
                frame: Frame::Data { .. },
                ..
            }) => {
                *txn.aliases.entry(existing.as_u64()).or_insert(0) += 1;
                Ok(existing)
            }
            _ => Err(GenerationError::AddressConflict {
                space: Space::Data,
                address: existing.as_u64(),
            }),
        }
    }

    /// Committed data pages of `size`, for aliasing.
    #[must_use]
    pub fn data_pages(&self, size: PageSize) -> Vec<PhysicalAddress> {
        self.phys
            .iter()
            .filter(|(_, r)| r.frame == Frame::Data { size })
            .map(|(&base, _)| PhysicalAddress::new(base))
            .collect()
    }

    /// Pick a committed root table or pointer entry, unmodified, among those
    /// `accept` lets through.
    pub fn reuse(
        &self,
        kind: ReuseKind,
        accept: impl Fn(&Reusable) -> bool,
        draws: &mut RandomDraws,
    ) -> Option<Reusable> {
        let candidates: Vec<Reusable> = match kind {
            ReuseKind::Root => self.roots.iter().copied().map(Reusable::Root).collect(),
            ReuseKind::Pointer { leaf_level, root } => self
                .pointers
                .iter()
                .filter(|(_, info)| info.level > leaf_level)
                .filter(|(_, info)| root.is_none_or(|root| info.root == root))
                .filter_map(|(&address, &info)| {
                    self.entries.get(&address).map(|&entry| Reusable::Pointer {
                        address,
                        entry,
                        info,
                    })
                })
                .collect(),
        };
        let candidates: Vec<Reusable> = candidates.into_iter().filter(&accept).collect();
        draws.choose_one(&candidates).copied()
    }

    /// Claim an existing table frame or reserve a fixed one.
    ///
    /// A frame already holding a table at `level` under `root` is returned as
    /// is (`Ok(true)`); a free frame is reserved (`Ok(false)`).
    ///
    /// # Errors
    /// [`GenerationError::AddressConflict`] if the frame holds something else,
    /// [`GenerationError::BoundsViolation`] if it lies outside the table range.
    pub fn claim_table(
        &self,
        txn: &mut Transaction,
        frame: PhysicalAddress,
        level: u8,
        root: PhysicalAddress,
    ) -> Result<bool, GenerationError> {
        let base = frame.align_down(PageSize::Size4K);
        if let Some(existing) = self.reservation(txn, base)
            && existing.frame == (Frame::Table { level, root })
        {
            return Ok(true);
        }
        self.check_bounds(Space::Table, &self.bounds.tables, base.as_u64(), PageSize::Size4K)?;
        if !self.phys_free(txn, base.as_u64(), PageSize::Size4K) {
            return Err(GenerationError::AddressConflict {
                space: Space::Table,
                address: base.as_u64(),
            });
        }
        txn.stage_physical(base.as_u64(), PageSize::Size4K.bytes(), Frame::Table { level, root });
        Ok(false)
    }

    /// Stage the entries a case created (its non-shared entries).
    pub fn stage_case(&self, txn: &mut Transaction, case: &GeneratedCase) {
        let root = case.satp.root();
        let last = case.entries.len().saturating_sub(1);
        for (i, step) in case.entries.iter().enumerate() {
            if step.shared {
                continue;
            }
            let role = if i == last {
                EntryRole::Leaf
            } else {
                let child = case.entries.get(i + 1).map_or(PhysicalAddress::zero(), |next| next.table);
                let prefix = case.va.as_u64() & !low_mask(self.mode.vpn_shift(step.level));
                txn.pointers.insert(
                    step.address,
                    PointerInfo {
                        root,
                        level: step.level,
                        prefix: VirtualAddress::new(prefix),
                    },
                );
                EntryRole::Pointer { child }
            };
            txn.entries.insert(
                step.address,
                StoredEntry {
                    pte: step.pte,
                    level: step.level,
                    role,
                    error: if i == last { case.error } else { None },
                },
            );
        }
    }

    fn virt_free(&self, txn: &Transaction, addr: u64, size: PageSize) -> bool {
        let base = align(addr, size);
        overlap(&self.virt, base, size.bytes(), |&b| b).is_none()
            && overlap(&txn.virt, base, size.bytes(), |&b| b).is_none()
    }

    fn phys_free(&self, txn: &Transaction, addr: u64, size: PageSize) -> bool {
        let base = align(addr, size);
        overlap(&self.phys, base, size.bytes(), |r| r.bytes).is_none()
            && overlap(&txn.phys, base, size.bytes(), |r| r.bytes).is_none()
    }

    fn check_bounds(
        &self,
        space: Space,
        region: &Range<u64>,
        addr: u64,
        size: PageSize,
    ) -> Result<(), GenerationError> {
        let base = align(addr, size);
        let inside = base >= region.start
            && base
                .checked_add(size.bytes())
                .is_some_and(|end| end <= region.end);
        if inside {
            Ok(())
        } else {
            Err(GenerationError::BoundsViolation {
                space,
                address: addr,
                start: region.start,
                end: region.end,
            })
        }
    }

    /// Find an address in `region` satisfying `constraint` for which `free` holds.
    ///
    /// A constraint that fixes every page-number bit is checked once; otherwise
    /// the free bits are drawn up to [`MAX_PLACEMENT_ATTEMPTS`] times.
    fn place(
        &self,
        space: Space,
        region: &Range<u64>,
        size: PageSize,
        constraint: &AddressConstraint,
        draws: &mut RandomDraws,
        free: impl Fn(u64) -> bool,
    ) -> Result<u64, GenerationError> {
        let width = match space {
            Space::Virtual => self.mode.va_bits(),
            _ => self.mode.pa_bits(),
        };

        if constraint.fixes_range(size.shift(), width) {
            let addr = constraint.apply(0) & low_mask(width);
            self.check_bounds(space, region, addr, size)?;
            return if free(addr) {
                Ok(addr)
            } else {
                Err(GenerationError::AddressConflict {
                    space,
                    address: addr,
                })
            };
        }

        let bytes = size.bytes();
        let first = region.start.div_ceil(bytes);
        let last = region.end.checked_sub(bytes).map(|end| end / bytes);
        let Some(last) = last.filter(|&last| last >= first) else {
            return Err(GenerationError::PoolExhausted { space, attempts: 0 });
        };

        for attempt in 0..MAX_PLACEMENT_ATTEMPTS {
            let candidate = draws.uniform_u64(first, last) * bytes;
            let addr = constraint.apply(candidate) & low_mask(width);
            if self.check_bounds(space, region, addr, size).is_err() {
                trace!("{space} candidate {addr:#x} out of bounds (attempt {attempt})");
                continue;
            }
            if free(addr) {
                return Ok(addr);
            }
            trace!("{space} candidate {addr:#x} taken (attempt {attempt})");
        }

        Err(GenerationError::PoolExhausted {
            space,
            attempts: MAX_PLACEMENT_ATTEMPTS,
        })
    }
}

const fn align(addr: u64, size: PageSize) -> u64 {
    mmu_addresses::align_down(addr, size.bytes())
}

/// The first reservation in `map` overlapping `[start, start + len)`.
fn overlap<V>(
    map: &BTreeMap<u64, V>,
    start: u64,
    len: u64,
    bytes_of: impl Fn(&V) -> u64,
) -> Option<u64> {
    if let Some((&base, v)) = map.range(..=start).next_back()
        && base.saturating_add(bytes_of(v)) > start
    {
        return Some(base);
    }
    map.range(start..start.saturating_add(len))
        .next()
        .map(|(&base, _)| base)
}
