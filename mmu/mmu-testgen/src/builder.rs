//! # Page-Table Builder
//!
//! Builds the walk of one [`Request`] into a [`Transaction`]:
//!
//! 1. **Root**: forced `satp.ppn`, the table of the first entry's forced
//!    address, the root of a reused pointer (`reuse_pte`), a reused root
//!    (`reuse_satp`), the run-wide root, or a fresh frame.
//! 2. **Exact match**: a fully fixed virtual page that is already mapped
//!    under that root is walked again as is; nothing new is written.
//! 3. **Addresses**: the virtual page, then the data page (or an alias, or a
//!    single address for both with `same_va_pa`). The page offset is shared:
//!    offset bits fixed on one side are copied to the other.
//! 4. **Chain**: from the root down to the table holding the leaf, occupied
//!    pointer slots are followed unchanged and empty slots get a pointer to a
//!    new (or forced) child table.
//! 5. **Leaf**: the page number of the data page, with `ppns` overrides
//!    already folded into the physical address.
//!
//! A superpage simply ends the chain early; nothing is built below its leaf.
//! Its data page must be aligned to its size.

use crate::attributes;
use crate::case::{GeneratedCase, WalkEntry};
use crate::error::{GenerationError, Space};
use crate::expand::{EntryPlan, Request};
use crate::pool::{
    AddressConstraint, AddressPool, EntryRole, Purpose, ReuseKind, Reusable, Transaction,
};
use crate::random::RandomDraws;
use log::debug;
use mmu_addresses::{PageSize, PagingMode, PhysicalAddress, VirtualAddress, low_mask};
use mmu_entry::{PteBits, Satp};

/// Why an attempt to build a request failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// A slot collision caused by random choices; another attempt may succeed.
    #[error("page-table slot {address} is taken")]
    Collision { address: PhysicalAddress },

    /// A failure no other attempt can fix.
    #[error(transparent)]
    Failed(#[from] GenerationError),
}

/// Builds walks against an [`AddressPool`].
#[derive(Debug)]
pub struct Builder<'a> {
    pool: &'a AddressPool,
    default_root: Option<Satp>,
}

/// How the root of a walk was found.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RootSource {
    /// Forced by the request or the run-wide `satp`.
    Given,
    /// Picked among existing roots or pointer entries.
    Reused,
    /// Placed at random.
    Fresh,
}

impl<'a> Builder<'a> {
    /// `default_root` is the run-wide root used when a request names none.
    #[must_use]
    pub const fn new(pool: &'a AddressPool, default_root: Option<Satp>) -> Self {
        Self { pool, default_root }
    }

    /// Build the walk of `request`, staging every change in `txn`.
    ///
    /// # Errors
    /// - [`BuildError::Collision`] for collisions another attempt may avoid.
    /// - [`BuildError::Failed`] with the [`GenerationError`] otherwise.
    pub fn build(
        &self,
        txn: &mut Transaction,
        request: &Request,
        draws: &mut RandomDraws,
    ) -> Result<GeneratedCase, BuildError> {
        let pool = self.pool;
        let mode = pool.mode();
        let size = request.pagesize;
        let root_level = mode.root_level();
        let levels: Vec<u8> = (0..=root_level).rev().take(request.entries.len()).collect();
        let leaf_level = levels.last().copied().unwrap_or(root_level);

        // Virtual bits fixed by the request itself.
        let mut va_c = request.va;
        for (plan, &level) in request.entries.iter().zip(&levels) {
            if let Some(address) = plan.address {
                let index = address.offset(PageSize::Size4K) / mode.pte_bytes();
                if !va_c.fix_vpn(mode, level, index) {
                    return Err(conflict(Space::Entry, address.as_u64()));
                }
            }
        }

        let (root, source) = self.resolve_root(txn, request, leaf_level, &mut va_c, draws)?;

        if let Some(case) = self.existing_walk(txn, request, root, &levels, &va_c) {
            debug!(
                "request #{} walks the committed mapping {} -> {} again",
                request.ordinal, case.va, case.pa
            );
            return Ok(case);
        }

        let (va, pa, aliased) = self.reserve_addresses(txn, request, &va_c, draws)?;
        let deterministic =
            source != RootSource::Reused && va_c.fixes_range(size.shift(), mode.va_bits());

        let mut entries = Vec::with_capacity(levels.len());
        let mut table = root;
        for (i, (plan, &level)) in request.entries.iter().zip(&levels).enumerate() {
            let index = va.vpn(mode, level);
            let address = table + index * mode.pte_bytes();
            if let Some(forced) = plan.address
                && forced != address
            {
                return Err(collision(deterministic, forced));
            }

            let next = request.entries.get(i + 1);
            let is_leaf = next.is_none();

            if let Some(existing) = pool.entry(txn, address) {
                let EntryRole::Pointer { child } = existing.role else {
                    return Err(collision(deterministic, address));
                };
                if is_leaf {
                    return Err(collision(deterministic, address));
                }
                if let Some(forced) = next.and_then(|n| n.address)
                    && forced.align_down(PageSize::Size4K) != child
                {
                    return Err(collision(deterministic, forced));
                }
                entries.push(WalkEntry {
                    level,
                    table,
                    index,
                    address,
                    pte: existing.pte,
                    shared: true,
                });
                table = child;
                continue;
            }

            let (pte, child) = if is_leaf {
                (set_leaf(mode, pa.align_down(size), plan, draws), None)
            } else {
                let child = self.ensure_child(txn, plan, next, level - 1, root, draws)?;
                let pte = attributes::assign_pointer(
                    PteBits::pointer(mode, child.ppn()),
                    &plan.attributes,
                    draws,
                );
                (pte, Some(child))
            };
            entries.push(WalkEntry {
                level,
                table,
                index,
                address,
                pte,
                shared: false,
            });
            if let Some(child) = child {
                table = child;
            }
        }

        Ok(GeneratedCase {
            ordinal: request.ordinal,
            spec_index: request.spec_index,
            mode,
            pagesize: size,
            satp: self.satp(request, root),
            va,
            pa,
            entries,
            error: None,
            aliased,
        })
    }

    fn satp(&self, request: &Request, root: PhysicalAddress) -> Satp {
        let asid = request
            .asid
            .or_else(|| self.default_root.map(|satp| satp.asid))
            .unwrap_or(0);
        Satp::new(self.pool.mode(), asid, root.ppn())
    }

    /// The committed walk of the request's virtual page under `root`,
    /// reproduced unchanged.
    ///
    /// Only a fully fixed virtual page qualifies, and only if every entry on
    /// the way already exists, the leaf sits at the requested level and the
    /// mapped page agrees with the request's physical constraints.
    fn existing_walk(
        &self,
        txn: &Transaction,
        request: &Request,
        root: PhysicalAddress,
        levels: &[u8],
        va_c: &AddressConstraint,
    ) -> Option<GeneratedCase> {
        let pool = self.pool;
        let mode = pool.mode();
        let size = request.pagesize;
        if !va_c.fixes_range(size.shift(), mode.va_bits()) {
            return None;
        }
        let page = VirtualAddress::new(va_c.apply(0) & low_mask(mode.va_bits())).align_down(size);

        let mut entries = Vec::with_capacity(levels.len());
        let mut table = root;
        let mut leaf = None;
        for (i, (plan, &level)) in request.entries.iter().zip(levels).enumerate() {
            let index = page.vpn(mode, level);
            let address = table + index * mode.pte_bytes();
            if plan.address.is_some_and(|forced| forced != address) {
                return None;
            }
            let existing = pool.entry(txn, address)?;
            entries.push(WalkEntry {
                level,
                table,
                index,
                address,
                pte: existing.pte,
                shared: true,
            });
            match (existing.role, i + 1 == levels.len()) {
                (EntryRole::Pointer { child }, false) => table = child,
                (EntryRole::Leaf, true) => leaf = Some(existing),
                _ => return None,
            }
        }
        let leaf = leaf?;

        let mut va_c = *va_c;
        let mut pa_c = request.pa;
        if !request.leaf().is_none_or(|plan| pa_c.fix_ppns(mode, &plan.ppns))
            || !link_offsets(&mut va_c, &mut pa_c, size)
        {
            return None;
        }
        let va = VirtualAddress::new(va_c.apply(0) & low_mask(mode.va_bits()));
        let pa = leaf.pte.target(mode).align_down(size) + va.offset(size);
        if !pa_c.admits(pa.as_u64()) || (request.same_va_pa && va.as_u64() != pa.as_u64()) {
            return None;
        }

        Some(GeneratedCase {
            ordinal: request.ordinal,
            spec_index: request.spec_index,
            mode,
            pagesize: size,
            satp: self.satp(request, root),
            va,
            pa,
            entries,
            error: leaf.error,
            aliased: false,
        })
    }

    /// Find or create the root table. A reused pointer entry also fixes the
    /// virtual bits that lead to it.
    fn resolve_root(
        &self,
        txn: &mut Transaction,
        request: &Request,
        leaf_level: u8,
        va_c: &mut AddressConstraint,
        draws: &mut RandomDraws,
    ) -> Result<(PhysicalAddress, RootSource), BuildError> {
        let pool = self.pool;
        let mode = pool.mode();
        let root_level = mode.root_level();

        let from_satp = request.satp_ppn.map(PhysicalAddress::from_ppn);
        let from_entry = request
            .entries
            .first()
            .and_then(|plan| plan.address)
            .map(|a| a.align_down(PageSize::Size4K));
        let forced = match (from_satp, from_entry) {
            (Some(satp), Some(entry)) if satp != entry => {
                return Err(conflict(Space::Table, entry.as_u64()));
            }
            (satp, entry) => satp.or(entry),
        };

        if request.reuse_pte {
            let kind = ReuseKind::Pointer {
                leaf_level,
                root: forced,
            };
            let accept = |candidate: &Reusable| match candidate {
                Reusable::Pointer { info, .. } => prefix_constraint(va_c, mode, info.prefix, info.level)
                    .is_some(),
                Reusable::Root(_) => false,
            };
            match pool.reuse(kind, accept, draws) {
                Some(Reusable::Pointer { address, info, .. }) => {
                    debug!(
                        "request #{} reuses pointer entry {address} (level {}, root {})",
                        request.ordinal, info.level, info.root
                    );
                    if let Some(c) = prefix_constraint(va_c, mode, info.prefix, info.level) {
                        *va_c = c;
                    }
                    return Ok((info.root, RootSource::Reused));
                }
                _ => debug!(
                    "request #{}: no pointer entry to reuse, building a fresh chain",
                    request.ordinal
                ),
            }
        }

        if let Some(root) = forced {
            if !pool.claim_table(txn, root, root_level, root)? {
                txn.add_root(root);
            }
            return Ok((root, RootSource::Given));
        }

        if request.reuse_satp {
            if let Some(Reusable::Root(root)) = pool.reuse(ReuseKind::Root, |_| true, draws) {
                debug!("request #{} reuses root {root}", request.ordinal);
                return Ok((root, RootSource::Reused));
            }
            debug!("request #{}: no root to reuse", request.ordinal);
        }

        if let Some(satp) = self.default_root {
            return Ok((satp.root(), RootSource::Given));
        }

        let root = pool.reserve_physical(
            txn,
            Purpose::Root { level: root_level },
            PageSize::Size4K,
            &AddressConstraint::default(),
            draws,
        )?;
        Ok((root, RootSource::Fresh))
    }

    /// Reserve the virtual and the physical page of the request.
    ///
    /// The returned physical address carries the virtual page offset.
    fn reserve_addresses(
        &self,
        txn: &mut Transaction,
        request: &Request,
        va_c: &AddressConstraint,
        draws: &mut RandomDraws,
    ) -> Result<(VirtualAddress, PhysicalAddress, bool), BuildError> {
        let pool = self.pool;
        let mode = pool.mode();
        let size = request.pagesize;

        let mut pa_c = request.pa;
        if let Some(leaf) = request.leaf()
            && !pa_c.fix_ppns(mode, &leaf.ppns)
        {
            return Err(conflict(Space::Data, pa_c.value()));
        }
        if !pa_c.aligns_to(size) {
            return Err(BuildError::Failed(GenerationError::MisalignedSuperpage {
                address: pa_c.value(),
                size,
            }));
        }
        let mut va_c = *va_c;
        if !link_offsets(&mut va_c, &mut pa_c, size) {
            return Err(BuildError::Failed(GenerationError::OffsetMismatch {
                va: va_c.value(),
                pa: pa_c.value(),
            }));
        }
        let with_offset = |va: VirtualAddress, page: PhysicalAddress| {
            (va, page.align_down(size) + va.offset(size))
        };

        if request.aliasing {
            let page_c = pa_c.above(size.shift());
            let candidates: Vec<PhysicalAddress> = pool
                .data_pages(size)
                .into_iter()
                .filter(|pa| page_c.admits(pa.as_u64()))
                .collect();
            if let Some(&existing) = draws.choose_one(&candidates) {
                let va = pool.reserve_virtual(txn, size, &va_c, draws)?;
                let pa = pool.alias_physical(txn, existing)?;
                debug!("request #{} aliases data page {pa} at {va}", request.ordinal);
                let (va, pa) = with_offset(va, pa);
                return Ok((va, pa, true));
            }
            debug!("request #{}: no {size} data page to alias", request.ordinal);
        }

        if request.same_va_pa {
            let mut both = va_c;
            if !both.merge(&pa_c) {
                return Err(conflict(Space::Virtual, va_c.value()));
            }
            let addr = pool.reserve_identity(txn, size, &both, draws)?;
            return Ok((VirtualAddress::new(addr), PhysicalAddress::new(addr), false));
        }

        let va = pool.reserve_virtual(txn, size, &va_c, draws)?;
        let pa = pool.reserve_physical(txn, Purpose::Data, size, &pa_c, draws)?;
        let (va, pa) = with_offset(va, pa);
        Ok((va, pa, false))
    }

    /// Find or create the child table a new pointer entry leads to.
    fn ensure_child(
        &self,
        txn: &mut Transaction,
        plan: &EntryPlan,
        next: Option<&EntryPlan>,
        level: u8,
        root: PhysicalAddress,
        draws: &mut RandomDraws,
    ) -> Result<PhysicalAddress, BuildError> {
        let pool = self.pool;
        let mode = pool.mode();

        let mut c = AddressConstraint::default();
        if !c.fix_ppns(mode, &plan.ppns) {
            return Err(conflict(Space::Table, c.value()));
        }

        let frame = match next.and_then(|n| n.address) {
            Some(forced) => Some(forced.align_down(PageSize::Size4K)),
            None if c.fixes_range(PageSize::Size4K.shift(), mode.pa_bits()) => {
                Some(PhysicalAddress::new(c.value() & low_mask(mode.pa_bits())))
            }
            None => None,
        };

        match frame {
            Some(frame) => {
                if !c.admits(frame.as_u64()) {
                    return Err(conflict(Space::Table, frame.as_u64()));
                }
                if pool.claim_table(txn, frame, level, root)? {
                    debug!("linking existing level-{level} table {frame}");
                }
                Ok(frame)
            }
            None => Ok(pool.reserve_physical(
                txn,
                Purpose::Table { level, root },
                PageSize::Size4K,
                &c,
                draws,
            )?),
        }
    }
}

/// Write the leaf for `pa`.
fn set_leaf(
    mode: PagingMode,
    pa: PhysicalAddress,
    plan: &EntryPlan,
    draws: &mut RandomDraws,
) -> PteBits {
    attributes::assign_leaf(PteBits::new().with_ppn(mode, pa.ppn()), &plan.attributes, draws)
}

/// Copy the fixed bits below `size` of each address to the other, so that
/// both share one page offset; `false` if they disagree.
fn link_offsets(va: &mut AddressConstraint, pa: &mut AddressConstraint, size: PageSize) -> bool {
    let (va_offset, pa_offset) = (va.below(size.shift()), pa.below(size.shift()));
    va.merge(&pa_offset) && pa.merge(&va_offset)
}

/// `constraint` with `VPN[root..=level]` taken from `prefix`, or `None` if
/// they disagree.
fn prefix_constraint(
    constraint: &AddressConstraint,
    mode: PagingMode,
    prefix: VirtualAddress,
    level: u8,
) -> Option<AddressConstraint> {
    let mut merged = *constraint;
    (level..=mode.root_level())
        .all(|l| merged.fix_vpn(mode, l, prefix.vpn(mode, l)))
        .then_some(merged)
}

const fn conflict(space: Space, address: u64) -> BuildError {
    BuildError::Failed(GenerationError::AddressConflict { space, address })
}

const fn collision(deterministic: bool, address: PhysicalAddress) -> BuildError {
    if deterministic {
        conflict(Space::Entry, address.as_u64())
    } else {
        BuildError::Collision { address }
    }
}
