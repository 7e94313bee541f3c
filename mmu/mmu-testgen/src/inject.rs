//! # Error Injector
//!
//! Turns a valid walk into one a compliant walker must reject. Only entries
//! written by the case itself are touched; shared entries stay as they are.

use crate::case::GeneratedCase;
use crate::error::GenerationError;
use crate::random::RandomDraws;
use crate::spec::ErrorKind;
use mmu_addresses::low_mask;
use mmu_entry::Flag;

/// Returns `true` if `kind` can be applied to `case`.
///
/// A leaf the case did not write itself is never touched.
#[must_use]
pub fn applies(kind: ErrorKind, case: &GeneratedCase) -> bool {
    let Some(leaf) = case.leaf().filter(|leaf| !leaf.shared) else {
        return false;
    };
    match kind {
        ErrorKind::MarkInvalid | ErrorKind::WriteNoRead => true,
        ErrorKind::LeafAsPointer => leaf.pte.is_leaf(),
        ErrorKind::GlobalNonglobal => deepest_own_pointer(case).is_some(),
        ErrorKind::UnclearedSuperpage => case.is_superpage(),
    }
}

/// Pick one of `kinds` that applies (by weight) and apply it.
///
/// # Errors
/// [`GenerationError::NoApplicableError`] if no kind with a positive weight applies.
pub fn inject(
    case: &mut GeneratedCase,
    kinds: &[(ErrorKind, f64)],
    draws: &mut RandomDraws,
) -> Result<ErrorKind, GenerationError> {
    let candidates: Vec<(ErrorKind, f64)> = kinds
        .iter()
        .copied()
        .filter(|&(kind, _)| applies(kind, case))
        .collect();
    let weights: Vec<f64> = candidates.iter().map(|&(_, w)| w).collect();
    let kind = draws
        .choose_weighted(&weights)
        .and_then(|i| candidates.get(i))
        .map(|&(kind, _)| kind)
        .ok_or(GenerationError::NoApplicableError)?;

    apply(kind, case, draws)?;
    case.error = Some(kind);
    Ok(kind)
}

fn apply(
    kind: ErrorKind,
    case: &mut GeneratedCase,
    draws: &mut RandomDraws,
) -> Result<(), GenerationError> {
    let mode = case.mode;
    let pointer = deepest_own_pointer(case);
    let leaf = case
        .entries
        .last_mut()
        .ok_or(GenerationError::NoApplicableError)?;

    match kind {
        ErrorKind::MarkInvalid => leaf.pte.set_flag(Flag::V, false),
        ErrorKind::WriteNoRead => {
            leaf.pte.set_flag(Flag::W, true);
            leaf.pte.set_flag(Flag::R, false);
        }
        ErrorKind::LeafAsPointer => leaf.pte = leaf.pte.with_xwr(0),
        ErrorKind::UnclearedSuperpage => {
            let width = mode.ppn_widths().first().copied().unwrap_or(0);
            let value = draws.uniform_u64(1, low_mask(width));
            leaf.pte = leaf.pte.with_ppn_field(mode, 0, value);
        }
        ErrorKind::GlobalNonglobal => {
            leaf.pte.set_flag(Flag::G, false);
            let index = pointer.ok_or(GenerationError::NoApplicableError)?;
            if let Some(entry) = case.entries.get_mut(index) {
                entry.pte.set_flag(Flag::G, true);
            }
        }
    }
    Ok(())
}

/// Index of the deepest pointer entry the case wrote itself.
fn deepest_own_pointer(case: &GeneratedCase) -> Option<usize> {
    case.pointers().iter().rposition(|entry| !entry.shared)
}
