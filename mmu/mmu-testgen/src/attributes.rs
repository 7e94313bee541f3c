//! # Attribute Assigner
//!
//! Sets the flag bits of freshly written entries. Explicit flags are drawn
//! with their probability; omitted flags follow a default policy:
//!
//! | Flag      | Pointer | Leaf                                     |
//! |-----------|---------|------------------------------------------|
//! | `V`       | 1       | 1                                        |
//! | `X W R`   | 0       | one of `R`, `RW`, `X`, `RX`, `RWX`       |
//! | `U G A D` | 0       | coin flip                                |
//! | `RSW`     | 0       | 0                                        |
//!
//! No consistency between explicit flags is enforced; `W = 1, R = 0` is
//! written if asked for.

use crate::random::{Probability, RandomDraws};
use crate::spec::Attributes;
use mmu_entry::{Flag, PteBits};

/// The `X W R` combinations a valid leaf may carry.
pub const LEAF_PERMISSIONS: [u8; 5] = [0b001, 0b011, 0b100, 0b101, 0b111];

const COIN: Probability = Probability::new(0.5);

/// Draw every explicitly given flag; returns the resolved values in flag order.
fn resolve_explicit(explicit: &Attributes, draws: &mut RandomDraws) -> Vec<(Flag, bool)> {
    explicit
        .iter()
        .map(|(&flag, &p)| (flag, draws.bernoulli(p)))
        .collect()
}

/// Set the flags of a pointer entry.
pub fn assign_pointer(pte: PteBits, explicit: &Attributes, draws: &mut RandomDraws) -> PteBits {
    let mut pte = pte.with_flag(Flag::V, true);
    for (flag, on) in resolve_explicit(explicit, draws) {
        pte.set_flag(flag, on);
    }
    pte
}

/// Set the flags of a leaf entry.
pub fn assign_leaf(pte: PteBits, explicit: &Attributes, draws: &mut RandomDraws) -> PteBits {
    let resolved = resolve_explicit(explicit, draws);
    let is_explicit = |flag: Flag| resolved.iter().any(|&(f, _)| f == flag);

    let mut pte = pte.with_flag(Flag::V, true);
    for flag in [Flag::U, Flag::G, Flag::A, Flag::D] {
        if !is_explicit(flag) {
            pte.set_flag(flag, draws.bernoulli(COIN));
        }
    }

    let permission_bits = [(Flag::R, 0b001_u8), (Flag::W, 0b010), (Flag::X, 0b100)];
    let fixed: Vec<(u8, bool)> = permission_bits
        .iter()
        .filter_map(|&(flag, bit)| {
            resolved
                .iter()
                .find(|&&(f, _)| f == flag)
                .map(|&(_, on)| (bit, on))
        })
        .collect();
    let legal: Vec<u8> = LEAF_PERMISSIONS
        .iter()
        .copied()
        .filter(|&xwr| fixed.iter().all(|&(bit, on)| (xwr & bit != 0) == on))
        .collect();

    match draws.choose_one(&legal) {
        Some(&xwr) => pte = pte.with_xwr(xwr),
        None => {
            for (flag, _) in permission_bits {
                if !is_explicit(flag) {
                    pte.set_flag(flag, draws.bernoulli(COIN));
                }
            }
        }
    }

    for (flag, on) in resolved {
        pte.set_flag(flag, on);
    }
    pte
}
