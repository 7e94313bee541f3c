//! # RISC-V Page-Table Entry and `satp` Layouts
//!
//! Bit-level models of the structures a test case consists of: the page-table
//! entries along a walk ([`PteBits`]) and the root pointer ([`Satp`]), plus the
//! named attribute bits a test case may control ([`Flag`]).
//!
//! All layouts are modelled with [`bitfield_struct`]; `Sv32` shares the 64-bit
//! entry type and is cut down to 32 bits by [`PteBits::raw`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::module_name_repetitions)]

mod flag;
mod pte;
mod satp;

pub use crate::flag::{Flag, ParseFlagError};
pub use crate::pte::PteBits;
pub use crate::satp::{Satp, Satp32, Satp64};
