//! # RISC-V Virtual and Physical Address Types
//!
//! Strongly typed wrappers for raw addresses, page sizes and paging modes used
//! when synthesizing RISC-V page tables.
//!
//! ## Overview
//!
//! | Concept | Description |
//! |----------|-------------|
//! | [`MemoryAddress`] | A raw 64-bit address, either physical or virtual. |
//! | [`VirtualAddress`] | An address translated by the page-table walk. |
//! | [`PhysicalAddress`] | An address of a table frame or a mapped page. |
//! | [`PageSize`] | A leaf mapping size (4 KiB up to 256 TiB). |
//! | [`PagingMode`] | `Sv32`, `Sv39`, `Sv48` or `Sv57`. |
//!
//! Page sizes are chosen at runtime (a test case may pick one of several), so
//! unlike a kernel's marker types, [`PageSize`] is a plain enum and every
//! alignment helper takes it as an argument.
//!
//! ## RISC-V Virtual Address → Physical Address Walk
//!
//! An `Sv39` virtual address is divided into four fields:
//!
//! ```text
//! | 38‒30  | 29‒21  | 20‒12  | 11‒0   |
//! | VPN[2] | VPN[1] | VPN[0] | Offset |
//! ```
//!
//! Each VPN field indexes one level of page tables. Every table is a single
//! 4 KiB frame holding 512 eight-byte entries (1024 four-byte entries in `Sv32`).
//! The walk starts at the root table named by `satp.PPN` and stops at the first
//! **leaf** entry, which may sit above level 0 and then maps a superpage:
//!
//! ```text
//!  satp → L2 table → L1 table → L0 table → 4 KiB page
//!            │          └──────────────────► leaf at L1 → 2 MiB page
//!            └─────────────────────────────► leaf at L2 → 1 GiB page
//! ```
//!
//! ## Typical Usage
//!
//! ```rust
//! # use mmu_addresses::*;
//! let mode = PagingMode::Sv39;
//! let va = VirtualAddress::new(0x4033_0234);
//!
//! assert_eq!(va.vpn(mode, 2), 1);
//! assert_eq!(va.vpn(mode, 1), 1);
//! assert_eq!(va.vpn(mode, 0), 0x130);
//! assert_eq!(va.offset(PageSize::Size4K), 0x234);
//!
//! assert_eq!(mode.leaf_level(PageSize::Size2M), Some(1));
//! assert_eq!(mode.walk_len(PageSize::Size2M), Some(2));
//! ```
//!
//! ## Serialization
//!
//! Addresses deserialize from integers or from `"0x…"` hex strings and
//! serialize as hex strings. Paging modes accept `39` or `"Sv39"`; page sizes
//! use their tags (`"4K"`, `"2M"`, …).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always, clippy::module_name_repetitions)]

mod memory_address;
mod page_size;
mod paging_mode;
mod physical_address;
pub mod serde_u64;
mod virtual_address;

pub use crate::memory_address::{MemoryAddress, ParseAddressError, parse_address};
pub use crate::page_size::{PageSize, ParsePageSizeError};
pub use crate::paging_mode::{PagingMode, ParsePagingModeError};
pub use crate::physical_address::PhysicalAddress;
pub use crate::virtual_address::VirtualAddress;

/// Size of a page-table frame and of the smallest page (4 KiB).
pub const FRAME_SIZE: u64 = 4096;

/// Number of page-offset bits (`log2(FRAME_SIZE)`).
pub const PAGE_SHIFT: u32 = 12;

/// Align `x` down to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use mmu_addresses::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Returns `true` if `x` is a multiple of the power-of-two `a`.
///
/// ```rust
/// # use mmu_addresses::is_aligned;
/// assert!(is_aligned(0x20_0000, 0x20_0000));
/// assert!(!is_aligned(0x20_1000, 0x20_0000));
/// ```
#[inline(always)]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    x & (a - 1) == 0
}

/// A mask with the low `bits` bits set (saturating at 64).
#[inline(always)]
#[must_use]
pub const fn low_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}
