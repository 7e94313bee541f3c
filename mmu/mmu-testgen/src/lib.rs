//! # RISC-V Page-Table Test-Case Generator
//!
//! Synthesizes concrete, internally consistent page tables for MMU
//! verification from a declarative [`Config`]. A run is deterministic for a
//! given seed.
//!
//! ## What you get
//! - A [`Config`] of [`TestCaseSpec`] templates, loadable with `serde`.
//! - A [`Generator`] that turns them into [`GeneratedCase`]s: a `satp` value,
//!   a virtual and a physical address, and the walk from root to leaf.
//! - A [`GenerationReport`] with one result per request and the final table
//!   contents, printable as a text dump or serializable as JSON.
//!
//! ## Pipeline
//!
//! ```text
//!  Config ─► validate ─► expand ─► Request ─┬─► AddressPool (reserve VA / PA / frames)
//!                                           ├─► Builder     (root → … → leaf)
//!                                           ├─► attributes  (flag bits)
//!                                           ├─► inject      (optional defect)
//!                                           └─► commit      ─► GeneratedCase
//! ```
//!
//! Every change of a request is staged in a [`Transaction`]; a request that
//! fails leaves no trace in the pool, and the run continues with the next one.
//!
//! ## Example
//!
//! ```rust
//! use mmu_testgen::{Config, Generator, PageSize, PagingMode, PhysicalAddress, TestCaseSpec};
//!
//! let config = Config::new(PagingMode::Sv48)
//!     .with_lower_bound(PhysicalAddress::new(0x8000_0000))
//!     .with_memory_size(0x4000_0000_u64)
//!     .with_test_cases(vec![
//!         TestCaseSpec::default().with_repeats(2_u32),
//!         TestCaseSpec::default().with_pagesize(PageSize::Size2M),
//!     ]);
//!
//! let report = Generator::new(config, 7).run()?;
//! for case in report.generated() {
//!     assert_eq!(case.entries.len(), case.mode.walk_len(case.pagesize).unwrap());
//!     println!("{case}");
//! }
//! # Ok::<(), mmu_testgen::SpecError>(())
//! ```

mod attributes;
mod builder;
mod case;
mod error;
mod expand;
mod generator;
mod inject;
mod pool;
mod random;
mod spec;

pub use attributes::{LEAF_PERMISSIONS, assign_leaf, assign_pointer};
pub use builder::{BuildError, Builder};
pub use case::{GeneratedCase, GenerationReport, RequestFailure, TableEntry, WalkEntry};
pub use error::{GenerationError, Space, SpecError, SpecPosition};
pub use expand::{EntryPlan, Request, expand};
pub use generator::{Generator, MAX_REQUEST_ATTEMPTS};
pub use inject::{applies, inject};
pub use pool::{
    AddressConstraint, AddressPool, Bounds, EntryRole, Frame, MAX_PLACEMENT_ATTEMPTS, PointerInfo,
    Purpose, Reservation, ReuseKind, Reusable, StoredEntry, Transaction,
};
pub use random::{Probability, RandomDraws};
pub use spec::{
    AddressFields, AddressSpec, Attributes, Choice, Config, ErrorKind, ErrorSpec,
    MAX_PAGE_RANGE_SLOTS, PaChoice, PageRange, PteSpec, SatpSpec, SpecialCase, TestCaseSpec,
    VaChoice,
};

pub use mmu_addresses::{PageSize, PagingMode, PhysicalAddress, VirtualAddress};
pub use mmu_entry::{Flag, PteBits, Satp};
