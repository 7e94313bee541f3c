use mmu_addresses::PageSize;
use serde::{Serialize, Serializer};
use std::fmt;

/// Where in a [`Config`](crate::Config) an invalid value was found.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpecPosition {
    /// A run-wide field (`mode`, bounds, `satp`).
    Config,
    /// The test case at this index of `test_cases`.
    TestCase(usize),
}

impl fmt::Display for SpecPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => f.write_str("config"),
            Self::TestCase(index) => write!(f, "test_cases[{index}]"),
        }
    }
}

/// A malformed or self-contradictory configuration. Aborts the whole run
/// before anything is allocated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("invalid spec at {position}: {reason}")]
    InvalidSpec {
        position: SpecPosition,
        reason: String,
    },
}

impl SpecError {
    pub(crate) fn invalid(position: SpecPosition, reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            position,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn position(&self) -> SpecPosition {
        match self {
            Self::InvalidSpec { position, .. } => *position,
        }
    }
}

/// The address space a placement was attempted in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Space {
    /// Virtual addresses.
    Virtual,
    /// Physical data pages.
    Data,
    /// Physical page-table frames.
    Table,
    /// A slot (entry) within a page table.
    Entry,
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Virtual => "virtual",
            Self::Data => "data page",
            Self::Table => "page-table frame",
            Self::Entry => "page-table entry",
        })
    }
}

/// Why a single request produced no [`GeneratedCase`](crate::GeneratedCase).
///
/// These are captured per request in the report; the run continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// An explicitly requested value collides with an existing reservation.
    #[error("fixed {space} address {address:#x} collides with an existing reservation")]
    AddressConflict { space: Space, address: u64 },

    /// Random placement failed after every allowed attempt.
    #[error("no free {space} placement found after {attempts} attempts")]
    PoolExhausted { space: Space, attempts: usize },

    /// A resolved address lies outside the configured bounds.
    #[error("{space} address {address:#x} is outside [{start:#x}, {end:#x})")]
    BoundsViolation {
        space: Space,
        address: u64,
        start: u64,
        end: u64,
    },

    /// Page-number bits below a superpage's size are set in the requested
    /// physical address.
    #[error("physical address {address:#x} is not aligned to a {size} page")]
    MisalignedSuperpage { address: u64, size: PageSize },

    /// The virtual and the physical address fix different page offsets.
    #[error("page offsets of virtual {va:#x} and physical {pa:#x} disagree")]
    OffsetMismatch { va: u64, pa: u64 },

    /// Error injection fired, but none of the requested kinds applies to the walk.
    #[error("none of the requested error kinds applies to this walk")]
    NoApplicableError,
}

impl Serialize for GenerationError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
