use crate::{PageSize, align_down};
use core::fmt;
use core::ops::{Add, AddAssign};
use serde::de::{self, Visitor};

/// Principal raw memory address ([virtual](crate::VirtualAddress) or
/// [physical](crate::PhysicalAddress)).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddress(u64);

impl MemoryAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The base of the page of `size` that contains this address.
    #[inline]
    #[must_use]
    pub const fn align_down(self, size: PageSize) -> Self {
        Self(align_down(self.0, size.bytes()))
    }

    /// The offset within the page of `size` that contains this address.
    #[inline]
    #[must_use]
    pub const fn offset(self, size: PageSize) -> u64 {
        self.0 & (size.bytes() - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, size: PageSize) -> bool {
        self.offset(size) == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryAddress(0x{:016X})", self.0)
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Add<u64> for MemoryAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for MemoryAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// Error returned by [`parse_address`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseAddressError {
    #[error("empty address")]
    Empty,
    #[error("invalid digit in address")]
    InvalidDigit,
    #[error("address does not fit into 64 bits")]
    Overflow,
}

/// Parse an address written as decimal or as `0x`-prefixed hexadecimal.
///
/// Underscores are accepted as digit separators.
///
/// ```rust
/// # use mmu_addresses::parse_address;
/// assert_eq!(parse_address("0x8000_0000"), Ok(0x8000_0000));
/// assert_eq!(parse_address("4096"), Ok(4096));
/// assert!(parse_address("0xZZ").is_err());
/// ```
pub fn parse_address(text: &str) -> Result<u64, ParseAddressError> {
    let text = text.trim();
    let (digits, radix) = match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => (hex, 16),
        None => (text, 10),
    };

    let mut value: u64 = 0;
    let mut seen = false;
    for c in digits.chars() {
        if c == '_' {
            continue;
        }
        let digit = c.to_digit(radix).ok_or(ParseAddressError::InvalidDigit)?;
        value = value
            .checked_mul(u64::from(radix))
            .and_then(|v| v.checked_add(u64::from(digit)))
            .ok_or(ParseAddressError::Overflow)?;
        seen = true;
    }

    if seen {
        Ok(value)
    } else {
        Err(ParseAddressError::Empty)
    }
}

/// Serde visitor shared by the address newtypes: integers or hex strings.
pub(crate) struct AddressVisitor;

impl Visitor<'_> for AddressVisitor {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an address as integer or \"0x\"-prefixed string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
        u64::try_from(v).map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
        parse_address(v).map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}
