use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An attribute bit of a page-table entry that a test case may control.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Flag {
    /// Valid.
    V,
    /// Readable.
    R,
    /// Writable.
    W,
    /// Executable.
    X,
    /// User-mode accessible.
    U,
    /// Global mapping.
    G,
    /// Accessed.
    A,
    /// Dirty.
    D,
    /// Reserved for supervisor software, bit 8.
    Rsw0,
    /// Reserved for supervisor software, bit 9.
    Rsw1,
}

impl Flag {
    /// All flags in bit order.
    pub const ALL: [Self; 10] = [
        Self::V,
        Self::R,
        Self::W,
        Self::X,
        Self::U,
        Self::G,
        Self::A,
        Self::D,
        Self::Rsw0,
        Self::Rsw1,
    ];

    /// Bit position within the entry.
    #[inline]
    #[must_use]
    pub const fn bit(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::V => "V",
            Self::R => "R",
            Self::W => "W",
            Self::X => "X",
            Self::U => "U",
            Self::G => "G",
            Self::A => "A",
            Self::D => "D",
            Self::Rsw0 => "RSW0",
            Self::Rsw1 => "RSW1",
        }
    }

    /// Returns `true` for `X`, `W` and `R`, the bits that decide leaf vs. pointer.
    #[inline]
    #[must_use]
    pub const fn is_permission(self) -> bool {
        matches!(self, Self::R | Self::W | Self::X)
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an attribute name is not one of [`Flag::ALL`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized attribute flag")]
pub struct ParseFlagError;

impl FromStr for Flag {
    type Err = ParseFlagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|flag| s.eq_ignore_ascii_case(flag.as_str()))
            .ok_or(ParseFlagError)
    }
}

impl Serialize for Flag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Flag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FlagVisitor;

        impl serde::de::Visitor<'_> for FlagVisitor {
            type Value = Flag;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("one of V, R, W, X, U, G, A, D, RSW0, RSW1")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Flag, E> {
                v.parse()
                    .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_str(FlagVisitor)
    }
}
