use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Leaf mapping sizes across the RISC-V paging modes.
///
/// Which sizes exist depends on the [`PagingMode`](crate::PagingMode): `Sv32`
/// has 4 KiB and 4 MiB pages, the 64-bit modes have 4 KiB, 2 MiB, 1 GiB and,
/// with enough levels, 512 GiB and 256 TiB pages.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageSize {
    /// 4 KiB page, leaf at level 0 in every mode.
    Size4K,
    /// 2 MiB megapage, leaf at level 1 in `Sv39`/`Sv48`/`Sv57`.
    Size2M,
    /// 4 MiB megapage, leaf at level 1 in `Sv32`.
    Size4M,
    /// 1 GiB gigapage, leaf at level 2.
    Size1G,
    /// 512 GiB terapage, leaf at level 3 (`Sv48`, `Sv57`).
    Size512G,
    /// 256 TiB petapage, leaf at level 4 (`Sv57`).
    Size256T,
}

impl PageSize {
    /// All known sizes, smallest first.
    pub const ALL: [Self; 6] = [
        Self::Size4K,
        Self::Size2M,
        Self::Size4M,
        Self::Size1G,
        Self::Size512G,
        Self::Size256T,
    ];

    /// log2 of the size in bytes.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Size4K => 12,
            Self::Size2M => 21,
            Self::Size4M => 22,
            Self::Size1G => 30,
            Self::Size512G => 39,
            Self::Size256T => 48,
        }
    }

    /// Size in bytes.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        1 << self.shift()
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Size4K => "4K",
            Self::Size2M => "2M",
            Self::Size4M => "4M",
            Self::Size1G => "1G",
            Self::Size512G => "512G",
            Self::Size256T => "256T",
        }
    }

    /// Returns `true` for every size larger than 4 KiB.
    #[inline]
    #[must_use]
    pub const fn is_superpage(self) -> bool {
        !matches!(self, Self::Size4K)
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a page-size tag is not recognized.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized page size tag")]
pub struct ParsePageSizeError;

impl FromStr for PageSize {
    type Err = ParsePageSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        Self::ALL
            .into_iter()
            .find(|size| {
                tag.eq_ignore_ascii_case(size.as_str())
                    || tag
                        .strip_suffix(['b', 'B'])
                        .is_some_and(|t| t.eq_ignore_ascii_case(size.as_str()))
            })
            .ok_or(ParsePageSizeError)
    }
}

impl Serialize for PageSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PageSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TagVisitor;

        impl serde::de::Visitor<'_> for TagVisitor {
            type Value = PageSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a page size tag such as \"4K\" or \"2M\"")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<PageSize, E> {
                v.parse()
                    .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_str(TagVisitor)
    }
}
