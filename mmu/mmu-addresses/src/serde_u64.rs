//! `deserialize_with` helpers for plain `u64` fields (sizes, page numbers)
//! that accept the same notation as the address types.
//!
//! ```rust
//! # use serde::Deserialize;
//! #[derive(Deserialize)]
//! struct Memory {
//!     #[serde(deserialize_with = "mmu_addresses::serde_u64::deserialize")]
//!     size: u64,
//!     #[serde(default, deserialize_with = "mmu_addresses::serde_u64::deserialize_option")]
//!     limit: Option<u64>,
//! }
//!
//! let m: Memory = serde_json::from_str(r#"{ "size": "0x10_0000" }"#).unwrap();
//! assert_eq!(m.size, 0x10_0000);
//! assert_eq!(m.limit, None);
//! ```

use crate::memory_address::AddressVisitor;
use core::fmt;
use serde::Deserializer;
use serde::de::{self, Visitor};

/// Deserialize an integer or a `"0x…"` string.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    deserializer.deserialize_any(AddressVisitor)
}

/// Like [`deserialize`], with `null` read as `None`.
pub fn deserialize_option<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u64>, D::Error> {
    struct OptionVisitor;

    impl<'de> Visitor<'de> for OptionVisitor {
        type Value = Option<u64>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("null, an integer or a \"0x\"-prefixed string")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
            deserialize(d).map(Some)
        }
    }

    deserializer.deserialize_option(OptionVisitor)
}
