//! # Random Draw Service
//!
//! Every probabilistic decision of a run goes through [`RandomDraws`], a thin
//! wrapper around a seeded [`StdRng`]. A draw is one call; the same seed and
//! the same call sequence reproduce the same results.

use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A seeded source of draws.
#[derive(Debug, Clone)]
pub struct RandomDraws {
    rng: StdRng,
    draws: u64,
}

impl RandomDraws {
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            draws: 0,
        }
    }

    /// Number of draws taken so far.
    #[must_use]
    pub const fn draws(&self) -> u64 {
        self.draws
    }

    /// A Bernoulli trial with probability `p`.
    ///
    /// Always takes one draw, also for `p = 0` and `p = 1`, so the stream
    /// position only depends on the call sequence.
    ///
    /// ```rust
    /// # use mmu_testgen::{Probability, RandomDraws};
    /// let mut draws = RandomDraws::from_seed(7);
    /// assert!(!draws.bernoulli(Probability::NEVER));
    /// assert!(draws.bernoulli(Probability::ALWAYS));
    /// assert_eq!(draws.draws(), 2);
    /// ```
    pub fn bernoulli(&mut self, p: Probability) -> bool {
        self.draws += 1;
        let x: f64 = self.rng.gen_range(0.0..1.0);
        x < p.get()
    }

    /// A uniform integer in `lo..=hi`. Swapped bounds are reordered.
    pub fn uniform_u64(&mut self, lo: u64, hi: u64) -> u64 {
        self.draws += 1;
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        self.rng.gen_range(lo..=hi)
    }

    /// A uniformly chosen element, or `None` for an empty slice.
    pub fn choose_one<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        self.draws += 1;
        let index = self.rng.gen_range(0..items.len());
        items.get(index)
    }

    /// An index chosen with the given relative weights.
    ///
    /// Negative and non-finite weights count as zero; returns `None` when no
    /// weight is positive.
    pub fn choose_weighted(&mut self, weights: &[f64]) -> Option<usize> {
        let weights = weights
            .iter()
            .map(|&w| if w.is_finite() && w > 0.0 { w } else { 0.0 });
        let dist = WeightedIndex::new(weights).ok()?;
        self.draws += 1;
        Some(self.rng.sample(dist))
    }
}

/// A probability clamped into `[0, 1]`.
///
/// `0` never fires and `1` always fires, so a probability doubles as a switch.
/// NaN reads as `0`. Deserializes from a number or a boolean.
///
/// ```rust
/// # use mmu_testgen::Probability;
/// assert_eq!(Probability::new(1.5), Probability::ALWAYS);
/// assert_eq!(Probability::new(f64::NAN), Probability::NEVER);
/// assert_eq!(Probability::from(true), Probability::ALWAYS);
/// ```
#[derive(Debug, Copy, Clone, Default, PartialEq, PartialOrd)]
pub struct Probability(f64);

impl Probability {
    pub const NEVER: Self = Self(0.0);
    pub const ALWAYS: Self = Self(1.0);

    #[must_use]
    pub const fn new(p: f64) -> Self {
        if p.is_nan() {
            Self::NEVER
        } else {
            Self(p.clamp(0.0, 1.0))
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> f64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn is_never(self) -> bool {
        self.0 <= 0.0
    }

    #[inline]
    #[must_use]
    pub fn is_always(self) -> bool {
        self.0 >= 1.0
    }
}

impl From<f64> for Probability {
    fn from(p: f64) -> Self {
        Self::new(p)
    }
}

impl From<bool> for Probability {
    fn from(on: bool) -> Self {
        if on { Self::ALWAYS } else { Self::NEVER }
    }
}

impl fmt::Display for Probability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Probability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.0)
    }
}

impl<'de> Deserialize<'de> for Probability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ProbabilityVisitor;

        impl serde::de::Visitor<'_> for ProbabilityVisitor {
            type Value = Probability;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a probability as number or boolean")
            }

            fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<Probability, E> {
                Ok(v.into())
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Probability, E> {
                Ok(v.into())
            }

            #[allow(clippy::cast_precision_loss)]
            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Probability, E> {
                Ok(Probability::new(v as f64))
            }

            #[allow(clippy::cast_precision_loss)]
            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Probability, E> {
                Ok(Probability::new(v as f64))
            }
        }

        deserializer.deserialize_any(ProbabilityVisitor)
    }
}
