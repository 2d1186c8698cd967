//! Key hash ranges restricting what a shuffle consumer reads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A half-open interval `[start, end)` of the partition key space assigned to
/// one destination task group.
///
/// A range whose upper bound is `u32::MAX` also includes `u32::MAX` itself;
/// the exclusive-bound representation has no value one past the top of the
/// key space, and without this the top key would be unreachable.
/// [`HashRange::all`] relies on this and is what one-to-one and broadcast
/// reads use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashRange {
    /// Inclusive lower bound.
    pub start: u32,
    /// Exclusive upper bound, except `u32::MAX`, which is included.
    pub end: u32,
}

impl HashRange {
    /// Creates the range `[start, end)`.
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// The range covering the entire key space.
    pub fn all() -> Self {
        Self {
            start: 0,
            end: u32::MAX,
        }
    }

    /// Returns whether this range covers the entire key space.
    pub fn is_all(&self) -> bool {
        self.start == 0 && self.end == u32::MAX
    }

    /// Returns whether `key` falls inside this range.
    pub fn includes(&self, key: u32) -> bool {
        key >= self.start && (key < self.end || self.end == u32::MAX)
    }
}

impl fmt::Display for HashRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_respects_half_open_bounds() {
        let range = HashRange::new(1, 4);
        assert!(!range.includes(0));
        assert!(range.includes(1));
        assert!(range.includes(3));
        assert!(!range.includes(4));
    }

    #[test]
    fn all_covers_every_key() {
        let all = HashRange::all();
        assert!(all.is_all());
        assert!(all.includes(0));
        assert!(all.includes(u32::MAX - 1));
        assert!(all.includes(u32::MAX));
    }

    #[test]
    fn top_bounded_range_includes_the_top_key() {
        let high = HashRange::new(7, u32::MAX);
        assert!(!high.includes(6));
        assert!(high.includes(u32::MAX));
    }
}
