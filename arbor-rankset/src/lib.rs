//! Compact sets of overlay ranks.
//!
//! A [`RankSet`] is an ordered set of non-negative integers with the usual
//! set algebra (union, intersection, difference, membership, cardinality)
//! and a canonical string encoding in comma-and-range form, e.g.
//! `0,3-7,12`. The string form is the wire representation used throughout
//! the coordination protocol, so encoding is canonical: every set has
//! exactly one encoding, with maximal ranges and ascending order.

use std::cmp::Ordering;
use std::fmt;
use std::iter::FromIterator;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

mod merge;


/// The integer identity of a node in the overlay.
pub type Rank = u32;

/// An error parsing the comma-and-range encoding of a [`RankSet`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseRanksError {
    /// A comma-separated token was empty, as in `"0,,5"`.
    #[error("empty token in rank set")]
    EmptyToken,

    /// A token was not an integer or an integer range.
    #[error("invalid rank token: {0:?}")]
    InvalidToken(String),

    /// A range token ran high-to-low, as in `"7-3"`.
    #[error("reversed range: {0:?}")]
    ReversedRange(String),
}

/// An ordered set of ranks.
///
/// Stored as sorted, coalesced, inclusive ranges, so sets produced by the
/// topology (contiguous subtrees) stay small regardless of cardinality.
/// Equality on `RankSet` is set equality: the range representation is kept
/// canonical by every operation.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct RankSet {
    /// Sorted, non-overlapping, non-adjacent inclusive ranges.
    ranges: Vec<(Rank, Rank)>,
}

impl RankSet {
    /// The empty set.
    pub fn new() -> RankSet {
        RankSet::default()
    }

    /// The set containing exactly `rank`.
    pub fn single(rank: Rank) -> RankSet {
        RankSet {
            ranges: vec![(rank, rank)],
        }
    }

    /// Returns true if the set contains no ranks.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The number of ranks in the set.
    pub fn count(&self) -> usize {
        self.ranges
            .iter()
            .map(|&(lo, hi)| (hi as u64 - lo as u64 + 1) as usize)
            .sum()
    }

    /// The smallest rank in the set, if any.
    pub fn first(&self) -> Option<Rank> {
        self.ranges.first().map(|&(lo, _)| lo)
    }

    /// Returns true if `rank` is a member.
    pub fn contains(&self, rank: Rank) -> bool {
        self.search(rank).is_ok()
    }

    /// Add a single rank.
    pub fn insert(&mut self, rank: Rank) {
        if let Err(idx) = self.search(rank) {
            let joins_prev = idx > 0 && self.ranges[idx - 1].1 + 1 == rank;
            let joins_next = idx < self.ranges.len() && rank + 1 == self.ranges[idx].0;
            match (joins_prev, joins_next) {
                (true, true) => {
                    self.ranges[idx - 1].1 = self.ranges[idx].1;
                    self.ranges.remove(idx);
                }
                (true, false) => self.ranges[idx - 1].1 = rank,
                (false, true) => self.ranges[idx].0 = rank,
                (false, false) => self.ranges.insert(idx, (rank, rank)),
            }
        }
    }

    /// Add the inclusive range `lo..=hi`.
    pub fn insert_range(&mut self, lo: Rank, hi: Rank) {
        assert!(lo <= hi, "reversed range");
        let single = RankSet {
            ranges: vec![(lo, hi)],
        };
        self.union_with(&single);
    }

    /// Remove a single rank.
    pub fn remove(&mut self, rank: Rank) {
        if let Ok(idx) = self.search(rank) {
            let (lo, hi) = self.ranges[idx];
            match (lo == rank, hi == rank) {
                (true, true) => {
                    self.ranges.remove(idx);
                }
                (true, false) => self.ranges[idx].0 = rank + 1,
                (false, true) => self.ranges[idx].1 = rank - 1,
                (false, false) => {
                    self.ranges[idx].1 = rank - 1;
                    self.ranges.insert(idx + 1, (rank + 1, hi));
                }
            }
        }
    }

    /// Remove every rank.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// The union of `self` and `other` as a new set.
    pub fn union(&self, other: &RankSet) -> RankSet {
        RankSet {
            ranges: merge::union(&self.ranges, &other.ranges),
        }
    }

    /// Add every member of `other` to `self`.
    pub fn union_with(&mut self, other: &RankSet) {
        self.ranges = merge::union(&self.ranges, &other.ranges);
    }

    /// The set of ranks in both `self` and `other`.
    pub fn intersection(&self, other: &RankSet) -> RankSet {
        RankSet {
            ranges: merge::intersection(&self.ranges, &other.ranges),
        }
    }

    /// The set of ranks in `self` but not in `other`.
    pub fn difference(&self, other: &RankSet) -> RankSet {
        RankSet {
            ranges: merge::difference(&self.ranges, &other.ranges),
        }
    }

    /// Returns true if `self` and `other` share at least one rank.
    pub fn intersects(&self, other: &RankSet) -> bool {
        merge::intersects(&self.ranges, &other.ranges)
    }

    /// Returns true if every member of `self` is a member of `other`.
    pub fn is_subset(&self, other: &RankSet) -> bool {
        self.difference(other).is_empty()
    }

    /// Returns true if `self` and `other` share no ranks.
    pub fn is_disjoint(&self, other: &RankSet) -> bool {
        !self.intersects(other)
    }

    /// Iterate over the member ranks in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Rank> + '_ {
        self.ranges.iter().flat_map(|&(lo, hi)| lo..=hi)
    }

    /// Locate `rank`: `Ok(range index)` when a stored range contains it,
    /// `Err(insertion index)` otherwise.
    fn search(&self, rank: Rank) -> Result<usize, usize> {
        self.ranges.binary_search_by(|&(lo, hi)| {
            if rank < lo {
                Ordering::Greater
            } else if rank > hi {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        })
    }
}

impl fmt::Display for RankSet {
    /// The canonical comma-and-range encoding.
    ///
    /// The empty set encodes as the empty string. Decoding any encoding of
    /// a set and re-encoding it always yields this form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, &(lo, hi)) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if lo == hi {
                write!(f, "{}", lo)?;
            } else {
                write!(f, "{}-{}", lo, hi)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for RankSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RankSet({})", self)
    }
}

impl FromStr for RankSet {
    type Err = ParseRanksError;

    /// Decode comma-and-range form.
    ///
    /// Accepts single integers and `lo-hi` ranges in any order, with
    /// overlap; the result is normalized. Rejects empty tokens, reversed
    /// ranges, and anything that is not an unsigned integer.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = RankSet::new();
        if s.is_empty() {
            return Ok(set);
        }
        for token in s.split(',') {
            if token.is_empty() {
                return Err(ParseRanksError::EmptyToken);
            }
            match token.split_once('-') {
                Some((lo, hi)) => {
                    let lo: Rank = lo
                        .parse()
                        .map_err(|_| ParseRanksError::InvalidToken(token.to_string()))?;
                    let hi: Rank = hi
                        .parse()
                        .map_err(|_| ParseRanksError::InvalidToken(token.to_string()))?;
                    if hi < lo {
                        return Err(ParseRanksError::ReversedRange(token.to_string()));
                    }
                    set.insert_range(lo, hi);
                }
                None => {
                    let rank: Rank = token
                        .parse()
                        .map_err(|_| ParseRanksError::InvalidToken(token.to_string()))?;
                    set.insert(rank);
                }
            }
        }
        Ok(set)
    }
}

impl FromIterator<Rank> for RankSet {
    fn from_iter<I: IntoIterator<Item = Rank>>(iter: I) -> RankSet {
        let mut set = RankSet::new();
        for rank in iter {
            set.insert(rank);
        }
        set
    }
}

impl Extend<Rank> for RankSet {
    fn extend<I: IntoIterator<Item = Rank>>(&mut self, iter: I) {
        for rank in iter {
            self.insert(rank);
        }
    }
}

impl Serialize for RankSet {
    /// Rank sets travel on the wire in their string encoding.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RankSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
