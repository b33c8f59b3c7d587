//! Range-list merge kernels for [`RankSet`](crate::RankSet) set algebra.
//!
//! Inputs and outputs are sorted, non-overlapping, non-adjacent inclusive
//! ranges; every function preserves that invariant.

use crate::Rank;

type Ranges = Vec<(Rank, Rank)>;

/// Merge two range lists, coalescing overlapping and adjacent ranges.
pub(crate) fn union(a: &[(Rank, Rank)], b: &[(Rank, Rank)]) -> Ranges {
    let mut out: Ranges = Vec::with_capacity(a.len() + b.len());
    let (mut ia, mut ib) = (0, 0);
    while ia < a.len() || ib < b.len() {
        let next = if ib >= b.len() || (ia < a.len() && a[ia].0 <= b[ib].0) {
            let r = a[ia];
            ia += 1;
            r
        } else {
            let r = b[ib];
            ib += 1;
            r
        };
        match out.last_mut() {
            Some(last) if next.0 <= last.1.saturating_add(1) => last.1 = last.1.max(next.1),
            _ => out.push(next),
        }
    }
    out
}

/// The overlapping parts of two range lists.
pub(crate) fn intersection(a: &[(Rank, Rank)], b: &[(Rank, Rank)]) -> Ranges {
    let mut out = Vec::new();
    let (mut ia, mut ib) = (0, 0);
    while ia < a.len() && ib < b.len() {
        let lo = a[ia].0.max(b[ib].0);
        let hi = a[ia].1.min(b[ib].1);
        if lo <= hi {
            out.push((lo, hi));
        }
        if a[ia].1 <= b[ib].1 {
            ia += 1;
        } else {
            ib += 1;
        }
    }
    out
}

/// True if any range of `a` overlaps any range of `b`.
pub(crate) fn intersects(a: &[(Rank, Rank)], b: &[(Rank, Rank)]) -> bool {
    let (mut ia, mut ib) = (0, 0);
    while ia < a.len() && ib < b.len() {
        if a[ia].0.max(b[ib].0) <= a[ia].1.min(b[ib].1) {
            return true;
        }
        if a[ia].1 <= b[ib].1 {
            ia += 1;
        } else {
            ib += 1;
        }
    }
    false
}

/// The parts of `a` not covered by `b`.
pub(crate) fn difference(a: &[(Rank, Rank)], b: &[(Rank, Rank)]) -> Ranges {
    let mut out = Vec::new();
    let mut ib = 0;
    for &(lo, hi) in a {
        while ib < b.len() && b[ib].1 < lo {
            ib += 1;
        }
        let mut j = ib;
        let mut cur = Some(lo);
        while let Some(c) = cur {
            if j >= b.len() || b[j].0 > hi {
                out.push((c, hi));
                cur = None;
            } else {
                if b[j].0 > c {
                    out.push((c, b[j].0 - 1));
                }
                // b[j].1 < hi here, so the successor cannot overflow
                cur = if b[j].1 >= hi { None } else { Some(b[j].1 + 1) };
                j += 1;
            }
        }
    }
    out
}
