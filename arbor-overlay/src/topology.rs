//! The overlay tree shape.

use serde::{Deserialize, Serialize};

use arbor_rankset::{Rank, RankSet};

/// A tree of ranks describing the overlay.
///
/// Process-wide constant after startup: the coordinator assumes a fixed,
/// connected tree with stable ranks for the duration of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// The rank at this position in the tree.
    pub rank: Rank,
    /// Subtrees rooted at this rank's direct children.
    #[serde(default)]
    pub children: Vec<Topology>,
}

impl Topology {
    /// A single-rank tree.
    pub fn solo(rank: Rank) -> Topology {
        Topology {
            rank,
            children: Vec::new(),
        }
    }

    /// A complete k-ary tree over ranks `0..size` in heap order: the
    /// children of rank `r` are `k*r + 1 ..= k*r + k`, clipped to `size`.
    pub fn kary(size: u32, fanout: u32) -> Topology {
        assert!(size > 0, "topology must contain at least rank 0");
        assert!(fanout > 0, "fanout must be at least 1");
        Self::kary_subtree(0, size, fanout)
    }

    fn kary_subtree(rank: Rank, size: u32, fanout: u32) -> Topology {
        let children = (1..=fanout)
            .map(|i| fanout * rank + i)
            .take_while(|&child| child < size)
            .map(|child| Self::kary_subtree(child, size, fanout))
            .collect();
        Topology { rank, children }
    }

    /// The subtree rooted at `rank`, if present.
    pub fn find(&self, rank: Rank) -> Option<&Topology> {
        if self.rank == rank {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(rank))
    }

    /// The set of all ranks at or below this node.
    pub fn ranks(&self) -> RankSet {
        let mut set = RankSet::single(self.rank);
        for child in &self.children {
            set.union_with(&child.ranks());
        }
        set
    }

    /// The number of ranks in the tree.
    pub fn size(&self) -> u32 {
        self.ranks().count() as u32
    }

    /// The parent of `rank`, or `None` for this subtree's root and for
    /// unknown ranks.
    pub fn parent_of(&self, rank: Rank) -> Option<Rank> {
        for child in &self.children {
            if child.rank == rank {
                return Some(self.rank);
            }
            if let Some(parent) = child.parent_of(rank) {
                return Some(parent);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kary_heap_layout() {
        arbor_test::init();

        let topo = Topology::kary(7, 2);
        assert_eq!(topo.ranks().to_string(), "0-6");
        assert_eq!(topo.children.len(), 2);
        assert_eq!(topo.children[0].rank, 1);
        assert_eq!(topo.children[1].rank, 2);
        assert_eq!(topo.children[0].ranks().to_string(), "1,3-4");
        assert_eq!(topo.children[1].ranks().to_string(), "2,5-6");

        assert_eq!(topo.parent_of(0), None);
        assert_eq!(topo.parent_of(4), Some(1));
        assert_eq!(topo.parent_of(5), Some(2));
        assert_eq!(topo.parent_of(9), None);
    }

    #[test]
    fn flat_tree_has_one_level() {
        arbor_test::init();

        let topo = Topology::kary(4, 16);
        assert_eq!(topo.children.len(), 3);
        assert!(topo.children.iter().all(|c| c.children.is_empty()));
    }

    #[test]
    fn find_returns_subtrees() {
        arbor_test::init();

        let topo = Topology::kary(7, 2);
        let sub = topo.find(2).expect("rank 2 exists");
        assert_eq!(sub.ranks().to_string(), "2,5-6");
        assert!(topo.find(7).is_none());
    }
}
