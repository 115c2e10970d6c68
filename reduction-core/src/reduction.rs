//! Generic reduction component
//!
//! Both trees in the ledger are instances of one abstraction: a node fans an
//! amount out into bounded children (or not at all) and fans the children's
//! progress back in. The fan-out side is a [`TreeShape`]; the fan-in side is a
//! [`Reduction`].
//!
//! # Last-writer-wins
//!
//! Children report *cumulative* values tagged with the sequence number of the
//! event that produced them. A report replaces the child's entry only when its
//! sequence is newer, so duplicated and reordered deliveries converge on the
//! same aggregate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::split;
use crate::types::{AccountId, Amount, BranchId};
use crate::{Error, Result};

/// Last report received from one child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildReport {
    /// Cumulative amount reported
    pub amount: Amount,
    /// Writer sequence of the report
    pub seq: u64,
}

/// How an incoming report relates to what is already recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    /// Newer than the stored entry (or first report of an admitted child)
    Newer,
    /// Not newer than the stored entry
    Stale,
    /// Child is not part of a closed reduction
    Unknown,
}

/// Children map plus exact aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reduction<K: Ord> {
    children: BTreeMap<K, ChildReport>,
    aggregate: Amount,
    closed: bool,
}

impl<K: Ord + Clone> Default for Reduction<K> {
    fn default() -> Self {
        Self::open()
    }
}

impl<K: Ord + Clone> Reduction<K> {
    /// Reduction admitting only `children`, each starting at zero
    pub fn closed(children: impl IntoIterator<Item = K>) -> Self {
        Self {
            children: children
                .into_iter()
                .map(|k| {
                    (
                        k,
                        ChildReport {
                            amount: Amount::ZERO,
                            seq: 0,
                        },
                    )
                })
                .collect(),
            aggregate: Amount::ZERO,
            closed: true,
        }
    }

    /// Reduction admitting any child on first report
    pub fn open() -> Self {
        Self {
            children: BTreeMap::new(),
            aggregate: Amount::ZERO,
            closed: false,
        }
    }

    /// Classify a report without applying it
    pub fn assess(&self, child: &K, seq: u64) -> Assessment {
        match self.children.get(child) {
            Some(report) if seq > report.seq => Assessment::Newer,
            Some(_) => Assessment::Stale,
            None if self.closed => Assessment::Unknown,
            None => Assessment::Newer,
        }
    }

    /// Aggregate that would result from accepting the report
    pub fn preview(&self, child: &K, amount: Amount) -> Amount {
        let previous = self
            .children
            .get(child)
            .map(|r| r.amount)
            .unwrap_or(Amount::ZERO);
        self.aggregate - previous + amount
    }

    /// Apply a report; returns whether anything changed
    pub fn apply(&mut self, child: K, amount: Amount, seq: u64) -> bool {
        if self.assess(&child, seq) != Assessment::Newer {
            return false;
        }
        self.children.insert(child, ChildReport { amount, seq });
        self.aggregate = self.children.values().map(|r| r.amount).sum();
        true
    }

    /// Exact sum of the latest reports
    pub fn aggregate(&self) -> Amount {
        self.aggregate
    }

    /// Latest report of one child
    pub fn get(&self, child: &K) -> Option<&ChildReport> {
        self.children.get(child)
    }

    /// Known children in key order
    pub fn children(&self) -> impl Iterator<Item = &K> {
        self.children.keys()
    }

    /// Number of known children
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether no child is known
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// Fan-out side of a reduction tree
pub trait TreeShape {
    /// Shares a node of `total` is split into (empty: never splits)
    fn split(&self, total: Amount) -> Result<Vec<Amount>>;

    /// Whether a share terminates the recursion
    fn is_leaf_share(&self, share: Amount) -> bool;
}

/// Withdrawal distribution tree: leaves hold at most `leaf_cap`, every node has
/// at most `fan_out` children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundingShape {
    /// Largest amount a single leaf seeks
    pub leaf_cap: Amount,
    /// Largest number of children per node
    pub fan_out: usize,
}

impl TreeShape for FundingShape {
    fn split(&self, total: Amount) -> Result<Vec<Amount>> {
        split::split_with_fan_out(total, self.leaf_cap, self.fan_out)
    }

    fn is_leaf_share(&self, share: Amount) -> bool {
        share <= self.leaf_cap
    }
}

/// Deposit shard splitting: one level, every share at most `capacity`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityShape {
    /// Largest amount one shard holds
    pub capacity: Amount,
}

impl TreeShape for CapacityShape {
    fn split(&self, total: Amount) -> Result<Vec<Amount>> {
        split::split_by_cap(total, self.capacity)
    }

    fn is_leaf_share(&self, share: Amount) -> bool {
        share <= self.capacity
    }
}

/// Balance aggregation tree: fixed depth, fixed branch factor, fan-in only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationShape {
    /// Depth of the slot level below the root
    pub levels: u32,
    /// Children per branch
    pub branch_factor: u64,
}

impl AggregationShape {
    /// Validated shape; `branch_factor ^ levels` must fit in a `u64`
    pub fn new(levels: u32, branch_factor: u64) -> Result<Self> {
        if levels == 0 || branch_factor < 2 {
            return Err(Error::Config(format!(
                "balance tree needs levels >= 1 and branch factor >= 2 (got {} and {})",
                levels, branch_factor
            )));
        }
        branch_factor.checked_pow(levels).ok_or_else(|| {
            Error::Config(format!(
                "balance tree of {} levels with factor {} overflows",
                levels, branch_factor
            ))
        })?;
        Ok(Self {
            levels,
            branch_factor,
        })
    }

    fn slot_count(&self) -> u64 {
        self.branch_factor.saturating_pow(self.levels)
    }

    /// Bottom slot a contribution source hashes to
    pub fn slot(&self, source: &str) -> u64 {
        let hash = blake3::hash(source.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_be_bytes(prefix) % self.slot_count()
    }

    /// Branch that records a contribution from `source`
    pub fn bottom_branch(&self, account: &AccountId, source: &str) -> BranchId {
        BranchId::new(
            account.clone(),
            self.levels - 1,
            self.slot(source) / self.branch_factor,
        )
    }

    /// Parent of a branch, `None` for the root
    pub fn parent(&self, branch: &BranchId) -> Option<BranchId> {
        if branch.is_root() {
            return None;
        }
        Some(BranchId::new(
            branch.account().clone(),
            branch.level() - 1,
            branch.branch() / self.branch_factor,
        ))
    }
}

impl TreeShape for AggregationShape {
    fn split(&self, _total: Amount) -> Result<Vec<Amount>> {
        Ok(Vec::new())
    }

    fn is_leaf_share(&self, _share: Amount) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cents(c: i64) -> Amount {
        Amount::from_cents(c)
    }

    #[test]
    fn test_last_writer_wins() {
        let mut reduction = Reduction::closed(vec!["a", "b"]);

        assert!(reduction.apply("a", cents(500), 3));
        assert!(reduction.apply("b", cents(200), 1));
        assert_eq!(reduction.aggregate(), cents(700));

        // older report arrives late
        assert!(!reduction.apply("a", cents(100), 2));
        // duplicate
        assert!(!reduction.apply("a", cents(500), 3));
        assert_eq!(reduction.aggregate(), cents(700));

        // cumulative replacement, never summed
        assert!(reduction.apply("a", cents(900), 4));
        assert_eq!(reduction.aggregate(), cents(1100));
    }

    #[test]
    fn test_default_admits_any_child() {
        let mut reduction: Reduction<String> = Reduction::default();
        assert!(reduction.is_empty());
        assert_eq!(reduction.assess(&"deposit:d1".to_string(), 1), Assessment::Newer);
        assert!(reduction.apply("deposit:d1".to_string(), cents(250), 1));
        assert_eq!(reduction.aggregate(), cents(250));
    }

    #[test]
    fn test_closed_rejects_unknown_child() {
        let reduction = Reduction::closed(vec!["a"]);
        assert_eq!(reduction.assess(&"z", 1), Assessment::Unknown);

        let mut open: Reduction<&str> = Reduction::open();
        assert_eq!(open.assess(&"z", 1), Assessment::Newer);
        assert!(open.apply("z", cents(-300), 1));
        assert_eq!(open.aggregate(), cents(-300));
    }

    #[test]
    fn test_preview_matches_apply() {
        let mut reduction = Reduction::closed(vec![1u32, 2]);
        reduction.apply(1, cents(10), 1);
        let expected = reduction.preview(&1, cents(40));
        reduction.apply(1, cents(40), 2);
        assert_eq!(expected, reduction.aggregate());
    }

    #[test]
    fn test_funding_shape() {
        let shape = FundingShape {
            leaf_cap: cents(2500),
            fan_out: 25,
        };
        let shares = shape.split(cents(100_000)).unwrap();
        assert_eq!(shares.len(), 25);
        assert!(shares.iter().all(|s| !shape.is_leaf_share(*s)));
        assert!(shape.is_leaf_share(cents(2500)));
    }

    #[test]
    fn test_aggregation_shape_mapping() {
        let shape = AggregationShape::new(4, 100).unwrap();
        let account = AccountId::new("acct");

        let bottom = shape.bottom_branch(&account, "dep-1");
        assert_eq!(bottom.level(), 3);
        assert!(bottom.branch() < 1_000_000);
        assert_eq!(shape.bottom_branch(&account, "dep-1"), bottom);

        let mut branch = bottom;
        let mut hops = 0;
        while let Some(parent) = shape.parent(&branch) {
            assert_eq!(parent.branch(), branch.branch() / 100);
            branch = parent;
            hops += 1;
        }
        assert_eq!(hops, 3);
        assert!(branch.is_root());
        assert!(shape.split(cents(100)).unwrap().is_empty());
    }

    #[test]
    fn test_aggregation_shape_validation() {
        assert!(AggregationShape::new(0, 100).is_err());
        assert!(AggregationShape::new(4, 1).is_err());
        assert!(AggregationShape::new(40, 100).is_err());
    }
}
