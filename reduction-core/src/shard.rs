//! Capacity-bounded deposit shard
//!
//! A deposit lands on its root shard, which keeps at most `shard_capacity`
//! and hands the rest to deterministic child shards. Each shard grants funds
//! to claimants (funding leaves) as holds; one hold per claimant, replaced on
//! every grant.
//!
//! # Invariants
//!
//! - `Σ holds ≤ current_amount`
//! - `available = current_amount − Σ holds ≥ 0`
//! - A created shard grows only within its capacity; it never splits twice

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::TreeConfig;
use crate::entity::Entity;
use crate::reduction::{CapacityShape, TreeShape};
use crate::types::{Amount, ShardId, TreeId};
use crate::{Error, Result};

/// Shard commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardCommand {
    /// Set the amount behind this shard
    ModifyAmount {
        /// New total for this shard and its children
        amount: Amount,
    },
    /// Grant up to `amount` to `claimant`, replacing its hold
    Withdraw {
        /// Funding leaf
        claimant: TreeId,
        /// Total the claimant wants held here
        amount: Amount,
    },
    /// Release the claimant's hold
    CancelWithdrawal {
        /// Funding leaf
        claimant: TreeId,
    },
}

/// Shard events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardEvent {
    /// Amount set (and split when above capacity)
    ModifiedAmount {
        /// Shard id
        id: ShardId,
        /// Requested total
        requested: Amount,
        /// Share retained by this shard
        amount: Amount,
        /// Shares handed to child shards
        children: Vec<(ShardId, Amount)>,
        /// Capacity in effect
        capacity: Amount,
        /// Available after the change
        available: Amount,
    },
    /// Hold granted (possibly zero)
    Withdrawn {
        /// Shard id
        id: ShardId,
        /// Funding leaf
        claimant: TreeId,
        /// Requested total
        requested: Amount,
        /// New hold for the claimant
        granted: Amount,
        /// Available after the grant
        available: Amount,
    },
    /// Hold released
    WithdrawalCanceled {
        /// Shard id
        id: ShardId,
        /// Funding leaf
        claimant: TreeId,
        /// Released amount
        released: Amount,
        /// Available after the release
        available: Amount,
    },
}

impl ShardEvent {
    /// Emitting shard
    pub fn shard(&self) -> &ShardId {
        match self {
            ShardEvent::ModifiedAmount { id, .. }
            | ShardEvent::Withdrawn { id, .. }
            | ShardEvent::WithdrawalCanceled { id, .. } => id,
        }
    }

    /// Shard availability after the event
    pub fn available(&self) -> Amount {
        match self {
            ShardEvent::ModifiedAmount { available, .. }
            | ShardEvent::Withdrawn { available, .. }
            | ShardEvent::WithdrawalCanceled { available, .. } => *available,
        }
    }
}

/// Shard state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositShard {
    /// Set on first `ModifiedAmount`
    pub id: Option<ShardId>,
    /// Capacity recorded at first modification
    pub capacity: Amount,
    /// Largest total ever requested
    pub high_water: Amount,
    /// Share retained by this shard
    pub current_amount: Amount,
    /// Holds by claimant
    pub holds: BTreeMap<TreeId, Amount>,
    /// Child shards created by splitting
    pub children: Vec<ShardId>,
    /// Last change
    pub updated_at: Option<DateTime<Utc>>,
}

impl DepositShard {
    /// Sum of all holds
    pub fn held(&self) -> Amount {
        self.holds.values().sum()
    }

    /// Funds not held by anyone
    pub fn available(&self) -> Amount {
        self.current_amount - self.held()
    }

    /// Funds `claimant` may hold: everything not held by someone else
    pub fn available_to(&self, claimant: &TreeId) -> Amount {
        let own = self.holds.get(claimant).copied().unwrap_or(Amount::ZERO);
        self.available() + own
    }
}

impl Entity for DepositShard {
    const KIND: &'static str = "shard";

    type Id = ShardId;
    type Command = ShardCommand;
    type Event = ShardEvent;

    fn decide(&self, id: &ShardId, command: &ShardCommand, tree: &TreeConfig) -> Result<Vec<ShardEvent>> {
        match command {
            ShardCommand::ModifyAmount { amount } => {
                let amount = amount.ensure_positive("deposit amount")?;
                if amount <= self.high_water {
                    return Ok(vec![]);
                }

                let capacity = if self.id.is_some() {
                    self.capacity
                } else {
                    tree.shard_capacity
                };
                let shares = CapacityShape { capacity }.split(amount)?;
                // children keep their first shares under their own high-water
                // guard, so a second split would count the surplus twice
                if self.id.is_some() && (shares.len() > 1 || !self.children.is_empty()) {
                    return Err(Error::InvalidCommand(format!(
                        "shard {} already holds {}; cannot re-split to {}",
                        id, self.high_water, amount
                    )));
                }
                let (retained, rest) = match shares.split_first() {
                    Some((first, rest)) => (*first, rest),
                    None => {
                        return Err(Error::InvariantViolation(format!(
                            "shard {} split produced no shares",
                            id
                        )))
                    }
                };

                let children = rest
                    .iter()
                    .enumerate()
                    .map(|(i, share)| (id.child(i + 1), *share))
                    .collect::<Vec<_>>();

                tracing::debug!(
                    shard = %id,
                    requested = %amount,
                    retained = %retained,
                    children = children.len(),
                    "Modifying shard amount"
                );

                Ok(vec![ShardEvent::ModifiedAmount {
                    id: id.clone(),
                    requested: amount,
                    amount: retained,
                    children,
                    capacity,
                    available: retained - self.held(),
                }])
            }

            ShardCommand::Withdraw { claimant, amount } => {
                if self.id.is_none() {
                    return Err(Error::EntityNotFound(format!("shard {}", id)));
                }
                let requested = amount.ensure_positive("withdrawal request")?;
                let available_to = self.available_to(claimant);
                let granted = requested.min(available_to);
                Ok(vec![ShardEvent::Withdrawn {
                    id: id.clone(),
                    claimant: claimant.clone(),
                    requested,
                    granted,
                    available: available_to - granted,
                }])
            }

            ShardCommand::CancelWithdrawal { claimant } => match self.holds.get(claimant) {
                Some(released) => Ok(vec![ShardEvent::WithdrawalCanceled {
                    id: id.clone(),
                    claimant: claimant.clone(),
                    released: *released,
                    available: self.available() + *released,
                }]),
                None => Ok(vec![]),
            },
        }
    }

    fn evolve(&mut self, event: &ShardEvent, at: DateTime<Utc>) {
        match event {
            ShardEvent::ModifiedAmount {
                id,
                requested,
                amount,
                children,
                capacity,
                ..
            } => {
                self.id = Some(id.clone());
                self.capacity = *capacity;
                self.high_water = *requested;
                self.current_amount = *amount;
                for (child, _) in children {
                    if !self.children.contains(child) {
                        self.children.push(child.clone());
                    }
                }
            }
            ShardEvent::Withdrawn {
                claimant, granted, ..
            } => {
                if granted.is_positive() {
                    self.holds.insert(claimant.clone(), *granted);
                } else {
                    self.holds.remove(claimant);
                }
            }
            ShardEvent::WithdrawalCanceled { claimant, .. } => {
                self.holds.remove(claimant);
            }
        }
        self.updated_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountId, RootId};

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn shard_id() -> ShardId {
        ShardId::new(AccountId::new("acct"), "dep1").unwrap()
    }

    fn leaf(n: usize) -> TreeId {
        RootId::new(AccountId::new("acct"), "wd1").unwrap().trunk().child(n)
    }

    fn run(shard: &mut DepositShard, command: ShardCommand) -> Vec<ShardEvent> {
        let events = shard.decide(&shard_id(), &command, &TreeConfig::default()).unwrap();
        for event in &events {
            shard.evolve(event, Utc::now());
        }
        events
    }

    fn funded(amount: &str) -> DepositShard {
        let mut shard = DepositShard::default();
        run(&mut shard, ShardCommand::ModifyAmount { amount: amt(amount) });
        shard
    }

    #[test]
    fn test_within_capacity_takes_whole_amount() {
        let shard = funded("10.00");
        assert_eq!(shard.current_amount, amt("10.00"));
        assert!(shard.children.is_empty());
        assert_eq!(shard.available(), amt("10.00"));
    }

    #[test]
    fn test_split_above_capacity() {
        let mut shard = DepositShard::default();
        let events = run(&mut shard, ShardCommand::ModifyAmount { amount: amt("543.21") });
        match &events[..] {
            [ShardEvent::ModifiedAmount { amount, children, .. }] => {
                assert_eq!(*amount, amt("24.70"));
                assert_eq!(children.len(), 21);
                assert_eq!(children[0], (shard_id().child(1), amt("24.70")));
                assert_eq!(children[1].1, amt("24.70"));
                assert_eq!(children[2].1, amt("24.69"));
                let total: Amount = children.iter().map(|(_, a)| *a).sum::<Amount>() + *amount;
                assert_eq!(total, amt("543.21"));
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_high_water_guard() {
        let mut shard = funded("543.21");
        assert!(run(&mut shard, ShardCommand::ModifyAmount { amount: amt("543.21") }).is_empty());
        assert!(run(&mut shard, ShardCommand::ModifyAmount { amount: amt("24.70") }).is_empty());
        assert_eq!(shard.current_amount, amt("24.70"));
    }

    #[test]
    fn test_withdraw_grants_min_and_replaces_hold() {
        let mut shard = funded("10.00");
        let events = run(&mut shard, ShardCommand::Withdraw { claimant: leaf(1), amount: amt("4.00") });
        assert!(matches!(
            events[0],
            ShardEvent::Withdrawn { granted, available, .. } if granted == amt("4.00") && available == amt("6.00")
        ));

        let events = run(&mut shard, ShardCommand::Withdraw { claimant: leaf(2), amount: amt("25.00") });
        assert!(matches!(events[0], ShardEvent::Withdrawn { granted, .. } if granted == amt("6.00")));
        assert_eq!(shard.available(), Amount::ZERO);

        // leaf 1 tops up; only its own hold is available to it
        let events = run(&mut shard, ShardCommand::Withdraw { claimant: leaf(1), amount: amt("9.00") });
        assert!(matches!(events[0], ShardEvent::Withdrawn { granted, .. } if granted == amt("4.00")));
        assert_eq!(shard.holds.len(), 2);
        assert!(shard.held() <= shard.current_amount);
    }

    #[test]
    fn test_cancel_releases_hold() {
        let mut shard = funded("10.00");
        run(&mut shard, ShardCommand::Withdraw { claimant: leaf(1), amount: amt("4.00") });
        let events = run(&mut shard, ShardCommand::CancelWithdrawal { claimant: leaf(1) });
        assert!(matches!(
            events[0],
            ShardEvent::WithdrawalCanceled { released, available, .. } if released == amt("4.00") && available == amt("10.00")
        ));
        assert!(run(&mut shard, ShardCommand::CancelWithdrawal { claimant: leaf(1) }).is_empty());
    }

    #[test]
    fn test_growth_within_capacity() {
        let mut shard = funded("10.00");
        run(&mut shard, ShardCommand::Withdraw { claimant: leaf(1), amount: amt("4.00") });
        let events = run(&mut shard, ShardCommand::ModifyAmount { amount: amt("25.00") });
        assert!(matches!(
            events[..],
            [ShardEvent::ModifiedAmount { amount, available, ref children, .. }]
                if amount == amt("25.00") && available == amt("21.00") && children.is_empty()
        ));
        assert_eq!(shard.high_water, amt("25.00"));
    }

    #[test]
    fn test_created_shard_never_resplits() {
        let mut shard = funded("20.00");
        run(&mut shard, ShardCommand::Withdraw { claimant: leaf(1), amount: amt("20.00") });
        let err = shard
            .decide(&shard_id(), &ShardCommand::ModifyAmount { amount: amt("45.00") }, &TreeConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCommand(_)));

        // a split parent cannot grow either, even within its own capacity
        let mut parent = funded("30.00");
        assert_eq!(parent.current_amount, amt("15.00"));
        let err = parent
            .decide(&shard_id(), &ShardCommand::ModifyAmount { amount: amt("31.00") }, &TreeConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCommand(_)));
        assert!(run(&mut parent, ShardCommand::ModifyAmount { amount: amt("30.00") }).is_empty());
    }

    #[test]
    fn test_withdraw_before_deposit_is_transient() {
        let shard = DepositShard::default();
        let err = shard
            .decide(
                &shard_id(),
                &ShardCommand::Withdraw { claimant: leaf(1), amount: amt("1.00") },
                &TreeConfig::default(),
            )
            .unwrap_err();
        assert!(err.is_transient());
    }
}
