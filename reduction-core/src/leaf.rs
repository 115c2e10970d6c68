//! Funding leaf of a withdrawal tree
//!
//! A leaf sources at most `leaf_cap` by probing deposit shards one at a time.
//! Each shard grant replaces that shard's contribution; whenever the leaf is
//! still short it asks for another shard with the remaining amount and the
//! holds it already has, so the relay can top up an existing hold instead of
//! stacking a second one.
//!
//! Terminal states are `funded` and `canceled`. Grants arriving after either
//! are reconciled so no shard keeps a hold the leaf does not account for.
//! A shard that keeps answering a restatement with a different grant is
//! restated at most [`MAX_RESTATEMENTS`] times; later mismatches are logged
//! and left alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::TreeConfig;
use crate::entity::Entity;
use crate::types::{Amount, ShardId, TreeId};
use crate::{Error, Result};

/// Restatements sent to one shard before the leaf stops reconciling it
pub const MAX_RESTATEMENTS: u32 = 3;

/// Leaf commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeafCommand {
    /// Create the leaf (`parent: None` makes it the root of its tree)
    Create {
        /// Creating node
        parent: Option<TreeId>,
        /// Amount to source
        amount: Amount,
    },
    /// A shard granted `amount` to this leaf
    DepositFound {
        /// Granting shard
        shard: ShardId,
        /// Total currently held for this leaf by that shard
        amount: Amount,
    },
    /// No shard currently has available funds
    DepositNotFound,
    /// Release every hold
    Cancel,
}

/// Leaf events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeafEvent {
    /// Leaf created
    LeafCreated {
        /// Leaf id
        id: TreeId,
        /// Parent (`None` for a root leaf)
        parent: Option<TreeId>,
        /// Amount to source
        amount: Amount,
    },
    /// Leaf needs more funds
    DepositSeek {
        /// Leaf id
        id: TreeId,
        /// Still missing
        amount_needed: Amount,
        /// Current contributions by shard
        holds: Vec<(ShardId, Amount)>,
    },
    /// A grant was recorded
    DepositFound {
        /// Leaf id
        id: TreeId,
        /// Parent (`None` for a root leaf)
        parent: Option<TreeId>,
        /// Granting shard
        shard: ShardId,
        /// That shard's contribution
        contribution: Amount,
        /// Sum of all contributions
        amount_funded: Amount,
    },
    /// Leaf sourced its whole amount
    FullyFunded {
        /// Leaf id
        id: TreeId,
        /// Parent (`None` for a root leaf)
        parent: Option<TreeId>,
        /// Amount sourced
        amount: Amount,
    },
    /// Funding failure relayed to the parent
    InsufficientFunds {
        /// Leaf id
        id: TreeId,
        /// Parent to notify
        parent: TreeId,
    },
    /// Leaf canceled; every contribution must be released
    Canceled {
        /// Leaf id
        id: TreeId,
        /// Parent (`None` for a root leaf)
        parent: Option<TreeId>,
        /// Contributions to release
        contributions: Vec<(ShardId, Amount)>,
    },
    /// Late grant the leaf will not use
    ContributionReturned {
        /// Leaf id
        id: TreeId,
        /// Shard holding the unused grant
        shard: ShardId,
        /// Granted amount
        amount: Amount,
    },
    /// Grant disagrees with the recorded contribution of a funded leaf
    ContributionRestated {
        /// Leaf id
        id: TreeId,
        /// Shard to reconcile
        shard: ShardId,
        /// Amount the leaf accounts for
        recorded: Amount,
    },
}

/// Leaf state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingLeaf {
    /// Set once created
    pub id: Option<TreeId>,
    /// Parent (`None` for a root leaf)
    pub parent: Option<TreeId>,
    /// Amount to source
    pub amount_needed: Amount,
    /// Sum of contributions
    pub amount_funded: Amount,
    /// Positive contributions by shard
    pub contributions: BTreeMap<ShardId, Amount>,
    /// Terminal success
    pub funded: bool,
    /// Terminal cancel
    pub canceled: bool,
    /// Insufficient funds already relayed upward
    pub insufficient_reported: bool,
    /// Restatements sent per shard
    pub restatements: BTreeMap<ShardId, u32>,
    /// Last change
    pub updated_at: Option<DateTime<Utc>>,
}

impl FundingLeaf {
    /// Whether the leaf has been created
    pub fn is_created(&self) -> bool {
        self.id.is_some()
    }

    /// Whether this leaf is the root of its tree
    pub fn is_root(&self) -> bool {
        self.is_created() && self.parent.is_none()
    }

    fn require_created(&self, id: &TreeId) -> Result<()> {
        if self.is_created() {
            Ok(())
        } else {
            Err(Error::EntityNotFound(format!("leaf {}", id)))
        }
    }

    fn holds(contributions: &BTreeMap<ShardId, Amount>) -> Vec<(ShardId, Amount)> {
        contributions.iter().map(|(s, a)| (s.clone(), *a)).collect()
    }

    /// Reconcile a grant arriving at a terminal leaf
    fn reconcile_late_grant(&self, id: &TreeId, shard: &ShardId, amount: Amount) -> Vec<LeafEvent> {
        let recorded = if self.canceled {
            None
        } else {
            self.contributions.get(shard).copied()
        };
        match recorded {
            Some(recorded) if recorded == amount => vec![],
            Some(recorded)
                if self.restatements.get(shard).copied().unwrap_or(0) >= MAX_RESTATEMENTS =>
            {
                tracing::warn!(
                    leaf = %id,
                    %shard,
                    %recorded,
                    granted = %amount,
                    "Grant still disagrees after restating; leaving it"
                );
                vec![]
            }
            Some(recorded) => vec![LeafEvent::ContributionRestated {
                id: id.clone(),
                shard: shard.clone(),
                recorded,
            }],
            None if amount.is_positive() => vec![LeafEvent::ContributionReturned {
                id: id.clone(),
                shard: shard.clone(),
                amount,
            }],
            None => vec![],
        }
    }
}

impl Entity for FundingLeaf {
    const KIND: &'static str = "leaf";

    type Id = TreeId;
    type Command = LeafCommand;
    type Event = LeafEvent;

    fn decide(&self, id: &TreeId, command: &LeafCommand, _tree: &TreeConfig) -> Result<Vec<LeafEvent>> {
        match command {
            LeafCommand::Create { parent, amount } => {
                if self.is_created() {
                    return Ok(vec![]);
                }
                let amount = amount.ensure_positive("leaf amount")?;
                if parent.is_none() != id.is_trunk() {
                    return Err(Error::InvalidCommand(format!(
                        "leaf {} parent does not match its position",
                        id
                    )));
                }
                Ok(vec![
                    LeafEvent::LeafCreated {
                        id: id.clone(),
                        parent: parent.clone(),
                        amount,
                    },
                    LeafEvent::DepositSeek {
                        id: id.clone(),
                        amount_needed: amount,
                        holds: vec![],
                    },
                ])
            }

            LeafCommand::DepositFound { shard, amount } => {
                self.require_created(id)?;
                if amount.is_negative() {
                    return Err(Error::InvalidCommand(format!(
                        "negative grant {} from {}",
                        amount, shard
                    )));
                }
                if self.canceled || self.funded {
                    return Ok(self.reconcile_late_grant(id, shard, *amount));
                }

                let previous = self.contributions.get(shard).copied();
                if amount.is_positive() && previous == Some(*amount) {
                    // no progress from this shard
                    return Ok(vec![LeafEvent::DepositSeek {
                        id: id.clone(),
                        amount_needed: self.amount_needed - self.amount_funded,
                        holds: Self::holds(&self.contributions),
                    }]);
                }

                let amount_funded =
                    self.amount_funded - previous.unwrap_or(Amount::ZERO) + *amount;
                if amount_funded > self.amount_needed {
                    return Err(Error::InvariantViolation(format!(
                        "leaf {} funded {} beyond needed {}",
                        id, amount_funded, self.amount_needed
                    )));
                }

                let mut events = vec![LeafEvent::DepositFound {
                    id: id.clone(),
                    parent: self.parent.clone(),
                    shard: shard.clone(),
                    contribution: *amount,
                    amount_funded,
                }];

                if amount_funded >= self.amount_needed {
                    events.push(LeafEvent::FullyFunded {
                        id: id.clone(),
                        parent: self.parent.clone(),
                        amount: self.amount_needed,
                    });
                } else {
                    let mut contributions = self.contributions.clone();
                    if amount.is_positive() {
                        contributions.insert(shard.clone(), *amount);
                    } else {
                        contributions.remove(shard);
                    }
                    events.push(LeafEvent::DepositSeek {
                        id: id.clone(),
                        amount_needed: self.amount_needed - amount_funded,
                        holds: Self::holds(&contributions),
                    });
                }
                Ok(events)
            }

            LeafCommand::DepositNotFound => {
                self.require_created(id)?;
                if self.canceled || self.funded {
                    return Ok(vec![]);
                }
                match &self.parent {
                    None => Ok(vec![LeafEvent::Canceled {
                        id: id.clone(),
                        parent: None,
                        contributions: Self::holds(&self.contributions),
                    }]),
                    Some(_) if self.insufficient_reported => Ok(vec![]),
                    Some(parent) => Ok(vec![LeafEvent::InsufficientFunds {
                        id: id.clone(),
                        parent: parent.clone(),
                    }]),
                }
            }

            LeafCommand::Cancel => {
                self.require_created(id)?;
                if self.canceled {
                    return Ok(vec![]);
                }
                Ok(vec![LeafEvent::Canceled {
                    id: id.clone(),
                    parent: self.parent.clone(),
                    contributions: Self::holds(&self.contributions),
                }])
            }
        }
    }

    fn evolve(&mut self, event: &LeafEvent, at: DateTime<Utc>) {
        match event {
            LeafEvent::LeafCreated { id, parent, amount } => {
                self.id = Some(id.clone());
                self.parent = parent.clone();
                self.amount_needed = *amount;
            }
            LeafEvent::DepositFound {
                shard,
                contribution,
                ..
            } => {
                if contribution.is_positive() {
                    self.contributions.insert(shard.clone(), *contribution);
                } else {
                    self.contributions.remove(shard);
                }
                self.amount_funded = self.contributions.values().sum();
            }
            LeafEvent::FullyFunded { .. } => {
                self.funded = true;
            }
            LeafEvent::InsufficientFunds { .. } => {
                self.insufficient_reported = true;
            }
            LeafEvent::Canceled { .. } => {
                self.canceled = true;
                self.contributions.clear();
                self.amount_funded = Amount::ZERO;
            }
            LeafEvent::ContributionRestated { shard, .. } => {
                *self.restatements.entry(shard.clone()).or_insert(0) += 1;
            }
            LeafEvent::DepositSeek { .. } | LeafEvent::ContributionReturned { .. } => {}
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

    fn shard(deposit: &str) -> ShardId {
        ShardId::new(AccountId::new("acct"), deposit).unwrap()
    }

    fn ids() -> (TreeId, TreeId) {
        let trunk = RootId::new(AccountId::new("acct"), "wd1").unwrap().trunk();
        let leaf = trunk.child(1);
        (trunk, leaf)
    }

    fn run(leaf: &mut FundingLeaf, id: &TreeId, command: LeafCommand) -> Vec<LeafEvent> {
        let events = leaf.decide(id, &command, &TreeConfig::default()).unwrap();
        for event in &events {
            leaf.evolve(event, Utc::now());
        }
        events
    }

    fn created_leaf(needed: &str) -> (FundingLeaf, TreeId) {
        let (trunk, id) = ids();
        let mut leaf = FundingLeaf::default();
        run(&mut leaf, &id, LeafCommand::Create { parent: Some(trunk), amount: amt(needed) });
        (leaf, id)
    }

    #[test]
    fn test_create_seeks_full_amount() {
        let (trunk, id) = ids();
        let mut leaf = FundingLeaf::default();
        let events = run(
            &mut leaf,
            &id,
            LeafCommand::Create { parent: Some(trunk.clone()), amount: amt("24.69") },
        );
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            LeafEvent::DepositSeek { id: id.clone(), amount_needed: amt("24.69"), holds: vec![] }
        );

        assert!(run(&mut leaf, &id, LeafCommand::Create { parent: Some(trunk), amount: amt("24.69") })
            .is_empty());
    }

    #[test]
    fn test_one_cent_short_seeks_again() {
        let (mut leaf, id) = created_leaf("4.94");
        let events = run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d1"), amount: amt("4.93") });

        assert_eq!(leaf.amount_funded, amt("4.93"));
        match &events[1] {
            LeafEvent::DepositSeek { amount_needed, holds, .. } => {
                assert_eq!(*amount_needed, amt("0.01"));
                assert_eq!(holds, &vec![(shard("d1"), amt("4.93"))]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_top_up_replaces_contribution() {
        let (mut leaf, id) = created_leaf("20.00");
        run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d1"), amount: amt("5.00") });
        run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d2"), amount: amt("10.00") });
        // d1 topped its hold up from 5.00 to 10.00
        let events = run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d1"), amount: amt("10.00") });

        assert!(matches!(events[1], LeafEvent::FullyFunded { .. }));
        assert!(leaf.funded);
        assert_eq!(leaf.amount_funded, amt("20.00"));
        assert_eq!(leaf.amount_funded, leaf.contributions.values().sum());
    }

    #[test]
    fn test_repeated_grant_seeks_without_recounting() {
        let (mut leaf, id) = created_leaf("20.00");
        run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d1"), amount: amt("5.00") });
        let events = run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d1"), amount: amt("5.00") });
        assert_eq!(
            events,
            vec![LeafEvent::DepositSeek {
                id: id.clone(),
                amount_needed: amt("15.00"),
                holds: vec![(shard("d1"), amt("5.00"))],
            }]
        );
        assert_eq!(leaf.amount_funded, amt("5.00"));
    }

    #[test]
    fn test_empty_grant_keeps_seeking() {
        let (mut leaf, id) = created_leaf("20.00");
        let events = run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d1"), amount: Amount::ZERO });
        assert!(matches!(&events[1], LeafEvent::DepositSeek { amount_needed, .. } if *amount_needed == amt("20.00")));
        assert!(leaf.contributions.is_empty());
    }

    #[test]
    fn test_overfunding_is_rejected() {
        let (leaf, id) = created_leaf("5.00");
        let err = leaf
            .decide(
                &id,
                &LeafCommand::DepositFound { shard: shard("d1"), amount: amt("6.00") },
                &TreeConfig::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_cancel_lists_contributions_once() {
        let (mut leaf, id) = created_leaf("20.00");
        run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d1"), amount: amt("5.00") });
        run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d2"), amount: amt("7.00") });

        let events = run(&mut leaf, &id, LeafCommand::Cancel);
        match &events[..] {
            [LeafEvent::Canceled { contributions, .. }] => {
                assert_eq!(contributions, &vec![(shard("d1"), amt("5.00")), (shard("d2"), amt("7.00"))]);
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert!(leaf.contributions.is_empty());
        assert_eq!(leaf.amount_funded, Amount::ZERO);
        assert!(run(&mut leaf, &id, LeafCommand::Cancel).is_empty());
    }

    #[test]
    fn test_late_grants_are_reconciled() {
        let (mut leaf, id) = created_leaf("5.00");
        run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d1"), amount: amt("5.00") });
        assert!(leaf.funded);

        // exact duplicate
        assert!(run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d1"), amount: amt("5.00") })
            .is_empty());
        // stale grant from a known shard
        assert_eq!(
            run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d1"), amount: amt("2.00") }),
            vec![LeafEvent::ContributionRestated { id: id.clone(), shard: shard("d1"), recorded: amt("5.00") }]
        );
        // grant from a shard the leaf never counted
        assert_eq!(
            run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d9"), amount: amt("1.00") }),
            vec![LeafEvent::ContributionReturned { id: id.clone(), shard: shard("d9"), amount: amt("1.00") }]
        );

        run(&mut leaf, &id, LeafCommand::Cancel);
        assert_eq!(
            run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d1"), amount: amt("5.00") }),
            vec![LeafEvent::ContributionReturned { id, shard: shard("d1"), amount: amt("5.00") }]
        );
    }

    #[test]
    fn test_restatements_are_bounded_per_shard() {
        let (mut leaf, id) = created_leaf("5.00");
        run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d1"), amount: amt("3.00") });
        run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d2"), amount: amt("2.00") });
        assert!(leaf.funded);

        // d1 keeps answering 1.00 to a restatement of 3.00
        for _ in 0..MAX_RESTATEMENTS {
            let events = run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d1"), amount: amt("1.00") });
            assert!(matches!(&events[..], [LeafEvent::ContributionRestated { recorded, .. }] if *recorded == amt("3.00")));
        }
        assert!(run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d1"), amount: amt("1.00") })
            .is_empty());
        assert_eq!(leaf.restatements.get(&shard("d1")), Some(&MAX_RESTATEMENTS));

        // other shards keep their own budget
        assert_eq!(
            run(&mut leaf, &id, LeafCommand::DepositFound { shard: shard("d2"), amount: amt("1.50") }),
            vec![LeafEvent::ContributionRestated { id, shard: shard("d2"), recorded: amt("2.00") }]
        );
        assert_eq!(leaf.amount_funded, amt("5.00"));
    }

    #[test]
    fn test_not_found_relays_or_self_cancels() {
        let (mut leaf, id) = created_leaf("5.00");
        let events = run(&mut leaf, &id, LeafCommand::DepositNotFound);
        assert!(matches!(&events[..], [LeafEvent::InsufficientFunds { .. }]));
        assert!(run(&mut leaf, &id, LeafCommand::DepositNotFound).is_empty());

        let (trunk, _) = ids();
        let mut root_leaf = FundingLeaf::default();
        run(&mut root_leaf, &trunk, LeafCommand::Create { parent: None, amount: amt("5.00") });
        let events = run(&mut root_leaf, &trunk, LeafCommand::DepositNotFound);
        assert!(matches!(&events[..], [LeafEvent::Canceled { parent: None, .. }]));
        assert!(root_leaf.canceled);
    }
}
