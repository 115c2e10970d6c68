//! Relay table: published event → derived directives
//!
//! Every edge of the protocol is one stateless rule here. Rules read only the
//! event payload (plus the shard index for discovery), so redelivering an
//! event derives the same commands, and the receiving entities absorb the
//! duplicates.
//!
//! | Event | Directives |
//! |---|---|
//! | node `BranchCreated` | `CreateBranch` / leaf `Create` per share |
//! | node `Updated` (branch) | parent `UpdateChildProgress` |
//! | node `Approved` | `WithdrawalApproved` + balance `−amount` |
//! | node `InsufficientFunds` | parent `InsufficientFunds` |
//! | node `Canceled` | `Cancel` per child, `WithdrawalCanceled` at the trunk |
//! | leaf `DepositSeek` | shard `Withdraw` or leaf `DepositNotFound` |
//! | leaf `DepositFound` (non-root) | parent `UpdateChildProgress` |
//! | leaf `FullyFunded` (root) | `WithdrawalApproved` + balance `−amount` |
//! | leaf `InsufficientFunds` | parent `InsufficientFunds` |
//! | leaf `Canceled` | shard `CancelWithdrawal` per contribution |
//! | leaf `ContributionReturned` | shard `CancelWithdrawal` |
//! | leaf `ContributionRestated` | shard `Withdraw(recorded)` |
//! | shard `ModifiedAmount` | child `ModifyAmount` per share; root shard adds balance `+requested` |
//! | shard `Withdrawn` | leaf `DepositFound` |
//! | balance `UpdatedBranch` | `ReleaseBranch` |
//! | balance `ReleasedBranch` | parent `UpdateSubbranch` or `BalanceUpdated` |

use rand::seq::SliceRandom;
use rand::Rng;
use reduction_core::reduction::AggregationShape;
use reduction_core::{
    AccountId, Amount, BalanceCommand, BalanceEvent, ChildKind, Command, DomainEvent,
    LeafCommand, LeafEvent, NodeCommand, NodeEvent, PublishedEvent, RootId, ShardCommand,
    ShardEvent, ShardId, TreeId,
};

use crate::index::ShardIndex;
use crate::message::{Directive, Outcome};

/// Balance tree source key of a deposit
pub fn deposit_source(deposit: &str) -> String {
    format!("deposit:{}", deposit)
}

/// Balance tree source key of a withdrawal
pub fn withdrawal_source(root: &RootId) -> String {
    format!("withdrawal:{}", root.root())
}

/// Contribution of `amount` from `source` into the account's balance tree.
/// `seq` is the journal position of the event behind it, so a later value
/// from the same source replaces an earlier one and redeliveries are no-ops.
pub fn balance_contribution(
    shape: &AggregationShape,
    account: &AccountId,
    source: String,
    amount: Amount,
    seq: u64,
) -> Command {
    Command::Balance {
        id: shape.bottom_branch(account, &source),
        command: BalanceCommand::UpdateSubbranch {
            subbranch: source,
            amount,
            seq,
        },
    }
}

/// Inputs a relay rule may consult besides the event itself
pub struct RouteContext<'a, R: Rng> {
    /// Shard discovery
    pub index: &'a ShardIndex,
    /// Balance tree mapping
    pub shape: &'a AggregationShape,
    /// Candidates per discovery lookup
    pub discovery_limit: usize,
    /// Random source for shard selection
    pub rng: &'a mut R,
}

impl<R: Rng> std::fmt::Debug for RouteContext<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteContext")
            .field("discovery_limit", &self.discovery_limit)
            .finish_non_exhaustive()
    }
}

/// Directives derived from one published event
pub fn derive<R: Rng>(published: &PublishedEvent, ctx: &mut RouteContext<'_, R>) -> Vec<Directive> {
    match &published.event {
        DomainEvent::Node(event) => node_directives(event, published.seq, ctx.shape),
        DomainEvent::Leaf(event) => leaf_directives(event, published.seq, ctx),
        DomainEvent::Shard(event) => shard_directives(event, published.seq, ctx.shape),
        DomainEvent::Balance(event) => balance_directives(event, published.seq, ctx.shape),
    }
}

fn approved(shape: &AggregationShape, root: &RootId, amount: Amount, seq: u64) -> Vec<Directive> {
    vec![
        Directive::Notify(Outcome::WithdrawalApproved {
            account: root.account().clone(),
            withdrawal: root.root().to_string(),
            amount,
        }),
        Directive::Command(balance_contribution(
            shape,
            root.account(),
            withdrawal_source(root),
            -amount,
            seq,
        )),
    ]
}

fn canceled(root: &RootId) -> Directive {
    Directive::Notify(Outcome::WithdrawalCanceled {
        account: root.account().clone(),
        withdrawal: root.root().to_string(),
    })
}

fn progress(parent: &TreeId, child: &TreeId, amount: Amount, seq: u64) -> Directive {
    Directive::Command(Command::Node {
        id: parent.clone(),
        command: NodeCommand::UpdateChildProgress {
            child: child.clone(),
            amount,
            seq,
        },
    })
}

fn insufficient(parent: &TreeId) -> Directive {
    Directive::Command(Command::Node {
        id: parent.clone(),
        command: NodeCommand::InsufficientFunds,
    })
}

fn release_hold(shard: &ShardId, claimant: &TreeId) -> Directive {
    Directive::Command(Command::Shard {
        id: shard.clone(),
        command: ShardCommand::CancelWithdrawal {
            claimant: claimant.clone(),
        },
    })
}

fn node_directives(event: &NodeEvent, seq: u64, shape: &AggregationShape) -> Vec<Directive> {
    match event {
        NodeEvent::BranchCreated { id, subbranches, .. } => subbranches
            .iter()
            .map(|sub| {
                Directive::Command(match sub.kind {
                    ChildKind::Branch => Command::Node {
                        id: sub.id.clone(),
                        command: NodeCommand::CreateBranch {
                            parent: id.clone(),
                            amount: sub.amount,
                        },
                    },
                    ChildKind::Leaf => Command::Leaf {
                        id: sub.id.clone(),
                        command: LeafCommand::Create {
                            parent: Some(id.clone()),
                            amount: sub.amount,
                        },
                    },
                })
            })
            .collect(),

        NodeEvent::Updated {
            id,
            parent: Some(parent),
            aggregate,
            ..
        } => vec![progress(parent, id, *aggregate, seq)],
        NodeEvent::Updated { parent: None, .. } => vec![],

        NodeEvent::Approved { id, amount } => approved(shape, id.root(), *amount, seq),

        NodeEvent::InsufficientFunds { parent, .. } => vec![insufficient(parent)],

        NodeEvent::Canceled {
            id,
            parent,
            subbranches,
        } => {
            let mut directives: Vec<Directive> = subbranches
                .iter()
                .map(|sub| {
                    Directive::Command(match sub.kind {
                        ChildKind::Branch => Command::Node {
                            id: sub.id.clone(),
                            command: NodeCommand::Cancel,
                        },
                        ChildKind::Leaf => Command::Leaf {
                            id: sub.id.clone(),
                            command: LeafCommand::Cancel,
                        },
                    })
                })
                .collect();
            if parent.is_none() {
                directives.push(canceled(id.root()));
            }
            directives
        }
    }
}

fn leaf_directives<R: Rng>(event: &LeafEvent, seq: u64, ctx: &mut RouteContext<'_, R>) -> Vec<Directive> {
    match event {
        LeafEvent::LeafCreated { .. } => vec![],

        LeafEvent::DepositSeek {
            id,
            amount_needed,
            holds,
        } => {
            let candidates = ctx.index.candidates(id.account(), ctx.discovery_limit);
            match candidates.choose(&mut *ctx.rng) {
                Some(shard) => {
                    let held = holds
                        .iter()
                        .find(|(s, _)| s == shard)
                        .map(|(_, a)| *a)
                        .unwrap_or(Amount::ZERO);
                    vec![Directive::Command(Command::Shard {
                        id: shard.clone(),
                        command: ShardCommand::Withdraw {
                            claimant: id.clone(),
                            amount: *amount_needed + held,
                        },
                    })]
                }
                None => vec![Directive::Command(Command::Leaf {
                    id: id.clone(),
                    command: LeafCommand::DepositNotFound,
                })],
            }
        }

        LeafEvent::DepositFound {
            id,
            parent: Some(parent),
            amount_funded,
            ..
        } => vec![progress(parent, id, *amount_funded, seq)],
        LeafEvent::DepositFound { parent: None, .. } => vec![],

        LeafEvent::FullyFunded {
            id,
            parent: None,
            amount,
        } => approved(ctx.shape, id.root(), *amount, seq),
        LeafEvent::FullyFunded { parent: Some(_), .. } => vec![],

        LeafEvent::InsufficientFunds { parent, .. } => vec![insufficient(parent)],

        LeafEvent::Canceled {
            id,
            parent,
            contributions,
        } => {
            let mut directives: Vec<Directive> = contributions
                .iter()
                .map(|(shard, _)| release_hold(shard, id))
                .collect();
            if parent.is_none() {
                directives.push(canceled(id.root()));
            }
            directives
        }

        LeafEvent::ContributionReturned { id, shard, .. } => vec![release_hold(shard, id)],

        LeafEvent::ContributionRestated {
            id,
            shard,
            recorded,
        } => vec![Directive::Command(if recorded.is_positive() {
            Command::Shard {
                id: shard.clone(),
                command: ShardCommand::Withdraw {
                    claimant: id.clone(),
                    amount: *recorded,
                },
            }
        } else {
            Command::Shard {
                id: shard.clone(),
                command: ShardCommand::CancelWithdrawal {
                    claimant: id.clone(),
                },
            }
        })],
    }
}

fn shard_directives(event: &ShardEvent, seq: u64, shape: &AggregationShape) -> Vec<Directive> {
    match event {
        ShardEvent::ModifiedAmount {
            id,
            requested,
            children,
            ..
        } => {
            let mut directives: Vec<Directive> = children
                .iter()
                .map(|(child, amount)| {
                    Directive::Command(Command::Shard {
                        id: child.clone(),
                        command: ShardCommand::ModifyAmount { amount: *amount },
                    })
                })
                .collect();
            if id.is_root() {
                directives.push(Directive::Command(balance_contribution(
                    shape,
                    id.owner(),
                    deposit_source(id.deposit()),
                    *requested,
                    seq,
                )));
            }
            directives
        }

        ShardEvent::Withdrawn {
            id,
            claimant,
            granted,
            ..
        } => vec![Directive::Command(Command::Leaf {
            id: claimant.clone(),
            command: LeafCommand::DepositFound {
                shard: id.clone(),
                amount: *granted,
            },
        })],

        ShardEvent::WithdrawalCanceled { .. } => vec![],
    }
}

fn balance_directives(event: &BalanceEvent, seq: u64, shape: &AggregationShape) -> Vec<Directive> {
    match event {
        BalanceEvent::UpdatedSubbranch { .. } => vec![],

        BalanceEvent::UpdatedBranch { id } => vec![Directive::Command(Command::Balance {
            id: id.clone(),
            command: BalanceCommand::ReleaseBranch,
        })],

        BalanceEvent::ReleasedBranch { id, aggregate } => match shape.parent(id) {
            Some(parent) => vec![Directive::Command(Command::Balance {
                id: parent,
                command: BalanceCommand::UpdateSubbranch {
                    subbranch: id.entity_id(),
                    amount: *aggregate,
                    seq,
                },
            })],
            None => vec![Directive::Notify(Outcome::BalanceUpdated {
                account: id.account().clone(),
                balance: *aggregate,
            })],
        },
    }
}
