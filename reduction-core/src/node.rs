//! Withdrawal tree node (trunk or branch)
//!
//! A node splits its amount into at most `fan_out` children with the funding
//! shape; shares above the leaf cap become branches, the rest become leaves.
//! Children report cumulative progress which the node folds with
//! last-writer-wins. The trunk approves the withdrawal once the aggregate
//! reaches the total, or cancels the whole tree when any descendant runs out
//! of funds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TreeConfig;
use crate::entity::Entity;
use crate::reduction::{Assessment, Reduction, TreeShape};
use crate::types::{Amount, TreeId};
use crate::{Error, Result};

/// What a child position becomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildKind {
    /// Splits again
    Branch,
    /// Seeks funds directly
    Leaf,
}

/// One child share created by a split
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subbranch {
    /// Child id
    pub id: TreeId,
    /// Share assigned to the child
    pub amount: Amount,
    /// Branch or leaf
    pub kind: ChildKind,
}

/// Node commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeCommand {
    /// Create the trunk of a new withdrawal tree
    CreateTrunk {
        /// Total to source
        amount: Amount,
    },
    /// Create an interior branch
    CreateBranch {
        /// Creating node
        parent: TreeId,
        /// Share to source
        amount: Amount,
    },
    /// Cumulative progress of one child
    UpdateChildProgress {
        /// Reporting child
        child: TreeId,
        /// Cumulative amount sourced by the child
        amount: Amount,
        /// Child's writer sequence
        seq: u64,
    },
    /// A descendant could not be funded
    InsufficientFunds,
    /// Cancel this node and everything below it
    Cancel,
}

/// Node events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    /// Node created and split
    BranchCreated {
        /// Node id
        id: TreeId,
        /// Parent (`None` for the trunk)
        parent: Option<TreeId>,
        /// Amount to source
        amount: Amount,
        /// Child shares
        subbranches: Vec<Subbranch>,
    },
    /// Child progress accepted
    Updated {
        /// Node id
        id: TreeId,
        /// Parent (`None` for the trunk)
        parent: Option<TreeId>,
        /// Reporting child
        child: TreeId,
        /// Child's cumulative amount
        amount: Amount,
        /// Child's writer sequence
        seq: u64,
        /// Node aggregate after the update
        aggregate: Amount,
    },
    /// Trunk fully sourced
    Approved {
        /// Trunk id
        id: TreeId,
        /// Withdrawal total
        amount: Amount,
    },
    /// Funding failure relayed upward
    InsufficientFunds {
        /// Node id
        id: TreeId,
        /// Parent to notify
        parent: TreeId,
    },
    /// Node canceled; children must cancel too
    Canceled {
        /// Node id
        id: TreeId,
        /// Parent (`None` for the trunk)
        parent: Option<TreeId>,
        /// Every child created by this node
        subbranches: Vec<Subbranch>,
    },
}

/// Node state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Set once created
    pub id: Option<TreeId>,
    /// Parent (`None` for the trunk)
    pub parent: Option<TreeId>,
    /// Amount to source
    pub total: Amount,
    /// Child progress
    pub progress: Reduction<TreeId>,
    /// Child shares
    pub subbranches: Vec<Subbranch>,
    /// Trunk fully sourced
    pub approved: bool,
    /// Terminal cancel
    pub canceled: bool,
    /// Insufficient funds already relayed upward
    pub insufficient_reported: bool,
    /// Last change
    pub updated_at: Option<DateTime<Utc>>,
}

impl TreeNode {
    /// Whether the node has been created
    pub fn is_created(&self) -> bool {
        self.id.is_some()
    }

    /// Whether this node is the trunk
    pub fn is_root(&self) -> bool {
        self.is_created() && self.parent.is_none()
    }

    /// Exact sum of the children's latest reports
    pub fn aggregated(&self) -> Amount {
        self.progress.aggregate()
    }

    fn require_created(&self, id: &TreeId) -> Result<()> {
        if self.is_created() {
            Ok(())
        } else {
            Err(Error::EntityNotFound(format!("node {}", id)))
        }
    }

    fn create(
        id: &TreeId,
        parent: Option<TreeId>,
        amount: Amount,
        tree: &TreeConfig,
    ) -> Result<Vec<NodeEvent>> {
        let amount = amount.ensure_positive("node amount")?;
        let shape = tree.funding_shape();
        let subbranches = shape
            .split(amount)?
            .into_iter()
            .enumerate()
            .map(|(i, share)| Subbranch {
                id: id.child(i + 1),
                amount: share,
                kind: if shape.is_leaf_share(share) {
                    ChildKind::Leaf
                } else {
                    ChildKind::Branch
                },
            })
            .collect();

        tracing::debug!(node = %id, amount = %amount, "Splitting node");

        Ok(vec![NodeEvent::BranchCreated {
            id: id.clone(),
            parent,
            amount,
            subbranches,
        }])
    }
}

impl Entity for TreeNode {
    const KIND: &'static str = "node";

    type Id = TreeId;
    type Command = NodeCommand;
    type Event = NodeEvent;

    fn decide(&self, id: &TreeId, command: &NodeCommand, tree: &TreeConfig) -> Result<Vec<NodeEvent>> {
        match command {
            NodeCommand::CreateTrunk { amount } => {
                if self.is_created() {
                    return Ok(vec![]);
                }
                if !id.is_trunk() {
                    return Err(Error::InvalidCommand(format!("{} is not a trunk position", id)));
                }
                Self::create(id, None, *amount, tree)
            }

            NodeCommand::CreateBranch { parent, amount } => {
                if self.is_created() {
                    return Ok(vec![]);
                }
                if id.is_trunk() {
                    return Err(Error::InvalidCommand(format!("{} is a trunk position", id)));
                }
                Self::create(id, Some(parent.clone()), *amount, tree)
            }

            NodeCommand::UpdateChildProgress { child, amount, seq } => {
                self.require_created(id)?;
                if amount.is_negative() {
                    return Err(Error::InvalidCommand(format!(
                        "negative progress {} from {}",
                        amount, child
                    )));
                }
                if self.canceled {
                    return Ok(vec![]);
                }
                match self.progress.assess(child, *seq) {
                    Assessment::Unknown => Err(Error::UnknownChild {
                        node: id.entity_id(),
                        child: child.entity_id(),
                    }),
                    Assessment::Stale => Ok(vec![]),
                    Assessment::Newer => {
                        let aggregate = self.progress.preview(child, *amount);
                        if aggregate > self.total {
                            return Err(Error::InvariantViolation(format!(
                                "node {} aggregate {} exceeds total {}",
                                id, aggregate, self.total
                            )));
                        }
                        let mut events = vec![NodeEvent::Updated {
                            id: id.clone(),
                            parent: self.parent.clone(),
                            child: child.clone(),
                            amount: *amount,
                            seq: *seq,
                            aggregate,
                        }];
                        if self.is_root() && !self.approved && aggregate == self.total {
                            events.push(NodeEvent::Approved {
                                id: id.clone(),
                                amount: self.total,
                            });
                        }
                        Ok(events)
                    }
                }
            }

            NodeCommand::InsufficientFunds => {
                self.require_created(id)?;
                if self.canceled || self.approved {
                    return Ok(vec![]);
                }
                match &self.parent {
                    None => Ok(vec![NodeEvent::Canceled {
                        id: id.clone(),
                        parent: None,
                        subbranches: self.subbranches.clone(),
                    }]),
                    Some(_) if self.insufficient_reported => Ok(vec![]),
                    Some(parent) => Ok(vec![NodeEvent::InsufficientFunds {
                        id: id.clone(),
                        parent: parent.clone(),
                    }]),
                }
            }

            NodeCommand::Cancel => {
                self.require_created(id)?;
                if self.canceled {
                    return Ok(vec![]);
                }
                Ok(vec![NodeEvent::Canceled {
                    id: id.clone(),
                    parent: self.parent.clone(),
                    subbranches: self.subbranches.clone(),
                }])
            }
        }
    }

    fn evolve(&mut self, event: &NodeEvent, at: DateTime<Utc>) {
        match event {
            NodeEvent::BranchCreated {
                id,
                parent,
                amount,
                subbranches,
            } => {
                self.id = Some(id.clone());
                self.parent = parent.clone();
                self.total = *amount;
                self.progress = Reduction::closed(subbranches.iter().map(|s| s.id.clone()));
                self.subbranches = subbranches.clone();
            }
            NodeEvent::Updated {
                child, amount, seq, ..
            } => {
                self.progress.apply(child.clone(), *amount, *seq);
            }
            NodeEvent::Approved { .. } => {
                self.approved = true;
            }
            NodeEvent::InsufficientFunds { .. } => {
                self.insufficient_reported = true;
            }
            NodeEvent::Canceled { .. } => {
                self.canceled = true;
            }
        }
        self.updated_at = Some(at);
    }
}
