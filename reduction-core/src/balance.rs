//! Balance aggregation branch
//!
//! The account balance is the level-0 aggregate of a fixed-depth fan-in tree.
//! Contributions (deposits, approved withdrawals) enter at the bottom and
//! each branch forwards its aggregate to its parent only when released, so a
//! burst of updates on one branch produces a single upward report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TreeConfig;
use crate::entity::Entity;
use crate::reduction::{Assessment, Reduction};
use crate::types::{Amount, BranchId};
use crate::Result;

/// Balance branch commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceCommand {
    /// Latest value of one subbranch (or contribution source at the bottom)
    UpdateSubbranch {
        /// Subbranch or source key
        subbranch: String,
        /// Its latest aggregate
        amount: Amount,
        /// Writer sequence
        seq: u64,
    },
    /// Forward the aggregate upward if it changed
    ReleaseBranch,
}

/// Balance branch events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceEvent {
    /// Subbranch value recorded
    UpdatedSubbranch {
        /// Branch id
        id: BranchId,
        /// Subbranch or source key
        subbranch: String,
        /// Its latest aggregate
        amount: Amount,
        /// Writer sequence
        seq: u64,
        /// Branch aggregate after the update
        aggregate: Amount,
    },
    /// First change since the last release
    UpdatedBranch {
        /// Branch id
        id: BranchId,
    },
    /// Aggregate forwarded upward
    ReleasedBranch {
        /// Branch id
        id: BranchId,
        /// Aggregate at release
        aggregate: Amount,
    },
}

/// Balance branch state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceBranch {
    /// Set on first update
    pub id: Option<BranchId>,
    /// Subbranch values
    pub subbranches: Reduction<String>,
    /// Changed since the last release
    pub dirty: bool,
    /// Aggregate at the last release
    pub released: Amount,
    /// Last change
    pub updated_at: Option<DateTime<Utc>>,
}

impl BalanceBranch {
    /// Exact sum of the subbranches
    pub fn aggregate(&self) -> Amount {
        self.subbranches.aggregate()
    }
}

impl Entity for BalanceBranch {
    const KIND: &'static str = "balance";

    type Id = BranchId;
    type Command = BalanceCommand;
    type Event = BalanceEvent;

    fn decide(&self, id: &BranchId, command: &BalanceCommand, _tree: &TreeConfig) -> Result<Vec<BalanceEvent>> {
        match command {
            BalanceCommand::UpdateSubbranch {
                subbranch,
                amount,
                seq,
            } => {
                if self.subbranches.assess(subbranch, *seq) != Assessment::Newer {
                    return Ok(vec![]);
                }
                let mut events = vec![BalanceEvent::UpdatedSubbranch {
                    id: id.clone(),
                    subbranch: subbranch.clone(),
                    amount: *amount,
                    seq: *seq,
                    aggregate: self.subbranches.preview(subbranch, *amount),
                }];
                if !self.dirty {
                    events.push(BalanceEvent::UpdatedBranch { id: id.clone() });
                }
                Ok(events)
            }

            BalanceCommand::ReleaseBranch => {
                if !self.dirty {
                    return Ok(vec![]);
                }
                Ok(vec![BalanceEvent::ReleasedBranch {
                    id: id.clone(),
                    aggregate: self.aggregate(),
                }])
            }
        }
    }

    fn evolve(&mut self, event: &BalanceEvent, at: DateTime<Utc>) {
        match event {
            BalanceEvent::UpdatedSubbranch {
                id,
                subbranch,
                amount,
                seq,
                ..
            } => {
                self.id = Some(id.clone());
                self.subbranches.apply(subbranch.clone(), *amount, *seq);
            }
            BalanceEvent::UpdatedBranch { .. } => {
                self.dirty = true;
            }
            BalanceEvent::ReleasedBranch { aggregate, .. } => {
                self.dirty = false;
                self.released = *aggregate;
            }
        }
        self.updated_at = Some(at);
    }
}
