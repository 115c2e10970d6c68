//! Event-sourced entity contract
//!
//! Every entity is a pure state machine:
//!
//! - `decide(state, command) -> events` validates a command and chooses the
//!   events it produces (empty for no-ops and duplicates)
//! - `evolve(state, event)` folds one event into the state
//!
//! The actor runtime journals the events returned by `decide` before applying
//! them with `evolve`, so replaying the journal reproduces the state exactly.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::hash::Hash;
use tokio::sync::mpsc;

use crate::balance::BalanceEvent;
use crate::config::TreeConfig;
use crate::leaf::LeafEvent;
use crate::node::NodeEvent;
use crate::shard::ShardEvent;
use crate::balance::BalanceBranch;
use crate::leaf::FundingLeaf;
use crate::node::TreeNode;
use crate::shard::DepositShard;
use crate::types::{BranchId, ShardId, TreeId};
use crate::{Error, Result};

/// Typed key an entity is addressed by
pub trait EntityKey: Clone + Eq + Hash + Ord + Send + Sync + Debug + Display + 'static {
    /// Composite string id
    fn entity_id(&self) -> String;
}

impl EntityKey for TreeId {
    fn entity_id(&self) -> String {
        TreeId::entity_id(self)
    }
}

impl EntityKey for ShardId {
    fn entity_id(&self) -> String {
        ShardId::entity_id(self)
    }
}

impl EntityKey for BranchId {
    fn entity_id(&self) -> String {
        BranchId::entity_id(self)
    }
}

/// Event-sourced state machine hosted by an [`EntityActor`](crate::actor::EntityActor)
pub trait Entity: Default + Clone + Debug + Send + Sync + 'static {
    /// Journal namespace
    const KIND: &'static str;

    /// Address type
    type Id: EntityKey;

    /// Accepted commands
    type Command: Debug + Send + 'static;

    /// Emitted events
    type Event: Clone + Debug + Serialize + DeserializeOwned + Into<DomainEvent> + Send + Sync + 'static;

    /// Validate `command` against the current state and choose the resulting events
    fn decide(&self, id: &Self::Id, command: &Self::Command, tree: &TreeConfig) -> Result<Vec<Self::Event>>;

    /// Fold one event into the state
    fn evolve(&mut self, event: &Self::Event, at: DateTime<Utc>);
}

/// Any entity's event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEvent {
    /// Withdrawal tree node
    Node(NodeEvent),
    /// Withdrawal tree leaf
    Leaf(LeafEvent),
    /// Deposit shard
    Shard(ShardEvent),
    /// Balance tree branch
    Balance(BalanceEvent),
}

impl DomainEvent {
    /// Decode a journal payload written by an entity of `kind`
    pub fn decode(kind: &str, payload: &[u8]) -> Result<Self> {
        if kind == TreeNode::KIND {
            Ok(DomainEvent::Node(bincode::deserialize(payload)?))
        } else if kind == FundingLeaf::KIND {
            Ok(DomainEvent::Leaf(bincode::deserialize(payload)?))
        } else if kind == DepositShard::KIND {
            Ok(DomainEvent::Shard(bincode::deserialize(payload)?))
        } else if kind == BalanceBranch::KIND {
            Ok(DomainEvent::Balance(bincode::deserialize(payload)?))
        } else {
            Err(Error::Storage(format!("unknown entity kind {:?}", kind)))
        }
    }

    /// Short event name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::Node(event) => match event {
                NodeEvent::BranchCreated { .. } => "node.branch_created",
                NodeEvent::Updated { .. } => "node.updated",
                NodeEvent::Approved { .. } => "node.approved",
                NodeEvent::InsufficientFunds { .. } => "node.insufficient_funds",
                NodeEvent::Canceled { .. } => "node.canceled",
            },
            DomainEvent::Leaf(event) => match event {
                LeafEvent::LeafCreated { .. } => "leaf.created",
                LeafEvent::DepositSeek { .. } => "leaf.deposit_seek",
                LeafEvent::DepositFound { .. } => "leaf.deposit_found",
                LeafEvent::FullyFunded { .. } => "leaf.fully_funded",
                LeafEvent::InsufficientFunds { .. } => "leaf.insufficient_funds",
                LeafEvent::Canceled { .. } => "leaf.canceled",
                LeafEvent::ContributionReturned { .. } => "leaf.contribution_returned",
                LeafEvent::ContributionRestated { .. } => "leaf.contribution_restated",
            },
            DomainEvent::Shard(event) => match event {
                ShardEvent::ModifiedAmount { .. } => "shard.modified_amount",
                ShardEvent::Withdrawn { .. } => "shard.withdrawn",
                ShardEvent::WithdrawalCanceled { .. } => "shard.withdrawal_canceled",
            },
            DomainEvent::Balance(event) => match event {
                BalanceEvent::UpdatedSubbranch { .. } => "balance.updated_subbranch",
                BalanceEvent::UpdatedBranch { .. } => "balance.updated_branch",
                BalanceEvent::ReleasedBranch { .. } => "balance.released_branch",
            },
        }
    }
}

impl From<NodeEvent> for DomainEvent {
    fn from(event: NodeEvent) -> Self {
        DomainEvent::Node(event)
    }
}

impl From<LeafEvent> for DomainEvent {
    fn from(event: LeafEvent) -> Self {
        DomainEvent::Leaf(event)
    }
}

impl From<ShardEvent> for DomainEvent {
    fn from(event: ShardEvent) -> Self {
        DomainEvent::Shard(event)
    }
}

impl From<BalanceEvent> for DomainEvent {
    fn from(event: BalanceEvent) -> Self {
        DomainEvent::Balance(event)
    }
}

/// Event as seen by relays: who emitted it, at which journal position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedEvent {
    /// Entity kind (journal namespace)
    pub kind: String,
    /// Emitting entity
    pub entity_id: String,
    /// Journal sequence of this event within the emitting entity
    pub seq: u64,
    /// When it was journaled
    pub recorded_at: DateTime<Utc>,
    /// Payload
    pub event: DomainEvent,
}

impl PublishedEvent {
    /// Journal key of the emitting entity
    pub fn journal_key(&self) -> String {
        format!("{}/{}", self.kind, self.entity_id)
    }
}

/// Receives every journaled event
pub trait EventSink: Send + Sync + 'static {
    /// Hand one event to the relays
    fn publish(&self, event: PublishedEvent);
}

impl EventSink for mpsc::UnboundedSender<PublishedEvent> {
    fn publish(&self, event: PublishedEvent) {
        if let Err(e) = self.send(event) {
            tracing::warn!(
                entity_id = %e.0.entity_id,
                seq = e.0.seq,
                "Event stream closed, event not relayed"
            );
        }
    }
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: PublishedEvent) {}
}
