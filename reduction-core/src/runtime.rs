//! Entity runtime: one registry per entity kind behind a single command entry point

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::actor::ActorContext;
use crate::balance::{BalanceBranch, BalanceCommand};
use crate::config::{Config, TreeConfig};
use crate::entity::{DomainEvent, Entity, EventSink, PublishedEvent};
use crate::leaf::{FundingLeaf, LeafCommand};
use crate::metrics::Metrics;
use crate::node::{NodeCommand, TreeNode};
use crate::registry::EntityRegistry;
use crate::shard::{DepositShard, ShardCommand, ShardEvent};
use crate::storage::{open_journal, Journal};
use crate::types::{BranchId, ShardId, TreeId};
use crate::{Error, Result};

/// Entity kind a command targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    /// Withdrawal tree node
    Node,
    /// Funding leaf
    Leaf,
    /// Deposit shard
    Shard,
    /// Balance branch
    Balance,
}

/// Command addressed to one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Withdrawal tree node command
    Node {
        /// Target node
        id: TreeId,
        /// Command
        command: NodeCommand,
    },
    /// Funding leaf command
    Leaf {
        /// Target leaf
        id: TreeId,
        /// Command
        command: LeafCommand,
    },
    /// Deposit shard command
    Shard {
        /// Target shard
        id: ShardId,
        /// Command
        command: ShardCommand,
    },
    /// Balance branch command
    Balance {
        /// Target branch
        id: BranchId,
        /// Command
        command: BalanceCommand,
    },
}

impl Command {
    /// Kind of the target entity
    pub fn kind(&self) -> TargetKind {
        match self {
            Command::Node { .. } => TargetKind::Node,
            Command::Leaf { .. } => TargetKind::Leaf,
            Command::Shard { .. } => TargetKind::Shard,
            Command::Balance { .. } => TargetKind::Balance,
        }
    }

    /// Entity id of the target
    pub fn target(&self) -> String {
        match self {
            Command::Node { id, .. } | Command::Leaf { id, .. } => id.entity_id(),
            Command::Shard { id, .. } => id.entity_id(),
            Command::Balance { id, .. } => id.entity_id(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} -> {}", self.kind(), self.target())
    }
}

/// The four entity registries sharing one journal and one event sink
#[derive(Debug)]
pub struct Runtime {
    nodes: EntityRegistry<TreeNode>,
    leaves: EntityRegistry<FundingLeaf>,
    shards: EntityRegistry<DepositShard>,
    balances: EntityRegistry<BalanceBranch>,
    ctx: Arc<ActorContext>,
}

impl Runtime {
    /// Runtime over an explicit journal
    pub fn new(config: &Config, journal: Arc<dyn Journal>, sink: Arc<dyn EventSink>) -> Result<Self> {
        config.tree.validate()?;
        let metrics = Metrics::new().map_err(|e| Error::Config(format!("metrics: {}", e)))?;
        let ctx = Arc::new(ActorContext {
            journal,
            sink,
            tree: config.tree.clone(),
            metrics,
            idle_timeout: config.actor.idle_timeout(),
        });
        let capacity = config.actor.mailbox_capacity;

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            leaf_cap = %config.tree.leaf_cap,
            fan_out = config.tree.fan_out,
            shard_capacity = %config.tree.shard_capacity,
            "Starting entity runtime"
        );

        Ok(Self {
            nodes: EntityRegistry::new(ctx.clone(), capacity),
            leaves: EntityRegistry::new(ctx.clone(), capacity),
            shards: EntityRegistry::new(ctx.clone(), capacity),
            balances: EntityRegistry::new(ctx.clone(), capacity),
            ctx,
        })
    }

    /// Runtime over the journal backend named in `config`
    pub fn open(config: &Config, sink: Arc<dyn EventSink>) -> Result<Self> {
        let journal = open_journal(config)?;
        Self::new(config, journal, sink)
    }

    /// Deliver one command, returning the number of events it journaled
    pub async fn dispatch(&self, command: Command) -> Result<usize> {
        match command {
            Command::Node { id, command } => Ok(self.nodes.execute(&id, command).await?.len()),
            Command::Leaf { id, command } => Ok(self.leaves.execute(&id, command).await?.len()),
            Command::Shard { id, command } => Ok(self.shards.execute(&id, command).await?.len()),
            Command::Balance { id, command } => {
                Ok(self.balances.execute(&id, command).await?.len())
            }
        }
    }

    /// Node state
    pub async fn node(&self, id: &TreeId) -> Result<TreeNode> {
        self.nodes.state(id).await
    }

    /// Leaf state
    pub async fn leaf(&self, id: &TreeId) -> Result<FundingLeaf> {
        self.leaves.state(id).await
    }

    /// Shard state
    pub async fn shard(&self, id: &ShardId) -> Result<DepositShard> {
        self.shards.state(id).await
    }

    /// Balance branch state
    pub async fn balance_branch(&self, id: &BranchId) -> Result<BalanceBranch> {
        self.balances.state(id).await
    }

    /// Latest journaled event of every shard with its sequence, for
    /// rebuilding read models
    pub fn last_shard_events(&self) -> Result<Vec<(u64, ShardEvent)>> {
        let prefix = format!("{}/", DepositShard::KIND);
        let mut events = Vec::new();
        for key in self.ctx.journal.keys(&prefix)? {
            if let Some(record) = self.ctx.journal.load(&key)?.pop() {
                events.push((record.seq, bincode::deserialize(&record.payload)?));
            }
        }
        Ok(events)
    }

    /// Every journaled event past its entity's relay watermark, in sequence
    /// order per entity. These were journaled but their derived work never
    /// settled, so relays must see them again.
    pub fn unrelayed_events(&self) -> Result<Vec<PublishedEvent>> {
        let journal = &self.ctx.journal;
        let mut events = Vec::new();
        for key in journal.keys("")? {
            let (kind, entity_id) = key
                .split_once('/')
                .ok_or_else(|| Error::Storage(format!("malformed journal key {:?}", key)))?;
            for record in journal.load_after(&key, journal.relayed(&key)?)? {
                events.push(PublishedEvent {
                    kind: kind.to_string(),
                    entity_id: entity_id.to_string(),
                    seq: record.seq,
                    recorded_at: record.recorded_at,
                    event: DomainEvent::decode(kind, &record.payload)?,
                });
            }
        }
        Ok(events)
    }

    /// Record that everything `key` journaled up to `seq` has been relayed
    pub fn mark_relayed(&self, key: &str, seq: u64) -> Result<()> {
        self.ctx.journal.mark_relayed(key, seq)
    }

    /// Tree shape parameters
    pub fn tree(&self) -> &TreeConfig {
        &self.ctx.tree
    }

    /// Runtime metrics
    pub fn metrics(&self) -> &Metrics {
        &self.ctx.metrics
    }

    /// Number of live actors across all kinds
    pub fn actor_count(&self) -> usize {
        self.nodes.len() + self.leaves.len() + self.shards.len() + self.balances.len()
    }

    /// Stop every actor
    pub async fn shutdown(&self) {
        futures::join!(
            self.nodes.shutdown(),
            self.leaves.shutdown(),
            self.shards.shutdown(),
            self.balances.shutdown(),
        );
        tracing::info!("Entity runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NullSink;
    use crate::node::NodeEvent;
    use crate::storage::MemoryJournal;
    use crate::types::{AccountId, Amount, RootId, ShardId};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_dispatch_routes_by_kind() {
        let (tx, mut rx) = mpsc::unbounded_channel::<PublishedEvent>();
        let runtime = Runtime::new(&Config::in_memory(), Arc::new(MemoryJournal::new()), Arc::new(tx)).unwrap();
        let trunk = RootId::new(AccountId::new("acct"), "wd1").unwrap().trunk();

        let count = runtime
            .dispatch(Command::Node {
                id: trunk.clone(),
                command: NodeCommand::CreateTrunk { amount: Amount::from_cents(7_500) },
            })
            .await
            .unwrap();
        assert_eq!(count, 1);

        let published = rx.recv().await.unwrap();
        assert!(matches!(published.event, DomainEvent::Node(NodeEvent::BranchCreated { .. })));
        assert_eq!(runtime.node(&trunk).await.unwrap().subbranches.len(), 3);

        // same id, different kind: an independent entity
        assert!(!runtime.leaf(&trunk).await.unwrap().is_created());
        assert_eq!(runtime.actor_count(), 2);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_last_shard_events() {
        let journal = Arc::new(MemoryJournal::new());
        let runtime = Runtime::new(&Config::in_memory(), journal.clone(), Arc::new(NullSink)).unwrap();
        let shard = ShardId::new(AccountId::new("acct"), "d1").unwrap();
        runtime
            .dispatch(Command::Shard {
                id: shard.clone(),
                command: ShardCommand::ModifyAmount { amount: Amount::from_cents(1_000) },
            })
            .await
            .unwrap();
        runtime.shutdown().await;

        let restarted = Runtime::new(&Config::in_memory(), journal, Arc::new(NullSink)).unwrap();
        let events = restarted.last_shard_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 1);
        assert_eq!(events[0].1.shard(), &shard);
        assert_eq!(events[0].1.available(), Amount::from_cents(1_000));
    }

    #[tokio::test]
    async fn test_unrelayed_events_resume_after_watermark() {
        let journal = Arc::new(MemoryJournal::new());
        let runtime = Runtime::new(&Config::in_memory(), journal.clone(), Arc::new(NullSink)).unwrap();
        let trunk = RootId::new(AccountId::new("acct"), "wd1").unwrap().trunk();
        let shard = ShardId::new(AccountId::new("acct"), "d1").unwrap();
        runtime
            .dispatch(Command::Shard {
                id: shard.clone(),
                command: ShardCommand::ModifyAmount { amount: Amount::from_cents(1_000) },
            })
            .await
            .unwrap();
        runtime
            .dispatch(Command::Leaf {
                id: trunk.clone(),
                command: LeafCommand::Create { parent: None, amount: Amount::from_cents(400) },
            })
            .await
            .unwrap();

        let pending = runtime.unrelayed_events().unwrap();
        let names: Vec<_> = pending.iter().map(|e| e.event.name()).collect();
        assert_eq!(names, vec!["leaf.created", "leaf.deposit_seek", "shard.modified_amount"]);

        runtime.mark_relayed(&pending[0].journal_key(), 1).unwrap();
        runtime.mark_relayed("shard/acct_d1_0", 1).unwrap();
        let pending = runtime.unrelayed_events().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, trunk.entity_id());
        assert_eq!(pending[0].seq, 2);
        assert!(matches!(pending[0].event, DomainEvent::Leaf(_)));
        runtime.shutdown().await;
    }

    #[test]
    fn test_rejects_invalid_tree_config() {
        let mut config = Config::in_memory();
        config.tree.fan_out = 0;
        let result = Runtime::new(&config, Arc::new(MemoryJournal::new()), Arc::new(NullSink));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_command_display() {
        let trunk = RootId::new(AccountId::new("acct"), "wd1").unwrap().trunk();
        let command = Command::Leaf { id: trunk, command: LeafCommand::Cancel };
        assert_eq!(command.to_string(), "Leaf -> acct_wd1_0");
    }
}
