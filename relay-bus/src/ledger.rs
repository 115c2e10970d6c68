//! Ledger facade: the upstream entry point
//!
//! Wires a [`Runtime`] to a [`Dispatcher`] and exposes the account-level
//! operations. Every call enqueues the first command of a cascade and returns;
//! the outcome arrives later over [`Ledger::subscribe`] or is polled through
//! [`Ledger::withdrawal_status`].
//!
//! Deposit and withdrawal ids are idempotency keys: repeating a request with
//! the same amount is a no-op, repeating it with a different amount is a
//! [`Error::Conflict`].

use reduction_core::{
    AccountId, Amount, BranchId, Command, Config, EventSink, LeafCommand, NodeCommand, RootId,
    Runtime, ShardCommand, ShardId,
};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatcher::{Backlog, Delivery, Dispatcher, RelaySink};
use crate::dlq::{DeadLetter, DeadLetterQueue};
use crate::index::ShardIndex;
use crate::message::Outcome;
use crate::retry::RetryPolicy;
use crate::{Error, Result};

const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

/// Requests for one id serialize on one of these
const ADMISSION_STRIPES: usize = 64;

/// Where a withdrawal stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WithdrawalStatus {
    /// Funding in progress
    Pending {
        /// Amount held so far
        funded: Amount,
        /// Amount requested
        amount: Amount,
    },
    /// Fully funded
    Approved {
        /// Amount requested
        amount: Amount,
    },
    /// Could not be funded; holds released
    Canceled,
}

impl WithdrawalStatus {
    /// Whether the withdrawal reached a final state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WithdrawalStatus::Pending { .. })
    }
}

/// Reduction-tree ledger
#[derive(Debug)]
pub struct Ledger {
    runtime: Arc<Runtime>,
    dispatcher: Dispatcher,
    index: Arc<ShardIndex>,
    dlq: Arc<DeadLetterQueue>,
    backlog: Arc<Backlog>,
    outcomes: broadcast::Sender<Outcome>,
    admission: Vec<Mutex<()>>,
    task: JoinHandle<()>,
}

impl Ledger {
    /// Ledger over the journal backend named in `config`
    pub fn open(config: &Config) -> Result<Self> {
        let journal = reduction_core::storage::open_journal(config)?;
        Self::with_journal(config, journal)
    }

    /// Ledger over an explicit journal
    pub fn with_journal(
        config: &Config,
        journal: Arc<dyn reduction_core::storage::Journal>,
    ) -> Result<Self> {
        let backlog = Arc::new(Backlog::new());
        let (sink, events) = RelaySink::channel(backlog.clone());
        let sink = Arc::new(sink);
        let runtime = Arc::new(Runtime::new(config, journal, sink.clone())?);

        let index = Arc::new(ShardIndex::new());
        let shards = runtime.last_shard_events()?;
        for (seq, event) in &shards {
            index.observe(*seq, event);
        }
        let dlq = Arc::new(DeadLetterQueue::new());
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);

        let dispatcher = Dispatcher::new(
            runtime.clone(),
            index.clone(),
            dlq.clone(),
            backlog.clone(),
            outcomes.clone(),
            RetryPolicy::from(&config.relay),
            config.relay.discovery_limit,
        )?;
        let task = dispatcher.clone().spawn(events);

        // journaled before the last stop but never fully relayed
        let unrelayed = runtime.unrelayed_events()?;
        let replayed = unrelayed.len();
        for event in unrelayed {
            sink.publish(event);
        }
        crate::metrics::EVENTS_REPLAYED.inc_by(replayed as u64);

        info!(
            service = %config.service_name,
            backend = ?config.storage.backend,
            shards = shards.len(),
            replayed,
            "Ledger started"
        );

        Ok(Self {
            runtime,
            dispatcher,
            index,
            dlq,
            backlog,
            outcomes,
            admission: (0..ADMISSION_STRIPES).map(|_| Mutex::new(())).collect(),
            task,
        })
    }

    fn admission(&self, key: &impl Hash) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.admission[hasher.finish() as usize % self.admission.len()]
    }

    /// Record a deposit; repeating the same deposit is a no-op
    pub async fn deposit(&self, account: &AccountId, deposit: &str, amount: Amount) -> Result<ShardId> {
        account.validate()?;
        let amount = amount.ensure_positive("deposit amount")?;
        let shard = ShardId::new(account.clone(), deposit)?;

        let _admitted = self.admission(&shard).lock().await;
        let existing = self.runtime.shard(&shard).await?;
        if existing.id.is_some() {
            if existing.high_water == amount {
                return Ok(shard);
            }
            return Err(Error::Conflict(format!(
                "deposit {} was recorded as {}, not {}",
                shard, existing.high_water, amount
            )));
        }

        self.runtime
            .dispatch(Command::Shard {
                id: shard.clone(),
                command: ShardCommand::ModifyAmount { amount },
            })
            .await?;

        info!(%account, deposit, %amount, "Deposit recorded");
        Ok(shard)
    }

    /// Start a withdrawal; the result arrives as an [`Outcome`]
    pub async fn withdraw(&self, account: &AccountId, withdrawal: &str, amount: Amount) -> Result<RootId> {
        account.validate()?;
        let amount = amount.ensure_positive("withdrawal amount")?;
        let root = RootId::new(account.clone(), withdrawal)?;
        let trunk = root.trunk();

        let _admitted = self.admission(&root).lock().await;
        if let Some(existing) = self.requested_amount(&root).await? {
            if existing == amount {
                return Ok(root);
            }
            return Err(Error::Conflict(format!(
                "withdrawal {} was requested as {}, not {}",
                root, existing, amount
            )));
        }

        let command = if amount <= self.runtime.tree().leaf_cap {
            Command::Leaf {
                id: trunk,
                command: LeafCommand::Create { parent: None, amount },
            }
        } else {
            Command::Node {
                id: trunk,
                command: NodeCommand::CreateTrunk { amount },
            }
        };
        self.runtime.dispatch(command).await?;

        info!(%account, withdrawal, %amount, "Withdrawal started");
        Ok(root)
    }

    /// Amount a withdrawal was started with, whichever kind its trunk is
    async fn requested_amount(&self, root: &RootId) -> Result<Option<Amount>> {
        let trunk = root.trunk();
        let node = self.runtime.node(&trunk).await?;
        if node.is_created() {
            return Ok(Some(node.total));
        }
        let leaf = self.runtime.leaf(&trunk).await?;
        Ok(leaf.is_created().then_some(leaf.amount_needed))
    }

    /// Current state of a withdrawal, read from its trunk entity
    pub async fn withdrawal_status(&self, root: &RootId) -> Result<WithdrawalStatus> {
        let trunk = root.trunk();

        let node = self.runtime.node(&trunk).await?;
        if node.is_created() {
            return Ok(if node.canceled {
                WithdrawalStatus::Canceled
            } else if node.approved {
                WithdrawalStatus::Approved { amount: node.total }
            } else {
                WithdrawalStatus::Pending {
                    funded: node.aggregated(),
                    amount: node.total,
                }
            });
        }

        let leaf = self.runtime.leaf(&trunk).await?;
        if leaf.is_created() {
            return Ok(if leaf.canceled {
                WithdrawalStatus::Canceled
            } else if leaf.funded {
                WithdrawalStatus::Approved { amount: leaf.amount_needed }
            } else {
                WithdrawalStatus::Pending {
                    funded: leaf.amount_funded,
                    amount: leaf.amount_needed,
                }
            });
        }

        Err(Error::NotFound(format!("withdrawal {}", root)))
    }

    /// Resolve once the withdrawal is approved or canceled
    pub async fn await_withdrawal(&self, root: &RootId, timeout: Duration) -> Result<WithdrawalStatus> {
        let mut outcomes = self.outcomes.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                let status = self.withdrawal_status(root).await?;
                if status.is_terminal() {
                    return Ok(status);
                }
                match outcomes.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => {
                        return Err(Error::Closed("outcome channel".to_string()))
                    }
                }
            }
        })
        .await
        .map_err(|_| Error::Timeout(format!("withdrawal {}", root)))?
    }

    /// Balance released by the root of the account's balance tree
    pub async fn balance(&self, account: &AccountId) -> Result<Amount> {
        let root = self
            .runtime
            .balance_branch(&BranchId::root(account.clone()))
            .await?;
        Ok(root.released)
    }

    /// Funds not held by any withdrawal, as last seen by the shard index
    pub fn available(&self, account: &AccountId) -> Amount {
        self.index.available(account)
    }

    /// Outcome stream
    pub fn subscribe(&self) -> broadcast::Receiver<Outcome> {
        self.outcomes.subscribe()
    }

    /// Resolve once every cascade in flight has settled
    pub async fn wait_idle(&self) {
        self.backlog.wait_idle().await
    }

    /// Like [`Ledger::wait_idle`], bounded
    pub async fn wait_idle_for(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.wait_idle())
            .await
            .map_err(|_| Error::Timeout(format!("{} units still in flight", self.backlog.pending())))
    }

    /// Parked commands
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dlq.list()
    }

    /// Dead letter queue
    pub fn dead_letter_queue(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    /// Resubmit every reprocessable dead letter, returning how many were sent
    pub fn redeliver_dead_letters(&self) -> usize {
        let ready = self.dlq.take_reprocessable();
        let count = ready.len();
        for entry in ready {
            self.dispatcher.deliver(Delivery {
                command: entry.command,
                origin: format!("dlq/{}", entry.id),
                receipt: entry.receipt,
            });
        }
        if count > 0 {
            warn!(count, "Redelivering dead letters");
        }
        count
    }

    /// Entity runtime
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Runtime and relay metrics in the Prometheus text format
    pub fn export_metrics(&self) -> Result<String> {
        let mut text = self.runtime.metrics().export()?;
        text.push_str(&crate::metrics::export()?);
        Ok(text)
    }

    /// Stop the dispatcher and every actor. Cascades still in flight resume
    /// from the journal when the ledger is reopened.
    pub async fn shutdown(self) {
        self.dispatcher.stop();
        self.task.abort();
        self.runtime.shutdown().await;
        info!("Ledger stopped");
    }
}
