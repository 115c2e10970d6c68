//! Reduction Core
//!
//! Event-sourced entities of a reduction-tree ledger: withdrawals are sourced
//! by fan-out trees of funding leaves drawing on capacity-bounded deposit
//! shards, and balances are folded by a fixed-depth fan-in tree.
//!
//! # Architecture
//!
//! - **Event Sourcing**: Entity state is a deterministic fold of its journal
//! - **Single Writer per Entity**: One Tokio actor per entity key, entities run in parallel
//! - **Last-Writer-Wins Reduction**: Cumulative child reports survive duplicates and reordering
//! - **Exact Arithmetic**: Two-decimal amounts split on whole cents
//!
//! # Invariants
//!
//! - Splits conserve the total to the cent
//! - A node's aggregate equals the sum of its children's latest reports
//! - A shard never holds more than it has: `Σ holds ≤ current`
//! - Canceled and approved states are terminal

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod balance;
pub mod config;
pub mod entity;
pub mod error;
pub mod leaf;
pub mod metrics;
pub mod node;
pub mod reduction;
pub mod registry;
pub mod runtime;
pub mod shard;
pub mod split;
pub mod storage;
pub mod types;

// Re-exports
pub use balance::{BalanceBranch, BalanceCommand, BalanceEvent};
pub use config::Config;
pub use entity::{DomainEvent, Entity, EventSink, PublishedEvent};
pub use error::{Error, Result};
pub use leaf::{FundingLeaf, LeafCommand, LeafEvent};
pub use node::{ChildKind, NodeCommand, NodeEvent, Subbranch, TreeNode};
pub use runtime::{Command, Runtime, TargetKind};
pub use shard::{DepositShard, ShardCommand, ShardEvent};
pub use types::{AccountId, Amount, BranchId, RootId, ShardId, TreeId};
