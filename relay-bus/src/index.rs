//! Shard discovery read model
//!
//! Tracks the last known availability of every deposit shard, grouped by
//! owner. Rows are refreshed from shard events as the dispatcher sees them,
//! so lookups may lag the shards themselves; a shard that turns out to be
//! empty simply grants zero and the leaf asks again. Each row remembers the
//! journal sequence it came from and never moves backwards, so replayed
//! events cannot overwrite newer availability.

use parking_lot::RwLock;
use reduction_core::{AccountId, Amount, ShardEvent, ShardId};
use std::collections::{BTreeMap, HashMap};

/// Available funds per shard, per owner
#[derive(Debug, Default)]
pub struct ShardIndex {
    rows: RwLock<HashMap<AccountId, BTreeMap<ShardId, Row>>>,
}

#[derive(Debug, Clone, Copy)]
struct Row {
    seq: u64,
    available: Amount,
}

impl ShardIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one shard event, journaled at `seq`, into the index
    pub fn observe(&self, seq: u64, event: &ShardEvent) {
        let shard = event.shard();
        let mut rows = self.rows.write();
        let shards = rows.entry(shard.owner().clone()).or_default();
        let row = Row {
            seq,
            available: event.available(),
        };
        match shards.get_mut(shard) {
            Some(current) if current.seq >= seq => {}
            Some(current) => *current = row,
            None => {
                shards.insert(shard.clone(), row);
            }
        }
    }

    /// Up to `limit` shards of `owner` with positive availability
    pub fn candidates(&self, owner: &AccountId, limit: usize) -> Vec<ShardId> {
        let rows = self.rows.read();
        rows.get(owner)
            .map(|shards| {
                shards
                    .iter()
                    .filter(|(_, row)| row.available.is_positive())
                    .take(limit)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Last known availability of one shard
    pub fn available_in(&self, shard: &ShardId) -> Option<Amount> {
        self.rows
            .read()
            .get(shard.owner())
            .and_then(|shards| shards.get(shard).map(|row| row.available))
    }

    /// Sum of last known availability across an owner's shards
    pub fn available(&self, owner: &AccountId) -> Amount {
        self.rows
            .read()
            .get(owner)
            .map(|shards| shards.values().map(|row| row.available).sum())
            .unwrap_or(Amount::ZERO)
    }

    /// Number of shards known for `owner`
    pub fn shard_count(&self, owner: &AccountId) -> usize {
        self.rows.read().get(owner).map(|s| s.len()).unwrap_or(0)
    }
}
