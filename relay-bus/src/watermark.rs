//! Relay watermarks
//!
//! An event is relayed once every command derived from it was delivered or
//! rejected. Per entity, the longest settled prefix of its journal is written
//! back through [`Runtime::mark_relayed`]; anything past that mark is
//! republished on the next start, so a crash between journaling and delivery
//! loses no cascade.
//!
//! Commands that exhaust their retries keep their event open. The receipt
//! travels with the dead letter and settles when a redelivery succeeds.

use parking_lot::Mutex;
use reduction_core::{PublishedEvent, Runtime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

/// Identifies the event a delivery was derived from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receipt {
    /// Journal key of the emitting entity
    pub key: String,
    /// Journal sequence of the event
    pub seq: u64,
}

/// Open events per entity: sequence -> deliveries not yet settled
#[derive(Debug)]
pub struct RelayWatermarks {
    runtime: Arc<Runtime>,
    open: Mutex<HashMap<String, BTreeMap<u64, usize>>>,
}

impl RelayWatermarks {
    /// Tracker writing marks through `runtime`
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Register an event that derived `deliveries` commands. Events of one
    /// entity must be opened in sequence order.
    pub fn open(&self, published: &PublishedEvent, deliveries: usize) -> Receipt {
        let receipt = Receipt {
            key: published.journal_key(),
            seq: published.seq,
        };
        let mut open = self.open.lock();
        let window = open.entry(receipt.key.clone()).or_default();
        window.insert(receipt.seq, deliveries);
        if deliveries == 0 {
            self.advance(&mut open, &receipt.key);
        }
        receipt
    }

    /// One delivery derived from `receipt` finished
    pub fn settle(&self, receipt: &Receipt) {
        let mut open = self.open.lock();
        match open
            .get_mut(&receipt.key)
            .and_then(|window| window.get_mut(&receipt.seq))
        {
            Some(left) => *left = left.saturating_sub(1),
            // opened before a restart; the next run republishes it
            None => return,
        }
        self.advance(&mut open, &receipt.key);
    }

    fn advance(&self, open: &mut HashMap<String, BTreeMap<u64, usize>>, key: &str) {
        let Some(window) = open.get_mut(key) else {
            return;
        };
        let mut settled = None;
        while let Some((&seq, &left)) = window.first_key_value() {
            if left > 0 {
                break;
            }
            window.pop_first();
            settled = Some(seq);
        }
        if window.is_empty() {
            open.remove(key);
        }

        if let Some(seq) = settled {
            if let Err(e) = self.runtime.mark_relayed(key, seq) {
                // the events are republished on restart instead
                warn!(key, seq, error = %e, "Failed to record relay watermark");
            }
        }
    }

    /// Events still waiting on deliveries
    pub fn open_events(&self) -> usize {
        self.open.lock().values().map(|w| w.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reduction_core::entity::NullSink;
    use reduction_core::storage::{Journal, MemoryJournal};
    use reduction_core::{AccountId, Amount, Config, DomainEvent, ShardEvent, ShardId};

    fn published(seq: u64) -> PublishedEvent {
        let id = ShardId::new(AccountId::new("acct"), "d1").unwrap();
        PublishedEvent {
            kind: "shard".to_string(),
            entity_id: id.entity_id(),
            seq,
            recorded_at: Utc::now(),
            event: DomainEvent::Shard(ShardEvent::WithdrawalCanceled {
                claimant: reduction_core::RootId::new(AccountId::new("acct"), "wd1")
                    .unwrap()
                    .trunk(),
                id,
                released: Amount::from_cents(100),
                available: Amount::from_cents(100),
            }),
        }
    }

    fn tracker() -> (RelayWatermarks, Arc<MemoryJournal>) {
        let journal = Arc::new(MemoryJournal::new());
        let runtime = Runtime::new(&Config::in_memory(), journal.clone(), Arc::new(NullSink)).unwrap();
        (RelayWatermarks::new(Arc::new(runtime)), journal)
    }

    #[tokio::test]
    async fn test_mark_advances_over_settled_prefix_only() {
        let (marks, journal) = tracker();
        let first = marks.open(&published(1), 2);
        let second = marks.open(&published(2), 1);
        let third = marks.open(&published(3), 0);

        marks.settle(&second);
        assert_eq!(journal.relayed(&first.key).unwrap(), 0);

        marks.settle(&first);
        assert_eq!(journal.relayed(&first.key).unwrap(), 0);
        marks.settle(&first);
        // 1 and 2 settled, 3 had nothing to deliver
        assert_eq!(journal.relayed(&third.key).unwrap(), 3);
        assert_eq!(marks.open_events(), 0);
    }

    #[tokio::test]
    async fn test_unsettled_event_holds_the_mark() {
        let (marks, journal) = tracker();
        let parked = marks.open(&published(1), 1);
        marks.open(&published(2), 0);
        assert_eq!(journal.relayed(&parked.key).unwrap(), 0);
        assert_eq!(marks.open_events(), 2);

        // a late settle from a previous run is ignored
        marks.settle(&Receipt { key: parked.key.clone(), seq: 9 });
        assert_eq!(marks.open_events(), 2);

        marks.settle(&parked);
        assert_eq!(journal.relayed(&parked.key).unwrap(), 2);
    }
}
