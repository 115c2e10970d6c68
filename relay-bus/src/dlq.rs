//! Dead letter queue for relayed commands
//!
//! Commands whose delivery failed are parked here with their failure
//! metadata:
//! - Failure reason and attempt count
//! - The event that derived the command
//! - Whether resubmission may succeed
//!
//! Reprocessing hands the command back to the caller for redelivery.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reduction_core::Command;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::retry::DeliveryFailure;
use crate::watermark::Receipt;
use crate::{Error, Result};

/// Parked command with failure metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Entry id
    pub id: String,
    /// Command that could not be delivered
    pub command: Command,
    /// Event that derived the command (`kind/entity_id#seq`)
    pub origin: String,
    /// Final error text
    pub failure_reason: String,
    /// Attempts made
    pub retry_count: u32,
    /// When the command was parked
    pub first_failure_at: DateTime<Utc>,
    /// Whether resubmission may succeed
    pub reprocessable: bool,
    /// Settles the originating event once a redelivery succeeds
    #[serde(default)]
    pub receipt: Option<Receipt>,
}

/// DLQ statistics
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DlqStats {
    /// Parked entries
    pub total_entries: usize,
    /// Entries eligible for resubmission
    pub reprocessable: usize,
    /// Entries per target kind
    pub by_target: HashMap<String, usize>,
}

/// In-process dead letter queue
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    entries: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a command, returning the entry id
    pub fn route(
        &self,
        command: Command,
        origin: String,
        receipt: Option<Receipt>,
        failure: &DeliveryFailure,
    ) -> String {
        let entry = DeadLetter {
            id: Uuid::new_v4().to_string(),
            failure_reason: failure.error().to_string(),
            retry_count: failure.attempts(),
            first_failure_at: Utc::now(),
            reprocessable: failure.reprocessable(),
            command,
            origin,
            receipt,
        };
        warn!(
            id = %entry.id,
            command = %entry.command,
            origin = %entry.origin,
            reason = %entry.failure_reason,
            attempts = entry.retry_count,
            "Command moved to dead letter queue"
        );
        crate::metrics::DEAD_LETTERS
            .with_label_values(&[failure.reason()])
            .inc();

        let id = entry.id.clone();
        self.entries.lock().push(entry);
        id
    }

    /// Snapshot of every entry
    pub fn list(&self) -> Vec<DeadLetter> {
        self.entries.lock().clone()
    }

    /// Remove one reprocessable entry and return it
    pub fn reprocess(&self, id: &str) -> Result<DeadLetter> {
        let mut entries = self.entries.lock();
        let position = entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| Error::NotFound(format!("dead letter {}", id)))?;

        if !entries[position].reprocessable {
            return Err(Error::NotReprocessable(format!(
                "dead letter {} is not reprocessable: {}",
                id, entries[position].failure_reason
            )));
        }

        let entry = entries.remove(position);
        info!(id, command = %entry.command, "Reprocessing dead letter");
        Ok(entry)
    }

    /// Remove every reprocessable entry
    pub fn take_reprocessable(&self) -> Vec<DeadLetter> {
        let mut entries = self.entries.lock();
        let (ready, kept): (Vec<_>, Vec<_>) = entries.drain(..).partition(|e| e.reprocessable);
        *entries = kept;
        ready
    }

    /// Parked entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is parked
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Queue statistics
    pub fn stats(&self) -> DlqStats {
        let entries = self.entries.lock();
        let mut stats = DlqStats {
            total_entries: entries.len(),
            ..DlqStats::default()
        };
        for entry in entries.iter() {
            if entry.reprocessable {
                stats.reprocessable += 1;
            }
            *stats
                .by_target
                .entry(format!("{:?}", entry.command.kind()))
                .or_default() += 1;
        }
        stats
    }

    /// Entries as a JSON array
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&*self.entries.lock())?)
    }
}
