//! Append-only event journal
//!
//! # Column Families
//!
//! - `events` - Journaled events (key: `kind/entity_id` || 0x00 || seq big-endian)
//! - `heads` - Last sequence per entity (key: `kind/entity_id`)
//! - `relayed` - Last sequence whose derived work settled (key: `kind/entity_id`)
//!
//! Big-endian sequence suffixes keep one entity's events contiguous and in
//! order, so loading an entity is a single forward scan.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, StorageBackend};
use crate::{Error, Result};

/// Column family names
const CF_EVENTS: &str = "events";
const CF_HEADS: &str = "heads";
const CF_RELAYED: &str = "relayed";

/// One journaled event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Position within the entity's journal, starting at 1
    pub seq: u64,
    /// When the record was appended
    pub recorded_at: DateTime<Utc>,
    /// bincode-encoded entity event
    pub payload: Vec<u8>,
}

/// Append-only per-entity event log
pub trait Journal: Send + Sync + 'static {
    /// Atomically append `records`; their sequences must continue the journal
    fn append(&self, key: &str, records: &[StoredRecord]) -> Result<()>;

    /// Every record of `key` in sequence order
    fn load(&self, key: &str) -> Result<Vec<StoredRecord>>;

    /// Journal keys starting with `prefix`, in key order
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Records of `key` with a sequence above `after`
    fn load_after(&self, key: &str, after: u64) -> Result<Vec<StoredRecord>> {
        let mut records = self.load(key)?;
        records.retain(|r| r.seq > after);
        Ok(records)
    }

    /// Relay watermark of `key`: every record up to it has been fully relayed
    fn relayed(&self, key: &str) -> Result<u64>;

    /// Raise the relay watermark of `key`; lower values are ignored
    fn mark_relayed(&self, key: &str, seq: u64) -> Result<()>;
}

fn decode_seq(key: &str, bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("corrupt sequence for {}", key)))?;
    Ok(u64::from_be_bytes(raw))
}

fn check_continuity(key: &str, head: u64, records: &[StoredRecord]) -> Result<()> {
    for (offset, record) in records.iter().enumerate() {
        let expected = head + 1 + offset as u64;
        if record.seq != expected {
            return Err(Error::InvariantViolation(format!(
                "journal {} expected seq {}, got {}",
                key, expected, record.seq
            )));
        }
    }
    Ok(())
}

/// Journal backend selected by configuration
pub fn open_journal(config: &Config) -> Result<Arc<dyn Journal>> {
    match config.storage.backend {
        StorageBackend::Rocksdb => Ok(Arc::new(Storage::open(config)?)),
        StorageBackend::Memory => Ok(Arc::new(MemoryJournal::new())),
    }
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let tuning = &config.storage.rocksdb;
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(tuning.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(tuning.max_write_buffer_number);
        db_opts.set_max_background_jobs(tuning.max_background_jobs);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_EVENTS, Self::cf_options_events()),
            ColumnFamilyDescriptor::new(CF_HEADS, Self::cf_options_heads()),
            ColumnFamilyDescriptor::new(CF_RELAYED, Self::cf_options_heads()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB journal");

        Ok(Self {
            db: Arc::new(db),
            sync_writes: tuning.sync_writes,
        })
    }

    fn cf_options_events() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_heads() -> Options {
        let mut opts = Options::default();
        // Heads are read on every append
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn event_prefix(key: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(key.len() + 1);
        prefix.extend_from_slice(key.as_bytes());
        prefix.push(0);
        prefix
    }

    fn event_key(key: &str, seq: u64) -> Vec<u8> {
        let mut bytes = Self::event_prefix(key);
        bytes.extend_from_slice(&seq.to_be_bytes());
        bytes
    }

    /// Last appended sequence for `key` (0 when empty)
    pub fn head(&self, key: &str) -> Result<u64> {
        let cf = self.cf_handle(CF_HEADS)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => decode_seq(key, &bytes),
            None => Ok(0),
        }
    }
}

impl Journal for Storage {
    fn append(&self, key: &str, records: &[StoredRecord]) -> Result<()> {
        let Some(last) = records.last() else {
            return Ok(());
        };
        check_continuity(key, self.head(key)?, records)?;

        let cf_events = self.cf_handle(CF_EVENTS)?;
        let cf_heads = self.cf_handle(CF_HEADS)?;

        let mut batch = WriteBatch::default();
        for record in records {
            let value = bincode::serialize(record)?;
            batch.put_cf(cf_events, Self::event_key(key, record.seq), value);
        }
        batch.put_cf(cf_heads, key.as_bytes(), last.seq.to_be_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        tracing::trace!(key, head = last.seq, count = records.len(), "Journal appended");
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<StoredRecord>> {
        let cf = self.cf_handle(CF_EVENTS)?;
        let prefix = Self::event_prefix(key);

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut records = Vec::new();
        for item in iter {
            let (k, v) = item?;
            if !k.starts_with(&prefix) {
                break;
            }
            records.push(bincode::deserialize::<StoredRecord>(&v)?);
        }
        Ok(records)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let cf = self.cf_handle(CF_HEADS)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        let mut keys = Vec::new();
        for item in iter {
            let (k, _) = item?;
            if !k.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(k.to_vec())
                .map_err(|_| Error::Storage("non-utf8 journal key".to_string()))?;
            keys.push(key);
        }
        Ok(keys)
    }

    fn load_after(&self, key: &str, after: u64) -> Result<Vec<StoredRecord>> {
        let cf = self.cf_handle(CF_EVENTS)?;
        let prefix = Self::event_prefix(key);
        let start = Self::event_key(key, after.saturating_add(1));

        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (k, v) = item?;
            if !k.starts_with(&prefix) {
                break;
            }
            records.push(bincode::deserialize::<StoredRecord>(&v)?);
        }
        Ok(records)
    }

    fn relayed(&self, key: &str) -> Result<u64> {
        let cf = self.cf_handle(CF_RELAYED)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => decode_seq(key, &bytes),
            None => Ok(0),
        }
    }

    fn mark_relayed(&self, key: &str, seq: u64) -> Result<()> {
        if seq <= self.relayed(key)? {
            return Ok(());
        }
        let cf = self.cf_handle(CF_RELAYED)?;
        self.db.put_cf(cf, key.as_bytes(), seq.to_be_bytes())?;
        Ok(())
    }
}

/// Process-local journal
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: RwLock<HashMap<String, Vec<StoredRecord>>>,
    relayed: RwLock<HashMap<String, u64>>,
}

impl MemoryJournal {
    /// Empty journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities with at least one record
    pub fn entity_count(&self) -> usize {
        self.entries.read().len()
    }
}

impl Journal for MemoryJournal {
    fn append(&self, key: &str, records: &[StoredRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries.write();
        let journal = entries.entry(key.to_string()).or_default();
        let head = journal.last().map(|r| r.seq).unwrap_or(0);
        check_continuity(key, head, records)?;
        journal.extend_from_slice(records);
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<StoredRecord>> {
        Ok(self.entries.read().get(key).cloned().unwrap_or_default())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn relayed(&self, key: &str) -> Result<u64> {
        Ok(self.relayed.read().get(key).copied().unwrap_or(0))
    }

    fn mark_relayed(&self, key: &str, seq: u64) -> Result<()> {
        let mut relayed = self.relayed.write();
        let mark = relayed.entry(key.to_string()).or_insert(0);
        *mark = (*mark).max(seq);
        Ok(())
    }
}
