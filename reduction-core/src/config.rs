//! Configuration for the reduction ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::reduction::{AggregationShape, CapacityShape, FundingShape};
use crate::types::Amount;
use crate::{Error, Result};

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Journal configuration
    pub storage: StorageConfig,

    /// Actor runtime configuration
    pub actor: ActorConfig,

    /// Tree shape parameters
    pub tree: TreeConfig,

    /// Relay delivery configuration
    pub relay: RelayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/reduction-ledger"),
            service_name: "reduction-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            storage: StorageConfig::default(),
            actor: ActorConfig::default(),
            tree: TreeConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

/// Journal backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// RocksDB under `data_dir`
    Rocksdb,
    /// Process-local, lost on exit
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rocksdb" => Ok(StorageBackend::Rocksdb),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(Error::Config(format!("unknown storage backend {:?}", other))),
        }
    }
}

/// Journal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend selection
    pub backend: StorageBackend,

    /// RocksDB tuning
    pub rocksdb: RocksDBConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Rocksdb,
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Sync the WAL on every append
    pub sync_writes: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,       // 64 MB
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            sync_writes: false,
        }
    }
}

/// Actor runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Mailbox capacity per entity
    pub mailbox_capacity: usize,

    /// An actor idle this long (milliseconds) is stopped and dropped from its
    /// registry; 0 keeps actors for the life of the runtime
    pub idle_timeout_ms: u64,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            idle_timeout_ms: 30_000,
        }
    }
}

impl ActorConfig {
    /// Idle timeout, if passivation is enabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// Tree shape parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Largest amount one funding leaf seeks
    pub leaf_cap: Amount,

    /// Largest number of children per withdrawal node
    pub fan_out: usize,

    /// Largest amount one deposit shard holds
    pub shard_capacity: Amount,

    /// Depth of the balance aggregation tree
    pub balance_levels: u32,

    /// Children per balance branch
    pub balance_branch_factor: u64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            leaf_cap: Amount::from_cents(2_500),      // $25.00
            fan_out: 25,
            shard_capacity: Amount::from_cents(2_500), // $25.00
            balance_levels: 4,
            balance_branch_factor: 100,                // 100^4 slots
        }
    }
}

impl TreeConfig {
    /// Withdrawal tree shape
    pub fn funding_shape(&self) -> FundingShape {
        FundingShape {
            leaf_cap: self.leaf_cap,
            fan_out: self.fan_out,
        }
    }

    /// Deposit shard shape
    pub fn capacity_shape(&self) -> CapacityShape {
        CapacityShape {
            capacity: self.shard_capacity,
        }
    }

    /// Balance tree shape
    pub fn aggregation_shape(&self) -> Result<AggregationShape> {
        AggregationShape::new(self.balance_levels, self.balance_branch_factor)
    }

    /// Reject shapes the split arithmetic cannot work with
    pub fn validate(&self) -> Result<()> {
        if !self.leaf_cap.is_positive() || !self.shard_capacity.is_positive() {
            return Err(Error::Config(format!(
                "leaf cap ({}) and shard capacity ({}) must be positive",
                self.leaf_cap, self.shard_capacity
            )));
        }
        if self.fan_out < 2 {
            return Err(Error::Config(format!(
                "fan-out must be at least 2, got {}",
                self.fan_out
            )));
        }
        self.aggregation_shape().map(|_| ())
    }
}

/// Relay delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Delivery attempts before dead-lettering
    pub max_retries: u32,

    /// First retry delay (milliseconds)
    pub initial_delay_ms: u64,

    /// Retry delay ceiling (milliseconds)
    pub max_delay_ms: u64,

    /// Delay growth per attempt
    pub backoff_multiplier: f64,

    /// Random spread applied to each delay (0.0 - 1.0)
    pub jitter_factor: f64,

    /// Shard candidates returned per discovery lookup
    pub discovery_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_delay_ms: 10,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            discovery_limit: 100,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.tree.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(idle) = std::env::var("LEDGER_ACTOR_IDLE_MS") {
            config.actor.idle_timeout_ms = idle
                .parse()
                .map_err(|e| Error::Config(format!("LEDGER_ACTOR_IDLE_MS: {}", e)))?;
        }

        if let Ok(backend) = std::env::var("LEDGER_STORAGE_BACKEND") {
            config.storage.backend = backend.parse()?;
        }

        if let Ok(cap) = std::env::var("LEDGER_LEAF_CAP") {
            config.tree.leaf_cap = cap.parse()?;
        }

        if let Ok(capacity) = std::env::var("LEDGER_SHARD_CAPACITY") {
            config.tree.shard_capacity = capacity.parse()?;
        }

        if let Ok(fan_out) = std::env::var("LEDGER_FAN_OUT") {
            config.tree.fan_out = fan_out
                .parse()
                .map_err(|e| Error::Config(format!("LEDGER_FAN_OUT: {}", e)))?;
        }

        config.tree.validate()?;
        Ok(config)
    }

    /// In-memory configuration for tests and simulations
    pub fn in_memory() -> Self {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        config
    }
}
