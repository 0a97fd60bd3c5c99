//! Coordinator configuration via `loadtxn.toml`
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Values are read once at startup and handed to the managers by value.

use crate::error::{Result, TxnError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "loadtxn.toml";

/// Durability of edit log appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditLogDurability {
    /// fsync after every append
    Strict,
    /// fsync every `interval_ms` or `batch_size` appends
    Batched,
}

/// Transaction coordinator configuration loaded from `loadtxn.toml`.
///
/// # Example
///
/// ```toml
/// label_keep_max_second = 259200
/// max_running_txn_num_per_db = 1000
/// edit_log_durability = "strict"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    /// Retention of finished transactions. `<= 0` purges them on the next sweep.
    pub label_keep_max_second: i64,
    /// Cap on counted running transactions per database
    pub max_running_txn_num_per_db: usize,
    /// Default stream load timeout
    pub stream_load_default_timeout_second: i64,
    /// Largest timeout accepted by begin
    pub max_load_timeout_second: i64,
    /// Smallest timeout accepted by begin
    pub min_load_timeout_second: i64,
    /// Default timeout for compaction transactions
    pub lake_compaction_default_timeout_second: i64,
    /// Cap on members per publish batch
    pub transaction_publish_batch_max_size: usize,
    /// Edit log fsync policy
    pub edit_log_durability: EditLogDurability,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            label_keep_max_second: 3 * 24 * 3600,
            max_running_txn_num_per_db: 1000,
            stream_load_default_timeout_second: 600,
            max_load_timeout_second: 3 * 24 * 3600,
            min_load_timeout_second: 1,
            lake_compaction_default_timeout_second: 24 * 3600,
            transaction_publish_batch_max_size: 64,
            edit_log_durability: EditLogDurability::Strict,
        }
    }
}

impl TxnConfig {
    /// Config for tests: small retention and cap
    pub fn for_testing() -> Self {
        Self {
            label_keep_max_second: 10,
            max_running_txn_num_per_db: 100,
            ..Default::default()
        }
    }

    /// Set the retention window
    pub fn with_label_keep_max_second(mut self, seconds: i64) -> Self {
        self.label_keep_max_second = seconds;
        self
    }

    /// Set the per-database running cap
    pub fn with_max_running_txn_num_per_db(mut self, max: usize) -> Self {
        self.max_running_txn_num_per_db = max;
        self
    }

    /// Set the publish batch cap
    pub fn with_publish_batch_max_size(mut self, max: usize) -> Self {
        self.transaction_publish_batch_max_size = max;
        self
    }

    /// Retention window in milliseconds
    pub fn label_keep_max_ms(&self) -> i64 {
        self.label_keep_max_second.saturating_mul(1000)
    }

    /// Check a begin timeout against the configured window
    pub fn check_timeout(&self, timeout_sec: i64) -> Result<()> {
        if timeout_sec < self.min_load_timeout_second || timeout_sec > self.max_load_timeout_second
        {
            return Err(TxnError::InvalidTimeout {
                timeout_sec,
                min: self.min_load_timeout_second,
                max: self.max_load_timeout_second,
            });
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_running_txn_num_per_db == 0 {
            return Err(TxnError::Config(
                "max_running_txn_num_per_db must be positive".to_string(),
            ));
        }
        if self.transaction_publish_batch_max_size == 0 {
            return Err(TxnError::Config(
                "transaction_publish_batch_max_size must be positive".to_string(),
            ));
        }
        if self.min_load_timeout_second > self.max_load_timeout_second {
            return Err(TxnError::Config(format!(
                "min_load_timeout_second {} exceeds max_load_timeout_second {}",
                self.min_load_timeout_second, self.max_load_timeout_second
            )));
        }
        Ok(())
    }

    /// Read, parse and validate config from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TxnError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate config from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: TxnConfig = toml::from_str(content)
            .map_err(|e| TxnError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TxnError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
