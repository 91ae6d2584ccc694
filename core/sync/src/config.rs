//! Store and sync configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ledgersync_common::{Error, Result};

use crate::conflict::ConflictStrategy;

/// Path value that opens a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Configuration for opening a [`SyncStore`](crate::SyncStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file, or `:memory:`.
    pub path: PathBuf,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// Use write-ahead logging so other handles can read concurrently.
    pub wal: bool,
    /// Primary key column used when applying remote rows to user tables.
    pub key_column: String,
    /// Remote timestamps further ahead of local time than this are not fed
    /// into the local clock. `None` disables the check.
    pub max_clock_drift_ms: Option<u64>,
}

impl StoreConfig {
    /// Config for a file-backed store with default settings.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Set the key column.
    pub fn with_key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = column.into();
        self
    }

    /// Whether this config targets an in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(IN_MEMORY),
            busy_timeout_ms: 5_000,
            wal: true,
            key_column: "id".to_string(),
            max_clock_drift_ms: None,
        }
    }
}

/// Configuration for a [`SyncClient`](crate::SyncClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Store settings.
    pub store: StoreConfig,
    /// This device's origin identifier.
    pub origin: String,
    /// Schema version the application expects; migrations run up to it.
    pub schema_version: u32,
    /// Maximum operations handed to one push call.
    pub push_batch_size: usize,
    /// Maximum pull round trips per sync cycle.
    pub max_pull_batches: usize,
    /// Resolution used by [`SyncClient::sync`](crate::SyncClient::sync).
    pub conflict_strategy: ConflictStrategy,
    /// Maximum retry attempts for push and pull.
    pub max_retries: u32,
    /// Initial retry delay in milliseconds.
    pub retry_initial_delay_ms: u64,
    /// Retry delay cap in milliseconds.
    pub retry_max_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            origin: String::new(),
            schema_version: 0,
            push_batch_size: 500,
            max_pull_batches: 20,
            conflict_strategy: ConflictStrategy::LastWriterWins,
            max_retries: 3,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
        }
    }
}

impl SyncConfig {
    /// Config for `origin` with defaults for everything else.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check the values make sense together.
    ///
    /// # Errors
    /// - Returns error if origin is empty
    /// - Returns error if a batch limit is zero
    pub fn validate(&self) -> Result<()> {
        if self.origin.is_empty() {
            return Err(Error::invalid("origin cannot be empty"));
        }
        if self.push_batch_size == 0 {
            return Err(Error::invalid("push_batch_size must be positive"));
        }
        if self.max_pull_batches == 0 {
            return Err(Error::invalid("max_pull_batches must be positive"));
        }
        if self.store.key_column.is_empty() {
            return Err(Error::invalid("key_column cannot be empty"));
        }
        Ok(())
    }
}
