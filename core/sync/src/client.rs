//! Push/pull sync driver.
//!
//! [`SyncClient`] owns a store and runs sync cycles against caller-supplied
//! transport functions. It performs no I/O itself besides the store.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use ledgersync_common::{OperationId, Result};

use crate::apply::{ApplyReport, RemoteBatch};
use crate::config::SyncConfig;
use crate::conflict::Resolver;
use crate::hlc::{ClockSource, SystemClock};
use crate::migration::Migrator;
use crate::oplog::Operation;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::store::SyncStore;

/// Result of one sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Operations handed to the push function.
    pub pushed: usize,
    /// Operations moved to acked.
    pub acked: usize,
    /// Pull round trips made.
    pub pull_batches: usize,
    /// Totals over all pulled batches.
    pub remote: ApplyReport,
}

/// Sync driver over one store.
#[derive(Debug)]
pub struct SyncClient {
    store: SyncStore,
    config: SyncConfig,
    retry: RetryExecutor,
}

impl SyncClient {
    /// Open the configured store, create the sync tables and migrate to
    /// `config.schema_version`.
    ///
    /// # Errors
    /// - `InvalidArgument` if the config is invalid
    /// - `SchemaVersion` if migration fails or the store is newer than the
    ///   configured version
    pub fn open(config: SyncConfig, migrator: &Migrator) -> Result<Self> {
        Self::open_with_clock(config, migrator, Arc::new(SystemClock))
    }

    /// [`open`](Self::open) with a custom clock source.
    pub fn open_with_clock(
        config: SyncConfig,
        migrator: &Migrator,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self> {
        config.validate()?;
        let mut store = SyncStore::open_with_clock(&config.store, clock)?;
        store.init_schema()?;
        let report = store.migrate(migrator, config.schema_version)?;
        info!(
            "Sync client ready for origin {} at schema {}",
            config.origin, report.to
        );

        Ok(Self {
            retry: RetryExecutor::new(RetryConfig::from_sync_config(&config)),
            store,
            config,
        })
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = RetryExecutor::new(retry);
        self
    }

    /// This device's origin.
    pub fn origin(&self) -> &str {
        &self.config.origin
    }

    /// Client settings.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The underlying store.
    pub fn store(&self) -> &SyncStore {
        &self.store
    }

    /// The underlying store, for logging local writes.
    pub fn store_mut(&mut self) -> &mut SyncStore {
        &mut self.store
    }

    /// Give the store back.
    pub fn into_store(self) -> SyncStore {
        self.store
    }

    /// Drain the pending queue through `push`.
    ///
    /// `push` receives up to `push_batch_size` operations and returns the ids
    /// the remote acknowledged. Sent operations become pushed, acknowledged
    /// ones acked. Returns `(pushed, acked)`.
    pub fn push<P>(&mut self, mut push: P) -> Result<(usize, usize)>
    where
        P: FnMut(&[Operation]) -> Result<Vec<OperationId>>,
    {
        let mut pushed = 0;
        let mut acked = 0;
        loop {
            let batch = self.store.pending_ops(self.config.push_batch_size)?;
            if batch.is_empty() {
                break;
            }

            let ack_ids = self.retry.execute(|| push(&batch))?;
            let sent: Vec<_> = batch.iter().map(|op| op.id).collect();
            pushed += self.store.mark_ops_pushed(&sent)?;
            acked += self.store.mark_ops_acked(&ack_ids)?;
            debug!("Pushed {} operations, {} acknowledged", sent.len(), ack_ids.len());
        }
        Ok((pushed, acked))
    }

    /// Pull and apply batches starting at the persisted cursor.
    ///
    /// `pull` receives the current cursor. Stops when the remote reports no
    /// more data, returns an empty page, or `max_pull_batches` is reached.
    pub fn pull<G, R>(&mut self, mut pull: G, resolver: &mut R) -> Result<(usize, ApplyReport)>
    where
        G: FnMut(Option<&str>) -> Result<RemoteBatch>,
        R: Resolver + ?Sized,
    {
        let mut total = ApplyReport::default();
        let mut batches = 0;
        while batches < self.config.max_pull_batches {
            let cursor = self.store.remote_cursor()?;
            let batch = self.retry.execute(|| pull(cursor.as_deref()))?;
            batches += 1;

            total += self.store.apply_remote_batch(&batch, resolver)?;
            if !batch.has_more || batch.ops.is_empty() {
                break;
            }
        }
        Ok((batches, total))
    }

    /// Push local changes, then pull remote ones.
    pub fn sync_cycle<P, G, R>(&mut self, push: P, pull: G, resolver: &mut R) -> Result<SyncReport>
    where
        P: FnMut(&[Operation]) -> Result<Vec<OperationId>>,
        G: FnMut(Option<&str>) -> Result<RemoteBatch>,
        R: Resolver + ?Sized,
    {
        let (pushed, acked) = self.push(push)?;
        let (pull_batches, remote) = self.pull(pull, resolver)?;
        let report = SyncReport {
            pushed,
            acked,
            pull_batches,
            remote,
        };
        info!(
            "Sync cycle done: pushed {}, acked {}, applied {}, skipped {}, conflicts {}",
            report.pushed,
            report.acked,
            report.remote.applied,
            report.remote.skipped,
            report.remote.conflicts
        );
        Ok(report)
    }

    /// [`sync_cycle`](Self::sync_cycle) using the configured conflict
    /// strategy.
    pub fn sync<P, G>(&mut self, push: P, pull: G) -> Result<SyncReport>
    where
        P: FnMut(&[Operation]) -> Result<Vec<OperationId>>,
        G: FnMut(Option<&str>) -> Result<RemoteBatch>,
    {
        let mut strategy = self.config.conflict_strategy;
        self.sync_cycle(push, pull, &mut strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ledgersync_common::{Error, OpType};
    use serde_json::json;

    use crate::apply::RemoteOperation;
    use crate::conflict::LastWriterWins;
    use crate::hlc::{ManualClock, Timestamp};
    use crate::migration::SqlMigration;

    fn migrator() -> Migrator {
        Migrator::new()
            .with(SqlMigration::new(
                1,
                "trips",
                "CREATE TABLE trips (id TEXT PRIMARY KEY, name TEXT);",
            ))
            .unwrap()
    }

    fn client(origin: &str) -> SyncClient {
        let mut config = SyncConfig::new(origin);
        config.schema_version = 1;
        config.push_batch_size = 2;
        SyncClient::open_with_clock(config, &migrator(), Arc::new(ManualClock::new(1_000)))
            .unwrap()
            .with_retry(RetryConfig::new(2).with_initial_delay(Duration::from_millis(1)))
    }

    fn remote_insert(remote_id: &str, row_id: &str, ms: u64) -> RemoteOperation {
        RemoteOperation {
            remote_id: remote_id.into(),
            table: "trips".into(),
            row_id: row_id.into(),
            op_type: OpType::Insert,
            columns: None,
            new_row: Some(json!({"id": row_id, "name": remote_id})),
            old_row: None,
            hlc: Timestamp::new(ms, 0, "B").unwrap().encode(),
            origin: "B".into(),
        }
    }

    #[test]
    fn test_open_migrates_to_configured_version() {
        let client = client("A");
        assert_eq!(client.store().schema_version().unwrap(), 1);
        assert_eq!(client.origin(), "A");
    }

    #[test]
    fn test_push_drains_queue_in_batches() {
        let mut client = client("A");
        for i in 0..5 {
            client
                .store_mut()
                .log_delete("trips", &format!("r{}", i), "A")
                .unwrap();
        }

        let mut calls = Vec::new();
        let (pushed, acked) = client
            .push(|ops: &[Operation]| {
                calls.push(ops.len());
                // Acknowledge all but the last op of each batch.
                Ok(ops[..ops.len() - 1].iter().map(|op| op.id).collect())
            })
            .unwrap();

        assert_eq!(calls, vec![2, 2, 1]);
        assert_eq!(pushed, 5);
        assert_eq!(acked, 2);
        assert_eq!(client.store().pending_count().unwrap(), 0);
    }

    #[test]
    fn test_transport_failure_is_retried_then_surfaced() {
        let mut client = client("A");
        client.store_mut().log_delete("trips", "r1", "A").unwrap();

        let mut attempts = 0;
        let err = client
            .push(|_: &[Operation]| {
                attempts += 1;
                Err(Error::Transport("offline".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(attempts, 3);
        // Nothing was marked, the op is still pending for the next cycle.
        assert_eq!(client.store().pending_count().unwrap(), 1);
    }

    #[test]
    fn test_pull_follows_cursor_until_exhausted() {
        let mut client = client("A");
        let pages = [
            RemoteBatch {
                ops: vec![remote_insert("s1", "r1", 2_000)],
                cursor: Some("p1".into()),
                has_more: true,
            },
            RemoteBatch {
                ops: vec![remote_insert("s2", "r2", 2_001)],
                cursor: Some("p2".into()),
                has_more: false,
            },
        ];

        let mut seen = Vec::new();
        let (batches, report) = client
            .pull(
                |cursor: Option<&str>| {
                    seen.push(cursor.map(str::to_string));
                    Ok(pages[seen.len() - 1].clone())
                },
                &mut LastWriterWins,
            )
            .unwrap();

        assert_eq!(batches, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(seen, vec![None, Some("p1".to_string())]);
        assert_eq!(client.store().remote_cursor().unwrap().as_deref(), Some("p2"));
    }

    #[test]
    fn test_sync_cycle_between_two_devices() {
        let mut a = client("A");
        let mut b = client("B");
        // The "server": ops in arrival order with their remote ids.
        let mut server: Vec<RemoteOperation> = Vec::new();

        a.store_mut()
            .transaction(|tx| {
                tx.execute("INSERT INTO trips (id, name) VALUES ('r1', 'Lisbon')", [])?;
                tx.log_insert("trips", "r1", &json!({"id": "r1", "name": "Lisbon"}), "A")
            })
            .unwrap();

        let report = a
            .sync(
                |ops: &[Operation]| {
                    for op in ops {
                        server.push(RemoteOperation {
                            remote_id: format!("srv-{}", server.len() + 1),
                            table: op.table.clone(),
                            row_id: op.row_id.clone(),
                            op_type: op.op_type,
                            columns: op.columns.clone(),
                            new_row: op.new_row.clone(),
                            old_row: op.old_row.clone(),
                            hlc: op.hlc.clone(),
                            origin: op.origin.clone(),
                        });
                    }
                    Ok(ops.iter().map(|op| op.id).collect())
                },
                |_: Option<&str>| Ok(RemoteBatch::default()),
            )
            .unwrap();
        assert_eq!((report.pushed, report.acked), (1, 1));

        let feed = server.clone();
        let report = b
            .sync(
                |_: &[Operation]| Ok(Vec::new()),
                |cursor: Option<&str>| {
                    let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
                    Ok(RemoteBatch {
                        ops: feed[start..].to_vec(),
                        cursor: Some(feed.len().to_string()),
                        has_more: false,
                    })
                },
            )
            .unwrap();
        assert_eq!(report.remote.applied, 1);

        let name: String = b
            .store()
            .connection()
            .query_row("SELECT name FROM trips WHERE id = 'r1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "Lisbon");
        assert_eq!(b.store().remote_cursor().unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_open_rejects_newer_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::new("A");
        config.store.path = dir.path().join("ledger.db");
        config.schema_version = 1;
        SyncClient::open(config.clone(), &migrator())
            .unwrap()
            .into_store()
            .close()
            .unwrap();

        config.schema_version = 0;
        let err = SyncClient::open(config, &migrator()).unwrap_err();
        assert!(matches!(err, Error::SchemaVersion(_)));
    }
}
