//! SQLite-backed sync store.
//!
//! A [`SyncStore`] owns one connection. Every mutating call takes `&mut self`
//! and runs in its own transaction; [`SyncStore::transaction`] hands out a
//! [`StoreTx`] for callers that need to write their own rows and the log entry
//! atomically.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, Params, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, info};

use ledgersync_common::{Error, OperationId, Result, SyncState};

use crate::apply::{self, ApplyReport, Pipeline, RemoteBatch, RemoteOperation, RowApplier, SqlRowApplier};
use crate::config::StoreConfig;
use crate::conflict::Resolver;
use crate::cursor;
use crate::hlc::{self, ClockSource, SystemClock, Timestamp};
use crate::migration::{self, AppliedMigration, MigrationReport, Migrator, SchemaVersion};
use crate::oplog::{self, NewOperation, Operation, UpdateChange};

/// Metadata tables owned by the sync core.
pub(crate) const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS sync_operations (
        change_id INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL,
        row_id TEXT NOT NULL,
        op_type TEXT NOT NULL CHECK (op_type IN ('INSERT', 'UPDATE', 'DELETE')),
        columns TEXT,
        new_row TEXT,
        old_row TEXT,
        hlc TEXT NOT NULL,
        origin TEXT NOT NULL,
        sync_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (sync_status IN ('pending', 'pushed', 'acked')),
        superseded_by TEXT,
        created_ms INTEGER NOT NULL,
        UNIQUE (hlc, origin)
    );

    CREATE INDEX IF NOT EXISTS idx_sync_operations_status
        ON sync_operations (sync_status, change_id);
    CREATE INDEX IF NOT EXISTS idx_sync_operations_row
        ON sync_operations (table_name, row_id);

    CREATE TABLE IF NOT EXISTS sync_clock (
        origin TEXT PRIMARY KEY,
        physical_ms INTEGER NOT NULL,
        counter INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sync_kv (
        k TEXT PRIMARY KEY,
        v TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sync_applied_remote (
        remote_id TEXT PRIMARY KEY,
        outcome TEXT NOT NULL,
        applied_ms INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        applied_ms INTEGER NOT NULL
    );
"#;

/// Handle to a sync store.
///
/// Dropping the handle closes the connection. Use [`close`](Self::close) to
/// observe close errors.
pub struct SyncStore {
    conn: Connection,
    clock: Arc<dyn ClockSource>,
    config: StoreConfig,
}

impl std::fmt::Debug for SyncStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStore")
            .field("path", &self.config.path)
            .finish()
    }
}

impl SyncStore {
    /// Open or create a store file with default settings.
    ///
    /// # Errors
    /// - `Storage` if the database cannot be opened
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(&StoreConfig::new(path.as_ref()))
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_with_config(&StoreConfig::default())
    }

    /// Open with explicit settings and the system clock.
    pub fn open_with_config(config: &StoreConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open with explicit settings and a custom clock source.
    pub fn open_with_clock(config: &StoreConfig, clock: Arc<dyn ClockSource>) -> Result<Self> {
        if config.key_column.is_empty() {
            return Err(Error::invalid("key_column cannot be empty"));
        }
        let conn = if config.is_in_memory() {
            Connection::open_in_memory()?
        } else {
            Connection::open(&config.path)?
        };
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        if config.wal && !config.is_in_memory() {
            let mode: String =
                conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            debug!("Journal mode: {}", mode);
        }

        info!("Sync store opened: {:?}", config.path);
        Ok(Self {
            conn,
            clock,
            config: config.clone(),
        })
    }

    /// Close the connection, reporting any error.
    pub fn close(self) -> Result<()> {
        let path = self.config.path;
        self.conn.close().map_err(|(_, err)| Error::Storage(err))?;
        debug!("Sync store closed: {:?}", path);
        Ok(())
    }

    /// Create the metadata tables. Safe to call on every start.
    pub fn init_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        self.conn.execute(
            "INSERT INTO sync_kv (k, v) VALUES ('schema_version', '0')
             ON CONFLICT(k) DO NOTHING",
            [],
        )?;
        debug!("Sync schema initialized");
        Ok(())
    }

    /// Settings this store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Underlying connection, for reading application tables.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run statements outside the sync bookkeeping, in their own transaction.
    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.transaction(|tx| tx.execute_batch(sql))
    }

    /// Run `f` in one transaction. Commits if `f` returns `Ok`, otherwise
    /// rolls back and returns the error.
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let store_tx = StoreTx {
            tx,
            clock: self.clock.as_ref(),
            config: &self.config,
        };
        let value = f(&store_tx)?;
        store_tx.tx.commit()?;
        Ok(value)
    }

    /// Issue and persist the next timestamp for `origin`.
    pub fn next_hlc(&mut self, origin: &str) -> Result<Timestamp> {
        self.transaction(|tx| tx.next_hlc(origin))
    }

    /// Log an insert of `new_row`.
    pub fn log_insert(
        &mut self,
        table: &str,
        row_id: &str,
        new_row: &Value,
        origin: &str,
    ) -> Result<OperationId> {
        self.transaction(|tx| tx.log_insert(table, row_id, new_row, origin))
    }

    /// Log an update.
    pub fn log_update(
        &mut self,
        table: &str,
        row_id: &str,
        change: &UpdateChange,
        origin: &str,
    ) -> Result<OperationId> {
        self.transaction(|tx| tx.log_update(table, row_id, change, origin))
    }

    /// Log a delete.
    pub fn log_delete(&mut self, table: &str, row_id: &str, origin: &str) -> Result<OperationId> {
        self.transaction(|tx| tx.log_delete(table, row_id, origin))
    }

    /// Move pending operations to pushed. Returns how many moved.
    pub fn mark_ops_pushed(&mut self, ids: &[OperationId]) -> Result<usize> {
        self.transaction(|tx| oplog::advance(tx.connection(), ids, SyncState::Pushed))
    }

    /// Move pending or pushed operations to acked. Returns how many moved.
    pub fn mark_ops_acked(&mut self, ids: &[OperationId]) -> Result<usize> {
        self.transaction(|tx| oplog::advance(tx.connection(), ids, SyncState::Acked))
    }

    /// Up to `limit` pending operations, oldest first.
    pub fn pending_ops(&self, limit: usize) -> Result<Vec<Operation>> {
        oplog::pending(&self.conn, limit)
    }

    /// [`pending_ops`](Self::pending_ops) as a JSON array.
    pub fn pending_ops_json(&self, limit: usize) -> Result<String> {
        Ok(serde_json::to_string(&self.pending_ops(limit)?)?)
    }

    /// Number of pending operations.
    pub fn pending_count(&self) -> Result<u64> {
        oplog::pending_count(&self.conn)
    }

    /// Look up one operation.
    pub fn operation(&self, id: OperationId) -> Result<Operation> {
        oplog::get(&self.conn, id)
    }

    /// Every operation logged for a row, oldest first.
    pub fn operations_for_row(&self, table: &str, row_id: &str) -> Result<Vec<Operation>> {
        oplog::for_row(&self.conn, table, row_id)
    }

    /// Persisted remote cursor.
    pub fn remote_cursor(&self) -> Result<Option<String>> {
        cursor::get(&self.conn)
    }

    /// Overwrite the remote cursor.
    pub fn set_remote_cursor(&mut self, cursor: &str) -> Result<()> {
        self.transaction(|tx| tx.set_remote_cursor(cursor))
    }

    /// Forget the remote cursor.
    pub fn clear_remote_cursor(&mut self) -> Result<bool> {
        self.transaction(|tx| cursor::clear(tx.connection()))
    }

    /// Current schema version.
    pub fn schema_version(&self) -> Result<SchemaVersion> {
        migration::schema_version(&self.conn)
    }

    /// Run registered migrations up to `target`.
    pub fn migrate(&mut self, migrator: &Migrator, target: SchemaVersion) -> Result<MigrationReport> {
        migrator.migrate(&mut self.conn, target)
    }

    /// Applied migrations, oldest first.
    pub fn migration_history(&self) -> Result<Vec<AppliedMigration>> {
        migration::history(&self.conn)
    }

    /// Apply remote operations and advance the cursor atomically, using the
    /// configured key column.
    ///
    /// # Errors
    /// - `MalformedOperation` / `InvalidArgument` from validation; nothing
    ///   is touched
    /// - `ConflictAborted` if the resolver aborts; the batch is rolled back
    /// - any resolver or storage error; the batch is rolled back
    pub fn apply_remote_ops<R>(
        &mut self,
        ops: &[RemoteOperation],
        resolver: &mut R,
        cursor: Option<&str>,
    ) -> Result<ApplyReport>
    where
        R: Resolver + ?Sized,
    {
        let applier = SqlRowApplier::new(self.config.key_column.clone());
        self.apply_remote_ops_with(ops, resolver, &applier, cursor)
    }

    /// [`apply_remote_ops`](Self::apply_remote_ops) with a custom row applier.
    pub fn apply_remote_ops_with<R, A>(
        &mut self,
        ops: &[RemoteOperation],
        resolver: &mut R,
        applier: &A,
        cursor: Option<&str>,
    ) -> Result<ApplyReport>
    where
        R: Resolver + ?Sized,
        A: RowApplier + ?Sized,
    {
        let stamps = apply::validate_batch(ops, cursor)?;
        debug!("Applying {} remote operations", ops.len());
        self.transaction(|tx| {
            Pipeline {
                conn: tx.connection(),
                clock: tx.clock,
                applier,
                max_drift_ms: tx.config.max_clock_drift_ms,
            }
            .run(ops, &stamps, resolver, cursor)
        })
    }

    /// Apply one pulled batch together with its cursor.
    pub fn apply_remote_batch<R>(&mut self, batch: &RemoteBatch, resolver: &mut R) -> Result<ApplyReport>
    where
        R: Resolver + ?Sized,
    {
        let cursor = batch.cursor.as_deref().filter(|c| !c.is_empty());
        self.apply_remote_ops(&batch.ops, resolver, cursor)
    }
}

/// An open store transaction.
///
/// Log entries, cursor writes and the caller's own statements made through
/// it commit or roll back together.
pub struct StoreTx<'a> {
    tx: rusqlite::Transaction<'a>,
    clock: &'a dyn ClockSource,
    config: &'a StoreConfig,
}

impl StoreTx<'_> {
    /// The transaction's connection.
    pub fn connection(&self) -> &Connection {
        &self.tx
    }

    /// Run SQL statements in this transaction.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.tx.execute_batch(sql)?;
        Ok(())
    }

    /// Run one parameterized statement in this transaction.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        Ok(self.tx.execute(sql, params)?)
    }

    /// Issue and persist the next timestamp for `origin`.
    pub fn next_hlc(&self, origin: &str) -> Result<Timestamp> {
        hlc::next(&self.tx, self.clock, origin)
    }

    /// Log an insert of `new_row`.
    pub fn log_insert(
        &self,
        table: &str,
        row_id: &str,
        new_row: &Value,
        origin: &str,
    ) -> Result<OperationId> {
        oplog::append(
            &self.tx,
            self.clock,
            NewOperation::insert(table, row_id, new_row, origin),
        )
    }

    /// Log an update.
    pub fn log_update(
        &self,
        table: &str,
        row_id: &str,
        change: &UpdateChange,
        origin: &str,
    ) -> Result<OperationId> {
        oplog::append(
            &self.tx,
            self.clock,
            NewOperation::update(table, row_id, change, origin),
        )
    }

    /// Log a delete.
    pub fn log_delete(&self, table: &str, row_id: &str, origin: &str) -> Result<OperationId> {
        oplog::append(
            &self.tx,
            self.clock,
            NewOperation::delete(table, row_id, origin),
        )
    }

    /// Stored remote cursor as seen inside this transaction.
    pub fn remote_cursor(&self) -> Result<Option<String>> {
        cursor::get(&self.tx)
    }

    /// Overwrite the remote cursor; commits with the transaction.
    pub fn set_remote_cursor(&self, cursor: &str) -> Result<()> {
        cursor::set(&self.tx, cursor)
    }
}
