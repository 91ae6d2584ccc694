//! LedgerSync Engine
//!
//! Local-first sync core over SQLite:
//! - Hybrid logical clock with persisted, never-regressing state
//! - Operation log and pending queue with a forward-only sync lifecycle
//! - Remote cursor stored atomically with applied batches
//! - Ordered, transactional schema migrations
//! - Remote batch application with deduplication and pluggable conflict
//!   resolution
//! - A push/pull driver with retry over caller-supplied transport

pub mod apply;
pub mod client;
pub mod config;
pub mod conflict;
pub mod cursor;
pub mod hlc;
pub mod merge;
pub mod migration;
pub mod oplog;
pub mod retry;
pub mod store;

// Re-export main types
pub use apply::{ApplyReport, RemoteBatch, RemoteOperation, RowApplier, SqlRowApplier};
pub use client::{SyncClient, SyncReport};
pub use config::{StoreConfig, SyncConfig};
pub use conflict::{
    Candidate, CodeResolver, ConflictStrategy, FnResolver, LastWriterWins, Outcome,
    ResolveContext, Resolver,
};
pub use hlc::{ClockSource, ManualClock, SystemClock, Timestamp};
pub use ledgersync_common::{Error, OpType, OperationId, Result, RowKey, SyncState};
pub use migration::{Migration, MigrationReport, Migrator, SchemaVersion, SqlMigration};
pub use oplog::{Operation, UpdateChange};
pub use retry::{retry, retry_with_config, RetryConfig, RetryExecutor};
pub use store::{StoreTx, SyncStore};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_module_exports() {
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _strategy = ConflictStrategy::default();
        let _migrator = Migrator::new();
    }

    fn edit(store: &mut SyncStore, origin: &str, name: &str) -> Operation {
        let id = store
            .transaction(|tx| {
                tx.execute(
                    "UPDATE trips SET name = ?1 WHERE id = 'r1'",
                    rusqlite::params![name],
                )?;
                tx.log_update(
                    "trips",
                    "r1",
                    &UpdateChange::columns(["name"], json!({ "name": name })),
                    origin,
                )
            })
            .unwrap();
        store.operation(id).unwrap()
    }

    /// Two devices edit the same row while offline and converge on the later
    /// write once both sides have exchanged operations.
    #[test]
    fn test_concurrent_edits_converge() {
        let clock = Arc::new(ManualClock::new(1_000));
        let migrator = Migrator::new()
            .with(SqlMigration::new(
                1,
                "trips",
                "CREATE TABLE trips (id TEXT PRIMARY KEY, name TEXT);
                 INSERT INTO trips (id, name) VALUES ('r1', 'base');",
            ))
            .unwrap();

        let mut devices: Vec<SyncStore> = (0..2)
            .map(|_| {
                let mut store =
                    SyncStore::open_with_clock(&StoreConfig::default(), clock.clone()).unwrap();
                store.init_schema().unwrap();
                store.migrate(&migrator, 1).unwrap();
                store
            })
            .collect();

        let from_a = edit(&mut devices[0], "A", "from A");
        clock.advance(10);
        let from_b = edit(&mut devices[1], "B", "from B");
        assert!(from_b.hlc > from_a.hlc);

        let as_remote = |op: &Operation| RemoteOperation {
            remote_id: format!("{}-{}", op.origin, op.id),
            table: op.table.clone(),
            row_id: op.row_id.clone(),
            op_type: op.op_type,
            columns: op.columns.clone(),
            new_row: op.new_row.clone(),
            old_row: op.old_row.clone(),
            hlc: op.hlc.clone(),
            origin: op.origin.clone(),
        };

        let at_a = devices[0]
            .apply_remote_ops(&[as_remote(&from_b)], &mut LastWriterWins, Some("b1"))
            .unwrap();
        let at_b = devices[1]
            .apply_remote_ops(&[as_remote(&from_a)], &mut LastWriterWins, Some("a1"))
            .unwrap();
        assert_eq!((at_a.applied, at_a.conflicts), (1, 1));
        assert_eq!((at_b.skipped, at_b.conflicts), (1, 1));

        for store in &devices {
            let name: String = store
                .connection()
                .query_row("SELECT name FROM trips WHERE id = 'r1'", [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(name, "from B");
        }
    }
}
