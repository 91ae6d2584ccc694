//! Remote application pipeline.
//!
//! Applies a batch of remote operations to local rows in one transaction:
//! duplicates are skipped, conflicting operations go through a [`Resolver`],
//! accepted operations are written through a [`RowApplier`], the clock
//! observes every processed remote timestamp, and the remote cursor advances.
//! Any error or an [`Outcome::Abort`] rolls the whole batch back.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use ledgersync_common::{Error, OpType, Result, RowKey};

use crate::conflict::{self, Candidate, Outcome, ResolveContext, Resolver};
use crate::cursor;
use crate::hlc::{self, ClockSource, Timestamp};
use crate::merge;
use crate::oplog;

/// An operation received from the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOperation {
    /// Remote-assigned identifier, used for deduplication.
    pub remote_id: String,
    pub table: String,
    pub row_id: String,
    pub op_type: OpType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub new_row: Option<Value>,
    #[serde(default)]
    pub old_row: Option<Value>,
    pub hlc: String,
    pub origin: String,
}

impl RemoteOperation {
    /// Check identity fields and parse the HLC.
    ///
    /// # Errors
    /// - `MalformedOperation` if an identity field is empty or an insert has
    ///   no row object
    /// - `InvalidArgument` if the HLC does not parse
    pub fn validate(&self) -> Result<Timestamp> {
        for (field, value) in [
            ("remoteId", &self.remote_id),
            ("table", &self.table),
            ("rowId", &self.row_id),
            ("origin", &self.origin),
        ] {
            if value.is_empty() {
                return Err(Error::malformed(format!(
                    "remote operation {:?} has an empty {}",
                    self.remote_id, field
                )));
            }
        }
        match (&self.op_type, &self.new_row) {
            (OpType::Insert, None) => {
                return Err(Error::malformed(format!(
                    "remote insert {} has no row",
                    self.remote_id
                )))
            }
            (_, Some(row)) if !row.is_object() => {
                return Err(Error::malformed(format!(
                    "remote operation {} row is not an object",
                    self.remote_id
                )))
            }
            _ => {}
        }
        Timestamp::parse(&self.hlc)
    }

    /// Target of this operation.
    pub fn row_key(&self) -> RowKey {
        RowKey {
            table: self.table.clone(),
            row_id: self.row_id.clone(),
        }
    }
}

/// One page of the remote feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBatch {
    #[serde(default)]
    pub ops: Vec<RemoteOperation>,
    /// Cursor to persist once the batch is applied.
    #[serde(default)]
    pub cursor: Option<String>,
    /// Whether the remote has more data after this page.
    #[serde(default)]
    pub has_more: bool,
}

/// What happened to a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Operations written to local rows.
    pub applied: usize,
    /// Operations a resolver chose to skip, plus accepted updates and
    /// deletes whose target row does not exist.
    pub skipped: usize,
    /// Operations already applied earlier.
    pub duplicates: usize,
    /// Operations that met unacknowledged local changes.
    pub conflicts: usize,
}

impl ApplyReport {
    /// Operations processed in any way.
    pub fn total(&self) -> usize {
        self.applied + self.skipped + self.duplicates
    }
}

impl std::ops::AddAssign for ApplyReport {
    fn add_assign(&mut self, other: Self) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.duplicates += other.duplicates;
        self.conflicts += other.conflicts;
    }
}

/// Writes remote operations into user tables.
pub trait RowApplier {
    /// Whether the operation's target row exists locally.
    fn row_exists(&self, conn: &Connection, op: &RemoteOperation) -> Result<bool>;

    /// Apply the operation to the local row.
    ///
    /// Updates and deletes against missing rows must be no-ops.
    fn apply(&self, conn: &Connection, op: &RemoteOperation) -> Result<()>;
}

/// Applies operations with plain SQL against a table named like the
/// operation's table, keyed by a single column.
///
/// Inserts upsert, so the key column needs a primary key or unique
/// constraint.
#[derive(Debug, Clone)]
pub struct SqlRowApplier {
    key_column: String,
}

impl SqlRowApplier {
    /// Create an applier keyed by `key_column`.
    pub fn new(key_column: impl Into<String>) -> Self {
        Self {
            key_column: key_column.into(),
        }
    }

    /// Key column name.
    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    fn row_object<'a>(op: &'a RemoteOperation) -> Option<&'a serde_json::Map<String, Value>> {
        op.new_row.as_ref().and_then(Value::as_object)
    }

    fn upsert(&self, conn: &Connection, op: &RemoteOperation) -> Result<()> {
        let row = Self::row_object(op)
            .ok_or_else(|| Error::malformed(format!("remote insert {} has no row", op.remote_id)))?;
        let table = quote_ident(&op.table)?;
        let key = quote_ident(&self.key_column)?;

        let mut names = vec![key.clone()];
        let mut values = vec![SqlValue::Text(op.row_id.clone())];
        for (column, value) in merge::changed_values(row, None, &self.key_column) {
            names.push(quote_ident(column)?);
            values.push(to_sql_value(value));
        }

        let placeholders = (1..=values.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let on_conflict = if names.len() == 1 {
            "DO NOTHING".to_string()
        } else {
            let sets = names[1..]
                .iter()
                .map(|n| format!("{} = excluded.{}", n, n))
                .collect::<Vec<_>>()
                .join(", ");
            format!("DO UPDATE SET {}", sets)
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
            table,
            names.join(", "),
            placeholders,
            key,
            on_conflict
        );
        conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    fn update(&self, conn: &Connection, op: &RemoteOperation) -> Result<()> {
        let Some(row) = Self::row_object(op) else {
            return Ok(());
        };
        let changes: Vec<(String, SqlValue)> = match op.columns.as_deref() {
            Some(columns) => merge::changed_values(row, Some(columns), &self.key_column)
                .into_iter()
                .map(|(column, value)| (column.to_string(), to_sql_value(value)))
                .collect(),
            // Full-row replace: columns absent from the snapshot become NULL.
            None => self.full_row_values(conn, op, row)?,
        };
        if changes.is_empty() {
            return Ok(());
        }

        let mut sets = Vec::with_capacity(changes.len());
        let mut values = Vec::with_capacity(changes.len() + 1);
        for (i, (column, value)) in changes.into_iter().enumerate() {
            sets.push(format!("{} = ?{}", quote_ident(&column)?, i + 1));
            values.push(value);
        }
        values.push(SqlValue::Text(op.row_id.clone()));

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            quote_ident(&op.table)?,
            sets.join(", "),
            quote_ident(&self.key_column)?,
            values.len()
        );
        conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    fn full_row_values(
        &self,
        conn: &Connection,
        op: &RemoteOperation,
        row: &serde_json::Map<String, Value>,
    ) -> Result<Vec<(String, SqlValue)>> {
        let columns = table_columns(conn, &op.table)?;
        if let Some(unknown) = row.keys().find(|k| !columns.contains(*k)) {
            return Err(Error::malformed(format!(
                "remote update {} names unknown column {:?} of {}",
                op.remote_id, unknown, op.table
            )));
        }
        Ok(columns
            .into_iter()
            .filter(|c| *c != self.key_column)
            .map(|c| {
                let value = row.get(&c).map_or(SqlValue::Null, to_sql_value);
                (c, value)
            })
            .collect())
    }

    fn delete(&self, conn: &Connection, op: &RemoteOperation) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(&op.table)?,
            quote_ident(&self.key_column)?
        );
        conn.execute(&sql, params![op.row_id])?;
        Ok(())
    }
}

impl Default for SqlRowApplier {
    fn default() -> Self {
        Self::new("id")
    }
}

impl RowApplier for SqlRowApplier {
    fn row_exists(&self, conn: &Connection, op: &RemoteOperation) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE {} = ?1 LIMIT 1",
            quote_ident(&op.table)?,
            quote_ident(&self.key_column)?
        );
        let found = conn
            .query_row(&sql, params![op.row_id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    fn apply(&self, conn: &Connection, op: &RemoteOperation) -> Result<()> {
        match op.op_type {
            OpType::Insert => self.upsert(conn, op),
            OpType::Update => self.update(conn, op),
            OpType::Delete => self.delete(conn, op),
        }
    }
}

/// Column names of `table`, in declaration order.
///
/// # Errors
/// - `InvalidArgument` if the table does not exist
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached("SELECT name FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if columns.is_empty() {
        return Err(Error::invalid(format!("no such table: {}", table)));
    }
    Ok(columns)
}

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('\0') {
        return Err(Error::invalid(format!("invalid identifier {:?}", name)));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Convert a JSON value into an SQLite value. Arrays and objects are stored
/// as JSON text.
pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => SqlValue::Integer(i),
            (None, Some(f)) => SqlValue::Real(f),
            (None, None) => SqlValue::Text(n.to_string()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Validate every operation of a batch before any work starts.
pub fn validate_batch(ops: &[RemoteOperation], cursor: Option<&str>) -> Result<Vec<Timestamp>> {
    if cursor == Some("") {
        return Err(Error::invalid("cursor cannot be empty"));
    }
    ops.iter().map(RemoteOperation::validate).collect()
}

fn already_applied(conn: &Connection, remote_id: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sync_applied_remote WHERE remote_id = ?1",
            params![remote_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn record_applied(conn: &Connection, remote_id: &str, outcome: Outcome) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_applied_remote (remote_id, outcome, applied_ms) VALUES (?1, ?2, ?3)",
        params![remote_id, outcome.as_str(), chrono::Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

/// Runs a validated batch inside an open transaction.
pub(crate) struct Pipeline<'a, A: RowApplier + ?Sized> {
    pub conn: &'a Connection,
    pub clock: &'a dyn ClockSource,
    pub applier: &'a A,
    pub max_drift_ms: Option<u64>,
}

impl<A: RowApplier + ?Sized> Pipeline<'_, A> {
    pub fn run<R: Resolver + ?Sized>(
        &self,
        ops: &[RemoteOperation],
        stamps: &[Timestamp],
        resolver: &mut R,
        cursor: Option<&str>,
    ) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();

        for (op, ts) in ops.iter().zip(stamps) {
            if already_applied(self.conn, &op.remote_id)? {
                debug!("Skipping duplicate remote operation {}", op.remote_id);
                report.duplicates += 1;
                continue;
            }

            let local = oplog::unresolved_for_row(self.conn, &op.table, &op.row_id)?;
            let target_exists =
                op.op_type == OpType::Insert || self.applier.row_exists(self.conn, op)?;

            let outcome = if local.is_empty() && target_exists {
                Outcome::AcceptRemote
            } else {
                if !local.is_empty() {
                    report.conflicts += 1;
                }
                let candidate = Candidate {
                    remote: op,
                    remote_hlc: ts,
                    local: &local,
                    target_exists,
                    suggested: conflict::suggest(ts, &local)?,
                };
                let outcome = resolver.resolve(&candidate, &ResolveContext::new(self.conn))?;
                debug!(
                    "Resolved remote operation {} on {}/{}: {}",
                    op.remote_id, op.table, op.row_id, outcome
                );
                outcome
            };

            match outcome {
                Outcome::AcceptRemote => {
                    self.applier.apply(self.conn, op)?;
                    if !local.is_empty() {
                        let ids: Vec<_> = local.iter().map(|l| l.id).collect();
                        oplog::supersede(self.conn, &ids, &op.remote_id)?;
                    }
                    // Accepted updates and deletes on missing rows write nothing.
                    if target_exists {
                        report.applied += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                Outcome::SkipRemote => report.skipped += 1,
                Outcome::Abort => {
                    warn!(
                        "Resolver aborted batch at remote operation {}",
                        op.remote_id
                    );
                    return Err(Error::ConflictAborted {
                        remote_id: op.remote_id.clone(),
                    });
                }
            }

            hlc::observe(self.conn, self.clock, ts, self.max_drift_ms)?;
            record_applied(self.conn, &op.remote_id, outcome)?;
        }

        if let Some(cursor) = cursor {
            cursor::set(self.conn, cursor)?;
        }

        info!(
            "Applied remote batch: {} applied, {} skipped, {} duplicates, {} conflicts",
            report.applied, report.skipped, report.duplicates, report.conflicts
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ledgersync_common::SyncState;
    use serde_json::json;

    use crate::config::StoreConfig;
    use crate::conflict::{CodeResolver, ConflictStrategy, FnResolver, LastWriterWins};
    use crate::hlc::ManualClock;
    use crate::oplog::UpdateChange;
    use crate::store::SyncStore;

    fn store() -> (SyncStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let mut store = SyncStore::open_with_clock(&StoreConfig::default(), clock.clone()).unwrap();
        store.init_schema().unwrap();
        store
            .execute_batch("CREATE TABLE trips (id TEXT PRIMARY KEY, name TEXT, n INTEGER)")
            .unwrap();
        (store, clock)
    }

    fn hlc(ms: u64, origin: &str) -> String {
        Timestamp::new(ms, 0, origin).unwrap().encode()
    }

    fn insert(remote_id: &str, row_id: &str, name: &str, ms: u64) -> RemoteOperation {
        RemoteOperation {
            remote_id: remote_id.into(),
            table: "trips".into(),
            row_id: row_id.into(),
            op_type: OpType::Insert,
            columns: None,
            new_row: Some(json!({"id": row_id, "name": name, "n": 1})),
            old_row: None,
            hlc: hlc(ms, "B"),
            origin: "B".into(),
        }
    }

    fn update(remote_id: &str, row_id: &str, name: &str, ms: u64) -> RemoteOperation {
        RemoteOperation {
            op_type: OpType::Update,
            columns: Some(vec!["name".into()]),
            new_row: Some(json!({"name": name})),
            ..insert(remote_id, row_id, name, ms)
        }
    }

    fn delete(remote_id: &str, row_id: &str, ms: u64) -> RemoteOperation {
        RemoteOperation {
            op_type: OpType::Delete,
            new_row: None,
            ..insert(remote_id, row_id, "", ms)
        }
    }

    fn name_of(store: &SyncStore, row_id: &str) -> Option<String> {
        store
            .connection()
            .query_row(
                "SELECT name FROM trips WHERE id = ?1",
                params![row_id],
                |row| row.get(0),
            )
            .optional()
            .unwrap()
    }

    fn row_count(store: &SyncStore) -> i64 {
        store
            .connection()
            .query_row("SELECT COUNT(*) FROM trips", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_applies_batch_and_cursor() {
        let (mut store, _) = store();
        let ops = vec![
            insert("s1", "r1", "a", 2_000),
            update("s2", "r1", "b", 2_001),
            insert("s3", "r2", "c", 2_002),
            delete("s4", "r2", 2_003),
        ];

        let report = store
            .apply_remote_ops(&ops, &mut LastWriterWins, Some("c1"))
            .unwrap();
        assert_eq!(report.applied, 4);
        assert_eq!(report.conflicts, 0);
        assert_eq!(name_of(&store, "r1").as_deref(), Some("b"));
        assert_eq!(name_of(&store, "r2"), None);
        assert_eq!(store.remote_cursor().unwrap().as_deref(), Some("c1"));
    }

    #[test]
    fn test_duplicates_are_skipped() {
        let (mut store, _) = store();
        let ops = vec![insert("s1", "r1", "a", 2_000), insert("s1", "r1", "zzz", 2_000)];

        let report = store.apply_remote_ops(&ops, &mut LastWriterWins, None).unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.duplicates, 1);

        let again = store
            .apply_remote_ops(&ops[..1], &mut LastWriterWins, None)
            .unwrap();
        assert_eq!(again.duplicates, 1);
        assert_eq!(again.applied, 0);
        assert_eq!(name_of(&store, "r1").as_deref(), Some("a"));
    }

    #[test]
    fn test_abort_rolls_back_everything() {
        let (mut store, _) = store();
        store.set_remote_cursor("c0").unwrap();
        store.log_insert("trips", "r2", &json!({"id": "r2"}), "A").unwrap();

        let ops = vec![
            insert("s1", "r1", "a", 2_000),
            insert("s2", "r2", "b", 2_001),
            insert("s3", "r3", "c", 2_002),
        ];
        let mut resolver = CodeResolver::new(|_| Outcome::Abort.to_code());
        let err = store
            .apply_remote_ops(&ops, &mut resolver, Some("c1"))
            .unwrap_err();
        assert!(matches!(err, Error::ConflictAborted { ref remote_id } if remote_id == "s2"));

        assert_eq!(row_count(&store), 0);
        assert_eq!(store.remote_cursor().unwrap().as_deref(), Some("c0"));
        // Nothing was recorded, so a retry processes the same operations.
        let retry = store
            .apply_remote_ops(&ops, &mut ConflictStrategy::PreferRemote, Some("c1"))
            .unwrap();
        assert_eq!(retry.applied, 3);
        assert_eq!(retry.duplicates, 0);
    }

    #[test]
    fn test_resolver_error_aborts_batch() {
        let (mut store, _) = store();
        store.log_insert("trips", "r1", &json!({"id": "r1"}), "A").unwrap();
        let mut resolver = FnResolver::new(|_, _| Err(Error::invalid("nope")));

        let ops = vec![insert("s1", "r1", "a", 2_000)];
        assert!(store.apply_remote_ops(&ops, &mut resolver, Some("c")).is_err());
        assert_eq!(store.remote_cursor().unwrap(), None);
    }

    #[test]
    fn test_unknown_resolver_code_aborts_batch() {
        let (mut store, _) = store();
        store.log_insert("trips", "r1", &json!({"id": "r1"}), "A").unwrap();
        let mut resolver = CodeResolver::new(|_| 42);

        let ops = vec![insert("s0", "r0", "x", 2_000), insert("s1", "r1", "a", 2_000)];
        let err = store.apply_remote_ops(&ops, &mut resolver, None).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(row_count(&store), 0);
    }

    #[test]
    fn test_accept_and_skip_remote() {
        let (mut store, clock) = store();
        store
            .execute_batch("INSERT INTO trips (id, name, n) VALUES ('r1', 'local', 1)")
            .unwrap();
        clock.set(5_000);
        let local = store
            .log_update("trips", "r1", &UpdateChange::columns(["name"], json!({"name": "local"})), "A")
            .unwrap();

        // Remote is older than the local change, so the suggestion is to skip.
        let mut skip = FnResolver::new(|c, _| {
            assert_eq!(c.suggested, Outcome::SkipRemote);
            assert_eq!(c.local.len(), 1);
            Ok(Outcome::SkipRemote)
        });
        let report = store
            .apply_remote_ops(&[update("s1", "r1", "remote", 2_000)], &mut skip, None)
            .unwrap();
        assert_eq!((report.skipped, report.conflicts), (1, 1));
        assert_eq!(name_of(&store, "r1").as_deref(), Some("local"));

        let mut accept = CodeResolver::new(|_| Outcome::AcceptRemote.to_code());
        let report = store
            .apply_remote_ops(&[update("s2", "r1", "remote", 2_001)], &mut accept, None)
            .unwrap();
        assert_eq!((report.applied, report.conflicts), (1, 1));
        assert_eq!(name_of(&store, "r1").as_deref(), Some("remote"));

        // The local op stays in the queue but no longer conflicts.
        let op = store.operation(local).unwrap();
        assert_eq!(op.sync_state, SyncState::Pending);
        let report = store
            .apply_remote_ops(&[update("s3", "r1", "later", 9_000)], &mut LastWriterWins, None)
            .unwrap();
        assert_eq!((report.applied, report.conflicts), (1, 0));
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_last_writer_wins_across_origins() {
        let (mut store, clock) = store();
        store
            .execute_batch("INSERT INTO trips (id, name) VALUES ('r1', 'base')")
            .unwrap();
        clock.set(3_000);
        store
            .log_update("trips", "r1", &UpdateChange::full(json!({"name": "mine"})), "A")
            .unwrap();

        let newer = update("s1", "r1", "theirs", 4_000);
        let report = store
            .apply_remote_ops(&[newer], &mut LastWriterWins, None)
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(name_of(&store, "r1").as_deref(), Some("theirs"));
    }

    #[test]
    fn test_missing_target_goes_through_resolver() {
        let (mut store, _) = store();
        let mut seen = Vec::new();
        let mut resolver = FnResolver::new(|c, _| {
            seen.push((c.remote.remote_id.clone(), c.target_missing(), c.has_local_changes()));
            Ok(Outcome::AcceptRemote)
        });

        let ops = vec![update("s1", "ghost", "x", 2_000), delete("s2", "ghost", 2_001)];
        let report = store.apply_remote_ops(&ops, &mut resolver, None).unwrap();
        assert_eq!((report.applied, report.skipped), (0, 2));
        assert_eq!(report.conflicts, 0);
        assert_eq!(report.total(), 2);
        // Accepting a partial update on a missing row does not resurrect it.
        assert_eq!(row_count(&store), 0);
        drop(resolver);
        assert_eq!(
            seen,
            vec![("s1".to_string(), true, false), ("s2".to_string(), true, false)]
        );
    }

    #[test]
    fn test_resolver_can_write_in_transaction() {
        let (mut store, _) = store();
        store
            .execute_batch("CREATE TABLE conflict_log (remote_id TEXT NOT NULL)")
            .unwrap();
        store.log_insert("trips", "r1", &json!({"id": "r1"}), "A").unwrap();

        let mut record = FnResolver::new(|c, ctx| {
            ctx.execute(
                "INSERT INTO conflict_log (remote_id) VALUES (?1)",
                params![c.remote.remote_id],
            )?;
            Ok(Outcome::SkipRemote)
        });
        store
            .apply_remote_ops(&[insert("s1", "r1", "a", 2_000)], &mut record, None)
            .unwrap();

        let mut abort = FnResolver::new(|_, ctx| {
            ctx.execute_batch("INSERT INTO conflict_log (remote_id) VALUES ('lost')")?;
            Ok(Outcome::Abort)
        });
        assert!(store
            .apply_remote_ops(&[insert("s2", "r1", "b", 2_001)], &mut abort, None)
            .is_err());

        let logged: Vec<String> = {
            let conn = store.connection();
            let mut stmt = conn.prepare("SELECT remote_id FROM conflict_log").unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .collect::<rusqlite::Result<_>>()
                .unwrap()
        };
        assert_eq!(logged, vec!["s1".to_string()]);
    }

    #[test]
    fn test_merge_resolver_combines_rows() {
        let (mut store, clock) = store();
        store
            .execute_batch("INSERT INTO trips (id, name, n) VALUES ('r1', 'a', 1)")
            .unwrap();
        clock.set(9_000);
        store
            .log_update("trips", "r1", &UpdateChange::columns(["n"], json!({"n": 7})), "A")
            .unwrap();

        // Take the remote name but keep the locally edited counter.
        let mut merge_fields = FnResolver::new(|c, ctx| {
            let local_row = json!({"n": 7});
            let merged = merge::merge_row(
                &local_row,
                c.remote.new_row.as_ref().unwrap_or(&Value::Null),
                c.remote.columns.as_deref(),
            );
            ctx.execute(
                "UPDATE trips SET name = ?1 WHERE id = ?2",
                params![merged["name"].as_str(), c.remote.row_id],
            )?;
            Ok(Outcome::SkipRemote)
        });
        store
            .apply_remote_ops(&[update("s1", "r1", "b", 2_000)], &mut merge_fields, None)
            .unwrap();
        assert_eq!(name_of(&store, "r1").as_deref(), Some("b"));
    }

    #[test]
    fn test_validation_happens_before_transaction() {
        let (mut store, _) = store();
        let good = insert("s1", "r1", "a", 2_000);

        let mut no_id = insert("", "r2", "b", 2_000);
        let err = store
            .apply_remote_ops(&[good.clone(), no_id.clone()], &mut LastWriterWins, Some("c"))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedOperation(_)));

        no_id.remote_id = "s2".into();
        no_id.hlc = "not-a-clock".into();
        let err = store
            .apply_remote_ops(&[good.clone(), no_id], &mut LastWriterWins, Some("c"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let mut rowless = insert("s3", "r3", "c", 2_000);
        rowless.new_row = None;
        let err = store
            .apply_remote_ops(&[good, rowless], &mut LastWriterWins, Some("c"))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedOperation(_)));

        assert_eq!(row_count(&store), 0);
        assert_eq!(store.remote_cursor().unwrap(), None);
    }

    #[test]
    fn test_observed_remote_time_orders_later_local_writes() {
        let (mut store, clock) = store();
        clock.set(1_000);
        store
            .apply_remote_ops(&[insert("s1", "r1", "a", 50_000)], &mut LastWriterWins, None)
            .unwrap();

        let id = store
            .log_update("trips", "r1", &UpdateChange::full(json!({"name": "b"})), "A")
            .unwrap();
        let local = store.operation(id).unwrap();
        assert!(local.hlc > hlc(50_000, "B"));
    }

    #[test]
    fn test_full_row_update_replaces_row() {
        let (mut store, _) = store();
        store
            .apply_remote_ops(&[insert("s1", "r1", "a", 2_000)], &mut LastWriterWins, None)
            .unwrap();

        let full = RemoteOperation {
            op_type: OpType::Update,
            columns: None,
            new_row: Some(json!({"id": "r1", "name": "b"})),
            ..insert("s2", "r1", "b", 2_001)
        };
        let report = store
            .apply_remote_ops(&[full], &mut LastWriterWins, None)
            .unwrap();
        assert_eq!(report.applied, 1);

        let (name, n): (Option<String>, Option<i64>) = store
            .connection()
            .query_row("SELECT name, n FROM trips WHERE id = 'r1'", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(name.as_deref(), Some("b"));
        assert_eq!(n, None);
    }

    #[test]
    fn test_full_row_update_rejects_unknown_column() {
        let (mut store, _) = store();
        store
            .apply_remote_ops(&[insert("s1", "r1", "a", 2_000)], &mut LastWriterWins, None)
            .unwrap();

        let full = RemoteOperation {
            op_type: OpType::Update,
            columns: None,
            new_row: Some(json!({"name": "b", "colour": "red"})),
            ..insert("s2", "r1", "b", 2_001)
        };
        let err = store
            .apply_remote_ops(&[full], &mut LastWriterWins, Some("c1"))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedOperation(_)));
        assert_eq!(name_of(&store, "r1").as_deref(), Some("a"));
        assert_eq!(store.remote_cursor().unwrap(), None);
    }

    #[test]
    fn test_table_columns_and_applier_key() {
        let (store, _) = store();
        assert_eq!(
            table_columns(store.connection(), "trips").unwrap(),
            vec!["id", "name", "n"]
        );
        assert!(matches!(
            table_columns(store.connection(), "nope"),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(SqlRowApplier::default().key_column(), "id");
        assert_eq!(SqlRowApplier::new("uuid").key_column(), "uuid");

        let op = update("s1", "r9", "x", 2_000);
        assert_eq!(op.row_key(), RowKey::new("trips", "r9").unwrap());
    }

    #[test]
    fn test_sql_values_and_identifiers() {
        assert_eq!(quote_ident("trips").unwrap(), "\"trips\"");
        assert_eq!(quote_ident("we\"ird").unwrap(), "\"we\"\"ird\"");
        assert!(quote_ident("").is_err());

        assert_eq!(to_sql_value(&json!(null)), SqlValue::Null);
        assert_eq!(to_sql_value(&json!(true)), SqlValue::Integer(1));
        assert_eq!(to_sql_value(&json!(3)), SqlValue::Integer(3));
        assert_eq!(to_sql_value(&json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(to_sql_value(&json!("x")), SqlValue::Text("x".into()));
        assert_eq!(to_sql_value(&json!([1])), SqlValue::Text("[1]".into()));
    }

    #[test]
    fn test_remote_operation_json() {
        let op: RemoteOperation = serde_json::from_value(json!({
            "remoteId": "s1",
            "table": "trips",
            "rowId": "r1",
            "opType": "Delete",
            "hlc": "1700000000000-0-B",
            "origin": "B"
        }))
        .unwrap();
        assert_eq!(op.op_type, OpType::Delete);
        assert_eq!(op.validate().unwrap().physical_ms, 1_700_000_000_000);
    }
}
