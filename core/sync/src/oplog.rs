//! Operation log and pending queue.
//!
//! Every local mutation is appended to `sync_operations` with a fresh HLC and
//! state `pending`. The pending queue is the subset still in that state,
//! ordered by local sequence number.

use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use ledgersync_common::{Error, OpType, OperationId, Result, RowKey, SyncState};

use crate::hlc::{self, ClockSource, Timestamp};

const SELECT_COLUMNS: &str = r#"
    SELECT change_id, table_name, row_id, op_type, columns, new_row, old_row,
           hlc, origin, sync_status
    FROM sync_operations
"#;

/// A logged local operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Local sequence number.
    pub id: OperationId,
    /// Target table.
    pub table: String,
    /// Target row key.
    pub row_id: String,
    /// Kind of mutation.
    pub op_type: OpType,
    /// Changed columns of an update; `None` means the whole row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    /// Row values after the change.
    #[serde(default)]
    pub new_row: Option<Value>,
    /// Row values before the change, when the caller supplied them.
    #[serde(default)]
    pub old_row: Option<Value>,
    /// Encoded HLC.
    pub hlc: String,
    /// Issuing device.
    pub origin: String,
    /// Sync lifecycle state.
    pub sync_state: SyncState,
}

impl Operation {
    /// Parsed HLC of this operation.
    pub fn timestamp(&self) -> Result<Timestamp> {
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

/// Payload of a logged update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateChange {
    /// Changed columns; `None` replaces the full row.
    pub columns: Option<Vec<String>>,
    /// New values.
    pub new_row: Option<Value>,
    /// Previous values.
    pub old_row: Option<Value>,
}

impl UpdateChange {
    /// Full-row replacement.
    pub fn full(new_row: Value) -> Self {
        Self {
            columns: None,
            new_row: Some(new_row),
            old_row: None,
        }
    }

    /// Change to the listed columns only.
    pub fn columns<I, S>(columns: I, new_row: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: Some(columns.into_iter().map(Into::into).collect()),
            new_row: Some(new_row),
            old_row: None,
        }
    }

    /// Attach the previous row values.
    pub fn with_old_row(mut self, old_row: Value) -> Self {
        self.old_row = Some(old_row);
        self
    }
}

/// An operation about to be appended.
#[derive(Debug, Clone)]
pub(crate) struct NewOperation<'a> {
    pub table: &'a str,
    pub row_id: &'a str,
    pub op_type: OpType,
    pub columns: Option<&'a [String]>,
    pub new_row: Option<&'a Value>,
    pub old_row: Option<&'a Value>,
    pub origin: &'a str,
}

impl<'a> NewOperation<'a> {
    pub fn insert(table: &'a str, row_id: &'a str, new_row: &'a Value, origin: &'a str) -> Self {
        Self {
            table,
            row_id,
            op_type: OpType::Insert,
            columns: None,
            new_row: Some(new_row),
            old_row: None,
            origin,
        }
    }

    pub fn update(
        table: &'a str,
        row_id: &'a str,
        change: &'a UpdateChange,
        origin: &'a str,
    ) -> Self {
        Self {
            table,
            row_id,
            op_type: OpType::Update,
            columns: change.columns.as_deref(),
            new_row: change.new_row.as_ref(),
            old_row: change.old_row.as_ref(),
            origin,
        }
    }

    pub fn delete(table: &'a str, row_id: &'a str, origin: &'a str) -> Self {
        Self {
            table,
            row_id,
            op_type: OpType::Delete,
            columns: None,
            new_row: None,
            old_row: None,
            origin,
        }
    }

    fn validate(&self) -> Result<()> {
        RowKey::new(self.table, self.row_id)?;
        if self.origin.is_empty() {
            return Err(Error::invalid("origin cannot be empty"));
        }
        if let Some(row) = self.new_row {
            if !row.is_object() {
                return Err(Error::invalid("row payload must be a JSON object"));
            }
        }
        if let Some(row) = self.old_row {
            if !row.is_object() {
                return Err(Error::invalid("old row payload must be a JSON object"));
            }
        }
        if let Some(columns) = self.columns {
            if columns.is_empty() {
                return Err(Error::invalid("changed column list cannot be empty"));
            }
            if columns.iter().any(|c| c.is_empty()) {
                return Err(Error::invalid("column name cannot be empty"));
            }
        }
        if self.op_type == OpType::Insert && self.new_row.is_none() {
            return Err(Error::invalid("insert requires a new row"));
        }
        Ok(())
    }
}

fn to_json(value: Option<&impl Serialize>) -> Result<Option<String>> {
    value
        .map(|v| serde_json::to_string(v).map_err(Error::from))
        .transpose()
}

/// Append an operation with a freshly issued HLC.
///
/// The clock tick and the insert share the caller's transaction.
pub(crate) fn append(
    conn: &Connection,
    clock: &dyn ClockSource,
    op: NewOperation<'_>,
) -> Result<OperationId> {
    op.validate()?;
    let ts = hlc::next(conn, clock, op.origin)?;

    conn.execute(
        r#"
        INSERT INTO sync_operations
            (table_name, row_id, op_type, columns, new_row, old_row, hlc, origin,
             sync_status, created_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)
        "#,
        params![
            op.table,
            op.row_id,
            op.op_type.as_str(),
            to_json(op.columns.as_ref())?,
            to_json(op.new_row)?,
            to_json(op.old_row)?,
            ts.encode(),
            op.origin,
            chrono::Utc::now().timestamp_millis(),
        ],
    )?;

    let id = OperationId::new(conn.last_insert_rowid());
    debug!(
        "Logged {} {}/{} as op {} at {}",
        op.op_type, op.table, op.row_id, id, ts
    );
    Ok(id)
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        serde_json::from_str(&t)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn parsed_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn map_operation(row: &Row<'_>) -> rusqlite::Result<Operation> {
    let columns = match json_column(row, 4)? {
        Some(value) => Some(
            serde_json::from_value::<Vec<String>>(value).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
            })?,
        ),
        None => None,
    };
    Ok(Operation {
        id: OperationId::new(row.get(0)?),
        table: row.get(1)?,
        row_id: row.get(2)?,
        op_type: parsed_column(row, 3)?,
        columns,
        new_row: json_column(row, 5)?,
        old_row: json_column(row, 6)?,
        hlc: row.get(7)?,
        origin: row.get(8)?,
        sync_state: parsed_column(row, 9)?,
    })
}

/// Look up one operation.
///
/// # Errors
/// - `NotFound` if no operation has this id
pub fn get(conn: &Connection, id: OperationId) -> Result<Operation> {
    let sql = format!("{} WHERE change_id = ?1", SELECT_COLUMNS);
    match conn.query_row(&sql, params![id.get()], map_operation) {
        Ok(op) => Ok(op),
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            Err(Error::NotFound(format!("operation {}", id)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Up to `limit` pending operations in ascending id order.
///
/// A single statement, so the result is one consistent snapshot even while
/// other handles write.
pub fn pending(conn: &Connection, limit: usize) -> Result<Vec<Operation>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let sql = format!(
        "{} WHERE sync_status = 'pending' ORDER BY change_id ASC LIMIT ?1",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let ops = stmt
        .query_map(params![limit], map_operation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ops)
}

/// Number of pending operations.
pub fn pending_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_operations WHERE sync_status = 'pending'",
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Every operation ever logged for a row, oldest first.
pub fn for_row(conn: &Connection, table: &str, row_id: &str) -> Result<Vec<Operation>> {
    let sql = format!(
        "{} WHERE table_name = ?1 AND row_id = ?2 ORDER BY change_id ASC",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let ops = stmt
        .query_map(params![table, row_id], map_operation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ops)
}

/// Local operations on a row that the remote has not acknowledged and that
/// no accepted remote operation has superseded.
pub(crate) fn unresolved_for_row(
    conn: &Connection,
    table: &str,
    row_id: &str,
) -> Result<Vec<Operation>> {
    let sql = format!(
        r#"{} WHERE table_name = ?1 AND row_id = ?2
              AND sync_status IN ('pending', 'pushed')
              AND superseded_by IS NULL
            ORDER BY change_id ASC"#,
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let ops = stmt
        .query_map(params![table, row_id], map_operation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ops)
}

/// Mark local operations as superseded by an accepted remote operation.
pub(crate) fn supersede(conn: &Connection, ids: &[OperationId], remote_id: &str) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "UPDATE sync_operations SET superseded_by = ?1
         WHERE change_id = ?2 AND superseded_by IS NULL",
    )?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute(params![remote_id, id.get()])?;
    }
    Ok(changed)
}

/// Move operations into `target`, skipping ids that do not exist or whose
/// current state cannot advance to it. Returns the number transitioned.
pub(crate) fn advance(conn: &Connection, ids: &[OperationId], target: SyncState) -> Result<usize> {
    let from = target.predecessors();
    if from.is_empty() || ids.is_empty() {
        return Ok(0);
    }
    let allowed = from
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE sync_operations SET sync_status = ?1
         WHERE change_id = ?2 AND sync_status IN ({})",
        allowed
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute(params![target.as_str(), id.get()])?;
    }
    debug!("Moved {} of {} operations to {}", changed, ids.len(), target);
    Ok(changed)
}
