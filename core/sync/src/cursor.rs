//! Remote cursor persistence.
//!
//! The cursor is an opaque position in the remote feed. It is stored in the
//! `sync_kv` table so it can be written in the same transaction as the batch
//! it accompanies.

use rusqlite::{params, Connection, OptionalExtension};

use ledgersync_common::{Error, Result};

const CURSOR_KEY: &str = "remote_cursor";

/// Read the cursor; `None` if it was never set.
pub fn get(conn: &Connection) -> Result<Option<String>> {
    let cursor = conn
        .query_row(
            "SELECT v FROM sync_kv WHERE k = ?1",
            params![CURSOR_KEY],
            |row| row.get(0),
        )
        .optional()?;
    Ok(cursor)
}

/// Overwrite the cursor.
///
/// # Errors
/// - `InvalidArgument` if the cursor is empty
pub fn set(conn: &Connection, cursor: &str) -> Result<()> {
    if cursor.is_empty() {
        return Err(Error::invalid("cursor cannot be empty"));
    }
    conn.execute(
        "INSERT INTO sync_kv (k, v) VALUES (?1, ?2)
         ON CONFLICT(k) DO UPDATE SET v = excluded.v",
        params![CURSOR_KEY, cursor],
    )?;
    Ok(())
}

/// Forget the cursor so the next pull starts from the beginning of the feed.
pub fn clear(conn: &Connection) -> Result<bool> {
    let removed = conn.execute("DELETE FROM sync_kv WHERE k = ?1", params![CURSOR_KEY])?;
    Ok(removed > 0)
}
