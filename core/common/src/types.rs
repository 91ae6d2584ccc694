//! Common types used throughout LedgerSync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Local sequence number of a logged operation.
///
/// Assigned on insert, strictly increasing per store and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(i64);

impl OperationId {
    /// Wrap a raw sequence number.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw sequence number.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for OperationId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of mutation an operation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    /// A new row; payload is the full row.
    Insert,
    /// Changed columns of an existing row.
    Update,
    /// Row removal; no payload beyond identity.
    Delete,
}

impl OpType {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Insert => "INSERT",
            OpType::Update => "UPDATE",
            OpType::Delete => "DELETE",
        }
    }
}

impl FromStr for OpType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(OpType::Insert),
            "UPDATE" => Ok(OpType::Update),
            "DELETE" => Ok(OpType::Delete),
            other => Err(Error::invalid(format!("unknown op type: {}", other))),
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync lifecycle of a locally logged operation.
///
/// Transitions only move forward: `Pending -> Pushed -> Acked`.
/// Acknowledging a pending operation directly is allowed since an ack
/// implies the push happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Logged locally, not yet transmitted.
    Pending,
    /// Transmitted, remote receipt not yet confirmed.
    Pushed,
    /// Remote has canonically applied it.
    Acked,
}

impl SyncState {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Pushed => "pushed",
            SyncState::Acked => "acked",
        }
    }

    /// States from which a transition into `self` is legal.
    pub fn predecessors(self) -> &'static [SyncState] {
        match self {
            SyncState::Pending => &[],
            SyncState::Pushed => &[SyncState::Pending],
            SyncState::Acked => &[SyncState::Pending, SyncState::Pushed],
        }
    }

    /// Check whether `self` may advance to `next`.
    pub fn can_advance_to(self, next: SyncState) -> bool {
        next.predecessors().contains(&self)
    }
}

impl FromStr for SyncState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SyncState::Pending),
            "pushed" => Ok(SyncState::Pushed),
            "acked" => Ok(SyncState::Acked),
            other => Err(Error::invalid(format!("unknown sync state: {}", other))),
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The logical record an operation targets.
///
/// Both parts are opaque strings; no foreign-key validation happens here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowKey {
    /// Table name.
    pub table: String,
    /// Primary key value, stringified.
    pub row_id: String,
}

impl RowKey {
    /// Create a row key.
    ///
    /// # Errors
    /// - Returns error if table or row id is empty
    pub fn new(table: impl Into<String>, row_id: impl Into<String>) -> Result<Self> {
        let table = table.into();
        let row_id = row_id.into();
        if table.is_empty() {
            return Err(Error::invalid("table name cannot be empty"));
        }
        if row_id.is_empty() {
            return Err(Error::invalid("row id cannot be empty"));
        }
        Ok(Self { table, row_id })
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.row_id)
    }
}
