//! Conflict detection and resolution.
//!
//! A remote operation conflicts with the local log when the same row still has
//! local operations the remote has not acknowledged. Remote updates and
//! deletes against rows that do not exist locally also go through the
//! resolver. Resolution happens inside the batch transaction; the resolver may
//! run its own SQL there through [`ResolveContext`].

use std::fmt;

use rusqlite::{Connection, Params};
use serde::{Deserialize, Serialize};

use ledgersync_common::{Error, Result};

use crate::apply::RemoteOperation;
use crate::hlc::Timestamp;
use crate::oplog::Operation;

/// Decision for one remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// Apply the remote operation to the local row.
    AcceptRemote,
    /// Keep local state; record the remote operation as processed.
    SkipRemote,
    /// Roll back the whole batch.
    Abort,
}

impl Outcome {
    /// Integer code used by resolvers living across a language boundary.
    pub fn to_code(self) -> i32 {
        match self {
            Outcome::AcceptRemote => 0,
            Outcome::SkipRemote => 1,
            Outcome::Abort => 2,
        }
    }

    /// Decode an integer resolver result.
    ///
    /// # Errors
    /// - `InvalidArgument` for any code other than 0, 1 or 2
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Outcome::AcceptRemote),
            1 => Ok(Outcome::SkipRemote),
            2 => Ok(Outcome::Abort),
            other => Err(Error::invalid(format!("unknown resolver outcome {}", other))),
        }
    }

    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::AcceptRemote => "accept_remote",
            Outcome::SkipRemote => "skip_remote",
            Outcome::Abort => "abort",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote operation that needs a decision.
#[derive(Debug)]
pub struct Candidate<'a> {
    /// The incoming operation.
    pub remote: &'a RemoteOperation,
    /// Its parsed HLC.
    pub remote_hlc: &'a Timestamp,
    /// Unacknowledged local operations on the same row, oldest first.
    pub local: &'a [Operation],
    /// Whether the target row exists locally.
    pub target_exists: bool,
    /// Default decision: accept when the remote HLC is later than every
    /// conflicting local HLC.
    pub suggested: Outcome,
}

impl Candidate<'_> {
    /// True when an update or delete targets a row missing locally.
    pub fn target_missing(&self) -> bool {
        !self.target_exists
    }

    /// True when local operations on the row are still unacknowledged.
    pub fn has_local_changes(&self) -> bool {
        !self.local.is_empty()
    }

    /// Most recent conflicting local operation.
    pub fn latest_local(&self) -> Option<&Operation> {
        self.local.last()
    }
}

/// Compute the default decision for a remote operation.
pub(crate) fn suggest(remote_hlc: &Timestamp, local: &[Operation]) -> Result<Outcome> {
    for op in local {
        if op.timestamp()? >= *remote_hlc {
            return Ok(Outcome::SkipRemote);
        }
    }
    Ok(Outcome::AcceptRemote)
}

/// Access to the batch transaction while resolving.
pub struct ResolveContext<'a> {
    conn: &'a Connection,
}

impl<'a> ResolveContext<'a> {
    pub(crate) fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Run SQL statements in the current transaction.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Run one parameterized statement in the current transaction.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        Ok(self.conn.execute(sql, params)?)
    }

    /// The underlying connection, for reads.
    pub fn connection(&self) -> &Connection {
        self.conn
    }
}

/// Decides what to do with conflicting remote operations.
///
/// Returning an error aborts the batch just like [`Outcome::Abort`].
pub trait Resolver {
    fn resolve(&mut self, candidate: &Candidate<'_>, ctx: &ResolveContext<'_>) -> Result<Outcome>;
}

impl<R: Resolver + ?Sized> Resolver for &mut R {
    fn resolve(&mut self, candidate: &Candidate<'_>, ctx: &ResolveContext<'_>) -> Result<Outcome> {
        (**self).resolve(candidate, ctx)
    }
}

/// Resolver backed by a closure.
pub struct FnResolver<F>(F);

impl<F> FnResolver<F>
where
    F: FnMut(&Candidate<'_>, &ResolveContext<'_>) -> Result<Outcome>,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Resolver for FnResolver<F>
where
    F: FnMut(&Candidate<'_>, &ResolveContext<'_>) -> Result<Outcome>,
{
    fn resolve(&mut self, candidate: &Candidate<'_>, ctx: &ResolveContext<'_>) -> Result<Outcome> {
        (self.0)(candidate, ctx)
    }
}

/// Resolver that always follows the HLC comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl Resolver for LastWriterWins {
    fn resolve(&mut self, candidate: &Candidate<'_>, _ctx: &ResolveContext<'_>) -> Result<Outcome> {
        Ok(candidate.suggested)
    }
}

/// Adapter for resolvers that answer with integer codes.
pub struct CodeResolver<F>(F);

impl<F> CodeResolver<F>
where
    F: FnMut(&Candidate<'_>) -> i32,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Resolver for CodeResolver<F>
where
    F: FnMut(&Candidate<'_>) -> i32,
{
    fn resolve(&mut self, candidate: &Candidate<'_>, _ctx: &ResolveContext<'_>) -> Result<Outcome> {
        Outcome::from_code((self.0)(candidate))
    }
}

/// Fixed resolution policy, selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Keep local changes, skip the remote operation.
    PreferLocal,
    /// Always take the remote operation.
    PreferRemote,
    /// Whichever side has the later HLC wins.
    #[default]
    LastWriterWins,
    /// Abort the batch so the application can resolve by hand.
    Manual,
}

impl Resolver for ConflictStrategy {
    fn resolve(&mut self, candidate: &Candidate<'_>, _ctx: &ResolveContext<'_>) -> Result<Outcome> {
        Ok(match self {
            ConflictStrategy::PreferLocal if candidate.has_local_changes() => Outcome::SkipRemote,
            ConflictStrategy::PreferLocal => candidate.suggested,
            ConflictStrategy::PreferRemote => Outcome::AcceptRemote,
            ConflictStrategy::LastWriterWins => candidate.suggested,
            ConflictStrategy::Manual => Outcome::Abort,
        })
    }
}
