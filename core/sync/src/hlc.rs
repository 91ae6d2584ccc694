//! Hybrid logical clock.
//!
//! Timestamps combine wall-clock milliseconds with a logical counter and the
//! issuing origin. The encoded form pads both numbers to a fixed width so that
//! plain string comparison agrees with timestamp order, which lets the log
//! sort and compare HLCs directly in SQL.
//!
//! Clock state lives in the `sync_clock` table, one row per origin holding the
//! highest timestamp known for it. Locally issued timestamps are written to the
//! issuing origin's row; timestamps observed on remote operations are written
//! to the remote origin's row. New timestamps are always derived from the
//! maximum over every row, so they sort after anything already issued or
//! applied in this store.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ledgersync_common::{Error, Result};

/// Width of the zero-padded physical component.
const PHYSICAL_WIDTH: usize = 15;
/// Largest physical value that still fits the padded width.
const MAX_PHYSICAL_MS: u64 = 999_999_999_999_999;

/// Source of wall-clock time for the clock.
pub trait ClockSource: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Manually driven clock, for tests and replay tools.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `now_ms`.
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    /// Jump to an absolute time. Moving backwards is allowed.
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Move forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<T: ClockSource + ?Sized> ClockSource for Arc<T> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// A hybrid logical clock timestamp.
///
/// Ordering is by physical time, then counter, then origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp {
    /// Wall-clock component in milliseconds.
    pub physical_ms: u64,
    /// Logical counter within one millisecond.
    pub counter: u32,
    /// Identifier of the issuing device.
    pub origin: String,
}

impl Timestamp {
    /// Create a timestamp.
    ///
    /// # Errors
    /// - Returns error if origin is empty
    /// - Returns error if physical time does not fit the encoding
    pub fn new(physical_ms: u64, counter: u32, origin: impl Into<String>) -> Result<Self> {
        let origin = origin.into();
        if origin.is_empty() {
            return Err(Error::invalid("origin cannot be empty"));
        }
        if physical_ms > MAX_PHYSICAL_MS {
            return Err(Error::invalid(format!(
                "physical time {} out of range",
                physical_ms
            )));
        }
        Ok(Self {
            physical_ms,
            counter,
            origin,
        })
    }

    /// Parse an encoded timestamp.
    ///
    /// Accepts both the padded form and the unpadded `ms-counter-origin`
    /// form. The origin may itself contain dashes. Counters in either form
    /// must fit in a `u32`; larger unpadded counters from older peers are
    /// rejected rather than truncated.
    ///
    /// # Errors
    /// - Returns `InvalidArgument` if the string is not a timestamp or the
    ///   counter exceeds `u32::MAX`
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '-');
        let (physical, counter, origin) = match (parts.next(), parts.next(), parts.next()) {
            (Some(p), Some(c), Some(o)) => (p, c, o),
            _ => return Err(Error::invalid(format!("malformed hlc: {:?}", s))),
        };
        let physical_ms = physical
            .parse::<u64>()
            .map_err(|_| Error::invalid(format!("malformed hlc physical time: {:?}", s)))?;
        let counter = counter
            .parse::<u32>()
            .map_err(|_| Error::invalid(format!("malformed hlc counter: {:?}", s)))?;
        Self::new(physical_ms, counter, origin)
    }

    /// Encode into the fixed-width, lexicographically ordered form.
    pub fn encode(&self) -> String {
        format!(
            "{:0pw$}-{:010}-{}",
            self.physical_ms,
            self.counter,
            self.origin,
            pw = PHYSICAL_WIDTH
        )
    }

    /// Compare only the (physical, counter) part, ignoring origin.
    pub fn logical_cmp(&self, other: &Timestamp) -> std::cmp::Ordering {
        (self.physical_ms, self.counter).cmp(&(other.physical_ms, other.counter))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Timestamp {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Timestamp> for String {
    fn from(ts: Timestamp) -> Self {
        ts.encode()
    }
}

/// Successor of `last` given the current wall-clock time.
fn tick(last: Option<(u64, u32)>, now_ms: u64) -> Result<(u64, u32)> {
    let next = match last {
        Some((physical, counter)) if now_ms <= physical => {
            if counter == u32::MAX {
                (physical + 1, 0)
            } else {
                (physical, counter + 1)
            }
        }
        _ => (now_ms, 0),
    };
    if next.0 > MAX_PHYSICAL_MS {
        return Err(Error::invalid("clock exhausted the physical range"));
    }
    Ok(next)
}

/// Highest (physical, counter) pair recorded for any origin.
pub fn high_water_mark(conn: &Connection) -> Result<Option<(u64, u32)>> {
    let row = conn
        .query_row(
            "SELECT physical_ms, counter FROM sync_clock
             ORDER BY physical_ms DESC, counter DESC LIMIT 1",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    Ok(row.map(|(p, c)| (p as u64, c as u32)))
}

/// Last timestamp recorded for `origin`, if any.
pub fn peek(conn: &Connection, origin: &str) -> Result<Option<Timestamp>> {
    let row = conn
        .query_row(
            "SELECT physical_ms, counter FROM sync_clock WHERE origin = ?1",
            params![origin],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    row.map(|(p, c)| Timestamp::new(p as u64, c as u32, origin))
        .transpose()
}

/// Issue the next timestamp for `origin` and persist it.
///
/// Must run inside the caller's transaction so the issued value and the
/// record that carries it commit together.
///
/// # Errors
/// - `InvalidArgument` if origin is empty
/// - `Storage` on database failure
pub fn next(conn: &Connection, clock: &dyn ClockSource, origin: &str) -> Result<Timestamp> {
    if origin.is_empty() {
        return Err(Error::invalid("origin cannot be empty"));
    }
    let (physical_ms, counter) = tick(high_water_mark(conn)?, clock.now_ms())?;
    conn.execute(
        "INSERT INTO sync_clock (origin, physical_ms, counter) VALUES (?1, ?2, ?3)
         ON CONFLICT(origin) DO UPDATE SET
             physical_ms = excluded.physical_ms,
             counter = excluded.counter",
        params![origin, physical_ms as i64, counter as i64],
    )?;
    Timestamp::new(physical_ms, counter, origin)
}

/// Record a timestamp seen on a remote operation.
///
/// Only ever moves the origin's row forward. When `max_drift_ms` is set,
/// timestamps further than that ahead of local wall-clock time are not
/// recorded, so a peer with a broken clock cannot drag local time forward.
/// Returns whether the clock state changed.
pub fn observe(
    conn: &Connection,
    clock: &dyn ClockSource,
    remote: &Timestamp,
    max_drift_ms: Option<u64>,
) -> Result<bool> {
    if let Some(drift) = max_drift_ms {
        let now = clock.now_ms();
        if remote.physical_ms > now.saturating_add(drift) {
            warn!(
                "Ignoring remote timestamp {} ahead of local time by more than {} ms",
                remote, drift
            );
            return Ok(false);
        }
    }

    let changed = conn.execute(
        "INSERT INTO sync_clock (origin, physical_ms, counter) VALUES (?1, ?2, ?3)
         ON CONFLICT(origin) DO UPDATE SET
             physical_ms = excluded.physical_ms,
             counter = excluded.counter
         WHERE excluded.physical_ms > sync_clock.physical_ms
            OR (excluded.physical_ms = sync_clock.physical_ms
                AND excluded.counter > sync_clock.counter)",
        params![
            remote.origin,
            remote.physical_ms as i64,
            remote.counter as i64
        ],
    )?;
    if changed > 0 {
        debug!("Observed remote timestamp {}", remote);
    }
    Ok(changed > 0)
}
