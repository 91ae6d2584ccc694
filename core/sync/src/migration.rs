//! Ordered, transactional schema migrations.
//!
//! A fresh store is at version 0. Migrations are registered in a
//! [`Migrator`] and run forward only: each step runs in its own transaction
//! together with the version bump and a history record, so a failed step
//! leaves the store at the last completed version.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};

use ledgersync_common::{Error, Result};

const VERSION_KEY: &str = "schema_version";

/// Schema version number. 0 means no migration has run.
pub type SchemaVersion = u32;

/// One schema migration step.
pub trait Migration: Send + Sync {
    /// Version this step migrates to. Must be unique and non-zero.
    fn version(&self) -> SchemaVersion;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Apply the step. Runs inside the step's transaction.
    fn up(&self, conn: &Connection) -> Result<()>;
}

/// Migration defined by a batch of SQL statements.
#[derive(Debug, Clone)]
pub struct SqlMigration {
    version: SchemaVersion,
    name: String,
    sql: String,
}

impl SqlMigration {
    /// Create a SQL migration.
    pub fn new(version: SchemaVersion, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            sql: sql.into(),
        }
    }
}

impl Migration for SqlMigration {
    fn version(&self) -> SchemaVersion {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn up(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&self.sql)?;
        Ok(())
    }
}

/// Registered migration, as listed by [`Migrator::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    pub version: SchemaVersion,
    pub name: String,
}

/// Outcome of [`Migrator::migrate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Version before the run.
    pub from: SchemaVersion,
    /// Version after the run.
    pub to: SchemaVersion,
    /// Versions applied, in order.
    pub applied: Vec<SchemaVersion>,
}

/// History row from the `schema_migrations` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: SchemaVersion,
    pub name: String,
    /// Unix time in milliseconds.
    pub applied_ms: i64,
}

/// Registry of migrations, ordered by version.
#[derive(Default)]
pub struct Migrator {
    migrations: BTreeMap<SchemaVersion, Box<dyn Migration>>,
}

impl fmt::Debug for Migrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migrator")
            .field("versions", &self.migrations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Migrator {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration.
    ///
    /// # Errors
    /// - `InvalidArgument` if the version is 0 or already registered
    pub fn register(&mut self, migration: Box<dyn Migration>) -> Result<()> {
        let version = migration.version();
        if version == 0 {
            return Err(Error::invalid("migration version must be at least 1"));
        }
        if self.migrations.contains_key(&version) {
            return Err(Error::invalid(format!(
                "migration version {} registered twice",
                version
            )));
        }
        self.migrations.insert(version, migration);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, migration: impl Migration + 'static) -> Result<Self> {
        self.register(Box::new(migration))?;
        Ok(self)
    }

    /// Load `<version>_<name>.sql` files from a directory.
    ///
    /// Files with other extensions are ignored.
    pub fn from_sql_dir(dir: &Path) -> Result<Self> {
        let mut migrator = Self::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| Error::invalid(format!("bad migration file {:?}", path)))?;
            let (version, name) = stem.split_once('_').unwrap_or((stem, stem));
            let version: SchemaVersion = version.parse().map_err(|_| {
                Error::invalid(format!(
                    "migration file {:?} must start with a version number",
                    path
                ))
            })?;
            let sql = std::fs::read_to_string(&path)?;
            migrator.register(Box::new(SqlMigration::new(version, name, sql)))?;
        }
        debug!("Loaded {} migrations from {:?}", migrator.len(), dir);
        Ok(migrator)
    }

    /// Number of registered migrations.
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Whether no migration is registered.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Highest registered version, or 0.
    pub fn latest(&self) -> SchemaVersion {
        self.migrations.keys().next_back().copied().unwrap_or(0)
    }

    /// Registered migrations in version order.
    pub fn list(&self) -> Vec<MigrationInfo> {
        self.migrations
            .values()
            .map(|m| MigrationInfo {
                version: m.version(),
                name: m.name().to_string(),
            })
            .collect()
    }

    /// Registered migrations newer than `current`.
    pub fn pending(&self, current: SchemaVersion) -> Vec<MigrationInfo> {
        self.list()
            .into_iter()
            .filter(|m| m.version > current)
            .collect()
    }

    /// Check that versions run 1, 2, 3, ... without gaps.
    pub fn validate(&self) -> Result<()> {
        for (expected, version) in (1..).zip(self.migrations.keys()) {
            if *version != expected {
                return Err(Error::schema(format!(
                    "migration {} is missing (next registered is {})",
                    expected, version
                )));
            }
        }
        Ok(())
    }

    /// Run every step in `(current, target]` in ascending order.
    ///
    /// # Errors
    /// - `SchemaVersion` if `target` is below the current version
    /// - `SchemaVersion` if the current version is already `u32::MAX`
    /// - `SchemaVersion` if a step in the range is not registered; nothing runs
    /// - `SchemaVersion` carrying the cause if a step fails; earlier steps
    ///   stay applied
    pub fn migrate(&self, conn: &mut Connection, target: SchemaVersion) -> Result<MigrationReport> {
        let from = schema_version(conn)?;
        if target < from {
            return Err(Error::schema(format!(
                "cannot downgrade schema from {} to {}",
                from, target
            )));
        }

        let first = from.checked_add(1).ok_or_else(|| {
            Error::schema(format!("stored schema version {} has no successor", from))
        })?;
        let steps = (first..=target)
            .map(|v| {
                self.migrations.get(&v).ok_or_else(|| {
                    Error::schema(format!("no migration registered for version {}", v))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut applied = Vec::with_capacity(steps.len());
        for migration in steps {
            run_step(conn, migration.as_ref())?;
            applied.push(migration.version());
        }

        if !applied.is_empty() {
            info!("Migrated schema from {} to {}", from, target);
        }
        Ok(MigrationReport {
            from,
            to: target,
            applied,
        })
    }

    /// Run every registered step above the current version.
    pub fn migrate_to_latest(&self, conn: &mut Connection) -> Result<MigrationReport> {
        let current = schema_version(conn)?;
        self.migrate(conn, self.latest().max(current))
    }
}

fn run_step(conn: &mut Connection, migration: &dyn Migration) -> Result<()> {
    let version = migration.version();
    let name = migration.name();
    debug!("Applying migration {} ({})", version, name);

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let step = migration.up(&tx).and_then(|_| {
        tx.execute(
            "INSERT INTO sync_kv (k, v) VALUES (?1, ?2)
             ON CONFLICT(k) DO UPDATE SET v = excluded.v",
            params![VERSION_KEY, version.to_string()],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO schema_migrations (version, name, applied_ms)
             VALUES (?1, ?2, ?3)",
            params![version, name, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    });

    match step {
        Ok(()) => {
            tx.commit()?;
            Ok(())
        }
        Err(err) => {
            warn!("Migration {} ({}) failed: {}", version, name, err);
            drop(tx);
            Err(Error::schema(format!(
                "migration {} ({}) failed: {}",
                version, name, err
            )))
        }
    }
}

/// Current schema version; 0 for a store that never migrated.
///
/// # Errors
/// - `SchemaVersion` if the stored value is corrupt
pub fn schema_version(conn: &Connection) -> Result<SchemaVersion> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT v FROM sync_kv WHERE k = ?1",
            params![VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;
    match stored {
        None => Ok(0),
        Some(v) => v
            .parse()
            .map_err(|_| Error::schema(format!("stored schema version {:?} is corrupt", v))),
    }
}

/// Applied migrations, oldest first.
pub fn history(conn: &Connection) -> Result<Vec<AppliedMigration>> {
    let mut stmt = conn.prepare(
        "SELECT version, name, applied_ms FROM schema_migrations ORDER BY version ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(AppliedMigration {
                version: row.get(0)?,
                name: row.get(1)?,
                applied_ms: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
