//! LedgerSync CLI - Command line interface for inspecting and driving a sync
//! store.
//!
//! Useful for operating on a device's store file directly: initializing and
//! migrating it, inspecting the pending queue, replaying acknowledgements and
//! applying a batch of remote operations captured as JSON.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ledgersync_engine::{
    ConflictStrategy, Migrator, OperationId, RemoteBatch, SyncConfig, SyncStore, UpdateChange,
};

#[derive(Parser)]
#[command(name = "ledgersync")]
#[command(about = "LedgerSync - Local-first sync store management")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Store file; overrides the config's store path.
    #[arg(short, long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the sync tables.
    Init,

    /// Run SQL migrations from a directory of `<version>_<name>.sql` files.
    Migrate {
        /// Migration directory.
        #[arg(short = 'm', long)]
        dir: PathBuf,

        /// Target version (default: highest available).
        #[arg(short, long)]
        target: Option<u32>,
    },

    /// Show the schema version and migration history.
    Version,

    /// List pending operations.
    Pending {
        /// Maximum operations to show.
        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Show one operation.
    Show {
        /// Operation id.
        id: i64,
    },

    /// Mark operations as pushed.
    MarkPushed {
        /// Operation ids.
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Mark operations as acknowledged.
    Ack {
        /// Operation ids.
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Read or change the remote cursor.
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },

    /// Issue the next hybrid logical clock timestamp.
    NextHlc {
        /// Origin; defaults to the config's origin.
        #[arg(short, long)]
        origin: Option<String>,
    },

    /// Append a local operation to the log.
    Log {
        #[command(subcommand)]
        op: LogOp,
    },

    /// Apply a JSON batch of remote operations.
    Apply {
        /// Batch file (`{"ops": [...], "cursor": ...}`), or `-` for stdin.
        #[arg(short, long)]
        file: PathBuf,

        /// Conflict resolution strategy.
        #[arg(short, long, value_enum, default_value_t = Strategy::LastWriterWins)]
        strategy: Strategy,
    },
}

#[derive(Subcommand)]
enum CursorAction {
    /// Print the cursor.
    Get,
    /// Overwrite the cursor.
    Set { cursor: String },
    /// Forget the cursor.
    Clear,
}

#[derive(Subcommand)]
enum LogOp {
    /// Log an insert.
    Insert {
        table: String,
        row_id: String,
        /// Full row as a JSON object.
        row: String,
        #[arg(short, long)]
        origin: Option<String>,
    },
    /// Log an update.
    Update {
        table: String,
        row_id: String,
        /// New values as a JSON object.
        row: String,
        /// Changed columns, comma separated (default: full row).
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,
        #[arg(short, long)]
        origin: Option<String>,
    },
    /// Log a delete.
    Delete {
        table: String,
        row_id: String,
        #[arg(short, long)]
        origin: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    PreferLocal,
    PreferRemote,
    LastWriterWins,
    Manual,
}

impl From<Strategy> for ConflictStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::PreferLocal => ConflictStrategy::PreferLocal,
            Strategy::PreferRemote => ConflictStrategy::PreferRemote,
            Strategy::LastWriterWins => ConflictStrategy::LastWriterWins,
            Strategy::Manual => ConflictStrategy::Manual,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref(), cli.db)?;

    match cli.command {
        Commands::Init => cmd_init(&config),
        Commands::Migrate { dir, target } => cmd_migrate(&config, &dir, target),
        Commands::Version => cmd_version(&config),
        Commands::Pending { limit, json } => cmd_pending(&config, limit, json),
        Commands::Show { id } => cmd_show(&config, id),
        Commands::MarkPushed { ids } => cmd_mark(&config, &ids, false),
        Commands::Ack { ids } => cmd_mark(&config, &ids, true),
        Commands::Cursor { action } => cmd_cursor(&config, action),
        Commands::NextHlc { origin } => cmd_next_hlc(&config, origin),
        Commands::Log { op } => cmd_log(&config, op),
        Commands::Apply { file, strategy } => cmd_apply(&config, &file, strategy),
    }
}

/// Build the effective config from an optional file and the `--db` flag.
fn load_config(path: Option<&Path>, db: Option<PathBuf>) -> Result<SyncConfig> {
    let mut config = match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            // Origin is only required by commands that write log entries.
            serde_json::from_str::<SyncConfig>(&json).context("Invalid config file")?
        }
        None => SyncConfig::default(),
    };
    if let Some(db) = db {
        config.store.path = db;
    }
    if config.store.is_in_memory() {
        bail!("No store file given; pass --db or set store.path in the config");
    }
    Ok(config)
}

fn open_store(config: &SyncConfig) -> Result<SyncStore> {
    SyncStore::open_with_config(&config.store)
        .with_context(|| format!("Failed to open store {}", config.store.path.display()))
}

fn origin_or_default(config: &SyncConfig, origin: Option<String>) -> Result<String> {
    match origin {
        Some(origin) => Ok(origin),
        None if !config.origin.is_empty() => Ok(config.origin.clone()),
        None => bail!("No origin given; pass --origin or set origin in the config"),
    }
}

fn parse_row(row: &str) -> Result<serde_json::Value> {
    serde_json::from_str(row).context("Row must be valid JSON")
}

fn cmd_init(config: &SyncConfig) -> Result<()> {
    let mut store = open_store(config)?;
    store.init_schema().context("Failed to create sync tables")?;
    println!("Store initialized: {}", config.store.path.display());
    Ok(())
}

fn cmd_migrate(config: &SyncConfig, dir: &Path, target: Option<u32>) -> Result<()> {
    let migrator = Migrator::from_sql_dir(dir)
        .with_context(|| format!("Failed to load migrations from {}", dir.display()))?;
    migrator.validate().context("Migration set is incomplete")?;

    let mut store = open_store(config)?;
    store.init_schema()?;
    let target = target.unwrap_or_else(|| migrator.latest());
    info!("Migrating {} to version {}", config.store.path.display(), target);

    let report = store.migrate(&migrator, target).context("Migration failed")?;
    if report.applied.is_empty() {
        println!("Already at version {}.", report.to);
    } else {
        println!(
            "Migrated from {} to {} ({} steps).",
            report.from,
            report.to,
            report.applied.len()
        );
    }
    Ok(())
}

fn cmd_version(config: &SyncConfig) -> Result<()> {
    let store = open_store(config)?;
    println!("Schema version: {}", store.schema_version()?);
    for applied in store.migration_history()? {
        println!("  {:>4}  {}  ({})", applied.version, applied.name, applied.applied_ms);
    }
    Ok(())
}

fn cmd_pending(config: &SyncConfig, limit: usize, json: bool) -> Result<()> {
    let store = open_store(config)?;
    if json {
        println!("{}", store.pending_ops_json(limit)?);
        return Ok(());
    }

    let ops = store.pending_ops(limit)?;
    if ops.is_empty() {
        println!("No pending operations.");
        return Ok(());
    }
    println!("Pending operations ({} total):", store.pending_count()?);
    for op in ops {
        println!(
            "  {:>6}  {:<6}  {}/{}  {}",
            op.id.get(),
            op.op_type.as_str(),
            op.table,
            op.row_id,
            op.hlc
        );
    }
    Ok(())
}

fn cmd_show(config: &SyncConfig, id: i64) -> Result<()> {
    let store = open_store(config)?;
    let op = store.operation(OperationId::new(id))?;
    println!("{}", serde_json::to_string_pretty(&op)?);
    Ok(())
}

fn cmd_mark(config: &SyncConfig, ids: &[i64], acked: bool) -> Result<()> {
    let mut store = open_store(config)?;
    let ids: Vec<_> = ids.iter().copied().map(OperationId::new).collect();
    let (moved, state) = if acked {
        (store.mark_ops_acked(&ids)?, "acked")
    } else {
        (store.mark_ops_pushed(&ids)?, "pushed")
    };
    println!("{} of {} operations marked {}.", moved, ids.len(), state);
    Ok(())
}

fn cmd_cursor(config: &SyncConfig, action: CursorAction) -> Result<()> {
    let mut store = open_store(config)?;
    match action {
        CursorAction::Get => match store.remote_cursor()? {
            Some(cursor) => println!("{}", cursor),
            None => println!("(no cursor)"),
        },
        CursorAction::Set { cursor } => {
            store.set_remote_cursor(&cursor)?;
            println!("Cursor set.");
        }
        CursorAction::Clear => {
            if store.clear_remote_cursor()? {
                println!("Cursor cleared.");
            } else {
                println!("No cursor was set.");
            }
        }
    }
    Ok(())
}

fn cmd_next_hlc(config: &SyncConfig, origin: Option<String>) -> Result<()> {
    let origin = origin_or_default(config, origin)?;
    let mut store = open_store(config)?;
    println!("{}", store.next_hlc(&origin)?);
    Ok(())
}

fn cmd_log(config: &SyncConfig, op: LogOp) -> Result<()> {
    let mut store = open_store(config)?;
    let id = match op {
        LogOp::Insert {
            table,
            row_id,
            row,
            origin,
        } => {
            let origin = origin_or_default(config, origin)?;
            store.log_insert(&table, &row_id, &parse_row(&row)?, &origin)?
        }
        LogOp::Update {
            table,
            row_id,
            row,
            columns,
            origin,
        } => {
            let origin = origin_or_default(config, origin)?;
            let change = UpdateChange {
                columns,
                new_row: Some(parse_row(&row)?),
                old_row: None,
            };
            store.log_update(&table, &row_id, &change, &origin)?
        }
        LogOp::Delete {
            table,
            row_id,
            origin,
        } => {
            let origin = origin_or_default(config, origin)?;
            store.log_delete(&table, &row_id, &origin)?
        }
    };

    let op = store.operation(id)?;
    println!("Logged operation {} at {}", op.id, op.hlc);
    Ok(())
}

fn cmd_apply(config: &SyncConfig, file: &Path, strategy: Strategy) -> Result<()> {
    let json = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read batch from stdin")?;
        buf
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read batch {}", file.display()))?
    };
    let batch: RemoteBatch = serde_json::from_str(&json).context("Invalid remote batch")?;

    let mut store = open_store(config)?;
    let mut resolver = ConflictStrategy::from(strategy);
    let report = store
        .apply_remote_batch(&batch, &mut resolver)
        .context("Failed to apply remote batch")?;

    println!(
        "Applied {}, skipped {}, duplicates {}, conflicts {}.",
        report.applied, report.skipped, report.duplicates, report.conflicts
    );
    if let Some(cursor) = store.remote_cursor()? {
        println!("Cursor: {}", cursor);
    }
    Ok(())
}
