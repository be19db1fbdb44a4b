use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

use crate::config::{self, SqliteConfig};

/// Version stamped into `user_version` when the schema is installed.
/// Bumped together with schema.sql; a full resync rebuilds message and
/// tool-call rows, so there is no in-place migration path.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA: &str = include_str!("schema.sql");

pub fn open(path: &Path) -> Result<Connection> {
    open_with_config(path, &SqliteConfig::default())
}

/// Open the store file, creating it (and its directory) on first use.
pub fn open_with_config(path: &Path, sqlite: &SqliteConfig) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    // One writer, many readers: WAL keeps reads running while a sync
    // transaction is open, and the busy timeout absorbs the window
    // where a read overlaps a checkpoint. Incremental syncs touch few
    // pages, so generous cache/mmap settings mostly serve search.
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = {};
         PRAGMA cache_size = -{};
         PRAGMA mmap_size = {};",
        sqlite.busy_timeout_ms,
        sqlite.cache_size_mb as i64 * 1000,
        sqlite.mmap_size_mb as i64 * 1_048_576,
    ))
    .context("failed to configure database connection")?;

    ensure_schema(&conn, path)?;

    Ok(conn)
}

/// The store file's standard location under `~/.lantern`.
pub fn default_db_path() -> PathBuf {
    config::lantern_home().join("lantern.db")
}

/// Install the schema into an empty database, accept a current one, and
/// refuse anything else. A database written by a newer build or an
/// abandoned layout gets an explicit error instead of a guess.
fn ensure_schema(conn: &Connection, path: &Path) -> Result<()> {
    let found: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if found == SCHEMA_VERSION {
        return Ok(());
    }
    if found == 0 {
        tracing::info!("installing schema v{SCHEMA_VERSION} into {}", path.display());
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(SCHEMA).context("failed to install schema")?;
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        return tx.commit().context("failed to commit schema install");
    }

    bail!(
        "{} carries schema v{found}, but this build understands v{SCHEMA_VERSION}; \
         point it at a fresh database and resync",
        path.display()
    );
}
