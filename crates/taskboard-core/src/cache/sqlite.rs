//! `SQLite`-backed persistent cache.
//!
//! Runtime defaults mirror a single-writer client store:
//! - `journal_mode = WAL` so a second reader (another window) never blocks
//! - `busy_timeout = 5s` to ride out transient lock contention
//! - schema versioned through `PRAGMA user_version`

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params, types::Type};

use super::{PersistentCache, RawEntry};
use crate::error::SyncError;

/// Busy timeout used for cache DB connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 1;

const MIGRATION_V1_SQL: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_key TEXT PRIMARY KEY NOT NULL,
    data TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL
);
";

const MIGRATIONS: &[(u32, &str)] = &[(1, MIGRATION_V1_SQL)];

/// Durable cache stored in a single `SQLite` file.
#[derive(Debug)]
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Open (or create) the cache database, apply pragmas, and migrate.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create cache db directory {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("open cache database {}", path.display()))?;

        configure_connection(&conn).context("configure sqlite pragmas")?;
        migrate(&mut conn).context("apply cache migrations")?;

        tracing::debug!(path = %path.display(), "opened persistent cache");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a throwaway in-memory database with the same schema.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("open in-memory cache")?;
        migrate(&mut conn).context("apply cache migrations")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

/// Read `PRAGMA user_version` as a `u32`.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Apply all pending migrations in ascending order.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let mut current = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.commit()?;
        current = *version;
    }

    Ok(current)
}

fn storage_error(e: &rusqlite::Error) -> SyncError {
    SyncError::Storage(e.to_string())
}

impl PersistentCache for SqliteCache {
    fn get_raw(&self, key: &str) -> Result<Option<RawEntry>, SyncError> {
        self.conn
            .lock()
            .query_row(
                "SELECT data, timestamp_ms FROM cache_entries WHERE cache_key = ?1",
                params![key],
                |row| {
                    Ok(RawEntry {
                        data: row.get(0)?,
                        timestamp: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(|e| storage_error(&e))
    }

    fn set_raw(&self, key: &str, entry: RawEntry) -> Result<(), SyncError> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO cache_entries (cache_key, data, timestamp_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(cache_key) DO UPDATE SET
                     data = excluded.data,
                     timestamp_ms = excluded.timestamp_ms",
                params![key, entry.data, entry.timestamp],
            )
            .map(|_| ())
            .map_err(|e| storage_error(&e))
    }

    fn evict(&self, key: &str) -> Result<bool, SyncError> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM cache_entries WHERE cache_key = ?1",
                params![key],
            )
            .map(|n| n > 0)
            .map_err(|e| storage_error(&e))
    }

    fn keys(&self) -> Result<Vec<String>, SyncError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT cache_key FROM cache_entries ORDER BY cache_key")
            .map_err(|e| storage_error(&e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| storage_error(&e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| storage_error(&e))
    }
}
