//! Database module for the compaction cache, settings, usage ledger and message log

pub mod cache;
pub mod message;
mod schema;
pub mod settings;
pub mod usage;

use std::path::Path;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::{Error, Result};

pub use cache::{CacheEntry, CacheRepo, CacheWrite};
pub use message::MessageRepo;
pub use schema::SCHEMA_VERSION;
pub use settings::{
    ContextSettings, ResolvedSetting, ResolvedSettings, SettingDef, SettingKind, SettingSource,
    SettingValue, SettingsRepo, SettingsSpec,
};
pub use usage::{
    KNOWN_OPERATIONS, OP_CHAT, OP_COMPACTION, OperationStats, UsageEntry, UsageRepo, UsageReport,
    UsageTotals,
};

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled database connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Initialize the database
///
/// # Errors
///
/// Returns error if database cannot be opened or initialized
pub fn init<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path)
        .with_init(|conn| conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;"));
    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    // Run migrations on first connection
    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn)?;

    tracing::info!(version = SCHEMA_VERSION, "database initialized");
    Ok(pool)
}

/// Initialize an in-memory database (for testing)
///
/// # Errors
///
/// Returns error if database cannot be initialized
pub fn init_memory() -> Result<DbPool> {
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn)?;

    Ok(pool)
}

/// Check out a pooled connection
pub(crate) fn conn(pool: &DbPool) -> Result<DbConn> {
    pool.get().map_err(|e| Error::Database(e.to_string()))
}

/// Timestamp format used by every table
///
/// Fixed-width so that string comparison in SQL orders chronologically.
pub(crate) fn format_datetime(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(s: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map_or_else(|_| chrono::Utc::now(), |dt| dt.with_timezone(&chrono::Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_memory() {
        let pool = init_memory().unwrap();
        let _conn = pool.get().unwrap();
    }

    #[test]
    fn test_init_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.db");

        let pool = init(&path).unwrap();
        drop(pool);

        // Reopening an initialized database is a no-op migration
        let pool = init(&path).unwrap();
        let version: i32 = pool
            .get()
            .unwrap()
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn datetime_format_is_fixed_width() {
        let a = format_datetime(chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let b = format_datetime(chrono::DateTime::from_timestamp(1_700_000_000, 123_000).unwrap());
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }
}
