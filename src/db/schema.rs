//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Message log (snowflake ids are time-ordered)
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            author_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            content TEXT NOT NULL,
            from_bot INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, id);

        -- One compaction summary per conversation
        CREATE TABLE IF NOT EXISTS compaction_cache (
            conversation_id TEXT PRIMARY KEY,
            community_id TEXT NOT NULL,
            oldest_id INTEGER NOT NULL,
            newest_id INTEGER NOT NULL,
            summary_text TEXT NOT NULL CHECK(length(summary_text) > 0),
            model_used TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK(oldest_id <= newest_id)
        );

        CREATE INDEX IF NOT EXISTS idx_compaction_cache_community ON compaction_cache(community_id, updated_at);

        -- Settings overrides; empty conversation_id is the community-wide row
        CREATE TABLE IF NOT EXISTS settings (
            community_id TEXT NOT NULL,
            conversation_id TEXT NOT NULL DEFAULT '',
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (community_id, conversation_id, key)
        );

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Append-only usage ledger
        CREATE TABLE IF NOT EXISTS usage_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            community_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cost REAL NOT NULL DEFAULT 0,
            model TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_usage_community ON usage_log(community_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_usage_conversation ON usage_log(conversation_id, created_at);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2 (usage ledger)");
    Ok(())
}
