//! Compaction cache repository
//!
//! One row per conversation holding the summary of an inclusive range of
//! messages. Rows are only ever replaced wholesale.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::DbPool;
use crate::context::estimate_tokens;
use crate::snowflake::Snowflake;
use crate::{Error, Result};

/// A cached compaction summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub conversation_id: String,
    pub community_id: String,
    /// First message folded into the summary
    pub oldest_id: Snowflake,
    /// Last message folded into the summary
    pub newest_id: Snowflake,
    pub summary_text: String,
    pub model_used: String,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values for replacing a conversation's cache entry
#[derive(Debug, Clone)]
pub struct CacheWrite<'a> {
    pub conversation_id: &'a str,
    pub community_id: &'a str,
    pub oldest_id: Snowflake,
    pub newest_id: Snowflake,
    pub summary_text: &'a str,
    pub model: &'a str,
    /// Estimated from `summary_text` when `None`
    pub token_count: Option<usize>,
}

const ENTRY_COLUMNS: &str = "conversation_id, community_id, oldest_id, newest_id, summary_text,
     model_used, token_count, created_at, updated_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        conversation_id: row.get(0)?,
        community_id: row.get(1)?,
        oldest_id: Snowflake::from_sql(row.get(2)?),
        newest_id: Snowflake::from_sql(row.get(3)?),
        summary_text: row.get(4)?,
        model_used: row.get(5)?,
        token_count: usize::try_from(row.get::<_, i64>(6)?).unwrap_or(0),
        created_at: super::parse_datetime(&row.get::<_, String>(7)?),
        updated_at: super::parse_datetime(&row.get::<_, String>(8)?),
    })
}

/// Compaction cache repository
#[derive(Clone)]
pub struct CacheRepo {
    pool: DbPool,
}

impl CacheRepo {
    /// Create a new cache repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the cache entry for a conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, conversation_id: &str) -> Result<Option<CacheEntry>> {
        let conn = super::conn(&self.pool)?;

        let entry = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM compaction_cache WHERE conversation_id = ?1"),
                [conversation_id],
                entry_from_row,
            )
            .optional()?;

        Ok(entry)
    }

    /// Replace the cache entry for a conversation
    ///
    /// Every field is overwritten except `created_at`, which records when the
    /// conversation was first compacted.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for an empty summary or inverted range, or
    /// error if database operation fails
    pub fn set(&self, write: &CacheWrite<'_>) -> Result<CacheEntry> {
        if write.summary_text.trim().is_empty() {
            return Err(Error::Validation("cache summary must not be empty".to_string()));
        }
        if write.oldest_id > write.newest_id {
            return Err(Error::Validation(format!(
                "cache range is inverted ({} > {})",
                write.oldest_id, write.newest_id
            )));
        }

        let token_count = write
            .token_count
            .unwrap_or_else(|| estimate_tokens(write.summary_text));
        let now = super::format_datetime(Utc::now());

        let conn = super::conn(&self.pool)?;
        let entry = conn.query_row(
            &format!(
                "INSERT INTO compaction_cache
                    (conversation_id, community_id, oldest_id, newest_id, summary_text,
                     model_used, token_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    community_id = excluded.community_id,
                    oldest_id = excluded.oldest_id,
                    newest_id = excluded.newest_id,
                    summary_text = excluded.summary_text,
                    model_used = excluded.model_used,
                    token_count = excluded.token_count,
                    updated_at = excluded.updated_at
                 RETURNING {ENTRY_COLUMNS}"
            ),
            params![
                write.conversation_id,
                write.community_id,
                write.oldest_id.to_sql(),
                write.newest_id.to_sql(),
                write.summary_text,
                write.model,
                i64::try_from(token_count).unwrap_or(i64::MAX),
                now,
            ],
            entry_from_row,
        )?;

        tracing::debug!(
            conversation = write.conversation_id,
            oldest = %write.oldest_id,
            newest = %write.newest_id,
            tokens = token_count,
            "compaction cache written"
        );

        Ok(entry)
    }

    /// Delete a conversation's cache entry
    ///
    /// Returns whether an entry existed.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn delete(&self, conversation_id: &str) -> Result<bool> {
        let conn = super::conn(&self.pool)?;
        let removed = conn.execute(
            "DELETE FROM compaction_cache WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        Ok(removed > 0)
    }

    /// Delete every cache entry in a community
    ///
    /// Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn delete_all(&self, community_id: &str) -> Result<usize> {
        let conn = super::conn(&self.pool)?;
        let removed = conn.execute(
            "DELETE FROM compaction_cache WHERE community_id = ?1",
            [community_id],
        )?;

        tracing::info!(community = community_id, removed, "compaction cache cleared");
        Ok(removed)
    }

    /// All entries in a community, most recently updated first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self, community_id: &str) -> Result<Vec<CacheEntry>> {
        let conn = super::conn(&self.pool)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM compaction_cache
             WHERE community_id = ?1
             ORDER BY updated_at DESC, conversation_id ASC"
        ))?;

        let entries = stmt
            .query_map([community_id], entry_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn write<'a>(
        conversation: &'a str,
        community: &'a str,
        range: (u64, u64),
        summary: &'a str,
    ) -> CacheWrite<'a> {
        CacheWrite {
            conversation_id: conversation,
            community_id: community,
            oldest_id: Snowflake(range.0),
            newest_id: Snowflake(range.1),
            summary_text: summary,
            model: "gpt-4o-mini",
            token_count: None,
        }
    }

    #[test]
    fn test_set_and_get() {
        let repo = CacheRepo::new(init_memory().unwrap());
        assert!(repo.get("chan").unwrap().is_none());

        let written = repo.set(&write("chan", "guild", (10, 20), "a short summary")).unwrap();
        assert_eq!(written.token_count, estimate_tokens("a short summary"));

        let entry = repo.get("chan").unwrap().unwrap();
        assert_eq!(entry, written);
        assert_eq!(entry.oldest_id, Snowflake(10));
        assert_eq!(entry.newest_id, Snowflake(20));
        assert_eq!(entry.model_used, "gpt-4o-mini");
    }

    #[test]
    fn test_explicit_token_count_kept() {
        let repo = CacheRepo::new(init_memory().unwrap());
        let entry = repo
            .set(&CacheWrite {
                token_count: Some(321),
                ..write("chan", "guild", (1, 2), "summary")
            })
            .unwrap();
        assert_eq!(entry.token_count, 321);
    }

    #[test]
    fn test_set_replaces_wholesale() {
        let repo = CacheRepo::new(init_memory().unwrap());
        let first = repo.set(&write("chan", "guild", (10, 20), "old summary")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = repo.set(&write("chan", "guild", (30, 40), "new summary")).unwrap();

        let entry = repo.get("chan").unwrap().unwrap();
        assert_eq!(entry, second);
        assert_eq!(entry.oldest_id, Snowflake(30));
        assert_eq!(entry.summary_text, "new summary");
        assert_eq!(entry.created_at, first.created_at);
        assert!(entry.updated_at > first.updated_at);
    }

    #[test]
    fn test_rejects_invalid_entries() {
        let repo = CacheRepo::new(init_memory().unwrap());

        let err = repo.set(&write("chan", "guild", (1, 2), "  ")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = repo.set(&write("chan", "guild", (5, 2), "summary")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert!(repo.get("chan").unwrap().is_none());
    }

    #[test]
    fn test_list_most_recent_first() {
        let repo = CacheRepo::new(init_memory().unwrap());
        repo.set(&write("a", "guild", (1, 2), "a")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        repo.set(&write("b", "guild", (1, 2), "b")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        repo.set(&write("x", "other", (1, 2), "x")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        repo.set(&write("a", "guild", (3, 4), "a again")).unwrap();

        let ids: Vec<_> = repo
            .list("guild")
            .unwrap()
            .into_iter()
            .map(|e| e.conversation_id)
            .collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn test_delete_and_delete_all() {
        let repo = CacheRepo::new(init_memory().unwrap());
        repo.set(&write("a", "guild", (1, 2), "a")).unwrap();
        repo.set(&write("b", "guild", (1, 2), "b")).unwrap();
        repo.set(&write("x", "other", (1, 2), "x")).unwrap();

        assert!(repo.delete("a").unwrap());
        assert!(!repo.delete("a").unwrap());

        assert_eq!(repo.delete_all("guild").unwrap(), 1);
        assert!(repo.get("b").unwrap().is_none());
        assert!(repo.get("x").unwrap().is_some());
    }
}
