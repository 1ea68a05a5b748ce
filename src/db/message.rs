//! Message log repository
//!
//! Backs the [`MessageSource`] contract with the local `messages` table. The
//! chat transport records messages here as they arrive; the context builder
//! only ever reads through the trait.

use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};

use super::DbPool;
use crate::context::{HistoryMessage, MessageSource};
use crate::snowflake::Snowflake;
use crate::Result;

/// Message log repository
#[derive(Clone)]
pub struct MessageRepo {
    pool: DbPool,
}

impl MessageRepo {
    /// Create a new message repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record a message in a conversation
    ///
    /// Re-recording an id replaces the stored row (edits arrive this way).
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn record(&self, conversation_id: &str, message: &HistoryMessage) -> Result<()> {
        let conn = super::conn(&self.pool)?;

        conn.execute(
            "INSERT INTO messages (id, conversation_id, author_id, display_name, content, from_bot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                author_id = excluded.author_id,
                display_name = excluded.display_name,
                content = excluded.content,
                from_bot = excluded.from_bot",
            params![
                message.id.to_sql(),
                conversation_id,
                message.author_id,
                message.display_name,
                message.text,
                message.from_bot,
            ],
        )?;

        Ok(())
    }

    /// Messages strictly between `after` and `before` (open-ended when `before` is `None`),
    /// oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn range(
        &self,
        conversation_id: &str,
        after: Snowflake,
        before: Option<Snowflake>,
    ) -> Result<Vec<HistoryMessage>> {
        let conn = super::conn(&self.pool)?;

        let mut stmt = conn.prepare(
            "SELECT id, author_id, display_name, content, from_bot
             FROM messages
             WHERE conversation_id = ?1 AND id > ?2 AND (?3 IS NULL OR id < ?3)
             ORDER BY id ASC",
        )?;

        let messages = stmt
            .query_map(
                params![conversation_id, after.to_sql(), before.map(Snowflake::to_sql)],
                |row| {
                    Ok(HistoryMessage {
                        id: Snowflake::from_sql(row.get(0)?),
                        author_id: row.get(1)?,
                        display_name: row.get(2)?,
                        text: row.get(3)?,
                        from_bot: row.get(4)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(messages)
    }

    /// Count messages in a conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count(&self, conversation_id: &str) -> Result<usize> {
        let conn = super::conn(&self.pool)?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Newest message id in a conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn newest_id(&self, conversation_id: &str) -> Result<Option<Snowflake>> {
        let conn = super::conn(&self.pool)?;

        let id: Option<Option<i64>> = conn
            .query_row(
                "SELECT MAX(id) FROM messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(id.flatten().map(Snowflake::from_sql))
    }
}

#[async_trait]
impl MessageSource for MessageRepo {
    async fn fetch(
        &self,
        conversation_id: &str,
        after: Snowflake,
        before: Option<Snowflake>,
    ) -> Result<Vec<HistoryMessage>> {
        self.range(conversation_id, after, before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn msg(id: u64, text: &str) -> HistoryMessage {
        HistoryMessage {
            id: Snowflake(id),
            author_id: "u1".to_string(),
            display_name: "Ada".to_string(),
            text: text.to_string(),
            from_bot: false,
        }
    }

    #[test]
    fn test_record_and_range() {
        let repo = MessageRepo::new(init_memory().unwrap());

        // Recorded out of order, returned by id
        repo.record("chan", &msg(30, "third")).unwrap();
        repo.record("chan", &msg(10, "first")).unwrap();
        repo.record("chan", &msg(20, "second")).unwrap();
        repo.record("other", &msg(15, "elsewhere")).unwrap();

        let all = repo.range("chan", Snowflake::MIN, None).unwrap();
        let texts: Vec<_> = all.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["first", "second", "third"]);
    }

    #[test]
    fn test_range_bounds_are_exclusive() {
        let repo = MessageRepo::new(init_memory().unwrap());
        for id in [10, 20, 30, 40] {
            repo.record("chan", &msg(id, "x")).unwrap();
        }

        let ids: Vec<_> = repo
            .range("chan", Snowflake(10), Some(Snowflake(40)))
            .unwrap()
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, [20, 30]);
    }

    #[test]
    fn test_record_replaces_edited_message() {
        let repo = MessageRepo::new(init_memory().unwrap());
        repo.record("chan", &msg(10, "typo")).unwrap();
        repo.record("chan", &msg(10, "fixed")).unwrap();

        assert_eq!(repo.count("chan").unwrap(), 1);
        assert_eq!(repo.range("chan", Snowflake::MIN, None).unwrap()[0].text, "fixed");
    }

    #[test]
    fn test_newest_id() {
        let repo = MessageRepo::new(init_memory().unwrap());
        assert_eq!(repo.newest_id("chan").unwrap(), None);

        repo.record("chan", &msg(10, "a")).unwrap();
        repo.record("chan", &msg(99, "b")).unwrap();
        assert_eq!(repo.newest_id("chan").unwrap(), Some(Snowflake(99)));
    }

    #[test]
    fn test_fetch_through_trait() {
        let repo = MessageRepo::new(init_memory().unwrap());
        repo.record("chan", &msg(10, "hello")).unwrap();

        let source: &dyn MessageSource = &repo;
        let fetched =
            tokio_test::block_on(source.fetch("chan", Snowflake::MIN, None)).unwrap();
        assert_eq!(fetched.len(), 1);
    }
}
