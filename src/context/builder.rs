//! Context builder: cached summary reuse and compaction
//!
//! Every request recomputes its state from the cache row and the message
//! source:
//!
//! - no cache entry: cold path, compact the whole window if it is large enough
//! - entry with little aged-out history since it was written: reuse it
//! - entry with too much aged-out history: recompact the whole window and
//!   replace the entry
//!
//! Compaction branches for one conversation are serialized; requests for
//! different conversations never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::tokens::{
    compose, estimate_messages_tokens, estimate_tokens, fit_to_budget, format_messages,
};
use super::{HistoryMessage, MAX_COMPACTION_INPUT, MAX_CONTEXT_TOKENS, MessageSource};
use crate::db::{
    CacheEntry, CacheRepo, CacheWrite, ContextSettings, OP_COMPACTION, UsageEntry, UsageRepo,
};
use crate::provider::{Summarizer, Summary, SummaryRequest};
use crate::snowflake::Snowflake;
use crate::{Error, Result};

/// Configuration for compaction calls
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Timeout for the summarization call; expiry counts as a provider failure
    pub summarize_timeout: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            summarize_timeout: Duration::from_secs(60),
        }
    }
}

/// Which branch produced a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// No messages in the window
    Empty,
    /// Verbatim history, nothing worth compacting
    Raw,
    /// Existing summary reused
    Cached,
    /// New summary written this request
    Compacted,
    /// Summarization failed; previous summary or raw history returned
    Fallback,
}

impl ContextKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Raw => "raw",
            Self::Cached => "cached",
            Self::Compacted => "compacted",
            Self::Fallback => "fallback",
        }
    }
}

/// Context text ready for the downstream model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltContext {
    /// Summary first (if any), then the most recent raw messages
    pub text: String,
    pub kind: ContextKind,
    /// Approximate token count of `text`
    pub estimated_tokens: usize,
}

impl BuiltContext {
    fn new(text: String, kind: ContextKind) -> Self {
        let estimated_tokens = estimate_tokens(&text);
        Self {
            text,
            kind,
            estimated_tokens,
        }
    }

    const fn empty() -> Self {
        Self {
            text: String::new(),
            kind: ContextKind::Empty,
            estimated_tokens: 0,
        }
    }

    /// Whether there is no context at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Message id boundaries for one request
#[derive(Debug, Clone, Copy)]
struct Window {
    /// Exclusive lower bound of the compaction window
    compact_after: Snowflake,
    /// Messages with ids below this have aged out of the raw tail
    raw_boundary: Snowflake,
    /// Exclusive upper bound; messages sent after `now` are not visible yet
    before: Snowflake,
}

impl Window {
    fn new(now: DateTime<Utc>, settings: &ContextSettings) -> Self {
        let compact_start = now - chrono::Duration::days(settings.compact_days);
        let raw_start = now - chrono::Duration::hours(settings.raw_hours);

        Self {
            compact_after: Snowflake(Snowflake::from_datetime(compact_start).0.saturating_sub(1)),
            raw_boundary: Snowflake::from_datetime(raw_start),
            before: Snowflake::from_datetime(now + chrono::Duration::milliseconds(1)),
        }
    }

    /// Number of leading messages older than the raw window
    fn aged_out(&self, messages: &[HistoryMessage]) -> usize {
        messages.partition_point(|m| m.id < self.raw_boundary)
    }
}

/// A cache entry that needs replacing, with the messages written since it
struct Stale {
    entry: CacheEntry,
    tail: Vec<HistoryMessage>,
    overflow_tokens: usize,
}

enum Warm {
    Fresh(BuiltContext),
    Stale(Stale),
}

/// Per-conversation compaction locks
///
/// Entries are weak so a conversation's lock lives only while some request
/// holds or waits on it.
#[derive(Default)]
struct ConversationLocks {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    fn get(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(lock) = locks.get(conversation_id).and_then(Weak::upgrade) {
            return lock;
        }

        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(conversation_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn summary_prompt(target_tokens: usize) -> String {
    format!(
        "You compress chat history into a briefing for an assistant that will continue \
         the conversation. Each line of the transcript is `name (user id): message`; lines \
         starting with [BOT] are the assistant's own earlier replies.\n\n\
         Write a factual summary in plain prose of at most {target_tokens} tokens. Keep who \
         said what, decisions, commitments, open questions and anything people asked the \
         assistant to remember. Refer to people by display name. Leave out greetings and \
         small talk. Do not add commentary or a preamble."
    )
}

/// Builds token-bounded conversation context, compacting older history on demand
pub struct ContextBuilder {
    source: Arc<dyn MessageSource>,
    summarizer: Arc<dyn Summarizer>,
    cache: CacheRepo,
    usage: UsageRepo,
    config: CompactionConfig,
    locks: ConversationLocks,
}

impl ContextBuilder {
    /// Create a new context builder
    #[must_use]
    pub fn new(
        source: Arc<dyn MessageSource>,
        summarizer: Arc<dyn Summarizer>,
        cache: CacheRepo,
        usage: UsageRepo,
    ) -> Self {
        Self {
            source,
            summarizer,
            cache,
            usage,
            config: CompactionConfig::default(),
            locks: ConversationLocks::default(),
        }
    }

    /// Replace the compaction configuration
    #[must_use]
    pub fn with_config(mut self, config: CompactionConfig) -> Self {
        self.config = config;
        self
    }

    /// Build context for a conversation as of now
    ///
    /// # Errors
    ///
    /// Returns error if the message source or a store fails. Summarization
    /// failures never surface here; they degrade to a less compacted context.
    pub async fn build(
        &self,
        conversation_id: &str,
        community_id: &str,
        settings: &ContextSettings,
    ) -> Result<BuiltContext> {
        self.build_at(conversation_id, community_id, settings, Utc::now())
            .await
    }

    /// Build context for a conversation as of `now`
    ///
    /// # Errors
    ///
    /// Returns error if the message source or a store fails
    pub async fn build_at(
        &self,
        conversation_id: &str,
        community_id: &str,
        settings: &ContextSettings,
        now: DateTime<Utc>,
    ) -> Result<BuiltContext> {
        let window = Window::new(now, settings);

        if let Some(entry) = self.cache.get(conversation_id)? {
            if let Warm::Fresh(context) = self
                .check_warm(conversation_id, entry, &window, settings)
                .await?
            {
                return Ok(context);
            }
        }

        let lock = self.locks.get(conversation_id);
        let _guard = lock.lock().await;

        // Another request may have compacted while we waited
        let stale = match self.cache.get(conversation_id)? {
            Some(entry) => match self
                .check_warm(conversation_id, entry, &window, settings)
                .await?
            {
                Warm::Fresh(context) => return Ok(context),
                Warm::Stale(stale) => Some(stale),
            },
            None => None,
        };

        if let Some(stale) = &stale {
            tracing::info!(
                conversation = conversation_id,
                overflow_tokens = stale.overflow_tokens,
                threshold = settings.recompact_raw_tokens,
                "recompaction triggered"
            );
        }

        self.compact(conversation_id, community_id, settings, &window, stale)
            .await
    }

    /// Classify an existing entry by the aged-out history written since it
    async fn check_warm(
        &self,
        conversation_id: &str,
        entry: CacheEntry,
        window: &Window,
        settings: &ContextSettings,
    ) -> Result<Warm> {
        let tail = self
            .source
            .fetch(conversation_id, entry.newest_id, Some(window.before))
            .await?;

        // Measured before trimming so the raw budget cannot hide aged-out messages
        let overflow_tokens = estimate_messages_tokens(&tail[..window.aged_out(&tail)]);

        if overflow_tokens > settings.recompact_raw_tokens {
            return Ok(Warm::Stale(Stale {
                entry,
                tail,
                overflow_tokens,
            }));
        }

        let raw = fit_to_budget(&tail, settings.raw_max_tokens);
        tracing::debug!(
            conversation = conversation_id,
            summary_tokens = entry.token_count,
            raw_messages = raw.len(),
            overflow_tokens,
            "reusing cached summary"
        );

        Ok(Warm::Fresh(BuiltContext::new(
            compose(Some(&entry.summary_text), raw),
            ContextKind::Cached,
        )))
    }

    /// Compact the whole window, replacing `stale` on success
    async fn compact(
        &self,
        conversation_id: &str,
        community_id: &str,
        settings: &ContextSettings,
        window: &Window,
        stale: Option<Stale>,
    ) -> Result<BuiltContext> {
        let history = self
            .source
            .fetch(conversation_id, window.compact_after, Some(window.before))
            .await?;

        if history.is_empty() {
            return Ok(stale.map_or_else(BuiltContext::empty, |stale| {
                reuse(&stale, settings, ContextKind::Cached)
            }));
        }

        if estimate_messages_tokens(&history) <= settings.compact_max_tokens {
            return Ok(raw(&history, ContextKind::Raw));
        }

        let split = window.aged_out(&history);
        let (older, recent) = history.split_at(split);
        if older.is_empty() {
            return Ok(raw(&history, ContextKind::Raw));
        }

        // Keep the newest part of an oversized backlog
        let older = fit_to_budget(older, MAX_COMPACTION_INPUT);
        let older_tokens = estimate_messages_tokens(older);
        if older_tokens < settings.compact_max_tokens {
            return Ok(raw(&history, ContextKind::Raw));
        }

        let (Some(first), Some(last)) = (older.first(), older.last()) else {
            return Ok(raw(&history, ContextKind::Raw));
        };
        let (oldest_id, newest_id) = (first.id, last.id);

        match self.summarize(older, settings).await {
            Ok(summary) => {
                let entry = self.cache.set(&CacheWrite {
                    conversation_id,
                    community_id,
                    oldest_id,
                    newest_id,
                    summary_text: &summary.text,
                    model: &settings.compact_model,
                    token_count: None,
                })?;

                let cost = self.usage.log_usage(&UsageEntry {
                    conversation_id,
                    community_id,
                    operation: OP_COMPACTION,
                    input_tokens: summary.input_tokens,
                    output_tokens: summary.output_tokens,
                    cost: None,
                    model: &settings.compact_model,
                })?;

                tracing::info!(
                    conversation = conversation_id,
                    messages = older.len(),
                    input_tokens = older_tokens,
                    summary_tokens = entry.token_count,
                    cached_tokens = ?summary.cached_tokens,
                    cost,
                    model = %settings.compact_model,
                    "compaction complete"
                );

                let recent = fit_to_budget(recent, settings.raw_max_tokens);
                Ok(BuiltContext::new(
                    compose(Some(&entry.summary_text), recent),
                    ContextKind::Compacted,
                ))
            }
            Err(e) => {
                tracing::warn!(
                    conversation = conversation_id,
                    error = %e,
                    kept_previous = stale.is_some(),
                    "compaction failed, falling back"
                );

                Ok(match &stale {
                    Some(stale) => reuse(stale, settings, ContextKind::Fallback),
                    None => raw(&history, ContextKind::Fallback),
                })
            }
        }
    }

    async fn summarize(
        &self,
        messages: &[HistoryMessage],
        settings: &ContextSettings,
    ) -> Result<Summary> {
        let system_prompt = summary_prompt(settings.compact_max_tokens);
        let input = format_messages(messages);
        let request = SummaryRequest {
            system_prompt: &system_prompt,
            input: &input,
            model: &settings.compact_model,
            max_output_tokens: u32::try_from(settings.compact_max_tokens).unwrap_or(u32::MAX),
        };

        tracing::debug!(
            provider = self.summarizer.name(),
            model = %settings.compact_model,
            messages = messages.len(),
            "requesting compaction summary"
        );

        let summary = tokio::time::timeout(
            self.config.summarize_timeout,
            self.summarizer.summarize(&request),
        )
        .await
        .map_err(|_| {
            Error::Provider(format!(
                "summarization timed out after {}s",
                self.config.summarize_timeout.as_secs_f32()
            ))
        })??;

        if summary.text.trim().is_empty() {
            return Err(Error::Provider("summarizer returned empty text".to_string()));
        }

        Ok(summary)
    }
}

/// Previous summary followed by the tail written since it
fn reuse(stale: &Stale, settings: &ContextSettings, kind: ContextKind) -> BuiltContext {
    let tail = fit_to_budget(&stale.tail, settings.raw_max_tokens);
    BuiltContext::new(compose(Some(&stale.entry.summary_text), tail), kind)
}

/// Uncompacted history in order, trimmed from the oldest end
fn raw(history: &[HistoryMessage], kind: ContextKind) -> BuiltContext {
    BuiltContext::new(
        format_messages(fit_to_budget(history, MAX_CONTEXT_TOKENS)),
        kind,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_boundaries() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let settings = ContextSettings {
            compact_days: 2,
            raw_hours: 3,
            ..ContextSettings::default()
        };
        let window = Window::new(now, &settings);

        let two_days_ago = Utc.with_ymd_and_hms(2025, 3, 8, 12, 0, 0).unwrap();
        assert_eq!(
            window.compact_after,
            Snowflake(Snowflake::from_datetime(two_days_ago).0 - 1)
        );
        assert_eq!(
            window.raw_boundary.timestamp(),
            Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap()
        );

        // Anything sent within the current millisecond is still visible
        assert!(window.before > Snowflake(Snowflake::from_datetime(now).0 | 0x3f_ffff));
        assert_eq!(window.before.timestamp(), now + chrono::Duration::milliseconds(1));
    }

    #[test]
    fn test_aged_out_counts_leading_old_messages() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let window = Window::new(now, &ContextSettings::default());
        let at = |hours_ago: i64| HistoryMessage {
            id: Snowflake::from_datetime(now - chrono::Duration::hours(hours_ago)),
            author_id: "1".to_string(),
            display_name: "Ada".to_string(),
            text: "hi".to_string(),
            from_bot: false,
        };

        let messages = [at(30), at(7), at(5), at(1)];
        assert_eq!(window.aged_out(&messages), 2);
        assert_eq!(window.aged_out(&[]), 0);
    }

    #[tokio::test]
    async fn test_locks_shared_per_conversation() {
        let locks = ConversationLocks::default();

        let a1 = locks.get("a");
        let a2 = locks.get("a");
        let b = locks.get("b");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));

        let _held = a1.lock().await;
        assert!(a2.try_lock().is_err());
        assert!(b.try_lock().is_ok());
    }

    #[test]
    fn test_locks_released_when_unused() {
        let locks = ConversationLocks::default();
        drop(locks.get("a"));
        drop(locks.get("b"));
        let _c = locks.get("c");
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_summary_prompt_mentions_target() {
        let prompt = summary_prompt(1200);
        assert!(prompt.contains("1200 tokens"));
        assert!(prompt.contains("[BOT]"));
    }

    #[test]
    fn test_context_kind_names() {
        assert_eq!(ContextKind::Compacted.as_str(), "compacted");
        assert!(BuiltContext::empty().is_empty());
    }
}
