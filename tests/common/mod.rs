//! Shared test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_context::context::{CompactionConfig, estimate_tokens};
use beacon_context::db::{CacheRepo, MessageRepo, UsageRepo};
use beacon_context::{
    ContextBuilder, DbPool, Error, HistoryMessage, PriceTable, Result, Snowflake, Summarizer,
    Summary, SummaryRequest, db,
};
use chrono::{DateTime, Duration as TimeDelta, TimeZone, Utc};

pub const CONVERSATION: &str = "channel-1";
pub const COMMUNITY: &str = "guild-1";

/// Fixed clock for deterministic windows
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// What the mock summarizer does when called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Reply with `summary #<call number>`
    Reply,
    /// Fail like a 5xx response
    Fail,
    /// Never answer
    Stall,
}

/// Scripted summarizer recording every call
pub struct MockSummarizer {
    behavior: Mutex<Behavior>,
    delay: Duration,
    calls: AtomicUsize,
    inputs: Mutex<Vec<String>>,
}

impl MockSummarizer {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Answer only after `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(&self, request: &SummaryRequest<'_>) -> Result<Summary> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.inputs.lock().unwrap().push(request.input.to_string());
        let behavior = *self.behavior.lock().unwrap();

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match behavior {
            Behavior::Reply => {
                let text = format!("summary #{call}");
                Ok(Summary {
                    input_tokens: estimate_tokens(request.input) as u64,
                    output_tokens: estimate_tokens(&text) as u64,
                    cached_tokens: None,
                    text,
                })
            }
            Behavior::Fail => Err(Error::Provider(
                "API error: 503 Service Unavailable".to_string(),
            )),
            Behavior::Stall => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(Error::Provider("unreachable".to_string()))
            }
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Builder wired to an in-memory store and a mock summarizer
pub struct Harness {
    pub pool: DbPool,
    pub messages: MessageRepo,
    pub cache: CacheRepo,
    pub usage: UsageRepo,
    pub summarizer: Arc<MockSummarizer>,
    pub builder: ContextBuilder,
}

impl Harness {
    pub fn new(summarizer: MockSummarizer) -> Self {
        Self::with_config(summarizer, CompactionConfig::default())
    }

    pub fn with_config(summarizer: MockSummarizer, config: CompactionConfig) -> Self {
        let pool = setup_test_db();
        let messages = MessageRepo::new(pool.clone());
        let cache = CacheRepo::new(pool.clone());
        let usage = UsageRepo::new(pool.clone(), Arc::new(PriceTable::default()));
        let summarizer = Arc::new(summarizer);

        let builder = ContextBuilder::new(
            Arc::new(messages.clone()),
            summarizer.clone(),
            cache.clone(),
            usage.clone(),
        )
        .with_config(config);

        Self {
            pool,
            messages,
            cache,
            usage,
            summarizer,
            builder,
        }
    }

    /// Store messages in the default conversation
    pub fn record(&self, messages: &[HistoryMessage]) {
        for message in messages {
            self.messages
                .record(CONVERSATION, message)
                .expect("failed to record message");
        }
    }
}

/// A message sent `minutes_ago` before `at`, formatted as exactly `11 + text_len` bytes
///
/// The text starts with `m<index>` so each message is recognizable in output.
pub fn message(
    at: DateTime<Utc>,
    minutes_ago: i64,
    index: usize,
    text_len: usize,
) -> HistoryMessage {
    let sent = at - TimeDelta::minutes(minutes_ago);
    let tag = format!("m{index:03} ");
    let text = format!("{tag}{}", "x".repeat(text_len.saturating_sub(tag.len())));

    HistoryMessage {
        // Low bits keep ids unique within a millisecond
        id: Snowflake(Snowflake::from_datetime(sent).0 + index as u64),
        author_id: "100".to_string(),
        display_name: "Ada".to_string(),
        text,
        from_bot: false,
    }
}

/// `count` messages ending `newest_minutes_ago` before `at`, `spacing` minutes apart
pub fn messages(
    at: DateTime<Utc>,
    first_index: usize,
    count: usize,
    newest_minutes_ago: i64,
    spacing: i64,
    text_len: usize,
) -> Vec<HistoryMessage> {
    (0..count)
        .map(|i| {
            let minutes_ago = newest_minutes_ago + spacing * (count - 1 - i) as i64;
            message(at, minutes_ago, first_index + i, text_len)
        })
        .collect()
}
