//! Beacon Context - Conversation context compaction for AI assistants
//!
//! This library builds token-bounded conversation context for a chat
//! assistant:
//! - Cached compaction summaries of older history, recomputed lazily
//! - A verbatim tail of the most recent messages
//! - Per-conversation and per-community settings with fallback
//! - A usage ledger for summarization calls
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Context Builder                     │
//! │   cold path  │  warm reuse  │  recompaction  │ lock  │
//! └───────┬──────────────┬──────────────────┬───────────┘
//!         │              │                  │
//! ┌───────▼──────┐ ┌─────▼─────────┐ ┌──────▼──────────┐
//! │ MessageSource│ │  SQLite store │ │   Summarizer    │
//! │ (message log)│ │ cache/settings│ │ (chat endpoint) │
//! │              │ │ usage         │ │                 │
//! └──────────────┘ └───────────────┘ └─────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod pricing;
pub mod provider;
pub mod snowflake;

pub use config::Config;
pub use context::{BuiltContext, ContextBuilder, ContextKind, HistoryMessage, MessageSource};
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use pricing::{ModelPrice, PriceTable};
pub use provider::{OpenAiSummarizer, Summarizer, Summary, SummaryRequest};
pub use snowflake::Snowflake;
