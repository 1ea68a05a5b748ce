//! Context building for conversation history
//!
//! Combines:
//! - A cached compaction summary of older history
//! - A verbatim tail of the most recent messages
//!
//! Token sizes are estimated with a crude byte heuristic; see [`estimate_tokens`].

mod builder;
mod source;
mod tokens;

pub use builder::{BuiltContext, CompactionConfig, ContextBuilder, ContextKind};
pub use source::{HistoryMessage, MessageSource};
pub use tokens::{
    ANNOTATION_PREFIX, BOT_MARKER, SUMMARY_HEADER, compose, estimate_messages_tokens,
    estimate_tokens, fit_to_budget, format_message, format_messages, strip_annotations,
    within_budget,
};

/// Upper bound on a fully raw context
pub const MAX_CONTEXT_TOKENS: usize = 16_000;

/// Upper bound on transcript sent to the summarizer in one call
pub const MAX_COMPACTION_INPUT: usize = 60_000;
