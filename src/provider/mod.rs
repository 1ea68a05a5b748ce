//! Summarization provider abstraction
//!
//! Available providers:
//! - OpenAI-compatible chat completions (`OpenAI`, `OpenRouter`, local gateways)

mod openai;

use async_trait::async_trait;

use crate::Result;

pub use openai::OpenAiSummarizer;

/// A single summarization call
#[derive(Debug, Clone, Copy)]
pub struct SummaryRequest<'a> {
    pub system_prompt: &'a str,
    pub input: &'a str,
    pub model: &'a str,
    pub max_output_tokens: u32,
}

/// Generated summary and token usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Prompt tokens served from the provider's cache, when reported
    pub cached_tokens: Option<u64>,
}

/// Chat-completion backend used to write compaction summaries
///
/// Error responses must surface as `Err`, never as partial text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce a summary of `request.input`
    async fn summarize(&self, request: &SummaryRequest<'_>) -> Result<Summary>;

    /// Provider name for logs
    fn name(&self) -> &'static str;
}
