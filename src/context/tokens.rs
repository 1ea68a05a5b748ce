//! Token estimation, message formatting and budget trimming

use std::borrow::Cow;

use super::source::HistoryMessage;

/// Prefix placed before a reused or freshly produced summary
pub const SUMMARY_HEADER: &str = "[Conversation summary]";

/// Marker prepended to the assistant's own turns
pub const BOT_MARKER: &str = "[BOT]";

/// Lines of assistant output starting with this are diagnostics (token counts,
/// model footers) and never reach a prompt
pub const ANNOTATION_PREFIX: &str = "-# ";

/// Rough token estimation (4 bytes per token on average)
///
/// Crude on purpose: it undercounts code, URLs and non-English text, which
/// [`fit_to_budget`] compensates for with a safety margin.
#[must_use]
pub const fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Whether `tokens`, inflated by the 1.2x safety margin, fits in `budget`
#[must_use]
pub const fn within_budget(tokens: usize, budget: usize) -> bool {
    // tokens * 1.2 <= budget, kept in integers
    tokens.saturating_mul(6) <= budget.saturating_mul(5)
}

/// Drop diagnostic annotation lines from assistant output
#[must_use]
pub fn strip_annotations(text: &str) -> Cow<'_, str> {
    if !text
        .lines()
        .any(|line| line.trim_start().starts_with(ANNOTATION_PREFIX))
    {
        return Cow::Borrowed(text);
    }

    Cow::Owned(
        text.lines()
            .filter(|line| !line.trim_start().starts_with(ANNOTATION_PREFIX))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

fn visible_text(message: &HistoryMessage) -> Cow<'_, str> {
    if message.from_bot {
        strip_annotations(&message.text)
    } else {
        Cow::Borrowed(message.text.as_str())
    }
}

/// Render one message as a transcript line
#[must_use]
pub fn format_message(message: &HistoryMessage) -> String {
    let text = visible_text(message);
    if message.from_bot {
        format!(
            "{BOT_MARKER} {} ({}): {text}",
            message.display_name, message.author_id
        )
    } else {
        format!("{} ({}): {text}", message.display_name, message.author_id)
    }
}

/// Byte length of [`format_message`] without building the line
fn formatted_len(message: &HistoryMessage) -> usize {
    let marker = if message.from_bot {
        BOT_MARKER.len() + 1
    } else {
        0
    };
    // "{name} ({author}): {text}"
    marker
        + message.display_name.len()
        + 2
        + message.author_id.len()
        + 3
        + visible_text(message).len()
}

/// Render messages as a newline-separated transcript
#[must_use]
pub fn format_messages(messages: &[HistoryMessage]) -> String {
    messages
        .iter()
        .map(format_message)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Estimated tokens of the formatted transcript
#[must_use]
pub fn estimate_messages_tokens(messages: &[HistoryMessage]) -> usize {
    let bytes: usize = messages.iter().map(formatted_len).sum();
    estimate_tokens_from_len(bytes + messages.len().saturating_sub(1))
}

const fn estimate_tokens_from_len(len: usize) -> usize {
    len / 4
}

/// Longest suffix of `messages` whose transcript fits `budget` with the safety margin
///
/// Returns `messages` itself when it already fits. Otherwise binary-searches the
/// first index to keep; dropping older messages only ever shrinks the transcript,
/// so the predicate is monotone. The result is empty when even the newest
/// message alone is over budget.
#[must_use]
pub fn fit_to_budget(messages: &[HistoryMessage], budget: usize) -> &[HistoryMessage] {
    if within_budget(estimate_messages_tokens(messages), budget) {
        return messages;
    }

    // suffix_len[i] = transcript length of messages[i..]
    let mut suffix_len = vec![0usize; messages.len() + 1];
    for (i, message) in messages.iter().enumerate().rev() {
        let separator = usize::from(i + 1 < messages.len());
        suffix_len[i] = formatted_len(message) + separator + suffix_len[i + 1];
    }

    let fits = |len: usize| within_budget(estimate_tokens_from_len(len), budget);
    let first_kept = suffix_len.partition_point(|&len| !fits(len));
    &messages[first_kept..]
}

/// Assemble final context text: summary first, then the raw tail
#[must_use]
pub fn compose(summary: Option<&str>, raw: &[HistoryMessage]) -> String {
    let transcript = format_messages(raw);
    match summary {
        Some(summary) if transcript.is_empty() => format!("{SUMMARY_HEADER} {summary}"),
        Some(summary) => format!("{SUMMARY_HEADER} {summary}\n\n{transcript}"),
        None => transcript,
    }
}
