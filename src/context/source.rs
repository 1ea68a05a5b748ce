//! Message source abstraction

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::snowflake::Snowflake;
use crate::Result;

/// A message from conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: Snowflake,
    pub author_id: String,
    pub display_name: String,
    pub text: String,
    /// Authored by the assistant itself
    #[serde(default)]
    pub from_bot: bool,
}

/// Query interface over a conversation's stored history
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Messages with `after < id < before` (no upper bound when `before` is `None`),
    /// oldest first
    async fn fetch(
        &self,
        conversation_id: &str,
        after: Snowflake,
        before: Option<Snowflake>,
    ) -> Result<Vec<HistoryMessage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exported_message_line() {
        let line = r#"{"id": "175928847299117063", "author_id": "80351110224678912", "display_name": "Ada", "text": "hello"}"#;
        let message: HistoryMessage = serde_json::from_str(line).unwrap();

        assert_eq!(message.id, Snowflake(175_928_847_299_117_063));
        assert_eq!(message.display_name, "Ada");
        assert!(!message.from_bot);
    }
}
