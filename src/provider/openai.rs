//! OpenAI-compatible chat completion summarizer

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{Summarizer, Summary, SummaryRequest};
use crate::config::ProviderConfig;
use crate::{Error, Result};

/// Summarizer backed by a `/chat/completions` endpoint
pub struct OpenAiSummarizer {
    client: Client,
    endpoint: url::Url,
    api_key: Option<SecretString>,
}

impl OpenAiSummarizer {
    /// Create a summarizer from provider configuration
    ///
    /// # Errors
    ///
    /// Returns error if the base URL cannot be extended or the HTTP client cannot be built
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            endpoint: completions_endpoint(&config.base_url)?,
            api_key: config
                .api_key
                .as_ref()
                .map(|key| SecretString::from(key.expose_secret().to_string())),
        })
    }
}

/// `{base}/chat/completions`, tolerating a trailing slash on the base
fn completions_endpoint(base: &url::Url) -> Result<url::Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }
    base.join("chat/completions")
        .map_err(|e| Error::Config(format!("invalid provider URL {base}: {e}")))
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, request: &SummaryRequest<'_>) -> Result<Summary> {
        let body = ChatCompletionRequest {
            model: request.model,
            messages: vec![
                Message {
                    role: "system",
                    content: request.system_prompt,
                },
                Message {
                    role: "user",
                    content: request.input,
                },
            ],
            max_tokens: Some(request.max_output_tokens),
            temperature: Some(0.3),
        };

        let mut http = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key.expose_secret());
        }

        let response = http
            .send()
            .await
            .map_err(|e| Error::Provider(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!("API error: {status} - {body}")));
        }

        let result: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("failed to parse response: {e}")))?;

        parse_summary(result)
    }

    fn name(&self) -> &'static str {
        "openai-compatible"
    }
}

fn parse_summary(result: ChatCompletionResponse) -> Result<Summary> {
    let text = result
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| Error::Provider("response contained no summary text".to_string()))?;

    let usage = result.usage.unwrap_or_default();

    Ok(Summary {
        text,
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cached_tokens: usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
    })
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize)]
struct PromptTokensDetails {
    cached_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_with_and_without_slash() {
        let a = completions_endpoint(&"https://api.openai.com/v1".parse().unwrap()).unwrap();
        let b = completions_endpoint(&"https://api.openai.com/v1/".parse().unwrap()).unwrap();
        assert_eq!(a.as_str(), "https://api.openai.com/v1/chat/completions");
        assert_eq!(a, b);
    }

    #[test]
    fn parses_summary_and_usage() {
        let raw = r#"{
            "choices": [{"message": {"role": "assistant", "content": "  They agreed on Friday.  "}}],
            "usage": {"prompt_tokens": 900, "completion_tokens": 40,
                      "prompt_tokens_details": {"cached_tokens": 512}}
        }"#;
        let response: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        let summary = parse_summary(response).unwrap();

        assert_eq!(summary.text, "They agreed on Friday.");
        assert_eq!(summary.input_tokens, 900);
        assert_eq!(summary.output_tokens, 40);
        assert_eq!(summary.cached_tokens, Some(512));
    }

    #[test]
    fn missing_usage_defaults_to_zero() {
        let raw = r#"{"choices": [{"message": {"content": "ok"}}]}"#;
        let response: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        let summary = parse_summary(response).unwrap();
        assert_eq!(summary.input_tokens, 0);
        assert_eq!(summary.cached_tokens, None);
    }

    #[test]
    fn empty_content_is_an_error() {
        for raw in [
            r#"{"choices": []}"#,
            r#"{"choices": [{"message": {"content": null}}]}"#,
            r#"{"choices": [{"message": {"content": "   "}}]}"#,
        ] {
            let response: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
            assert!(matches!(parse_summary(response), Err(Error::Provider(_))));
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_provider_error() {
        let config = ProviderConfig {
            base_url: "http://127.0.0.1:9/v1".parse().unwrap(),
            api_key: None,
            timeout: Duration::from_secs(2),
        };
        let summarizer = OpenAiSummarizer::new(&config).unwrap();
        let result = summarizer
            .summarize(&SummaryRequest {
                system_prompt: "sys",
                input: "text",
                model: "gpt-4o-mini",
                max_output_tokens: 10,
            })
            .await;
        assert!(matches!(result, Err(Error::Provider(_))));
    }
}
