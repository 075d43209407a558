use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::providers::{CompletionError, CompletionService};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Completion provider speaking the Anthropic messages API.
pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, model: &str, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: "https://api.anthropic.com/v1".to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    /// Concatenated text blocks from a messages-API response body.
    fn extract_text(body: &Value) -> Result<String, CompletionError> {
        let blocks = body["content"]
            .as_array()
            .ok_or_else(|| CompletionError::malformed("response has no content array"))?;

        let text: String = blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(CompletionError::malformed("no text content in response"));
        }
        Ok(text)
    }
}

#[async_trait]
impl CompletionService for AnthropicProvider {
    async fn complete(
        &self,
        prompt: &str,
        system_prompt: &str,
        max_tokens: u32,
    ) -> Result<String, CompletionError> {
        let mut payload = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });
        if !system_prompt.is_empty() {
            payload["system"] = json!(system_prompt);
        }

        debug!(model = %self.model, max_tokens, "completion request");

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|e| CompletionError::network(&e))?;

        let status = resp.status().as_u16();
        let body_text = resp
            .text()
            .await
            .map_err(|e| CompletionError::network(&e))?;

        if status != 200 {
            return Err(CompletionError::from_status(status, &body_text));
        }

        let body: Value = serde_json::from_str(&body_text)
            .map_err(|e| CompletionError::malformed(format!("invalid response body: {e}")))?;

        Self::extract_text(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_joins_text_blocks() {
        let body = json!({
            "content": [
                { "type": "text", "text": "Got it! " },
                { "type": "text", "text": "Added the task." }
            ]
        });
        assert_eq!(
            AnthropicProvider::extract_text(&body).unwrap(),
            "Got it! Added the task."
        );
    }

    #[test]
    fn extract_text_rejects_empty_content() {
        let body = json!({ "content": [] });
        assert!(AnthropicProvider::extract_text(&body).is_err());
    }

    #[test]
    fn extract_text_skips_non_text_blocks() {
        let body = json!({
            "content": [
                { "type": "thinking", "thinking": "hmm" },
                { "type": "text", "text": "answer" }
            ]
        });
        assert_eq!(AnthropicProvider::extract_text(&body).unwrap(), "answer");
    }
}
