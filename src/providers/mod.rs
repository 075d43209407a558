//! Completion-service seam. The rest of the pipeline only sees the
//! [`CompletionService`] trait; the concrete provider speaks the Anthropic
//! messages API.

mod anthropic;
mod error;

pub use anthropic::AnthropicProvider;
pub use error::{CompletionError, CompletionErrorKind};

use async_trait::async_trait;
use serde_json::Value;

/// Black-box natural-language completion: given a prompt, return text, or
/// JSON conforming to a caller-described shape. Fails with
/// [`CompletionError`] on transport failure or non-conforming output.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        system_prompt: &str,
        max_tokens: u32,
    ) -> Result<String, CompletionError>;

    /// Complete and parse the response as JSON. Tolerates markdown fences
    /// around the payload, which models add despite instructions.
    async fn complete_json(
        &self,
        prompt: &str,
        system_prompt: &str,
        max_tokens: u32,
    ) -> Result<Value, CompletionError> {
        let text = self.complete(prompt, system_prompt, max_tokens).await?;
        extract_json(&text)
    }
}

/// Pull a JSON value out of model output: a ```json fence if present,
/// otherwise the first object or array literal in the text.
pub fn extract_json(text: &str) -> Result<Value, CompletionError> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            let candidate = rest[..end].trim();
            return serde_json::from_str(candidate)
                .map_err(|e| CompletionError::malformed(format!("fenced JSON invalid: {e}")));
        }
    }

    // First object or array literal, whichever opens earlier.
    let obj = text.find('{');
    let arr = text.find('[');
    let (start, close) = match (obj, arr) {
        (Some(o), Some(a)) if a < o => (a, ']'),
        (Some(o), _) => (o, '}'),
        (None, Some(a)) => (a, ']'),
        (None, None) => {
            return Err(CompletionError::malformed("no JSON found in response"));
        }
    };
    let end = text
        .rfind(close)
        .ok_or_else(|| CompletionError::malformed("unterminated JSON in response"))?;
    if end <= start {
        return Err(CompletionError::malformed("unterminated JSON in response"));
    }

    serde_json::from_str(&text[start..=end])
        .map_err(|e| CompletionError::malformed(format!("response was not valid JSON: {e}")))
}
