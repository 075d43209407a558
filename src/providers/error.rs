use std::fmt;

/// Classified completion-service error: tells the caller *why* the call
/// failed so it can pick the right fallback.
#[derive(Debug)]
pub struct CompletionError {
    pub kind: CompletionErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Seconds to wait before retrying (from a 429 Retry-After body).
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionErrorKind {
    /// 401/403: bad API key or permissions.
    Auth,
    /// 429: rate limited; check retry_after_secs.
    RateLimit,
    /// 408, request timeout, or the provider took too long.
    Timeout,
    /// Connection refused, DNS failure, reset, etc.
    Network,
    /// 500/502/503/504: provider-side outage.
    ServerError,
    /// The response came back but was not the JSON the caller asked for.
    MalformedOutput,
    /// Anything else.
    Unknown,
}

impl CompletionError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => CompletionErrorKind::Auth,
            408 => CompletionErrorKind::Timeout,
            429 => CompletionErrorKind::RateLimit,
            500 | 502 | 503 | 504 => CompletionErrorKind::ServerError,
            _ => CompletionErrorKind::Unknown,
        };

        let retry_after_secs = if kind == CompletionErrorKind::RateLimit {
            extract_retry_after(body)
        } else {
            None
        };

        Self {
            kind,
            status: Some(status),
            message: truncate_body(body),
            retry_after_secs,
        }
    }

    pub fn network(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            CompletionErrorKind::Timeout
        } else {
            CompletionErrorKind::Network
        };
        Self {
            kind,
            status: None,
            message: err.to_string(),
            retry_after_secs: None,
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            kind: CompletionErrorKind::MalformedOutput,
            status: None,
            message: detail.into(),
            retry_after_secs: None,
        }
    }

    /// Whether a caller that wants the same output could reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            CompletionErrorKind::RateLimit
                | CompletionErrorKind::Timeout
                | CompletionErrorKind::Network
                | CompletionErrorKind::ServerError
        )
    }
}

impl fmt::Display for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status {
            write!(f, "completion error ({}, {:?}): {}", status, self.kind, self.message)
        } else {
            write!(f, "completion error ({:?}): {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for CompletionError {}

/// Try to parse retry_after from a JSON error body.
/// Handles: {"error": {"retry_after": 5}} and {"retry_after": 5}
fn extract_retry_after(body: &str) -> Option<u64> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    v["error"]["retry_after"]
        .as_u64()
        .or_else(|| v["retry_after"].as_u64())
        .or_else(|| {
            v["error"]["retry_after"]
                .as_f64()
                .or_else(|| v["retry_after"].as_f64())
                .map(|f| f.ceil() as u64)
        })
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= 300 {
        return body.to_string();
    }
    let cut: String = body.chars().take(300).collect();
    format!("{cut}...")
}
