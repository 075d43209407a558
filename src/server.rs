//! HTTP surface: the Twilio SMS webhook and an authenticated chat endpoint.
//!
//! The webhook only records and enqueues; processing and the outbound reply
//! happen on the queue, so the handler answers Twilio inside its timeout no
//! matter how slow the model is. The chat endpoint runs the pipeline inline
//! and returns the reply as JSON.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::gateway::twiml_empty;
use crate::pipeline::Pipeline;
use crate::queue::{Job, JobQueue};
use crate::types::RequestContext;

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub queue: JobQueue,
    pub config: Arc<AppConfig>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/sms", post(sms_webhook))
        .route("/chat", post(chat))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = state.config.server.bind_addr.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Twilio posts inbound SMS here, form-encoded, PascalCase field names.
#[derive(Debug, Deserialize)]
pub struct TwilioWebhookForm {
    #[serde(rename = "MessageSid")]
    pub message_sid: String,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "Body")]
    pub body: String,
}

/// Record-then-enqueue. Always answers with TwiML: an empty `<Response>` on
/// success and on duplicate deliveries, and a 500 with the same body on a
/// store failure so Twilio redelivers into the idempotency check.
async fn sms_webhook(
    State(state): State<Arc<AppState>>,
    Form(form): Form<TwilioWebhookForm>,
) -> Response {
    let ctx = RequestContext::new(state.config.assistant.owner_user_id.clone());

    let recorded = match state
        .pipeline
        .store()
        .try_record_inbound(&ctx, &form.message_sid, &form.from, &form.to, &form.body)
        .await
    {
        Ok(Some(message)) => Ok(message),
        Ok(None) => Err(PipelineError::DuplicateMessage(form.message_sid.clone())),
        Err(e) => Err(PipelineError::Other(e)),
    };

    let status = match recorded {
        Ok(_) => {
            state.queue.enqueue(Job::ProcessMessage {
                external_id: form.message_sid.clone(),
                user_id: ctx.user_id.clone(),
            });
            StatusCode::OK
        }
        // Redelivery of a SID we already hold: same ack, nothing enqueued.
        Err(PipelineError::DuplicateMessage(sid)) => {
            info!(%sid, "duplicate webhook delivery ignored");
            StatusCode::OK
        }
        Err(e) => {
            error!(sid = %form.message_sid, error = %e, "failed to record inbound message");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    (
        status,
        [(header::CONTENT_TYPE, "text/xml")],
        twiml_empty(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

/// Synchronous chat for non-SMS clients. Bearer-token gated; disabled
/// entirely when no token is configured.
async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let token = &state.config.server.chat_token;
    if token.is_empty() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "chat endpoint is disabled");
    }
    if !bearer_matches(&headers, token) {
        return error_response(StatusCode::UNAUTHORIZED, "invalid token");
    }
    if request.message.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "message is empty");
    }

    let ctx = RequestContext::new(state.config.assistant.owner_user_id.clone());
    match state
        .pipeline
        .process_message(&ctx, &request.message, None)
        .await
    {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => {
            error!(error = %e, "chat processing failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "processing failed")
        }
    }
}

fn bearer_matches(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == expected)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_check_requires_exact_token() {
        assert!(bearer_matches(&headers_with("Bearer s3cret"), "s3cret"));
        assert!(!bearer_matches(&headers_with("Bearer wrong"), "s3cret"));
        assert!(!bearer_matches(&headers_with("s3cret"), "s3cret"));
        assert!(!bearer_matches(&HeaderMap::new(), "s3cret"));
    }

    #[test]
    fn webhook_form_decodes_twilio_field_names() {
        let form: TwilioWebhookForm = serde_urlencoded::from_str(
            "MessageSid=SM123&From=%2B15550001&To=%2B15550002&Body=hi+there",
        )
        .unwrap();
        assert_eq!(form.message_sid, "SM123");
        assert_eq!(form.from, "+15550001");
        assert_eq!(form.body, "hi there");
    }
}
