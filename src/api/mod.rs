//! Upstream completion backends.
//!
//! Each provider lives in its own module and contributes two things: how to
//! build the streaming request, and how to read one server-sent event into a
//! [`SseAction`]. Everything else (sending, status handling, SSE framing) is
//! shared here.

mod anthropic;
mod google;
mod openai;

use crate::config::Endpoints;
use crate::models::ChatMessage;
use crate::registry::ProviderKind;
use crate::resolver::ResolvedModel;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{future, Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::pin::Pin;
use thiserror::Error;

// Alias for the stream type backends return
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, UpstreamError>> + Send>>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream rate limit: {0}")]
    RateLimited(String),
    #[error("upstream request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to reach upstream: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream stream failed: {0}")]
    Stream(String),
    #[error("malformed upstream event: {0}")]
    Malformed(String),
}

impl UpstreamError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

/// What one upstream event means for the text stream.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseAction {
    Delta(String),
    Skip,
    Done,
}

type EventParser = fn(&str, &str) -> Result<SseAction, UpstreamError>;

/// One capability every provider offers: a stream of text deltas.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn open_stream(
        &self,
        model: &ResolvedModel,
        messages: &[ChatMessage],
        max_output_tokens: u32,
    ) -> Result<DeltaStream, UpstreamError>;
}

/// Talks to the real provider APIs over HTTPS.
pub struct HttpBackend {
    client: Client,
    endpoints: Endpoints,
}

impl HttpBackend {
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            client: Client::new(),
            endpoints,
        }
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    async fn open_stream(
        &self,
        model: &ResolvedModel,
        messages: &[ChatMessage],
        max_output_tokens: u32,
    ) -> Result<DeltaStream, UpstreamError> {
        log::info!(
            "Opening {} stream with model {} ({} messages)",
            model.provider,
            model.model_id,
            messages.len()
        );

        let (request, parser): (RequestBuilder, EventParser) = match model.provider {
            ProviderKind::OpenAi => (
                openai::build_request(&self.client, &self.endpoints.openai, model, messages, max_output_tokens),
                openai::parse_event,
            ),
            ProviderKind::Anthropic => (
                anthropic::build_request(
                    &self.client,
                    &self.endpoints.anthropic,
                    model,
                    messages,
                    max_output_tokens,
                ),
                anthropic::parse_event,
            ),
            ProviderKind::Google => (
                google::build_request(&self.client, &self.endpoints.google, model, messages, max_output_tokens),
                google::parse_event,
            ),
        };

        let response = send(request).await?;
        Ok(delta_stream(response, parser))
    }
}

async fn send(request: RequestBuilder) -> Result<Response, UpstreamError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<Failed to read error body>".to_string());
    log::error!("Upstream stream request failed with status {}: {}", status, body);

    // 529 is Anthropic's "overloaded", which clients should treat like a rate limit.
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 529 {
        Err(UpstreamError::RateLimited(body))
    } else {
        Err(UpstreamError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Frames the response body as SSE and keeps only the text deltas.
fn delta_stream(response: Response, parser: EventParser) -> DeltaStream {
    let deltas = response
        .bytes_stream()
        .eventsource()
        .map(move |event| match event {
            Ok(event) => parser(&event.event, event.data.trim()),
            Err(e) => Err(UpstreamError::Stream(e.to_string())),
        })
        .take_while(|action| future::ready(!matches!(action, Ok(SseAction::Done))))
        .filter_map(|action| {
            future::ready(match action {
                Ok(SseAction::Delta(text)) if !text.is_empty() => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => {
                    log::error!("Error processing stream event: {:?}", e);
                    Some(Err(e))
                }
            })
        });

    Box::pin(deltas)
}

/// Shared reading of `{"error": {"type"|"status", "message"}}` payloads.
fn classify_error_payload(error: &serde_json::Value) -> UpstreamError {
    let message = error
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown upstream error")
        .to_string();

    let rate_limited = ["type", "status", "code"].iter().any(|field| {
        match error.get(*field) {
            Some(serde_json::Value::String(kind)) => {
                kind.contains("rate_limit") || kind == "overloaded_error" || kind == "RESOURCE_EXHAUSTED"
            }
            Some(serde_json::Value::Number(code)) => code.as_u64() == Some(429),
            _ => false,
        }
    });
    if rate_limited {
        UpstreamError::RateLimited(message)
    } else {
        UpstreamError::Stream(message)
    }
}
