//! `POST /api/chat`: validate, resolve, then relay a streaming completion as
//! plain text while it is being generated.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::{Map, Value};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::api::{DeltaStream, UpstreamError};
use crate::error::ApiError;
use crate::models::{ChatMessage, ChatRequest, FieldErrors, Role};
use crate::resolver;
use crate::state::AppState;
use crate::storage::StorageManager;

pub async fn chat(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request = validate_chat_request(&body).map_err(ApiError::Validation)?;
    let model = resolver::resolve(&request.provider, &request.model, state.credentials.as_ref())?;

    log::info!(
        "Chat request for {}/{} with {} messages",
        request.provider,
        request.model,
        request.messages.len()
    );

    let idle = state.limits.idle_timeout;
    let mut upstream = state
        .backend
        .open_stream(&model, &request.messages, state.limits.max_output_tokens)
        .await
        .map_err(upstream_failure)?;

    // Nothing has been sent yet, so a failure here can still become a status code.
    let first = match timeout(idle, upstream.next()).await {
        Ok(Some(Ok(text))) => Some(text),
        Ok(None) => None,
        Ok(Some(Err(e))) => return Err(upstream_failure(e)),
        Err(_) => {
            return Err(ApiError::Internal(anyhow::anyhow!(
                "Upstream sent nothing within {:?}",
                idle
            )))
        }
    };

    let recorder = ExchangeRecorder::new(&state, &request);
    let body = relay(first, upstream, idle, recorder);

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

fn upstream_failure(err: UpstreamError) -> ApiError {
    if err.is_rate_limit() {
        log::warn!("Upstream rate limit: {}", err);
        ApiError::RateLimited
    } else {
        ApiError::Internal(anyhow::Error::new(err).context("Upstream completion failed"))
    }
}

/// Forwards each delta as soon as it arrives. Dropping the returned stream
/// (client went away) drops `upstream` with it and skips the recorder.
fn relay(
    first: Option<String>,
    mut upstream: DeltaStream,
    idle: Duration,
    recorder: Option<ExchangeRecorder>,
) -> impl futures::Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    async_stream::stream! {
        let mut transcript = String::new();
        let mut next = first;
        while let Some(text) = next {
            transcript.push_str(&text);
            yield Ok(Bytes::from(text));

            next = match timeout(idle, upstream.next()).await {
                Ok(Some(Ok(text))) => Some(text),
                Ok(None) => None,
                Ok(Some(Err(e))) => {
                    log::error!("Upstream failed mid-stream after {} chars: {:?}", transcript.len(), e);
                    yield Err(io::Error::new(io::ErrorKind::Other, e));
                    return;
                }
                Err(_) => {
                    log::error!("Upstream stalled for {:?} mid-stream", idle);
                    yield Err(io::Error::new(io::ErrorKind::TimedOut, "upstream stream stalled"));
                    return;
                }
            };
        }

        log::info!("Completion stream finished ({} chars)", transcript.len());
        match recorder {
            Some(_) if transcript.is_empty() => {
                log::warn!("Upstream produced no text, exchange not persisted");
            }
            Some(recorder) => {
                recorder.record(transcript);
            }
            None => {}
        }
    }
}

/// Best-effort append of one finished exchange to the relational mirror.
pub struct ExchangeRecorder {
    state: AppState,
    storage: Arc<StorageManager>,
    conversation_id: String,
    user_message: Option<ChatMessage>,
}

impl ExchangeRecorder {
    /// `None` when there is no conversation id or no database.
    pub fn new(state: &AppState, request: &ChatRequest) -> Option<Self> {
        let conversation_id = request.conversation_id.clone()?;
        let storage = state.storage.clone()?;
        Some(Self {
            state: state.clone(),
            storage,
            conversation_id,
            user_message: request.last_user_message().cloned(),
        })
    }

    /// Spawns the write and returns immediately. Failures are logged only.
    pub fn record(self, assistant_text: String) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Self {
                state,
                storage,
                conversation_id,
                user_message,
            } = self;
            let mut messages: Vec<ChatMessage> = user_message.into_iter().collect();
            messages.push(ChatMessage::new(Role::Assistant, assistant_text));

            let lock = state.persist_lock(&conversation_id);
            let outcome = {
                let _guard = lock.lock().await;
                storage.record_exchange(&conversation_id, &messages).await
            };
            state.release_persist_lock(&conversation_id, lock);

            match outcome {
                Ok(true) => log::debug!("Persisted exchange for conversation {}", conversation_id),
                Ok(false) => log::warn!(
                    "Conversation {} no longer exists, exchange not persisted",
                    conversation_id
                ),
                Err(e) => log::error!(
                    "Failed to persist exchange for conversation {}: {:?}",
                    conversation_id,
                    e
                ),
            }
        })
    }
}

/// Structural check of a chat body, collecting every problem by field path.
pub fn validate_chat_request(body: &[u8]) -> Result<ChatRequest, FieldErrors> {
    let mut errors = FieldErrors::new();
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            errors.insert("body".into(), vec![format!("Invalid JSON: {e}")]);
            return Err(errors);
        }
    };
    let Value::Object(object) = value else {
        errors.insert("body".into(), vec!["Expected a JSON object".into()]);
        return Err(errors);
    };

    let messages = validate_messages(object.get("messages"), &mut errors);
    let provider = required_string(&object, "provider", &mut errors);
    let model = required_string(&object, "model", &mut errors);
    let conversation_id = match object.get("conversationId") {
        None | Some(Value::Null) => None,
        Some(_) => required_string(&object, "conversationId", &mut errors),
    };

    if !errors.is_empty() {
        return Err(errors);
    }
    match (provider, model) {
        (Some(provider), Some(model)) => Ok(ChatRequest {
            messages,
            provider,
            model,
            conversation_id,
        }),
        _ => Err(errors),
    }
}

fn validate_messages(value: Option<&Value>, errors: &mut FieldErrors) -> Vec<ChatMessage> {
    let items = match value {
        Some(Value::Array(items)) if !items.is_empty() => items,
        Some(Value::Array(_)) => {
            push_error(errors, "messages", "At least one message is required");
            return Vec::new();
        }
        None => {
            push_error(errors, "messages", "Required");
            return Vec::new();
        }
        Some(_) => {
            push_error(errors, "messages", "Expected an array");
            return Vec::new();
        }
    };

    let mut messages = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let Value::Object(fields) = item else {
            push_error(errors, &format!("messages.{i}"), "Expected an object");
            continue;
        };
        let role = match fields.get("role") {
            Some(Value::String(role)) => Role::parse(role),
            _ => None,
        };
        if role.is_none() {
            push_error(
                errors,
                &format!("messages.{i}.role"),
                "Expected 'user', 'assistant' or 'system'",
            );
        }
        let content = match fields.get("content") {
            Some(Value::String(content)) => Some(content.clone()),
            _ => {
                push_error(errors, &format!("messages.{i}.content"), "Expected a string");
                None
            }
        };
        if let (Some(role), Some(content)) = (role, content) {
            messages.push(ChatMessage { role, content });
        }
    }
    messages
}

fn required_string(object: &Map<String, Value>, field: &str, errors: &mut FieldErrors) -> Option<String> {
    match object.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::String(_)) => {
            push_error(errors, field, "Must not be empty");
            None
        }
        None => {
            push_error(errors, field, "Required");
            None
        }
        Some(_) => {
            push_error(errors, field, "Expected a string");
            None
        }
    }
}

fn push_error(errors: &mut FieldErrors, field: &str, message: &str) {
    errors
        .entry(field.to_string())
        .or_default()
        .push(message.to_string());
}
