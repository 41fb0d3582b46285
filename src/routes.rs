use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::ApiError;
use crate::gateway;
use crate::models::{Conversation, ConversationSummary, FieldErrors, Role};
use crate::registry;
use crate::state::AppState;
use crate::storage::{ConversationPatch, IncomingMessage, NewConversation, StorageManager};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(gateway::chat))
        .route("/api/models", get(list_models))
        .route("/api/conversations", get(list_conversations).post(create_conversation))
        .route(
            "/api/conversations/:id",
            get(get_conversation)
                .put(update_conversation)
                .delete(delete_conversation),
        )
        .with_state(state)
}

async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let providers = registry::listing(state.credentials.as_ref());
    (
        [(header::CACHE_CONTROL, "public, max-age=60")],
        Json(serde_json::json!({ "providers": providers })),
    )
}

fn storage(state: &AppState) -> Result<&Arc<StorageManager>, ApiError> {
    state.storage.as_ref().ok_or(ApiError::PersistenceDisabled)
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        let mut errors = FieldErrors::new();
        errors.insert("body".into(), vec![e.to_string()]);
        ApiError::Validation(errors)
    })
}

fn check_not_empty(errors: &mut FieldErrors, field: &str, value: Option<&str>) {
    if value.is_some_and(|v| v.trim().is_empty()) {
        errors
            .entry(field.to_string())
            .or_default()
            .push("Must not be empty".to_string());
    }
}

async fn list_conversations(State(state): State<AppState>) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    log::info!("Client requested to list conversations");
    let conversations = storage(&state)?.list_conversations().await?;
    Ok(Json(conversations))
}

#[derive(Deserialize)]
struct CreateConversationBody {
    id: Option<String>,
    title: String,
    provider: String,
    model: String,
}

async fn create_conversation(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let storage = storage(&state)?;
    let body: CreateConversationBody = parse_body(&body)?;

    let mut errors = FieldErrors::new();
    check_not_empty(&mut errors, "id", body.id.as_deref());
    check_not_empty(&mut errors, "title", Some(body.title.as_str()));
    check_not_empty(&mut errors, "provider", Some(body.provider.as_str()));
    check_not_empty(&mut errors, "model", Some(body.model.as_str()));
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let conversation = storage
        .create_conversation(NewConversation {
            id: body.id,
            title: body.title,
            provider: body.provider,
            model: body.model,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    storage(&state)?
        .get_conversation(&conversation_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

#[derive(Deserialize)]
struct MessageBody {
    id: Option<String>,
    role: Role,
    content: String,
}

#[derive(Deserialize)]
struct UpdateConversationBody {
    title: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    messages: Option<Vec<MessageBody>>,
}

async fn update_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    body: Bytes,
) -> Result<Json<Conversation>, ApiError> {
    let storage = storage(&state)?;
    let body: UpdateConversationBody = parse_body(&body)?;

    let mut errors = FieldErrors::new();
    check_not_empty(&mut errors, "title", body.title.as_deref());
    check_not_empty(&mut errors, "provider", body.provider.as_deref());
    check_not_empty(&mut errors, "model", body.model.as_deref());
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let patch = ConversationPatch {
        title: body.title,
        provider: body.provider,
        model: body.model,
        messages: body.messages.map(|messages| {
            messages
                .into_iter()
                .map(|m| IncomingMessage {
                    id: m.id,
                    role: m.role,
                    content: m.content,
                })
                .collect()
        }),
    };
    storage
        .update_conversation(&conversation_id, patch)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if storage(&state)?.delete_conversation(&conversation_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}
