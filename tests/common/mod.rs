#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use futures::stream::{self, StreamExt};
use polychat_lib::api::{CompletionBackend, DeltaStream, UpstreamError};
use polychat_lib::config::{StaticCredentials, StreamLimits};
use polychat_lib::models::ChatMessage;
use polychat_lib::resolver::ResolvedModel;
use polychat_lib::routes;
use polychat_lib::state::AppState;
use polychat_lib::storage::StorageManager;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

pub enum Reply {
    Chunks(Vec<String>),
    ChunksThenError(Vec<String>, UpstreamError),
    OpenError(UpstreamError),
    /// Yields the chunks, then never ends.
    ChunksThenPending(Vec<String>),
}

struct CountOnDrop(Arc<AtomicUsize>);

impl Drop for CountOnDrop {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Backend that plays queued replies and counts how often it was opened.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Reply>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
    dropped: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn chunks(&self, chunks: &[&str]) {
        self.push(Reply::Chunks(chunks.iter().map(|c| c.to_string()).collect()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }

    /// Number of upstream streams dropped so far.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn open_stream(
        &self,
        _model: &ResolvedModel,
        messages: &[ChatMessage],
        _max_output_tokens: u32,
    ) -> Result<DeltaStream, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Chunks(Vec::new()));
        let deltas: DeltaStream = match reply {
            Reply::Chunks(chunks) => stream::iter(chunks.into_iter().map(Ok)).boxed(),
            Reply::ChunksThenError(chunks, error) => stream::iter(
                chunks
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(error))),
            )
            .boxed(),
            Reply::ChunksThenPending(chunks) => stream::iter(chunks.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed(),
            Reply::OpenError(error) => return Err(error),
        };
        let guard = CountOnDrop(self.dropped.clone());
        Ok(deltas
            .map(move |item| {
                let _guard = &guard;
                item
            })
            .boxed())
    }
}

pub fn all_credentials() -> StaticCredentials {
    StaticCredentials::new([
        ("OPENAI_API_KEY", "sk-openai"),
        ("ANTHROPIC_API_KEY", "sk-anthropic"),
        ("GOOGLE_GENERATIVE_AI_API_KEY", "g-key"),
    ])
}

pub fn state(backend: Arc<ScriptedBackend>, credentials: StaticCredentials, storage: Option<StorageManager>) -> AppState {
    let limits = StreamLimits {
        max_output_tokens: 256,
        idle_timeout: Duration::from_secs(5),
    };
    AppState::new(storage, backend, Arc::new(credentials), limits)
}

pub async fn storage() -> (TempDir, StorageManager) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("gateway.sqlite").display());
    (dir, StorageManager::connect(&url).await.unwrap())
}

pub async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> Response<Body> {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    app.clone().oneshot(request.body(body).unwrap()).await.unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

pub fn app(state: AppState) -> Router {
    routes::router(state)
}
