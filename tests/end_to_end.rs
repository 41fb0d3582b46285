mod common;

use common::*;
use polychat_lib::client::{
    ChatError, HttpTransport, MemoryStore, SessionError, SessionEvent, Workspace, WorkspaceError,
};
use polychat_lib::config::StaticCredentials;
use polychat_lib::routes;
use polychat_lib::state::AppState;
use std::sync::Arc;
use std::time::Duration;

async fn serve(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, routes::router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

fn workspace(base_url: String) -> Workspace {
    Workspace::open(
        Arc::new(MemoryStore::new()),
        Arc::new(HttpTransport::new(base_url)),
        Duration::from_secs(5),
    )
}

#[tokio::test]
async fn hello_through_the_gateway() {
    let backend = ScriptedBackend::new();
    backend.chunks(&["Hi", "! How", " can I help?"]);
    let base_url = serve(state(backend.clone(), all_credentials(), None)).await;
    let mut workspace = workspace(base_url);
    let created_at = workspace.active().created_at;

    workspace.submit("Hello").await.unwrap();
    let mut text = String::new();
    loop {
        match workspace.next_event().await {
            Some(SessionEvent::Delta(fragment)) => text.push_str(&fragment),
            Some(SessionEvent::Completed) => break,
            other => panic!("unexpected event {other:?}"),
        }
    }

    let conversation = workspace.active();
    assert_eq!(text, "Hi! How can I help?");
    assert_eq!(conversation.title, "Hello");
    assert_eq!(conversation.messages.len(), 2);
    assert_eq!(conversation.messages[1].content, text);
    assert!(conversation.updated_at > created_at);
    assert_eq!(workspace.conversations()[0], *conversation);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn missing_key_surfaces_as_configuration_error() {
    let backend = ScriptedBackend::new();
    let credentials = StaticCredentials::new([("OPENAI_API_KEY", "sk-openai")]);
    let base_url = serve(state(backend.clone(), credentials, None)).await;
    let mut workspace = workspace(base_url);
    workspace
        .select_model("anthropic", "claude-sonnet-4-20250514")
        .unwrap();

    let err = workspace.submit("Hello").await.unwrap_err();
    match err {
        WorkspaceError::Session(SessionError::Request(ChatError::Configuration(message))) => {
            assert!(message.contains("ANTHROPIC_API_KEY"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!workspace.session().is_streaming());
    assert_eq!(workspace.active().messages.len(), 1);
    assert_eq!(backend.calls(), 0);
}
