//! One conversation's chat loop: submit, stream, stop, regenerate.
//!
//! The session never spawns. Whoever owns it drives the stream by awaiting
//! [`ChatSession::next_event`], which is cancel-safe and can therefore race
//! user input inside `tokio::select!`. Stopping means dropping the fragment
//! stream, which closes the HTTP connection behind it.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

use super::settings::Selection;
use super::store::ConversationStore;
use super::transport::{ChatError, ChatTransport, FragmentStream};
use crate::models::{ChatRequest, Conversation, Message, Role};

pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("message is empty")]
    EmptyInput,
    #[error("a response is still streaming")]
    Busy,
    #[error("nothing is streaming")]
    NotStreaming,
    #[error("the last message is not an assistant answer")]
    NothingToRegenerate,
    #[error("there is no user message to send again")]
    NothingToRetry,
    #[error(transparent)]
    Request(#[from] ChatError),
}

/// What happened while the caller was waiting.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A fragment was appended to the assistant message.
    Delta(String),
    Completed,
    /// The turn ended early; partial text is kept.
    Failed(ChatError),
}

struct ActiveTurn {
    fragments: FragmentStream,
    /// Index of the assistant message, once the first fragment arrived.
    assistant_index: Option<usize>,
    selection: Selection,
}

enum Phase {
    Idle,
    Streaming(ActiveTurn),
}

pub struct ChatSession {
    transport: Arc<dyn ChatTransport>,
    store: ConversationStore,
    conversation: Conversation,
    selection: Selection,
    phase: Phase,
    last_error: Option<ChatError>,
    stall_timeout: Duration,
}

impl ChatSession {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: ConversationStore,
        conversation: Conversation,
        selection: Selection,
    ) -> Self {
        Self {
            transport,
            store,
            conversation,
            selection,
            phase: Phase::Idle,
            last_error: None,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.phase, Phase::Streaming(_))
    }

    pub fn last_error(&self) -> Option<&ChatError> {
        self.last_error.as_ref()
    }

    /// Used for the next turn; a turn in flight keeps the one it started with.
    pub fn set_selection(&mut self, selection: Selection) {
        self.selection = selection;
    }

    /// Sends `text` as a new user message and starts streaming the answer.
    pub async fn submit(&mut self, text: &str) -> Result<(), SessionError> {
        if self.is_streaming() {
            return Err(SessionError::Busy);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyInput);
        }

        self.conversation.push(Message::user(text));
        self.store.update(&self.conversation);
        self.start_turn().await
    }

    /// Waits for the next fragment or the end of the turn.
    ///
    /// Returns `None` when idle. Cancelling the returned future loses nothing.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            let Phase::Streaming(turn) = &mut self.phase else {
                return None;
            };
            let next = timeout(self.stall_timeout, turn.fragments.next()).await;
            match next {
                Ok(Some(Ok(fragment))) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    match turn.assistant_index {
                        Some(index) => self.conversation.messages[index].content.push_str(&fragment),
                        None => {
                            self.conversation.messages.push(Message::assistant(fragment.as_str()));
                            turn.assistant_index = Some(self.conversation.messages.len() - 1);
                        }
                    }
                    return Some(SessionEvent::Delta(fragment));
                }
                Ok(None) => {
                    self.finish_turn();
                    return Some(SessionEvent::Completed);
                }
                Ok(Some(Err(e))) => return Some(self.fail_turn(e)),
                Err(_) => {
                    let stalled = ChatError::Stalled(self.stall_timeout);
                    return Some(self.fail_turn(stalled));
                }
            }
        }
    }

    /// Aborts the stream and keeps whatever text arrived so far.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        if !self.is_streaming() {
            return Err(SessionError::NotStreaming);
        }
        log::info!("Stopping generation for conversation {}", self.conversation.id);
        self.finish_turn();
        Ok(())
    }

    /// Replaces the last assistant answer with a fresh one from the current selection.
    pub async fn regenerate(&mut self) -> Result<(), SessionError> {
        if self.is_streaming() {
            return Err(SessionError::Busy);
        }
        if self.conversation.last_message().map(|m| m.role) != Some(Role::Assistant) {
            return Err(SessionError::NothingToRegenerate);
        }
        self.conversation.messages.pop();
        self.conversation.touch();
        self.store.update(&self.conversation);
        self.start_turn().await
    }

    /// Sends the last user message again after a failure, dropping any partial answer.
    pub async fn retry(&mut self) -> Result<(), SessionError> {
        if self.is_streaming() {
            return Err(SessionError::Busy);
        }
        let tail: Vec<Role> = self.conversation.messages.iter().rev().take(2).map(|m| m.role).collect();
        let drop_partial = match tail.as_slice() {
            [Role::User, ..] => false,
            [Role::Assistant, Role::User] => true,
            _ => return Err(SessionError::NothingToRetry),
        };
        if drop_partial {
            self.conversation.messages.pop();
            self.conversation.touch();
            self.store.update(&self.conversation);
        }
        self.start_turn().await
    }

    /// Switches to another conversation, stopping the current stream first.
    pub fn load(&mut self, conversation: Conversation) {
        if self.is_streaming() {
            self.finish_turn();
        }
        self.conversation = conversation;
        self.last_error = None;
    }

    pub fn rename(&mut self, title: &str) {
        self.conversation.rename(title);
        self.store.update(&self.conversation);
    }

    /// Records the current selection on the conversation when idle.
    pub fn stamp_selection(&mut self) {
        if self.is_streaming() {
            return;
        }
        if self
            .conversation
            .set_model(&self.selection.provider, &self.selection.model)
        {
            self.store.update(&self.conversation);
        }
    }

    async fn start_turn(&mut self) -> Result<(), SessionError> {
        let request = ChatRequest {
            messages: self.conversation.history(),
            provider: self.selection.provider.clone(),
            model: self.selection.model.clone(),
            conversation_id: Some(self.conversation.id.clone()),
        };
        self.last_error = None;

        match self.transport.open(&request).await {
            Ok(fragments) => {
                log::debug!(
                    "Streaming {}/{} into conversation {}",
                    request.provider,
                    request.model,
                    self.conversation.id
                );
                self.phase = Phase::Streaming(ActiveTurn {
                    fragments,
                    assistant_index: None,
                    selection: self.selection.clone(),
                });
                Ok(())
            }
            Err(e) => {
                log::warn!("Chat request failed: {}", e);
                self.last_error = Some(e.clone());
                Err(e.into())
            }
        }
    }

    fn fail_turn(&mut self, error: ChatError) -> SessionEvent {
        log::warn!("Stream for conversation {} failed: {}", self.conversation.id, error);
        self.last_error = Some(error.clone());
        self.finish_turn();
        SessionEvent::Failed(error)
    }

    /// Ends the turn (completed, stopped or failed) and persists the result.
    fn finish_turn(&mut self) {
        let Phase::Streaming(turn) = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };
        let ActiveTurn {
            fragments,
            selection,
            ..
        } = turn;
        drop(fragments);

        self.conversation.set_model(&selection.provider, &selection.model);
        // A model picked while this turn was streaming applies from now on.
        if self.selection != selection {
            self.conversation
                .set_model(&self.selection.provider, &self.selection.model);
        }
        self.conversation.derive_title();
        self.conversation.touch();
        self.store.update(&self.conversation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::store::MemoryStore;
    use crate::client::testing::ScriptedTransport;
    use crate::models::DEFAULT_TITLE;

    fn session(transport: Arc<ScriptedTransport>) -> (ConversationStore, ChatSession) {
        let store = ConversationStore::new(Arc::new(MemoryStore::new()));
        let conversation = store.create(Conversation::new("openai", "gpt-4o-mini"));
        let session = ChatSession::new(transport, store.clone(), conversation, Selection::default());
        (store, session)
    }

    async fn drain(session: &mut ChatSession) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = session.next_event().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn hello_scenario() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(["Hi", " there", "!"]);
        let (store, mut session) = session(transport.clone());
        let created_at = session.conversation().created_at;

        session.submit("Hello").await.unwrap();
        let events = drain(&mut session).await;
        assert_eq!(events.last(), Some(&SessionEvent::Completed));

        let stored = store.get(&session.conversation().id).unwrap();
        assert_eq!(stored.title, "Hello");
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[0].role, Role::User);
        assert_eq!(stored.messages[1].role, Role::Assistant);
        assert_eq!(stored.messages[1].content, "Hi there!");
        assert!(stored.updated_at > created_at);
        assert!(!session.is_streaming());

        let sent = transport.requests();
        assert_eq!(sent[0].conversation_id.as_deref(), Some(stored.id.as_str()));
        assert_eq!(sent[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn chunkwise_equals_concatenated() {
        let chunks = ["a", "bc", "", "déf", "g"];
        let one = Arc::new(ScriptedTransport::new());
        one.reply(chunks);
        let (_, mut chunked) = session(one);
        chunked.submit("x").await.unwrap();
        drain(&mut chunked).await;

        let all = Arc::new(ScriptedTransport::new());
        all.reply([chunks.concat()]);
        let (_, mut whole) = session(all);
        whole.submit("x").await.unwrap();
        drain(&mut whole).await;

        assert_eq!(
            chunked.conversation().messages[1].content,
            whole.conversation().messages[1].content
        );
    }

    #[tokio::test]
    async fn stop_after_three_of_ten_keeps_partial() {
        let transport = Arc::new(ScriptedTransport::new());
        let chunks: Vec<String> = (0..10).map(|i| format!("c{i} ")).collect();
        let dropped = transport.reply(chunks.clone());
        let (store, mut session) = session(transport);

        session.submit("Count").await.unwrap();
        for _ in 0..3 {
            assert!(matches!(session.next_event().await, Some(SessionEvent::Delta(_))));
        }
        session.stop().unwrap();

        assert!(!session.is_streaming());
        assert!(dropped.is_dropped());
        let stored = store.get(&session.conversation().id).unwrap();
        assert_eq!(stored.messages[1].content, chunks[..3].concat());
        assert_eq!(stored.title, "Count");
        assert!(session.next_event().await.is_none());
    }

    #[tokio::test]
    async fn mid_stream_error_keeps_partial_and_records_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_then_fail(["par", "tial"], ChatError::Connection("reset".into()));
        let (store, mut session) = session(transport);

        session.submit("Go").await.unwrap();
        let events = drain(&mut session).await;
        assert_eq!(
            events.last(),
            Some(&SessionEvent::Failed(ChatError::Connection("reset".into())))
        );
        assert!(session.last_error().is_some());
        let stored = store.get(&session.conversation().id).unwrap();
        assert_eq!(stored.messages[1].content, "partial");
    }

    #[tokio::test]
    async fn open_failure_stays_idle_with_user_message_saved() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail(ChatError::Configuration(
            "API key not configured for Anthropic. Set ANTHROPIC_API_KEY in your environment variables.".into(),
        ));
        let (store, mut session) = session(transport);

        let err = session.submit("Hi").await.unwrap_err();
        assert!(matches!(err, SessionError::Request(ChatError::Configuration(_))));
        assert!(!session.is_streaming());
        assert!(session.last_error().unwrap().user_message().contains("ANTHROPIC_API_KEY"));
        let stored = store.get(&session.conversation().id).unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.title, DEFAULT_TITLE);
    }

    #[tokio::test]
    async fn regenerate_replaces_last_answer() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(["first"]);
        transport.reply(["second"]);
        let (_, mut session) = session(transport.clone());

        session.submit("Q").await.unwrap();
        drain(&mut session).await;
        let before = session.conversation().messages.len();

        session.set_selection(Selection::new("google", "gemini-2.0-flash"));
        session.regenerate().await.unwrap();
        drain(&mut session).await;

        let conversation = session.conversation();
        assert_eq!(conversation.messages.len(), before);
        assert_eq!(conversation.messages[1].content, "second");
        assert_eq!(conversation.provider, "google");
        let sent = transport.requests();
        assert_eq!(sent[1].model, "gemini-2.0-flash");
        assert_eq!(sent[1].messages.len(), 1);
    }

    #[tokio::test]
    async fn regenerate_needs_an_answer() {
        let (_, mut session) = session(Arc::new(ScriptedTransport::new()));
        assert!(matches!(
            session.regenerate().await,
            Err(SessionError::NothingToRegenerate)
        ));
    }

    #[tokio::test]
    async fn submit_rejects_blank_and_busy() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(["x"]);
        let (_, mut session) = session(transport);
        assert!(matches!(session.submit("   ").await, Err(SessionError::EmptyInput)));
        session.submit("go").await.unwrap();
        assert!(matches!(session.submit("again").await, Err(SessionError::Busy)));
        assert!(matches!(session.regenerate().await, Err(SessionError::Busy)));
    }

    #[tokio::test]
    async fn retry_resends_after_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply_then_fail(["half"], ChatError::Connection("reset".into()));
        transport.reply(["whole"]);
        let (_, mut session) = session(transport.clone());

        session.submit("Q").await.unwrap();
        drain(&mut session).await;
        session.retry().await.unwrap();
        assert!(session.last_error().is_none());
        drain(&mut session).await;

        let messages = &session.conversation().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "whole");
        assert_eq!(transport.requests()[1].messages.len(), 1);
    }

    #[tokio::test]
    async fn stall_is_an_error() {
        let transport = Arc::new(ScriptedTransport::new());
        let _held = transport.hang();
        let (_, session) = session(transport);
        let mut session = session.with_stall_timeout(Duration::from_millis(20));

        session.submit("Q").await.unwrap();
        assert_eq!(
            session.next_event().await,
            Some(SessionEvent::Failed(ChatError::Stalled(Duration::from_millis(20))))
        );
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn load_stops_stream_without_writing_into_new_conversation() {
        let transport = Arc::new(ScriptedTransport::new());
        let dropped = transport.reply(["one", "two"]);
        let (store, mut session) = session(transport);
        let first_id = session.conversation().id.clone();

        session.submit("Q").await.unwrap();
        session.next_event().await;
        let other = store.create(Conversation::new("openai", "gpt-4o"));
        session.load(other.clone());

        assert!(dropped.is_dropped());
        assert!(session.next_event().await.is_none());
        assert!(session.conversation().messages.is_empty());
        assert_eq!(store.get(&first_id).unwrap().messages[1].content, "one");
    }

    #[tokio::test]
    async fn model_switched_mid_turn_is_stamped_when_turn_ends() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(["a", "b"]);
        let (store, mut session) = session(transport.clone());

        session.submit("Q").await.unwrap();
        session.next_event().await;
        session.set_selection(Selection::new("anthropic", "claude-3-5-haiku-20241022"));
        session.stamp_selection();
        assert_eq!(session.conversation().provider, "openai");

        drain(&mut session).await;
        let stored = store.get(&session.conversation().id).unwrap();
        assert_eq!(stored.provider, "anthropic");
        assert_eq!(stored.model, "claude-3-5-haiku-20241022");
        assert_eq!(transport.requests()[0].provider, "openai");
    }
}
