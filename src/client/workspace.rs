use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::session::{ChatSession, SessionError, SessionEvent};
use super::settings::{Selection, Settings};
use super::store::{ConversationStore, KeyValueStore};
use super::transport::ChatTransport;
use crate::models::Conversation;
use crate::registry;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("no conversation with id {0}")]
    NotFound(String),
    #[error("unknown model {model} for provider {provider}")]
    UnknownModel { provider: String, model: String },
    #[error("title must not be empty")]
    EmptyTitle,
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Everything the chat screen shows: the conversation list, the selection and
/// the active session. There is always exactly one active conversation.
pub struct Workspace {
    store: ConversationStore,
    settings: Settings,
    session: ChatSession,
}

impl Workspace {
    /// Restores the saved selection and the most recent conversation, creating
    /// one when the store is empty.
    pub fn open(kv: Arc<dyn KeyValueStore>, transport: Arc<dyn ChatTransport>, stall_timeout: Duration) -> Self {
        let store = ConversationStore::new(kv.clone());
        let settings = Settings::new(kv);
        let selection = settings.load();

        let active = match store.list().into_iter().next() {
            Some(conversation) => conversation,
            None => store.create(Conversation::new(&selection.provider, &selection.model)),
        };
        log::info!(
            "Opened workspace on conversation {} with {}/{}",
            active.id,
            selection.provider,
            selection.model
        );

        let session = ChatSession::new(transport, store.clone(), active, selection).with_stall_timeout(stall_timeout);
        Self {
            store,
            settings,
            session,
        }
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.store.list()
    }

    pub fn active(&self) -> &Conversation {
        self.session.conversation()
    }

    pub fn selection(&self) -> &Selection {
        self.session.selection()
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    /// Starts an empty conversation with the current selection and makes it active.
    pub fn new_chat(&mut self) -> &Conversation {
        let selection = self.session.selection().clone();
        let conversation = self
            .store
            .create(Conversation::new(selection.provider, selection.model));
        self.session.load(conversation);
        self.session.conversation()
    }

    pub fn select(&mut self, id: &str) -> Result<(), WorkspaceError> {
        if self.active().id == id {
            return Ok(());
        }
        let conversation = self
            .store
            .get(id)
            .ok_or_else(|| WorkspaceError::NotFound(id.to_string()))?;
        self.session.load(conversation);
        Ok(())
    }

    /// Deletes a conversation. Deleting the active one promotes the most
    /// recently updated remaining conversation, or a fresh one.
    pub fn delete(&mut self, id: &str) -> Result<(), WorkspaceError> {
        let was_active = self.active().id == id;
        if was_active && self.session.is_streaming() {
            self.session.stop()?;
        }
        if !self.store.delete(id) {
            return Err(WorkspaceError::NotFound(id.to_string()));
        }
        log::info!("Deleted conversation {}", id);

        if was_active {
            match self.store.list().into_iter().next() {
                Some(next) => self.session.load(next),
                None => {
                    self.new_chat();
                }
            }
        }
        Ok(())
    }

    pub fn rename(&mut self, id: &str, title: &str) -> Result<(), WorkspaceError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(WorkspaceError::EmptyTitle);
        }
        if self.active().id == id {
            self.session.rename(title);
            return Ok(());
        }
        let mut conversation = self
            .store
            .get(id)
            .ok_or_else(|| WorkspaceError::NotFound(id.to_string()))?;
        conversation.rename(title);
        self.store.update(&conversation);
        Ok(())
    }

    /// Saves the selection for future turns and stamps it on the active
    /// conversation when nothing is streaming.
    pub fn select_model(&mut self, provider: &str, model: &str) -> Result<(), WorkspaceError> {
        if !registry::is_known_model(provider, model) {
            return Err(WorkspaceError::UnknownModel {
                provider: provider.to_string(),
                model: model.to_string(),
            });
        }
        let selection = Selection::new(provider, model);
        if let Err(e) = self.settings.save(&selection) {
            log::warn!("Failed to save model selection: {:?}", e);
        }
        self.session.set_selection(selection);
        self.session.stamp_selection();
        Ok(())
    }

    pub async fn submit(&mut self, text: &str) -> Result<(), WorkspaceError> {
        Ok(self.session.submit(text).await?)
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.session.next_event().await
    }

    pub fn stop(&mut self) -> Result<(), WorkspaceError> {
        Ok(self.session.stop()?)
    }

    pub async fn regenerate(&mut self) -> Result<(), WorkspaceError> {
        Ok(self.session.regenerate().await?)
    }

    pub async fn retry(&mut self) -> Result<(), WorkspaceError> {
        Ok(self.session.retry().await?)
    }
}
