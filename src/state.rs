use crate::api::CompletionBackend;
use crate::config::{CredentialSource, StreamLimits};
use crate::storage::StorageManager;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

// Core application state shared by every request handler
#[derive(Clone)] // Allow cloning for background tasks
pub struct AppState {
    // None when no database is configured; persistence and CRUD are then off.
    pub storage: Option<Arc<StorageManager>>,
    pub backend: Arc<dyn CompletionBackend>,
    pub credentials: Arc<dyn CredentialSource>,
    pub limits: StreamLimits,
    // One async lock per conversation currently being persisted.
    persist_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl AppState {
    pub fn new(
        storage: Option<StorageManager>,
        backend: Arc<dyn CompletionBackend>,
        credentials: Arc<dyn CredentialSource>,
        limits: StreamLimits,
    ) -> Self {
        Self {
            storage: storage.map(Arc::new),
            backend,
            credentials,
            limits,
            persist_locks: Arc::new(DashMap::new()),
        }
    }

    /// Lock serializing persistence for one conversation.
    pub fn persist_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.persist_locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the lock entry once no task other than the caller holds it.
    pub fn release_persist_lock(&self, conversation_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.persist_locks
            .remove_if(conversation_id, |_, held| Arc::strong_count(held) == 1);
    }

    #[cfg(test)]
    fn pending_persist_locks(&self) -> usize {
        self.persist_locks.len()
    }
}
