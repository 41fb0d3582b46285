//! Local persistence for the chat client.
//!
//! Conversations live as one serialized array under a single key. Every write
//! rewrites the whole collection, so two writers working from stale copies
//! lose each other's updates (last write wins). This is an accepted limitation
//! of a single-user store.

use dashmap::DashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::models::Conversation;

pub const CONVERSATIONS_KEY: &str = "polychat-conversations";
/// Conversations kept after a quota failure.
pub const RETENTION: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage quota exceeded ({needed} bytes needed, {limit} allowed)")]
    QuotaExceeded { needed: usize, limit: usize },
    #[error("storage I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// String values under string keys, like a browser's local storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process store with an optional byte quota over all values.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<String, String>,
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            values: DashMap::new(),
            quota: Some(quota),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if let Some(limit) = self.quota {
            let others: usize = self
                .values
                .iter()
                .filter(|entry| entry.key() != key)
                .map(|entry| entry.value().len())
                .sum();
            let needed = others + value.len();
            if needed > limit {
                return Err(StoreError::QuotaExceeded { needed, limit });
            }
        }
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }
}

/// One `<key>.json` file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        log::info!("Using local store at {}", dir.display());
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        // Write aside and rename so a crash never leaves half a file behind.
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        fs::write(&tmp, value)?;
        fs::rename(&tmp, self.path(key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path(key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// The conversation collection on top of a [`KeyValueStore`].
#[derive(Clone)]
pub struct ConversationStore {
    kv: Arc<dyn KeyValueStore>,
}

impl ConversationStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// All conversations, most recently updated first.
    pub fn list(&self) -> Vec<Conversation> {
        let mut conversations = self.load_all();
        sort_recent_first(&mut conversations);
        conversations
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.load_all().into_iter().find(|c| c.id == id)
    }

    pub fn create(&self, conversation: Conversation) -> Conversation {
        let mut conversations = self.load_all();
        conversations.retain(|c| c.id != conversation.id);
        conversations.insert(0, conversation.clone());
        self.save_all(conversations);
        conversation
    }

    /// Replaces the stored copy, or inserts it when missing.
    pub fn update(&self, conversation: &Conversation) {
        let mut conversations = self.load_all();
        match conversations.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation.clone(),
            None => conversations.insert(0, conversation.clone()),
        }
        self.save_all(conversations);
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut conversations = self.load_all();
        let before = conversations.len();
        conversations.retain(|c| c.id != id);
        if conversations.len() == before {
            return false;
        }
        self.save_all(conversations);
        true
    }

    pub fn clear(&self) {
        if let Err(e) = self.kv.remove(CONVERSATIONS_KEY) {
            log::error!("Failed to clear conversations: {:?}", e);
        }
    }

    fn load_all(&self) -> Vec<Conversation> {
        let raw = match self.kv.get(CONVERSATIONS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                log::error!("Failed to read conversations: {:?}", e);
                return Vec::new();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            log::error!("Stored conversations are unreadable, starting empty: {}", e);
            Vec::new()
        })
    }

    fn save_all(&self, mut conversations: Vec<Conversation>) {
        match self.write(&conversations) {
            Ok(()) => {}
            Err(StoreError::QuotaExceeded { needed, limit }) => {
                log::warn!(
                    "Local store quota exceeded ({} > {} bytes), keeping the {} most recent conversations",
                    needed,
                    limit,
                    RETENTION
                );
                sort_recent_first(&mut conversations);
                conversations.truncate(RETENTION);
                if let Err(e) = self.write(&conversations) {
                    log::error!("Failed to save conversations after trimming: {:?}", e);
                }
            }
            Err(e) => log::error!("Failed to save conversations: {:?}", e),
        }
    }

    fn write(&self, conversations: &[Conversation]) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(conversations)
            .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        self.kv.set(CONVERSATIONS_KEY, &serialized)
    }
}

fn sort_recent_first(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}
