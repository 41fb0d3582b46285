use std::sync::Arc;

use super::store::{KeyValueStore, StoreError};
use crate::registry::{self, DEFAULT_MODEL, DEFAULT_PROVIDER};

pub const PROVIDER_KEY: &str = "polychat-provider";
pub const MODEL_KEY: &str = "polychat-model";

/// The provider/model pair new turns are sent with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub provider: String,
    pub model: String,
}

impl Selection {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl Default for Selection {
    fn default() -> Self {
        Self::new(DEFAULT_PROVIDER, DEFAULT_MODEL)
    }
}

/// Loads and saves the last selection. Nothing is cached between calls.
#[derive(Clone)]
pub struct Settings {
    kv: Arc<dyn KeyValueStore>,
}

impl Settings {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// The saved selection, or the default when it is missing or no longer offered.
    pub fn load(&self) -> Selection {
        let read = |key: &str| match self.kv.get(key) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Failed to read setting {}: {:?}", key, e);
                None
            }
        };
        match (read(PROVIDER_KEY), read(MODEL_KEY)) {
            (Some(provider), Some(model)) if registry::is_known_model(&provider, &model) => {
                Selection { provider, model }
            }
            (None, None) => Selection::default(),
            (provider, model) => {
                log::warn!(
                    "Saved selection {:?}/{:?} is not available, using the default",
                    provider,
                    model
                );
                Selection::default()
            }
        }
    }

    pub fn save(&self, selection: &Selection) -> Result<(), StoreError> {
        self.kv.set(PROVIDER_KEY, &selection.provider)?;
        self.kv.set(MODEL_KEY, &selection.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::store::MemoryStore;

    fn settings() -> (Arc<MemoryStore>, Settings) {
        let kv = Arc::new(MemoryStore::new());
        (kv.clone(), Settings::new(kv))
    }

    #[test]
    fn defaults_when_nothing_saved() {
        let (_, settings) = settings();
        assert_eq!(settings.load(), Selection::new("openai", "gpt-4o-mini"));
    }

    #[test]
    fn saved_selection_is_restored() {
        let (_, settings) = settings();
        let selection = Selection::new("google", "gemini-2.0-flash");
        settings.save(&selection).unwrap();
        assert_eq!(settings.load(), selection);
    }

    #[test]
    fn unknown_saved_model_falls_back() {
        let (kv, settings) = settings();
        kv.set(PROVIDER_KEY, "openai").unwrap();
        kv.set(MODEL_KEY, "gpt-2").unwrap();
        assert_eq!(settings.load(), Selection::default());
    }
}
