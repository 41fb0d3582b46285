//! Turns a `(provider, model)` selection into a handle a backend can open a
//! stream with, or a configuration error an operator can act on.

use crate::config::CredentialSource;
use crate::registry::{self, ProviderKind};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("API key not configured for {provider}. Set {env_key} in your environment variables.")]
    MissingCredential {
        provider: &'static str,
        env_key: &'static str,
    },
    #[error("Unknown model \"{model}\" for provider \"{provider}\"")]
    UnknownModel {
        provider: &'static str,
        model: String,
    },
}

/// A validated provider/model pair together with the key to call it.
#[derive(Clone)]
pub struct ResolvedModel {
    pub provider: ProviderKind,
    pub model_id: &'static str,
    api_key: String,
}

impl ResolvedModel {
    pub fn new(provider: ProviderKind, model_id: &'static str, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            model_id,
            api_key: api_key.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for ResolvedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedModel")
            .field("provider", &self.provider)
            .field("model_id", &self.model_id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Validates provider, credential and model, in that order.
///
/// Pure apart from reading `credentials`, which happens on every call so a
/// newly exported key is picked up without a restart.
pub fn resolve(
    provider_id: &str,
    model_id: &str,
    credentials: &dyn CredentialSource,
) -> Result<ResolvedModel, ResolveError> {
    let provider = registry::find_provider(provider_id)
        .ok_or_else(|| ResolveError::UnknownProvider(provider_id.to_string()))?;

    let api_key = credentials
        .get(provider.env_key)
        .filter(|key| !key.trim().is_empty())
        .ok_or(ResolveError::MissingCredential {
            provider: provider.name,
            env_key: provider.env_key,
        })?;

    let model = provider
        .find_model(model_id)
        .ok_or_else(|| ResolveError::UnknownModel {
            provider: provider.name,
            model: model_id.to_string(),
        })?;

    Ok(ResolvedModel::new(provider.kind, model.id, api_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticCredentials;
    use crate::registry::PROVIDERS;

    fn all_keys() -> StaticCredentials {
        StaticCredentials::new(PROVIDERS.iter().map(|p| (p.env_key, format!("key-{}", p.id))))
    }

    #[test]
    fn every_registered_pair_resolves_with_credentials() {
        let credentials = all_keys();
        for provider in PROVIDERS {
            for model in provider.models {
                let resolved = resolve(provider.id, model.id, &credentials).unwrap();
                assert_eq!(resolved.provider, provider.kind);
                assert_eq!(resolved.model_id, model.id);
                assert_eq!(resolved.api_key(), format!("key-{}", provider.id));
            }
        }
    }

    #[test]
    fn every_pair_without_credential_names_the_variable() {
        let credentials = StaticCredentials::default();
        for provider in PROVIDERS {
            for model in provider.models {
                let err = resolve(provider.id, model.id, &credentials).unwrap_err();
                assert_eq!(
                    err,
                    ResolveError::MissingCredential {
                        provider: provider.name,
                        env_key: provider.env_key,
                    }
                );
                assert!(err.to_string().contains(provider.env_key));
            }
        }
    }

    #[test]
    fn unknown_provider_is_reported_first() {
        let err = resolve("mistral", "large", &all_keys()).unwrap_err();
        assert_eq!(err.to_string(), "Unknown provider: mistral");
    }

    #[test]
    fn unknown_model_names_provider() {
        let err = resolve("openai", "gpt-2", &all_keys()).unwrap_err();
        assert_eq!(err.to_string(), "Unknown model \"gpt-2\" for provider \"OpenAI\"");
    }

    #[test]
    fn whitespace_key_counts_as_missing() {
        let credentials = StaticCredentials::new([("GOOGLE_GENERATIVE_AI_API_KEY", " \n")]);
        let err = resolve("google", "gemini-2.0-flash", &credentials).unwrap_err();
        assert!(matches!(err, ResolveError::MissingCredential { .. }));
    }

    #[test]
    fn debug_output_redacts_key() {
        let resolved = resolve("openai", "gpt-4o", &all_keys()).unwrap();
        let rendered = format!("{resolved:?}");
        assert!(!rendered.contains("key-openai"));
        assert!(rendered.contains("<redacted>"));
    }
}
