//! Static table of supported providers and their models.
//!
//! Availability is never stored here: it is derived from a
//! [`CredentialSource`] every time it is asked for.

use crate::config::CredentialSource;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// The closed set of backends this build knows how to talk to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        })
    }
}

#[derive(Debug)]
pub struct ModelSpec {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct ProviderSpec {
    pub kind: ProviderKind,
    pub id: &'static str,
    pub name: &'static str,
    /// Environment variable holding the API key.
    pub env_key: &'static str,
    pub models: &'static [ModelSpec],
}

impl ProviderSpec {
    pub fn find_model(&self, model_id: &str) -> Option<&'static ModelSpec> {
        self.models.iter().find(|m| m.id == model_id)
    }

    pub fn is_available(&self, credentials: &dyn CredentialSource) -> bool {
        credentials
            .get(self.env_key)
            .is_some_and(|key| !key.trim().is_empty())
    }
}

pub static PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        kind: ProviderKind::OpenAi,
        id: "openai",
        name: "OpenAI",
        env_key: "OPENAI_API_KEY",
        models: &[
            ModelSpec {
                id: "gpt-4o",
                name: "GPT-4o",
                description: "Most capable OpenAI model",
            },
            ModelSpec {
                id: "gpt-4o-mini",
                name: "GPT-4o Mini",
                description: "Fast and affordable",
            },
        ],
    },
    ProviderSpec {
        kind: ProviderKind::Anthropic,
        id: "anthropic",
        name: "Anthropic",
        env_key: "ANTHROPIC_API_KEY",
        models: &[
            ModelSpec {
                id: "claude-sonnet-4-20250514",
                name: "Claude Sonnet 4",
                description: "Most capable Claude model",
            },
            ModelSpec {
                id: "claude-3-5-haiku-20241022",
                name: "Claude 3.5 Haiku",
                description: "Fast and efficient",
            },
        ],
    },
    ProviderSpec {
        kind: ProviderKind::Google,
        id: "google",
        name: "Google",
        env_key: "GOOGLE_GENERATIVE_AI_API_KEY",
        models: &[
            ModelSpec {
                id: "gemini-2.0-flash",
                name: "Gemini 2.0 Flash",
                description: "Latest Gemini model",
            },
            ModelSpec {
                id: "gemini-2.0-flash-lite",
                name: "Gemini 2.0 Flash Lite",
                description: "Lightweight and fast",
            },
        ],
    },
];

pub fn find_provider(provider_id: &str) -> Option<&'static ProviderSpec> {
    PROVIDERS.iter().find(|p| p.id == provider_id)
}

/// True when the pair names a registered provider and one of its models.
pub fn is_known_model(provider_id: &str, model_id: &str) -> bool {
    find_provider(provider_id).is_some_and(|p| p.find_model(model_id).is_some())
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelListing {
    pub id: String,
    pub name: String,
    pub provider_id: String,
    pub description: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderListing {
    pub id: String,
    pub name: String,
    pub available: bool,
    pub models: Vec<ModelListing>,
}

/// Every provider with a live availability flag, for `GET /api/models`.
pub fn listing(credentials: &dyn CredentialSource) -> Vec<ProviderListing> {
    PROVIDERS
        .iter()
        .map(|provider| ProviderListing {
            id: provider.id.to_string(),
            name: provider.name.to_string(),
            available: provider.is_available(credentials),
            models: provider
                .models
                .iter()
                .map(|model| ModelListing {
                    id: model.id.to_string(),
                    name: model.name.to_string(),
                    provider_id: provider.id.to_string(),
                    description: model.description.to_string(),
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticCredentials;

    #[test]
    fn default_selection_is_registered() {
        assert!(is_known_model(DEFAULT_PROVIDER, DEFAULT_MODEL));
    }

    #[test]
    fn provider_ids_match_kind_names() {
        for provider in PROVIDERS {
            assert_eq!(provider.kind.to_string(), provider.id);
        }
    }

    #[test]
    fn listing_marks_availability_per_credential() {
        let credentials = StaticCredentials::new([("ANTHROPIC_API_KEY", "sk-ant")]);
        let providers = listing(&credentials);
        assert_eq!(providers.len(), 3);
        let available: Vec<_> = providers
            .iter()
            .filter(|p| p.available)
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(available, vec!["anthropic"]);
        assert!(providers
            .iter()
            .flat_map(|p| p.models.iter().map(move |m| (p, m)))
            .all(|(p, m)| m.provider_id == p.id));
    }

    #[test]
    fn blank_credential_is_unavailable() {
        let credentials = StaticCredentials::new([("OPENAI_API_KEY", "   ")]);
        let openai = find_provider("openai").unwrap();
        assert!(!openai.is_available(&credentials));
    }

    #[test]
    fn unknown_pairs_are_rejected() {
        assert!(!is_known_model("openai", "claude-3-5-haiku-20241022"));
        assert!(!is_known_model("mistral", "large"));
    }
}
