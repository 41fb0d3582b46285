use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use keyring::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// --- Command line ---

#[derive(Debug, Parser)]
#[command(name = "polychat", version, about = "Multi-provider streaming chat gateway")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Server options used when no subcommand is given.
    #[command(flatten)]
    pub server: ServerConfig,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP gateway.
    Serve(ServerConfig),
    /// Chat in the terminal against a running gateway.
    Chat(ClientConfig),
    /// Store a provider API key in the OS keyring, read from stdin.
    SetKey {
        /// Credential variable name, e.g. OPENAI_API_KEY.
        env_key: String,
    },
}

#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    #[arg(long, env = "POLYCHAT_BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    /// SQLite URL for the conversation mirror, e.g. sqlite://polychat.sqlite.
    /// Persistence and the conversation endpoints are disabled without it.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "POLYCHAT_MAX_OUTPUT_TOKENS", default_value_t = 4096)]
    pub max_output_tokens: u32,

    #[arg(long, env = "POLYCHAT_STREAM_IDLE_TIMEOUT_SECS", default_value_t = 120)]
    pub stream_idle_timeout_secs: u64,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    #[arg(long, env = "ANTHROPIC_BASE_URL", default_value = "https://api.anthropic.com")]
    pub anthropic_base_url: String,

    #[arg(
        long,
        env = "GOOGLE_BASE_URL",
        default_value = "https://generativelanguage.googleapis.com"
    )]
    pub google_base_url: String,

    /// Fall back to the OS keyring when a credential variable is unset.
    #[arg(long, env = "POLYCHAT_USE_KEYRING")]
    pub use_keyring: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            database_url: None,
            max_output_tokens: 4096,
            stream_idle_timeout_secs: 120,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            google_base_url: "https://generativelanguage.googleapis.com".to_string(),
            use_keyring: false,
        }
    }
}

impl ServerConfig {
    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            openai: self.openai_base_url.clone(),
            anthropic: self.anthropic_base_url.clone(),
            google: self.google_base_url.clone(),
        }
    }

    pub fn stream_limits(&self) -> StreamLimits {
        StreamLimits {
            max_output_tokens: self.max_output_tokens,
            idle_timeout: Duration::from_secs(self.stream_idle_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ClientConfig {
    #[arg(long, env = "POLYCHAT_SERVER", default_value = "http://127.0.0.1:3000")]
    pub server: String,

    /// Directory for the local conversation store and settings.
    #[arg(long, env = "POLYCHAT_DATA_DIR", default_value = ".polychat")]
    pub data_dir: PathBuf,

    #[arg(long, default_value_t = 120)]
    pub stall_timeout_secs: u64,
}

/// Base URLs of the upstream completion APIs.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub openai: String,
    pub anthropic: String,
    pub google: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        ServerConfig::default().endpoints()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    pub max_output_tokens: u32,
    /// Longest wait for the next upstream event before the stream counts as stalled.
    pub idle_timeout: Duration,
}

impl Default for StreamLimits {
    fn default() -> Self {
        ServerConfig::default().stream_limits()
    }
}

// --- API Key Retrieval ---

const KEYRING_SERVICE: &str = "polychat";

/// Where provider API keys come from. Read on every call, never cached.
pub trait CredentialSource: Send + Sync {
    fn get(&self, env_key: &str) -> Option<String>;
}

/// Process environment, optionally backed by the OS keyring.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials {
    keyring_fallback: bool,
}

impl EnvCredentials {
    pub fn new(keyring_fallback: bool) -> Self {
        Self { keyring_fallback }
    }
}

impl CredentialSource for EnvCredentials {
    fn get(&self, env_key: &str) -> Option<String> {
        if let Some(value) = std::env::var(env_key).ok().filter(|v| !v.trim().is_empty()) {
            return Some(value);
        }
        if !self.keyring_fallback {
            return None;
        }
        log::debug!("{} not set, checking keyring", env_key);
        match Entry::new(KEYRING_SERVICE, env_key).and_then(|entry| entry.get_password()) {
            Ok(value) => Some(value),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                log::warn!("Keyring lookup for {} failed: {}", env_key, e);
                None
            }
        }
    }
}

/// Fixed credentials, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    values: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new<K, V>(values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl CredentialSource for StaticCredentials {
    fn get(&self, env_key: &str) -> Option<String> {
        self.values.get(env_key).cloned()
    }
}

/// Stores an API key in the OS keyring under the given variable name.
pub fn set_api_key_in_keyring(env_key: &str, api_key: &str) -> Result<()> {
    if crate::registry::PROVIDERS.iter().all(|p| p.env_key != env_key) {
        anyhow::bail!("{} is not a credential variable of any known provider", env_key);
    }
    let entry = Entry::new(KEYRING_SERVICE, env_key)
        .context("Failed to create keyring entry for setting password")?;
    log::info!("Setting API key in keyring for {}", env_key);
    entry
        .set_password(api_key.trim())
        .with_context(|| format!("Failed to set API key in keyring for '{}'", env_key))?;

    // Stores without persistence (the in-memory mock) only remember the
    // value on the entry that wrote it, so read it back through a new one.
    let stored = Entry::new(KEYRING_SERVICE, env_key)
        .and_then(|entry| entry.get_password())
        .ok();
    if stored.as_deref() != Some(api_key.trim()) {
        anyhow::bail!(
            "The keyring did not keep the key for '{}'; no persistent OS credential store is available",
            env_key
        );
    }
    Ok(())
}
