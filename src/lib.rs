// Declare the modules
pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod models;
pub mod registry;
pub mod resolver;
pub mod routes;
pub mod state;
pub mod storage;

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::api::HttpBackend;
use crate::config::{Cli, Command, EnvCredentials, ServerConfig};
use crate::state::AppState;
use crate::storage::StorageManager;

pub async fn run() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        None => serve(cli.server).await,
        Some(Command::Serve(config)) => serve(config).await,
        Some(Command::Chat(config)) => client::repl::run(config).await,
        Some(Command::SetKey { env_key }) => {
            let mut key = String::new();
            tokio::io::stdin()
                .read_to_string(&mut key)
                .await
                .context("Failed to read the API key from stdin")?;
            if key.trim().is_empty() {
                anyhow::bail!("No API key given on stdin");
            }
            config::set_api_key_in_keyring(&env_key, &key)?;
            println!("Stored {} in the OS keyring", env_key);
            Ok(())
        }
    }
}

/// Builds the shared state from configuration: database, backend, credentials.
pub async fn build_state(config: &ServerConfig) -> anyhow::Result<AppState> {
    let storage = match &config.database_url {
        Some(url) => Some(StorageManager::connect(url).await?),
        None => {
            log::info!("No DATABASE_URL configured, conversation persistence is disabled");
            None
        }
    };

    Ok(AppState::new(
        storage,
        Arc::new(HttpBackend::new(config.endpoints())),
        Arc::new(EnvCredentials::new(config.use_keyring)),
        config.stream_limits(),
    ))
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let state = build_state(&config).await?;
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    log::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {:?}", e);
            }
            log::info!("Shutting down");
        })
        .await
        .context("Server error")
}
