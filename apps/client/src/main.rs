mod access;
mod api;
mod auth;
mod cli;
mod config;
mod errors;
mod models;
mod state;
mod upload;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::access::AccessController;
use crate::api::ApiClient;
use crate::auth::SessionStore;
use crate::cli::Cli;
use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Load configuration first (falls back to defaults without a .env)
    let config = Config::from_env()?;

    // Initialize structured logging on stderr so command output stays clean
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    debug!(
        "CampusNotes client v{} -> {}",
        env!("CARGO_PKG_VERSION"),
        config.api_base_url
    );

    let api = ApiClient::new(&config);
    let store = SessionStore::open(config.session_file.clone())?;
    let controller = AccessController::new(Arc::new(api.clone()), store)?;

    let state = AppState {
        config,
        api,
        controller,
    };

    cli::run(state, args).await
}
