use std::path::PathBuf;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Every field has a workable default so the client runs against a local
/// backend with no `.env` at all.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    /// Overrides the session credential path (used by tests and scripts).
    pub session_file: Option<PathBuf>,
    /// Variant toggles: the two historical app builds differed only in
    /// whether the subscribe page and share links existed.
    pub enable_subscribe: bool,
    pub enable_sharing: bool,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            api_base_url: std::env::var("API_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:5000".to_string())
                .trim_end_matches('/')
                .to_string(),
            request_timeout_secs: std::env::var("REQUEST_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse::<u64>()
                .context("REQUEST_TIMEOUT_SECS must be a number of seconds")?,
            session_file: std::env::var("CAMPUSNOTES_SESSION_FILE")
                .ok()
                .map(PathBuf::from),
            enable_subscribe: env_flag("CAMPUSNOTES_ENABLE_SUBSCRIBE", true),
            enable_sharing: env_flag("CAMPUSNOTES_ENABLE_SHARING", false),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}
