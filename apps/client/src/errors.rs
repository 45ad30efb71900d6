use thiserror::Error;

/// Application-level error type.
/// Every failure a command can surface to the user maps onto one of these
/// variants; network-originating failures are never thrown raw across the
/// CLI boundary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Session expired. Please log in again.")]
    Unauthorized,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient CNX Token balance: {0}")]
    InsufficientBalance(String),

    #[error("Analysis quota exhausted")]
    QuotaExhausted,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("A {0} request is already in flight")]
    RequestPending(&'static str),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Session storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Malformed session token: {0}")]
    Token(String),
}
