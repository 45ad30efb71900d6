use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use serde::Deserialize;

use crate::errors::AppError;

/// Identity claims carried in the bearer token payload.
///
/// Decoded without signature verification: the server is the verifier; the
/// client only needs the subject, display name, and expiry to render state
/// and to notice a dead session before issuing a request.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Unix timestamp, seconds.
    pub exp: i64,
}

/// A live session: the raw bearer credential plus its decoded claims.
/// Never mutated in place; replaced wholesale on login or refresh.
#[derive(Debug, Clone)]
pub struct Session {
    token: String,
    claims: Claims,
}

impl Session {
    pub fn from_token(token: &str) -> Result<Self, AppError> {
        let claims = decode_claims(token)?;
        Ok(Self {
            token: token.to_string(),
            claims,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn is_expired(&self) -> bool {
        self.claims.exp <= Utc::now().timestamp()
    }
}

fn decode_claims(token: &str) -> Result<Claims, AppError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => {
            return Err(AppError::Token(
                "expected three dot-separated segments".to_string(),
            ))
        }
    };
    let raw = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AppError::Token(format!("payload is not base64url: {e}")))?;
    serde_json::from_slice(&raw)
        .map_err(|e| AppError::Token(format!("payload is not a claims object: {e}")))
}

#[cfg(test)]
pub(crate) fn encode_token(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{header}.{payload}.sig")
}
