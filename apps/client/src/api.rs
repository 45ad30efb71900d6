//! API Client — the single point of entry for all CampusNotes service calls.
//!
//! ARCHITECTURAL RULE: no other module may issue HTTP requests directly.
//! All network traffic MUST go through this module, so that status-code
//! mapping to the `AppError` taxonomy happens in exactly one place.
//!
//! Failed requests are never retried silently; the user re-triggers the
//! action. The only resilience applied here is the per-request timeout from
//! configuration.

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::errors::AppError;
use crate::models::analysis::{AnalysesPurchase, AnalyzeResponse};
use crate::models::note::Note;
use crate::models::transaction::Transaction;
use crate::models::user::UserProfile;
use crate::upload::NoteUpload;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileUrlResponse {
    file_url: String,
}

#[derive(Debug, Deserialize)]
struct AnswerResponse {
    answer: String,
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    #[serde(rename = "_id")]
    id: String,
}

#[derive(Debug, Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct SignupRequest<'a> {
    name: &'a str,
    email: &'a str,
    password: &'a str,
}

/// The HTTP client used by every command and by the access controller's
/// gateway implementation.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
                .build()
                .expect("Failed to build HTTP client"),
            base_url: config.api_base_url.clone(),
        }
    }

    pub async fn signup(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<String, AppError> {
        let response = self
            .client
            .post(self.url("/api/auth/signup"))
            .json(&SignupRequest {
                name,
                email,
                password,
            })
            .send()
            .await?;
        Ok(Self::parse::<TokenResponse>(response).await?.token)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<String, AppError> {
        let response = self
            .client
            .post(self.url("/api/auth/login"))
            .json(&Credentials { email, password })
            .send()
            .await?;
        Ok(Self::parse::<TokenResponse>(response).await?.token)
    }

    /// Always acks on the server side; the caller shows the same message
    /// whether or not the address exists.
    pub async fn forgot_password(&self, email: &str) -> Result<(), AppError> {
        let response = self
            .client
            .post(self.url("/api/auth/forgot-password"))
            .json(&serde_json::json!({ "email": email }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn me(&self, token: &str) -> Result<UserProfile, AppError> {
        let response = self
            .client
            .get(self.url("/api/auth/me"))
            .bearer_auth(token)
            .send()
            .await?;
        Self::parse(response).await
    }

    pub async fn list_notes(&self, token: Option<&str>) -> Result<Vec<Note>, AppError> {
        let request = self.client.get(self.url("/api/notes"));
        let response = maybe_bearer(request, token).send().await?;
        Self::parse(response).await
    }

    pub async fn note(&self, token: Option<&str>, note_id: &str) -> Result<Note, AppError> {
        let request = self.client.get(self.url(&format!("/api/notes/{note_id}")));
        let response = maybe_bearer(request, token).send().await?;
        Self::parse(response).await
    }

    pub async fn purchase_note(&self, token: &str, note_id: &str) -> Result<(), AppError> {
        let response = self
            .client
            .post(self.url(&format!("/api/notes/{note_id}/purchase")))
            .bearer_auth(token)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// GET on the purchase route resolves the content locator for a note the
    /// caller already owns.
    pub async fn file_url(&self, token: &str, note_id: &str) -> Result<String, AppError> {
        let response = self
            .client
            .get(self.url(&format!("/api/notes/{note_id}/purchase")))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(Self::parse::<FileUrlResponse>(response).await?.file_url)
    }

    pub async fn analyze(
        &self,
        token: &str,
        file_name: &str,
        file: Bytes,
        title: &str,
    ) -> Result<AnalyzeResponse, AppError> {
        let part = Part::bytes(file.to_vec())
            .file_name(file_name.to_string())
            .mime_str("application/pdf")?;
        let form = Form::new().text("title", title.to_string()).part("file", part);
        let response = self
            .client
            .post(self.url("/api/notes/analyze"))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        Self::parse(response).await
    }

    /// The analyze route doubles as the pack-purchase endpoint when flagged
    /// with `purchaseOnly`.
    pub async fn purchase_analyses(&self, token: &str) -> Result<AnalysesPurchase, AppError> {
        let form = Form::new()
            .text("title", "Purchase Analyses")
            .text("purchaseOnly", "true");
        let response = self
            .client
            .post(self.url("/api/notes/analyze"))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        Self::parse(response).await
    }

    pub async fn upload_note(&self, token: &str, upload: NoteUpload) -> Result<String, AppError> {
        let part = Part::bytes(upload.file.to_vec())
            .file_name(upload.file_name.clone())
            .mime_str("application/pdf")?;
        let form = Form::new()
            .text("title", upload.title)
            .text("description", upload.description.unwrap_or_default())
            .text("price", upload.price.to_string())
            .text("analysisId", upload.analysis_id)
            .part("file", part);
        let response = self
            .client
            .post(self.url("/api/notes/upload"))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        Ok(Self::parse::<CreatedResponse>(response).await?.id)
    }

    pub async fn ask(
        &self,
        token: &str,
        note_id: &str,
        question: &str,
    ) -> Result<String, AppError> {
        let response = self
            .client
            .post(self.url(&format!("/api/notes/{note_id}/ask")))
            .bearer_auth(token)
            .json(&serde_json::json!({ "question": question }))
            .send()
            .await?;
        Ok(Self::parse::<AnswerResponse>(response).await?.answer)
    }

    pub async fn transactions(&self, token: &str) -> Result<Vec<Transaction>, AppError> {
        let response = self
            .client
            .get(self.url("/api/transactions/history"))
            .bearer_auth(token)
            .send()
            .await?;
        Self::parse(response).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, AppError> {
        let response = Self::check(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Converts a non-success response into a typed error, preferring the
    /// server's `{"error": "..."}` body over raw text.
    async fn check(response: Response) -> Result<Response, AppError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        debug!("request failed: status={status} message={message}");
        Err(map_failure(status.as_u16(), message))
    }
}

fn maybe_bearer(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(t) => request.bearer_auth(t),
        None => request,
    }
}

/// Status-code mapping onto the error taxonomy. A 402 is a quota exhaustion
/// only when the server's message says so; otherwise it is a balance failure,
/// which must not trigger the purchase-prompt path.
fn map_failure(status: u16, message: String) -> AppError {
    match status {
        401 => AppError::Unauthorized,
        402 | 403 if is_quota_message(&message) => AppError::QuotaExhausted,
        402 => AppError::InsufficientBalance(message),
        403 => AppError::AccessDenied(message),
        404 => AppError::NotFound(message),
        400 | 422 => AppError::Validation(message),
        _ => AppError::Api { status, message },
    }
}

fn is_quota_message(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("quota") || m.contains("analyses remaining") || m.contains("no analyses")
}
