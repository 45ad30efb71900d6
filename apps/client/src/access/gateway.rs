//! The seam between the controller and the network.
//!
//! The controller never touches HTTP directly; it talks to a
//! `MarketGateway`, implemented by [`ApiClient`] in production and by a
//! scripted fake in tests. Carried as `Arc<dyn MarketGateway>`.

use async_trait::async_trait;
use bytes::Bytes;

use crate::api::ApiClient;
use crate::errors::AppError;
use crate::models::analysis::{AnalysesPurchase, AnalyzeResponse};
use crate::models::note::Note;
use crate::models::user::UserProfile;
use crate::upload::NoteUpload;

#[async_trait]
pub trait MarketGateway: Send + Sync {
    async fn fetch_profile(&self, token: &str) -> Result<UserProfile, AppError>;

    async fn fetch_note(&self, token: Option<&str>, note_id: &str) -> Result<Note, AppError>;

    async fn purchase_note(&self, token: &str, note_id: &str) -> Result<(), AppError>;

    /// Resolves the opaque content locator for a purchased note.
    async fn fetch_file_url(&self, token: &str, note_id: &str) -> Result<String, AppError>;

    async fn analyze_file(
        &self,
        token: &str,
        file_name: &str,
        file: Bytes,
        title: &str,
    ) -> Result<AnalyzeResponse, AppError>;

    async fn purchase_analyses(&self, token: &str) -> Result<AnalysesPurchase, AppError>;

    /// Returns the created note id.
    async fn upload_note(&self, token: &str, upload: NoteUpload) -> Result<String, AppError>;

    async fn ask_question(
        &self,
        token: &str,
        note_id: &str,
        question: &str,
    ) -> Result<String, AppError>;
}

#[async_trait]
impl MarketGateway for ApiClient {
    async fn fetch_profile(&self, token: &str) -> Result<UserProfile, AppError> {
        ApiClient::me(self, token).await
    }

    async fn fetch_note(&self, token: Option<&str>, note_id: &str) -> Result<Note, AppError> {
        ApiClient::note(self, token, note_id).await
    }

    async fn purchase_note(&self, token: &str, note_id: &str) -> Result<(), AppError> {
        ApiClient::purchase_note(self, token, note_id).await
    }

    async fn fetch_file_url(&self, token: &str, note_id: &str) -> Result<String, AppError> {
        ApiClient::file_url(self, token, note_id).await
    }

    async fn analyze_file(
        &self,
        token: &str,
        file_name: &str,
        file: Bytes,
        title: &str,
    ) -> Result<AnalyzeResponse, AppError> {
        ApiClient::analyze(self, token, file_name, file, title).await
    }

    async fn purchase_analyses(&self, token: &str) -> Result<AnalysesPurchase, AppError> {
        ApiClient::purchase_analyses(self, token).await
    }

    async fn upload_note(&self, token: &str, upload: NoteUpload) -> Result<String, AppError> {
        ApiClient::upload_note(self, token, upload).await
    }

    async fn ask_question(
        &self,
        token: &str,
        note_id: &str,
        question: &str,
    ) -> Result<String, AppError> {
        ApiClient::ask(self, token, note_id, question).await
    }
}
