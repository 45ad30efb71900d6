//! Pre-upload validation.
//!
//! An upload is only legal when it references a prior successful analysis of
//! the same bytes, with a well-formed identifier and a passing quality score.
//! All of these checks run locally and deterministically; a draft that fails
//! them never produces a network call.

use bytes::Bytes;

use crate::errors::AppError;

/// Quality score below which a note cannot be published.
pub const MIN_QUALITY_SCORE: f64 = 6.0;

/// Minimum title length, matching the server's field validation.
pub const MIN_TITLE_LEN: usize = 3;

const PDF_MAGIC: &[u8] = b"%PDF-";

/// A note the user wants to publish, before validation.
#[derive(Debug, Clone)]
pub struct NoteDraft {
    pub title: String,
    pub description: Option<String>,
    pub price: u32,
    pub file_name: String,
    pub file: Bytes,
}

/// A validated draft, carrying the analysis id that binds it to the scored
/// file. This is the only shape the gateway accepts for upload.
#[derive(Debug, Clone)]
pub struct NoteUpload {
    pub title: String,
    pub description: Option<String>,
    pub price: u32,
    pub file_name: String,
    pub file: Bytes,
    pub analysis_id: String,
}

/// Record of the most recent successful analysis. Valid for exactly one
/// upload attempt of the same bytes; the controller drops it once consumed.
#[derive(Debug, Clone)]
pub struct PendingAnalysis {
    pub analysis_id: String,
    pub digest: blake3::Hash,
    pub quality_score: f64,
}

/// Strict 24-lowercase-hex check for analysis identifiers.
pub fn is_valid_analysis_id(id: &str) -> bool {
    id.len() == 24 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Validates a draft against the pending analysis, returning the wire-ready
/// upload on success.
pub fn validate_draft(
    draft: &NoteDraft,
    pending: Option<&PendingAnalysis>,
) -> Result<NoteUpload, AppError> {
    if draft.title.trim().chars().count() < MIN_TITLE_LEN {
        return Err(AppError::Validation(
            "Title must be at least 3 characters".to_string(),
        ));
    }
    if draft.price == 0 {
        return Err(AppError::Validation(
            "Price must be a positive number".to_string(),
        ));
    }
    if !draft.file.starts_with(PDF_MAGIC) {
        return Err(AppError::Validation(
            "Only PDF files are allowed".to_string(),
        ));
    }

    let pending = pending.ok_or_else(|| {
        AppError::Validation("No successful analysis on record. Analyze the file first".to_string())
    })?;
    if blake3::hash(&draft.file) != pending.digest {
        return Err(AppError::Validation(
            "Analysis does not match this file. Re-run the analysis".to_string(),
        ));
    }
    if !is_valid_analysis_id(&pending.analysis_id) {
        return Err(AppError::Validation(
            "Analysis id is not a 24-character hex token".to_string(),
        ));
    }
    if pending.quality_score < MIN_QUALITY_SCORE {
        return Err(AppError::Validation(format!(
            "Quality score {:.1} is below the publishing threshold of {MIN_QUALITY_SCORE}",
            pending.quality_score
        )));
    }

    Ok(NoteUpload {
        title: draft.title.clone(),
        description: draft.description.clone(),
        price: draft.price,
        file_name: draft.file_name.clone(),
        file: draft.file.clone(),
        analysis_id: pending.analysis_id.clone(),
    })
}
