use serde::{Deserialize, Serialize};

/// An uploaded document's metadata as the catalog reports it.
/// `has_access` is scoped to the requesting user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: u32,
    #[serde(default)]
    pub uploader: Option<Uploader>,
    #[serde(default)]
    pub has_access: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Uploader {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
}

/// One question/answer exchange in a note view.
/// Transcripts are in-memory and ordered by insertion; they do not survive
/// the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub question: String,
    pub answer: String,
}
