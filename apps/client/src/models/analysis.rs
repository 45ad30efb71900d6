use serde::{Deserialize, Serialize};

/// Response from scoring a candidate file. The pool counts it carries are
/// authoritative: the server decides which pool the analysis drew from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    /// 24 lowercase hex characters; binds the scored file to a later upload.
    pub analysis_id: String,
    /// Quality score in [0, 10].
    pub quality_score: f64,
    pub summary: String,
    pub free_analyses_remaining: u8,
    pub purchased_analyses_remaining: u32,
    #[serde(default)]
    pub credits: Option<u32>,
}

/// Response from buying an analysis pack. Credits and counts arrive in one
/// payload so the client can apply them atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysesPurchase {
    pub credits: u32,
    pub free_analyses_remaining: u8,
    pub purchased_analyses_remaining: u32,
}
