use serde::{Deserialize, Serialize};

/// Server-reported facts about the session subject. Mutated only by
/// re-fetching from `/api/auth/me`; the client never computes these locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub credits: u32,
    #[serde(default)]
    pub is_premium: bool,
    /// Resets on a server-controlled period; absent means a fresh allowance.
    #[serde(default = "free_pool_default")]
    pub free_analyses_remaining: u8,
    #[serde(default)]
    pub purchased_analyses_remaining: u32,
}

fn free_pool_default() -> u8 {
    3
}
