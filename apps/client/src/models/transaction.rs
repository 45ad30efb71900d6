use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A ledger line from the credit history. Positive amounts are earnings,
/// negative amounts are debits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(rename = "_id")]
    pub id: String,
    pub amount: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}
