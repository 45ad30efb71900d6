// Access/Quota Controller.
// Owns the client-side belief about (a) whether the current user may view a
// note's file and (b) how many AI analyses remain before payment is required.
// Every state change routes through the controller's single reducer so
// concurrent completions cannot interleave into an inconsistent combination
// of counters.

pub mod controller;
pub mod gateway;
pub mod quota;

// Re-export the public API consumed by the CLI.
pub use controller::{
    AccessController, AnalysisReport, AnalyzeOutcome, NoteAccessState, NoteView,
    PackPurchaseReceipt, PurchaseOutcome,
};
pub use gateway::MarketGateway;
pub use quota::{PackOffer, PoolCounts, QuotaFlow};
