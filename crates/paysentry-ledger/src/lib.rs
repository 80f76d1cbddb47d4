//! PaySentry Ledger - Spend tracking over the transaction stream
//!
//! The tracker owns the canonical copy of every transaction the control
//! plane has seen. Other components refer to transactions by id and look
//! them up here.
//!
//! # Invariants
//!
//! 1. An id appears at most once in the chronological list
//! 2. Secondary indices exactly mirror the primary map's field values
//! 3. Re-recording an id updates the stored value in place
//! 4. `record` happens-before any query returning that transaction

mod analytics;
mod tracker;

pub use analytics::{AnalyticsQuery, RecipientVolume, SpendAnalytics, SpendSummary};
pub use tracker::{SpendTracker, TransactionQuery};
