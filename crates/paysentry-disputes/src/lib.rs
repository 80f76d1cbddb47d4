//! PaySentry Disputes - Contested transactions and fund recovery
//!
//! Two engines live here. The dispute manager owns dispute cases: filing,
//! evidence, status changes, resolution, and listener notification. The
//! recovery engine turns favorable resolutions into queued refund actions
//! and drives an external executor with retries.
//!
//! # Invariants
//!
//! 1. At most one non-closed dispute per transaction
//! 2. Closed disputes refuse further evidence and status changes
//! 3. `resolved_at` is set exactly when a dispute closes
//! 4. At most one recovery that is neither failed nor cancelled per dispute
//! 5. Invariant violations raise before any state is mutated

mod dispute;
mod recovery;

pub use dispute::{
    DisputeCase, DisputeError, DisputeEvidence, DisputeListener, DisputeManager, DisputeQuery,
    DisputeResult, DisputeStats, DisputeStatus, FileDisputeInput, LiabilityParty, Resolution,
};
pub use recovery::{
    RecoveryAction, RecoveryConfig, RecoveryEngine, RecoveryError, RecoveryResult, RecoveryStats,
    RecoveryStatus, RecoveryType, RefundExecutor, RefundOutcome,
};
