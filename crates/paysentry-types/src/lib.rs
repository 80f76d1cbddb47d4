//! PaySentry Types - Foundation types for the payment control plane
//!
//! This crate holds the types every other PaySentry crate builds on:
//! transactions and their lifecycle graph, opaque identifiers, the glob
//! matcher used by policy conditions, and budget window keys.
//!
//! # Invariants
//!
//! 1. Transaction ids are unique within the process lifetime
//! 2. Transaction amounts are strictly positive
//! 3. `created_at <= updated_at`
//! 4. Status transitions follow the lifecycle graph
//! 5. Transaction metadata is frozen after construction

mod error;
mod glob;
mod id;
mod transaction;
mod window;

pub use error::{PaySentryError, Result};
pub use glob::glob_match;
pub use id::{generate_id, prefix};
pub use transaction::{
    PaymentProtocol, Transaction, TransactionBuilder, TransactionStatus,
};
pub use window::{iso_millis, BudgetWindow};
