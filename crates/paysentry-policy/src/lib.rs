//! PaySentry Policy - Deterministic spend policy evaluation
//!
//! The engine evaluates transactions against declarative policies: budget
//! limits over time windows, per-agent cooldowns, and ordered condition
//! rules. Decisions are pure functions of the loaded policies, the bucket
//! state, the cooldown table, and the clock reading; there is no
//! probabilistic or learned logic anywhere in the decision path.
//!
//! # Evaluation order (per enabled policy)
//!
//! 1. Budget check - first violated budget denies
//! 2. Cooldown check - remaining milliseconds reported in the decision
//! 3. Rule scan - enabled rules by ascending priority, first match fires,
//!    default allow
//!
//! Across policies the most restrictive decision wins
//! (`deny < require_approval < flag < allow`).

mod engine;
mod model;

pub use engine::{BudgetBucket, CurrentSpend, PolicyDecision, PolicyEngine};
pub use model::{
    BudgetLimit, PolicyError, PolicyRule, Result, RuleAction, RuleConditions, SpendPolicy,
};
