//! Error types shared across the PaySentry core.

use thiserror::Error;

/// Result type for PaySentry operations
pub type Result<T> = std::result::Result<T, PaySentryError>;

/// Errors raised by the foundation types
#[derive(Debug, Clone, Error)]
pub enum PaySentryError {
    /// Transaction amount must be strictly positive
    #[error("Invalid amount for transaction: {amount} (must be positive)")]
    InvalidAmount { amount: String },

    /// Attempted a status transition the lifecycle graph forbids
    #[error("Invalid status transition for {transaction_id}: {from} -> {to}")]
    InvalidStatusTransition {
        transaction_id: String,
        from: String,
        to: String,
    },

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_offender() {
        let err = PaySentryError::InvalidStatusTransition {
            transaction_id: "ps_1_abc".to_string(),
            from: "completed".to_string(),
            to: "pending".to_string(),
        };
        assert!(err.to_string().contains("ps_1_abc"));
    }
}
