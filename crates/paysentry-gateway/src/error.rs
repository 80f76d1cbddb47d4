//! Gateway error types.

use thiserror::Error;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway errors
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The circuit breaker for `key` is open. Carries the time until the
    /// next probe is admitted; the adapter propagates this unchanged.
    #[error("Circuit breaker open for {key}; retry in {remaining_ms}ms")]
    BreakerOpen { key: String, remaining_ms: u64 },

    /// The external facilitator failed or returned garbage
    #[error("Facilitator call failed: {message}")]
    Facilitator { message: String },

    /// The payment payload or requirements could not be turned into a
    /// transaction
    #[error("Invalid payment payload: {message}")]
    InvalidPayload { message: String },
}

impl GatewayError {
    pub fn facilitator(message: impl Into<String>) -> Self {
        Self::Facilitator {
            message: message.into(),
        }
    }

    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen { .. })
    }
}
