//! PaySentry Gateway - Policy-gated wrapper around a payment facilitator
//!
//! The gateway sits between an agent and an external facilitator client.
//! Every `verify` passes through the policy engine before the facilitator
//! is ever contacted; every `settle` flows through a per-operation circuit
//! breaker and feeds the spend ledger, the provenance log, the alert
//! evaluator, and (on success only) the policy engine's budget buckets.
//!
//! ```text
//! agent -> verify  -> policy -> breaker -> facilitator
//!       -> settle  ->           breaker -> facilitator -> ledger
//!                                                      -> provenance
//!                                                      -> alerts
//!                                                      -> budgets (success)
//! ```

mod adapter;
mod breaker;
mod error;
mod x402;

pub use adapter::{
    DefaultExtractor, FacilitatorClient, GatewayConfig, PaymentGateway, TransactionExtractor,
};
pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use error::{GatewayError, GatewayResult};
pub use x402::{
    transaction_key, PaymentPayload, PaymentRequirements, SettleResponse, SupportedKinds,
    VerifyResponse,
};
