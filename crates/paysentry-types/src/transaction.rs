//! Transaction model and lifecycle graph.
//!
//! A transaction is the canonical in-memory record of one proposed agent
//! payment. Recipients, currencies, and service tags are opaque strings;
//! the control plane never interprets them beyond equality and glob
//! matching.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{PaySentryError, Result};
use crate::id::{generate_id, prefix};

/// Payment protocol a transaction travels over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentProtocol {
    /// HTTP-402 micropayments
    #[serde(rename = "x402")]
    X402,
    /// Agent commerce protocols
    AgentCommerce,
    /// Agent-to-agent mandated transfers
    AgentMandate,
    /// Card rails
    Card,
    /// Anything else
    Custom,
}

impl std::fmt::Display for PaymentProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::X402 => "x402",
            Self::AgentCommerce => "agent_commerce",
            Self::AgentMandate => "agent_mandate",
            Self::Card => "card",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Status of a transaction in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created, awaiting a policy decision
    Pending,
    /// Policy allowed the payment
    Approved,
    /// Policy denied the payment (terminal)
    Rejected,
    /// Handed to the facilitator
    Executing,
    /// Settled successfully
    Completed,
    /// Settlement failed
    Failed,
    /// Under dispute
    Disputed,
    /// Funds returned (terminal)
    Refunded,
}

impl TransactionStatus {
    /// Whether the lifecycle graph permits moving from `self` to `next`.
    ///
    /// The graph: pending -> {approved, rejected}; approved -> executing;
    /// executing -> {completed, failed}; completed -> {disputed, refunded};
    /// failed -> disputed; disputed -> {refunded, completed}.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Executing)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Completed, Disputed)
                | (Completed, Refunded)
                | (Failed, Disputed)
                | (Disputed, Refunded)
                | (Disputed, Completed)
        )
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Refunded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Disputed => "disputed",
            Self::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment proposed or executed by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique id (`ps_<hex-ms>_<suffix>`)
    pub id: String,
    /// Initiating agent
    pub agent_id: String,
    /// Recipient URI, address, or merchant handle (opaque)
    pub recipient: String,
    /// Amount, strictly positive
    pub amount: Decimal,
    /// Currency code (opaque)
    pub currency: String,
    /// Free-text purpose
    pub purpose: String,
    /// Payment protocol
    pub protocol: PaymentProtocol,
    /// Lifecycle status
    pub status: TransactionStatus,
    /// Optional service tag
    pub service_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last status/amount mutation time
    pub updated_at: DateTime<Utc>,
    /// Protocol-native transaction id, set after settlement
    pub protocol_tx_id: Option<String>,
    /// Frozen after construction; read through [`Transaction::metadata`]
    metadata: HashMap<String, String>,
}

impl Transaction {
    /// Start building a transaction. `build` validates the amount and
    /// stamps id, timestamps, and the `Pending` status.
    pub fn builder(
        agent_id: impl Into<String>,
        recipient: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
    ) -> TransactionBuilder {
        TransactionBuilder {
            agent_id: agent_id.into(),
            recipient: recipient.into(),
            amount,
            currency: currency.into(),
            purpose: String::new(),
            protocol: PaymentProtocol::Custom,
            service_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Metadata supplied at construction. Immutable afterwards.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Move to `next`, stamping `updated_at`. Fails without mutating when
    /// the lifecycle graph forbids the transition.
    pub fn set_status(&mut self, next: TransactionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PaySentryError::InvalidStatusTransition {
                transaction_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record the protocol-native tx id, stamping `updated_at`.
    pub fn set_protocol_tx_id(&mut self, tx_id: impl Into<String>) {
        self.protocol_tx_id = Some(tx_id.into());
        self.updated_at = Utc::now();
    }
}

/// Builder for [`Transaction`]
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    agent_id: String,
    recipient: String,
    amount: Decimal,
    currency: String,
    purpose: String,
    protocol: PaymentProtocol,
    service_id: Option<String>,
    metadata: HashMap<String, String>,
}

impl TransactionBuilder {
    pub fn purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }

    pub fn protocol(mut self, protocol: PaymentProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn metadata_entry(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validate and construct. The amount must be strictly positive.
    pub fn build(self) -> Result<Transaction> {
        if self.amount <= Decimal::ZERO {
            return Err(PaySentryError::InvalidAmount {
                amount: self.amount.to_string(),
            });
        }
        let now = Utc::now();
        Ok(Transaction {
            id: generate_id(prefix::TRANSACTION),
            agent_id: self.agent_id,
            recipient: self.recipient,
            amount: self.amount,
            currency: self.currency,
            purpose: self.purpose,
            protocol: self.protocol,
            status: TransactionStatus::Pending,
            service_id: self.service_id,
            created_at: now,
            updated_at: now,
            protocol_tx_id: None,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tx() -> Transaction {
        Transaction::builder("agent-1", "merchant.example/pay", dec!(10), "USDC")
            .purpose("api call")
            .protocol(PaymentProtocol::X402)
            .service_id("svc-search")
            .metadata_entry("tier", "gold")
            .build()
            .unwrap()
    }

    #[test]
    fn build_stamps_id_status_and_times() {
        let t = tx();
        assert!(t.id.starts_with("ps_"));
        assert_eq!(t.status, TransactionStatus::Pending);
        assert!(t.created_at <= t.updated_at);
        assert_eq!(t.metadata().get("tier"), Some(&"gold".to_string()));
    }

    #[test]
    fn zero_or_negative_amount_is_rejected() {
        let res = Transaction::builder("a", "r", dec!(0), "USDC").build();
        assert!(matches!(res, Err(PaySentryError::InvalidAmount { .. })));
        let res = Transaction::builder("a", "r", dec!(-3), "USDC").build();
        assert!(res.is_err());
    }

    #[test]
    fn lifecycle_graph_is_enforced() {
        let mut t = tx();
        t.set_status(TransactionStatus::Approved).unwrap();
        t.set_status(TransactionStatus::Executing).unwrap();
        t.set_status(TransactionStatus::Completed).unwrap();
        // completed -> pending is not an edge
        let before = t.updated_at;
        let err = t.set_status(TransactionStatus::Pending);
        assert!(err.is_err());
        assert_eq!(t.status, TransactionStatus::Completed);
        assert_eq!(t.updated_at, before);
    }

    #[test]
    fn dispute_resolution_paths() {
        let mut t = tx();
        t.set_status(TransactionStatus::Approved).unwrap();
        t.set_status(TransactionStatus::Executing).unwrap();
        t.set_status(TransactionStatus::Failed).unwrap();
        t.set_status(TransactionStatus::Disputed).unwrap();
        // Denied resolution returns the transaction to completed.
        t.set_status(TransactionStatus::Completed).unwrap();
        t.set_status(TransactionStatus::Refunded).unwrap();
        assert!(t.status.is_terminal());
    }

    #[test]
    fn rejected_is_terminal() {
        let mut t = tx();
        t.set_status(TransactionStatus::Rejected).unwrap();
        assert!(t.status.is_terminal());
        assert!(t.set_status(TransactionStatus::Approved).is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TransactionStatus::Executing).unwrap();
        assert_eq!(json, "\"executing\"");
        let proto = serde_json::to_string(&PaymentProtocol::X402).unwrap();
        assert_eq!(proto, "\"x402\"");
    }
}
