//! The facilitator adapter: policy gate, breaker, observation hooks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, warn};

use paysentry_alerts::AlertEvaluator;
use paysentry_ledger::SpendTracker;
use paysentry_policy::PolicyEngine;
use paysentry_provenance::{ProvenanceLog, StageOutcome};
use paysentry_types::{PaymentProtocol, Transaction, TransactionStatus};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::error::{GatewayError, GatewayResult};
use crate::x402::{
    transaction_key, PaymentPayload, PaymentRequirements, SettleResponse, SupportedKinds,
    VerifyResponse,
};

/// External payment-protocol client. All three calls may suspend and may
/// fail; the gateway wraps `verify` and `settle` with its breaker.
#[async_trait::async_trait]
pub trait FacilitatorClient: Send + Sync {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> GatewayResult<VerifyResponse>;

    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> GatewayResult<SettleResponse>;

    async fn supported(&self) -> GatewayResult<SupportedKinds>;
}

/// Gateway tuning
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Breaker key prefix; operations gate on `<key>:verify` / `<key>:settle`
    pub facilitator_key: String,
    /// Currency assigned to derived transactions
    pub default_currency: String,
    /// Agent id used when the payload names no payer
    pub fallback_agent_id: String,
    /// Base-unit decimals per currency
    pub currency_decimals: HashMap<String, u32>,
    /// Decimals for currencies not listed above
    pub default_decimals: u32,
    /// Prefix on `invalidReason` when policy blocks a payment
    pub invalid_reason_prefix: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut currency_decimals = HashMap::new();
        currency_decimals.insert("USDC".to_string(), 6);
        currency_decimals.insert("ETH".to_string(), 18);
        Self {
            facilitator_key: "facilitator".to_string(),
            default_currency: "USDC".to_string(),
            fallback_agent_id: "unknown-agent".to_string(),
            currency_decimals,
            default_decimals: 6,
            invalid_reason_prefix: "Payment blocked by policy".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn decimals_for(&self, currency: &str) -> u32 {
        self.currency_decimals
            .get(currency)
            .copied()
            .unwrap_or(self.default_decimals)
    }
}

/// Derives an internal [`Transaction`] from a wire pair.
pub trait TransactionExtractor: Send + Sync {
    fn extract(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
        config: &GatewayConfig,
    ) -> GatewayResult<Transaction>;
}

/// Default extraction: agent from the payload's payer (or the configured
/// fallback), recipient from `payTo`, amount from `maxAmountRequired`
/// divided by the currency's base-unit decimals.
pub struct DefaultExtractor;

impl TransactionExtractor for DefaultExtractor {
    fn extract(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
        config: &GatewayConfig,
    ) -> GatewayResult<Transaction> {
        let units: i128 = requirements.max_amount_required.parse().map_err(|_| {
            GatewayError::InvalidPayload {
                message: format!(
                    "maxAmountRequired '{}' is not an integer",
                    requirements.max_amount_required
                ),
            }
        })?;
        let currency = config.default_currency.clone();
        let amount = Decimal::from_i128_with_scale(units, config.decimals_for(&currency));

        let agent_id = payload
            .payer
            .clone()
            .unwrap_or_else(|| config.fallback_agent_id.clone());

        Transaction::builder(agent_id, requirements.pay_to.clone(), amount, currency)
            .purpose(requirements.description.clone())
            .protocol(PaymentProtocol::X402)
            .metadata_entry("scheme", requirements.scheme.clone())
            .metadata_entry("network", requirements.network.clone())
            .metadata_entry("resource", requirements.resource.clone())
            .build()
            .map_err(|e| GatewayError::InvalidPayload {
                message: e.to_string(),
            })
    }
}

/// The policy-gated facilitator wrapper.
pub struct PaymentGateway {
    client: Arc<dyn FacilitatorClient>,
    policy: Arc<PolicyEngine>,
    tracker: Arc<SpendTracker>,
    provenance: Arc<ProvenanceLog>,
    alerts: Option<Arc<AlertEvaluator>>,
    breaker: CircuitBreaker,
    extractor: Arc<dyn TransactionExtractor>,
    config: GatewayConfig,
    /// Verified-but-unsettled transactions by de-duplication key, so a
    /// settle reuses the transaction its verify derived
    pending: Mutex<HashMap<String, Transaction>>,
}

impl PaymentGateway {
    pub fn new(
        client: Arc<dyn FacilitatorClient>,
        policy: Arc<PolicyEngine>,
        tracker: Arc<SpendTracker>,
        provenance: Arc<ProvenanceLog>,
    ) -> Self {
        Self {
            client,
            policy,
            tracker,
            provenance,
            alerts: None,
            breaker: CircuitBreaker::default(),
            extractor: Arc::new(DefaultExtractor),
            config: GatewayConfig::default(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertEvaluator>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker = CircuitBreaker::new(config);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn TransactionExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Verify a payment: policy first, then the facilitator through the
    /// breaker. Policy denial returns a negative reply, never an error.
    pub async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> GatewayResult<VerifyResponse> {
        let mut tx = self.extractor.extract(payload, requirements, &self.config)?;
        self.provenance.record_intent(
            &tx.id,
            "payment verification requested",
            json!({
                "scheme": requirements.scheme,
                "network": requirements.network,
                "resource": requirements.resource,
                "amount": tx.amount,
                "currency": tx.currency,
            }),
        );

        let decision = self.policy.evaluate(&tx);
        self.provenance.record_policy_check(
            &tx.id,
            if decision.allowed {
                StageOutcome::Pass
            } else {
                StageOutcome::Fail
            },
            json!({
                "action": decision.action.as_str(),
                "reason": decision.reason,
                "policyId": decision.policy_id,
                "ruleId": decision.rule_id,
            }),
        );

        if !decision.allowed {
            info!(tx_id = %tx.id, reason = %decision.reason, "verification blocked by policy");
            return Ok(VerifyResponse::invalid(format!(
                "{}: {}",
                self.config.invalid_reason_prefix, decision.reason
            )));
        }

        tx.set_status(TransactionStatus::Approved)
            .map_err(|e| GatewayError::InvalidPayload {
                message: e.to_string(),
            })?;
        self.pending
            .lock()
            .insert(transaction_key(payload, requirements), tx);

        let key = format!("{}:verify", self.config.facilitator_key);
        self.breaker
            .execute(&key, || self.client.verify(payload, requirements))
            .await
    }

    /// Settle a payment through the breaker, then record the outcome in
    /// the ledger, the provenance log, the alert evaluator, and (on
    /// success only) the policy engine's budget buckets.
    pub async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> GatewayResult<SettleResponse> {
        let mut tx = match self
            .pending
            .lock()
            .remove(&transaction_key(payload, requirements))
        {
            Some(tx) => tx,
            None => {
                let mut tx = self.extractor.extract(payload, requirements, &self.config)?;
                tx.set_status(TransactionStatus::Approved)
                    .map_err(|e| GatewayError::InvalidPayload {
                        message: e.to_string(),
                    })?;
                tx
            }
        };
        tx.set_status(TransactionStatus::Executing)
            .map_err(|e| GatewayError::InvalidPayload {
                message: e.to_string(),
            })?;

        self.provenance.record_execution(
            &tx.id,
            "settlement requested",
            json!({
                "payTo": requirements.pay_to,
                "amount": tx.amount,
                "currency": tx.currency,
            }),
        );

        let key = format!("{}:settle", self.config.facilitator_key);
        let result = self
            .breaker
            .execute(&key, || self.client.settle(payload, requirements))
            .await;

        match result {
            Ok(response) => {
                let status = if response.success {
                    TransactionStatus::Completed
                } else {
                    TransactionStatus::Failed
                };
                let _ = tx.set_status(status);
                if let Some(tx_hash) = &response.tx_hash {
                    tx.set_protocol_tx_id(tx_hash.clone());
                }
                self.tracker.record(tx.clone());
                self.provenance.record_settlement(
                    &tx.id,
                    if response.success {
                        StageOutcome::Pass
                    } else {
                        StageOutcome::Fail
                    },
                    json!({
                        "txHash": response.tx_hash,
                        "network": response.network,
                        "error": response.error,
                    }),
                );
                if let Some(alerts) = &self.alerts {
                    alerts.evaluate(&tx).await;
                }
                if response.success {
                    // Budgets count settled funds only.
                    self.policy.record_transaction(&tx);
                    info!(tx_id = %tx.id, "settlement completed");
                } else {
                    warn!(tx_id = %tx.id, error = ?response.error, "settlement failed");
                }
                Ok(response)
            }
            Err(err) if err.is_breaker_open() => Err(err),
            Err(err) => {
                // Record the failed settlement before re-raising.
                let _ = tx.set_status(TransactionStatus::Failed);
                self.tracker.record(tx.clone());
                self.provenance.record_settlement(
                    &tx.id,
                    StageOutcome::Fail,
                    json!({ "error": err.to_string() }),
                );
                warn!(tx_id = %tx.id, error = %err, "settlement raised");
                Err(err)
            }
        }
    }

    /// Direct passthrough.
    pub async fn supported(&self) -> GatewayResult<SupportedKinds> {
        self.client.supported().await
    }
}
