//! Runnable PaySentry walkthrough against a mock facilitator.
//!
//! Drives the full stack: policy gating on verify, settlement with
//! ledger/provenance/alert observation, breaker behavior under a flaky
//! facilitator, and a dispute that ends in a refund.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use rust_decimal_macros::dec;
use tracing::info;

use paysentry_alerts::{
    Alert, AlertEvaluator, AlertHandler, AlertResult, AlertRule, AlertRuleKind, AlertSeverity,
};
use paysentry_disputes::{
    DisputeManager, DisputeStatus, FileDisputeInput, LiabilityParty, RecoveryAction,
    RecoveryConfig, RecoveryEngine, RecoveryResult, RefundExecutor, RefundOutcome, Resolution,
};
use paysentry_gateway::{
    BreakerConfig, FacilitatorClient, GatewayError, GatewayResult, PaymentGateway, PaymentPayload,
    PaymentRequirements, SettleResponse, SupportedKinds, VerifyResponse,
};
use paysentry_ledger::{AnalyticsQuery, SpendAnalytics, SpendTracker};
use paysentry_policy::{PolicyEngine, SpendPolicy};
use paysentry_provenance::ProvenanceLog;

/// The daily ceiling is deliberately configuration, not a constant.
struct DemoConfig {
    daily_budget_usdc: rust_decimal::Decimal,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            daily_budget_usdc: dec!(100),
        }
    }
}

struct SandboxFacilitator {
    flaky: AtomicBool,
}

#[async_trait::async_trait]
impl FacilitatorClient for SandboxFacilitator {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        _requirements: &PaymentRequirements,
    ) -> GatewayResult<VerifyResponse> {
        Ok(VerifyResponse::valid(payload.payer.clone()))
    }

    async fn settle(
        &self,
        _payload: &PaymentPayload,
        _requirements: &PaymentRequirements,
    ) -> GatewayResult<SettleResponse> {
        if self.flaky.load(Ordering::SeqCst) {
            return Err(GatewayError::facilitator("sandbox rail offline"));
        }
        Ok(SettleResponse {
            success: true,
            tx_hash: Some("0xsandbox".to_string()),
            network: "base-sepolia".to_string(),
            error: None,
        })
    }

    async fn supported(&self) -> GatewayResult<SupportedKinds> {
        Ok(SupportedKinds {
            schemes: vec!["exact".to_string()],
            networks: vec!["base-sepolia".to_string()],
        })
    }
}

struct ConsoleAlerts;

#[async_trait::async_trait]
impl AlertHandler for ConsoleAlerts {
    async fn handle(&self, alert: &Alert) -> AlertResult<()> {
        println!("  [alert:{:?}] {}", alert.severity, alert.message);
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

struct SandboxRefunds;

#[async_trait::async_trait]
impl RefundExecutor for SandboxRefunds {
    async fn execute(&self, action: &RecoveryAction) -> RecoveryResult<RefundOutcome> {
        info!(recovery_id = %action.id, amount = %action.amount, "sandbox refund executed");
        Ok(RefundOutcome {
            success: true,
            refund_tx_id: Some("0xrefund".to_string()),
            error: None,
        })
    }
}

fn payload(agent: &str) -> PaymentPayload {
    PaymentPayload {
        x402_version: 1,
        scheme: "exact".to_string(),
        network: "base-sepolia".to_string(),
        payload: serde_json::json!({"signature": "0xsig"}),
        resource: Some("https://api.example.com/search".to_string()),
        payer: Some(agent.to_string()),
    }
}

fn requirements_for(usdc: u64) -> PaymentRequirements {
    PaymentRequirements {
        scheme: "exact".to_string(),
        network: "base-sepolia".to_string(),
        max_amount_required: (usdc as u128 * 1_000_000).to_string(),
        resource: "https://api.example.com/search".to_string(),
        pay_to: "0xmerchant".to_string(),
        description: "search API access".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = DemoConfig::default();

    let policy = Arc::new(PolicyEngine::new());
    policy.load_policy(SpendPolicy::from_json(&format!(
        r#"{{
            "id": "demo-controls",
            "name": "Demo spending controls",
            "enabled": true,
            "rules": [
                {{"id": "block-above-1000", "enabled": true, "priority": 1,
                  "conditions": {{"minAmount": 1000, "currencies": ["USDC"]}}, "action": "deny"}},
                {{"id": "approve-above-100", "enabled": true, "priority": 2,
                  "conditions": {{"minAmount": 100, "currencies": ["USDC"]}}, "action": "require_approval"}},
                {{"id": "allow-rest", "enabled": true, "priority": 3, "action": "allow"}}
            ],
            "budgets": [{{"window": "daily", "maxAmount": {}, "currency": "USDC"}}]
        }}"#,
        config.daily_budget_usdc
    ))?);

    let tracker = Arc::new(SpendTracker::new());
    let provenance = Arc::new(ProvenanceLog::new());
    let alerts = Arc::new(AlertEvaluator::new(tracker.clone()));
    alerts.add_rule(AlertRule::new(
        "large payments",
        AlertSeverity::Warning,
        AlertRuleKind::LargeTransaction {
            currency: "USDC".to_string(),
            threshold: dec!(50),
        },
    ));
    alerts.add_rule(AlertRule::new(
        "novel recipients",
        AlertSeverity::Info,
        AlertRuleKind::NewRecipient { agent_id: None },
    ));
    alerts.on_alert(Arc::new(ConsoleAlerts));

    let facilitator = Arc::new(SandboxFacilitator {
        flaky: AtomicBool::new(false),
    });
    let gateway = PaymentGateway::new(
        facilitator.clone(),
        policy.clone(),
        tracker.clone(),
        provenance.clone(),
    )
    .with_alerts(alerts)
    .with_breaker_config(BreakerConfig {
        failure_threshold: 2,
        recovery_timeout_ms: 2_000,
        half_open_max_requests: 1,
    });

    println!("== Policy ladder: allow / require approval / deny ==");
    for usdc in [10u64, 100, 1500] {
        let reply = gateway.verify(&payload("agent-demo"), &requirements_for(usdc)).await?;
        match reply.invalid_reason {
            None => println!("  {usdc} USDC -> allowed"),
            Some(reason) => println!("  {usdc} USDC -> {reason}"),
        }
    }

    println!("== Settlement: three payments against a {} USDC daily budget ==", config.daily_budget_usdc);
    for usdc in [30u64, 30, 30] {
        let pay = payload("agent-demo");
        let req = requirements_for(usdc);
        gateway.verify(&pay, &req).await?;
        let settled = gateway.settle(&pay, &req).await?;
        println!("  {usdc} USDC settled (txHash {:?})", settled.tx_hash);
    }
    let fourth = gateway
        .verify(&payload("agent-demo"), &requirements_for(30))
        .await?;
    println!(
        "  fourth 30 USDC -> {}",
        fourth.invalid_reason.as_deref().unwrap_or("allowed")
    );

    println!("== Circuit breaker under a failing rail ==");
    facilitator.flaky.store(true, Ordering::SeqCst);
    for attempt in 1..=3 {
        match gateway.settle(&payload("agent-demo"), &requirements_for(5)).await {
            Err(GatewayError::BreakerOpen { remaining_ms, .. }) => {
                println!("  attempt {attempt}: breaker open, retry in {remaining_ms}ms")
            }
            Err(e) => println!("  attempt {attempt}: {e}"),
            Ok(_) => println!("  attempt {attempt}: settled"),
        }
    }
    facilitator.flaky.store(false, Ordering::SeqCst);

    println!("== Dispute and refund ==");
    let disputed_tx = tracker
        .query(&paysentry_ledger::TransactionQuery {
            status: Some(paysentry_types::TransactionStatus::Completed),
            ..Default::default()
        })
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no completed transactions to dispute"))?;
    let disputes = Arc::new(DisputeManager::with_provenance(provenance.clone()));
    let dispute = disputes.file(FileDisputeInput {
        transaction_id: disputed_tx.id.clone(),
        agent_id: disputed_tx.agent_id.clone(),
        reason: "results were empty".to_string(),
        requested_amount: disputed_tx.amount,
        evidence: vec![],
    })?;
    disputes
        .resolve(
            &dispute.id,
            Resolution {
                status: DisputeStatus::ResolvedRefunded,
                liability: LiabilityParty::ServiceProvider,
                resolved_amount: Some(disputed_tx.amount),
            },
        )
        .await?;
    let recovery = RecoveryEngine::new(
        disputes,
        tracker.clone(),
        Arc::new(SandboxRefunds),
        RecoveryConfig::default(),
    );
    recovery.initiate(&dispute.id)?;
    for action in recovery.process_queue().await {
        println!(
            "  recovery {} -> {} (refund {:?})",
            action.id, action.status, action.refund_tx_id
        );
    }

    println!("== Spending summary ==");
    let summary = SpendAnalytics::summarize(&tracker, &AnalyticsQuery::default());
    println!(
        "  {} transactions, {} completed, volume {:?}",
        summary.transaction_count, summary.completed_count, summary.volume_by_currency
    );

    Ok(())
}
