//! End-to-end flows through the gateway: policy gating, settlement
//! observation, breaker behavior, and dispute-driven recovery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal_macros::dec;

use paysentry_alerts::{AlertEvaluator, AlertRule, AlertRuleKind, AlertSeverity, InMemoryAlertHandler};
use paysentry_disputes::{
    DisputeManager, DisputeStatus, FileDisputeInput, LiabilityParty, RecoveryConfig,
    RecoveryEngine, RecoveryResult, RecoveryStatus, RefundExecutor, RefundOutcome, Resolution,
};
use paysentry_gateway::{
    BreakerConfig, FacilitatorClient, GatewayError, GatewayResult, PaymentGateway, PaymentPayload,
    PaymentRequirements, SettleResponse, SupportedKinds, VerifyResponse,
};
use paysentry_ledger::SpendTracker;
use paysentry_policy::{BudgetLimit, PolicyEngine, PolicyRule, RuleAction, RuleConditions, SpendPolicy};
use paysentry_provenance::{ProvenanceLog, ProvenanceStage};
use paysentry_types::{BudgetWindow, TransactionStatus};

#[derive(Clone, Copy)]
enum SettleMode {
    Succeed,
    Reject,
    Raise,
}

struct MockFacilitator {
    verify_calls: AtomicUsize,
    settle_calls: AtomicUsize,
    settle_mode: Mutex<SettleMode>,
}

impl MockFacilitator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            verify_calls: AtomicUsize::new(0),
            settle_calls: AtomicUsize::new(0),
            settle_mode: Mutex::new(SettleMode::Succeed),
        })
    }

    fn set_settle_mode(&self, mode: SettleMode) {
        *self.settle_mode.lock() = mode;
    }
}

#[async_trait::async_trait]
impl FacilitatorClient for MockFacilitator {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        _requirements: &PaymentRequirements,
    ) -> GatewayResult<VerifyResponse> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        Ok(VerifyResponse::valid(payload.payer.clone()))
    }

    async fn settle(
        &self,
        _payload: &PaymentPayload,
        _requirements: &PaymentRequirements,
    ) -> GatewayResult<SettleResponse> {
        self.settle_calls.fetch_add(1, Ordering::SeqCst);
        match *self.settle_mode.lock() {
            SettleMode::Succeed => Ok(SettleResponse {
                success: true,
                tx_hash: Some("0xsettled".to_string()),
                network: "base-sepolia".to_string(),
                error: None,
            }),
            SettleMode::Reject => Ok(SettleResponse {
                success: false,
                tx_hash: None,
                network: "base-sepolia".to_string(),
                error: Some("insufficient allowance".to_string()),
            }),
            SettleMode::Raise => Err(GatewayError::facilitator("connection reset")),
        }
    }

    async fn supported(&self) -> GatewayResult<SupportedKinds> {
        Ok(SupportedKinds {
            schemes: vec!["exact".to_string()],
            networks: vec!["base-sepolia".to_string()],
        })
    }
}

fn payload(payer: &str) -> PaymentPayload {
    PaymentPayload {
        x402_version: 1,
        scheme: "exact".to_string(),
        network: "base-sepolia".to_string(),
        payload: serde_json::json!({"signature": "0xsig"}),
        resource: Some("https://api.example.com/search".to_string()),
        payer: Some(payer.to_string()),
    }
}

/// Requirements demanding `usdc` whole units (USDC has 6 decimals).
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

fn blocking_policy() -> SpendPolicy {
    SpendPolicy {
        id: "controls".to_string(),
        name: "Spending controls".to_string(),
        enabled: true,
        rules: vec![PolicyRule {
            id: "block-above-1000".to_string(),
            name: None,
            description: None,
            enabled: true,
            priority: 1,
            conditions: RuleConditions {
                min_amount: Some(dec!(1000)),
                currencies: Some(vec!["USDC".to_string()]),
                ..Default::default()
            },
            action: RuleAction::Deny,
        }],
        budgets: vec![BudgetLimit {
            window: BudgetWindow::Daily,
            max_amount: dec!(500),
            currency: Some("USDC".to_string()),
            agent_ids: None,
            service_ids: None,
        }],
        cooldown_ms: None,
    }
}

struct Stack {
    facilitator: Arc<MockFacilitator>,
    policy: Arc<PolicyEngine>,
    tracker: Arc<SpendTracker>,
    provenance: Arc<ProvenanceLog>,
    gateway: PaymentGateway,
}

fn stack(breaker: BreakerConfig) -> Stack {
    let facilitator = MockFacilitator::new();
    let policy = Arc::new(PolicyEngine::new());
    policy.load_policy(blocking_policy());
    let tracker = Arc::new(SpendTracker::new());
    let provenance = Arc::new(ProvenanceLog::new());
    let gateway = PaymentGateway::new(
        facilitator.clone(),
        policy.clone(),
        tracker.clone(),
        provenance.clone(),
    )
    .with_breaker_config(breaker);
    Stack {
        facilitator,
        policy,
        tracker,
        provenance,
        gateway,
    }
}

#[tokio::test]
async fn verify_blocks_without_touching_the_facilitator() {
    let s = stack(BreakerConfig::default());

    let response = s
        .gateway
        .verify(&payload("agent-1"), &requirements_for(1500))
        .await
        .unwrap();

    assert!(!response.is_valid);
    let reason = response.invalid_reason.unwrap();
    assert!(reason.starts_with("Payment blocked by policy:"), "{reason}");
    assert_eq!(s.facilitator.verify_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn verify_forwards_allowed_payments() {
    let s = stack(BreakerConfig::default());

    let response = s
        .gateway
        .verify(&payload("agent-1"), &requirements_for(10))
        .await
        .unwrap();

    assert!(response.is_valid);
    assert_eq!(response.payer.as_deref(), Some("agent-1"));
    assert_eq!(s.facilitator.verify_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn settle_records_ledger_provenance_and_budgets() {
    let s = stack(BreakerConfig::default());
    let pay = payload("agent-1");
    let req = requirements_for(10);

    s.gateway.verify(&pay, &req).await.unwrap();
    let response = s.gateway.settle(&pay, &req).await.unwrap();
    assert!(response.success);

    // Exactly one transaction, completed, carrying the protocol tx id.
    assert_eq!(s.tracker.len(), 1);
    let tx = &s.tracker.get_by_agent("agent-1")[0];
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.amount, dec!(10));
    assert_eq!(tx.protocol_tx_id.as_deref(), Some("0xsettled"));
    assert_eq!(tx.recipient, "0xmerchant");

    // Verify and settle share one provenance chain, in canonical order.
    let chain = s.provenance.chain(&tx.id);
    let stages: Vec<ProvenanceStage> = chain.iter().map(|r| r.stage).collect();
    assert_eq!(
        stages,
        vec![
            ProvenanceStage::Intent,
            ProvenanceStage::PolicyCheck,
            ProvenanceStage::Execution,
            ProvenanceStage::Settlement,
        ]
    );
    assert!(s.provenance.is_complete(&tx.id));

    // Settled funds consumed budget.
    let budget = blocking_policy().budgets[0].clone();
    let spend = s.policy.current_spend("controls", &budget, None);
    assert_eq!(spend.amount, dec!(10));
    assert_eq!(spend.count, 1);
}

#[tokio::test]
async fn failed_settlement_is_recorded_but_never_consumes_budget() {
    let s = stack(BreakerConfig::default());
    s.facilitator.set_settle_mode(SettleMode::Reject);
    let pay = payload("agent-1");
    let req = requirements_for(10);

    let response = s.gateway.settle(&pay, &req).await.unwrap();
    assert!(!response.success);

    let tx = &s.tracker.get_by_agent("agent-1")[0];
    assert_eq!(tx.status, TransactionStatus::Failed);

    let budget = blocking_policy().budgets[0].clone();
    let spend = s.policy.current_spend("controls", &budget, None);
    assert_eq!(spend.count, 0);
}

#[tokio::test]
async fn raised_settlement_records_failure_then_reraises() {
    let s = stack(BreakerConfig::default());
    s.facilitator.set_settle_mode(SettleMode::Raise);
    let pay = payload("agent-1");
    let req = requirements_for(10);

    let err = s.gateway.settle(&pay, &req).await.unwrap_err();
    assert!(matches!(err, GatewayError::Facilitator { .. }));

    let tx = &s.tracker.get_by_agent("agent-1")[0];
    assert_eq!(tx.status, TransactionStatus::Failed);
    assert_eq!(
        s.provenance.last_stage(&tx.id),
        Some(ProvenanceStage::Settlement)
    );
}

#[tokio::test]
async fn settle_breaker_trips_and_rejects_without_io() {
    let s = stack(BreakerConfig {
        failure_threshold: 2,
        recovery_timeout_ms: 60_000,
        half_open_max_requests: 1,
    });
    s.facilitator.set_settle_mode(SettleMode::Raise);
    let pay = payload("agent-1");

    for _ in 0..2 {
        let err = s.gateway.settle(&pay, &requirements_for(10)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Facilitator { .. }));
    }
    assert_eq!(s.facilitator.settle_calls.load(Ordering::SeqCst), 2);

    // Breaker is open: the facilitator is not called again.
    let err = s.gateway.settle(&pay, &requirements_for(10)).await.unwrap_err();
    match err {
        GatewayError::BreakerOpen { key, remaining_ms } => {
            assert_eq!(key, "facilitator:settle");
            assert!(remaining_ms > 0 && remaining_ms <= 60_000);
        }
        other => panic!("expected breaker-open, got {other:?}"),
    }
    assert_eq!(s.facilitator.settle_calls.load(Ordering::SeqCst), 2);

    // Verify uses its own key and stays closed.
    let ok = s
        .gateway
        .verify(&pay, &requirements_for(10))
        .await
        .unwrap();
    assert!(ok.is_valid);
}

#[tokio::test]
async fn alerts_fire_on_settled_transactions() {
    let facilitator = MockFacilitator::new();
    let policy = Arc::new(PolicyEngine::new());
    let tracker = Arc::new(SpendTracker::new());
    let provenance = Arc::new(ProvenanceLog::new());

    let alerts = Arc::new(AlertEvaluator::new(tracker.clone()));
    alerts.add_rule(AlertRule::new(
        "large payments",
        AlertSeverity::Warning,
        AlertRuleKind::LargeTransaction {
            currency: "USDC".to_string(),
            threshold: dec!(5),
        },
    ));
    let sink = Arc::new(InMemoryAlertHandler::new("sink"));
    alerts.on_alert(sink.clone());

    let gateway = PaymentGateway::new(
        facilitator,
        policy,
        tracker,
        provenance,
    )
    .with_alerts(alerts);

    gateway
        .settle(&payload("agent-1"), &requirements_for(10))
        .await
        .unwrap();

    let received = sink.received();
    assert_eq!(received.len(), 1);
    assert!(received[0].message.contains("Large transaction"));
}

struct SucceedingRefunds;

#[async_trait::async_trait]
impl RefundExecutor for SucceedingRefunds {
    async fn execute(
        &self,
        _action: &paysentry_disputes::RecoveryAction,
    ) -> RecoveryResult<RefundOutcome> {
        Ok(RefundOutcome {
            success: true,
            refund_tx_id: Some("0xrefund".to_string()),
            error: None,
        })
    }
}

#[tokio::test]
async fn disputed_settlement_recovers_funds() {
    let s = stack(BreakerConfig::default());
    let pay = payload("agent-1");
    let req = requirements_for(25);

    s.gateway.verify(&pay, &req).await.unwrap();
    s.gateway.settle(&pay, &req).await.unwrap();
    let tx = s.tracker.get_by_agent("agent-1")[0].clone();

    // File against the settled transaction; the provenance chain lands as
    // leading evidence and the chain gains a dispute record.
    let disputes = Arc::new(DisputeManager::with_provenance(s.provenance.clone()));
    let dispute = disputes
        .file(FileDisputeInput {
            transaction_id: tx.id.clone(),
            agent_id: tx.agent_id.clone(),
            reason: "service never delivered".to_string(),
            requested_amount: dec!(25),
            evidence: vec![],
        })
        .unwrap();
    assert_eq!(dispute.evidence[0].kind, "transaction_log");
    assert_eq!(
        s.provenance.last_stage(&tx.id),
        Some(ProvenanceStage::Dispute)
    );

    disputes
        .resolve(
            &dispute.id,
            Resolution {
                status: DisputeStatus::ResolvedRefunded,
                liability: LiabilityParty::ServiceProvider,
                resolved_amount: Some(dec!(25)),
            },
        )
        .await
        .unwrap();

    let recovery = RecoveryEngine::new(
        disputes,
        s.tracker.clone(),
        Arc::new(SucceedingRefunds),
        RecoveryConfig {
            retry_delay_ms: 1,
            ..Default::default()
        },
    );
    let action = recovery.initiate(&dispute.id).unwrap();
    assert_eq!(action.amount, dec!(25));
    assert_eq!(action.currency, "USDC");

    let processed = recovery.process_queue().await;
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].status, RecoveryStatus::Completed);
    assert_eq!(processed[0].refund_tx_id.as_deref(), Some("0xrefund"));
}

#[tokio::test]
async fn supported_is_a_passthrough() {
    let s = stack(BreakerConfig::default());
    let kinds = s.gateway.supported().await.unwrap();
    assert_eq!(kinds.schemes, vec!["exact"]);
}

#[tokio::test]
async fn custom_decimals_change_amount_extraction() {
    let facilitator = MockFacilitator::new();
    let policy = Arc::new(PolicyEngine::new());
    let tracker = Arc::new(SpendTracker::new());
    let provenance = Arc::new(ProvenanceLog::new());

    let mut config = paysentry_gateway::GatewayConfig::default();
    config.default_currency = "ETH".to_string();
    config.currency_decimals = HashMap::from([("ETH".to_string(), 18)]);

    let gateway = PaymentGateway::new(facilitator, policy, tracker.clone(), provenance)
        .with_config(config);

    let mut req = requirements_for(0);
    // 1.5 ETH in wei.
    req.max_amount_required = "1500000000000000000".to_string();
    gateway.settle(&payload("agent-1"), &req).await.unwrap();

    let tx = &tracker.get_by_agent("agent-1")[0];
    assert_eq!(tx.amount, dec!(1.5));
    assert_eq!(tx.currency, "ETH");
}
