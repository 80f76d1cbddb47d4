//! PaySentry Alerts - Anomaly and threshold alerts over the spend stream
//!
//! The evaluator runs every enabled rule against each transaction and
//! fans the resulting alerts out to registered handlers. Rules read
//! history from the spend ledger; the current transaction is always
//! excluded from history so evaluation order relative to `record` does
//! not change results.
//!
//! # Rule kinds
//!
//! - **BudgetThreshold**: projected utilization of a sliding-window budget
//! - **LargeTransaction**: single payment at or above a threshold
//! - **RateSpike**: too many transactions inside a window
//! - **NewRecipient**: first payment to a recipient for a scope
//! - **Anomaly**: amount is a statistical outlier for agent + currency

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use paysentry_ledger::SpendTracker;
use paysentry_types::{generate_id, prefix, Transaction, TransactionStatus};

/// Alert errors
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("Alert handler '{handler}' failed: {message}")]
    HandlerFailed { handler: String, message: String },
}

/// Result type for alert operations
pub type AlertResult<T> = Result<T, AlertError>;

/// Alert severity, carried from the firing rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Closed taxonomy matching the rule kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    BudgetThreshold,
    LargeTransaction,
    RateSpike,
    NewRecipient,
    Anomaly,
}

/// A fired alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: Option<String>,
    pub transaction_id: Option<String>,
    /// Rule id/name plus kind-specific figures
    pub data: serde_json::Value,
}

/// Kind-specific rule parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertRuleKind {
    /// Fires when projected window spend reaches a fraction of a budget
    BudgetThreshold {
        /// Restrict to one agent; absent means all agents
        agent_id: Option<String>,
        currency: String,
        /// Sliding window, milliseconds
        window_ms: u64,
        threshold: Decimal,
        /// Fraction of `threshold` that triggers (e.g. 0.8)
        alert_at_percent: Decimal,
    },
    /// Fires on any single transaction at or above `threshold`
    LargeTransaction { currency: String, threshold: Decimal },
    /// Fires when the windowed transaction count exceeds `max_transactions`
    RateSpike {
        agent_id: Option<String>,
        max_transactions: usize,
        window_ms: u64,
    },
    /// Fires the first time a recipient is seen for the scope
    NewRecipient { agent_id: Option<String> },
    /// Fires when the z-score of the amount exceeds `std_dev_threshold`.
    /// Uses population standard deviation (divide by N).
    Anomaly {
        agent_id: Option<String>,
        std_dev_threshold: f64,
        min_sample_size: usize,
    },
}

/// A configured alert rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub severity: AlertSeverity,
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: AlertRuleKind,
}

impl AlertRule {
    pub fn new(name: impl Into<String>, severity: AlertSeverity, kind: AlertRuleKind) -> Self {
        Self {
            id: generate_id(prefix::ALERT_RULE),
            name: name.into(),
            severity,
            enabled: true,
            kind,
        }
    }
}

/// Receives fired alerts. Errors are logged and swallowed by the
/// evaluator; a failing handler never blocks the others.
#[async_trait::async_trait]
pub trait AlertHandler: Send + Sync {
    async fn handle(&self, alert: &Alert) -> AlertResult<()>;

    fn name(&self) -> &str;
}

/// In-memory handler for tests and demos
pub struct InMemoryAlertHandler {
    name: String,
    received: RwLock<Vec<Alert>>,
}

impl InMemoryAlertHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            received: RwLock::new(Vec::new()),
        }
    }

    pub fn received(&self) -> Vec<Alert> {
        self.received.read().clone()
    }
}

#[async_trait::async_trait]
impl AlertHandler for InMemoryAlertHandler {
    async fn handle(&self, alert: &Alert) -> AlertResult<()> {
        self.received.write().push(alert.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Evaluates alert rules against each transaction.
pub struct AlertEvaluator {
    tracker: Arc<SpendTracker>,
    rules: RwLock<Vec<AlertRule>>,
    handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
    /// Scope key (agent id or `*`) -> recipients already seen
    seen_recipients: RwLock<HashMap<String, HashSet<String>>>,
}

impl AlertEvaluator {
    pub fn new(tracker: Arc<SpendTracker>) -> Self {
        Self {
            tracker,
            rules: RwLock::new(Vec::new()),
            handlers: RwLock::new(Vec::new()),
            seen_recipients: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.rules.write().push(rule);
    }

    /// Remove a rule by id; unknown ids are a no-op returning `false`.
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != rule_id);
        rules.len() != before
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().clone()
    }

    /// Register a handler for every future alert.
    pub fn on_alert(&self, handler: Arc<dyn AlertHandler>) {
        self.handlers.write().push(handler);
    }

    /// Evaluate all enabled rules, dispatch the fired alerts to every
    /// handler, and return them.
    pub async fn evaluate(&self, tx: &Transaction) -> Vec<Alert> {
        let alerts = self.collect(tx, Utc::now());

        let handlers: Vec<Arc<dyn AlertHandler>> = self.handlers.read().clone();
        for alert in &alerts {
            for handler in &handlers {
                if let Err(e) = handler.handle(alert).await {
                    warn!(handler = handler.name(), error = %e, "alert handler failed");
                }
            }
        }
        alerts
    }

    fn collect(&self, tx: &Transaction, now: DateTime<Utc>) -> Vec<Alert> {
        let rules = self.rules.read().clone();
        let mut alerts = Vec::new();
        for rule in rules.iter().filter(|r| r.enabled) {
            if let Some(alert) = self.check_rule(rule, tx, now) {
                alerts.push(alert);
            }
        }
        alerts
    }

    fn check_rule(&self, rule: &AlertRule, tx: &Transaction, now: DateTime<Utc>) -> Option<Alert> {
        match &rule.kind {
            AlertRuleKind::BudgetThreshold {
                agent_id,
                currency,
                window_ms,
                threshold,
                alert_at_percent,
            } => {
                if let Some(agent) = agent_id {
                    if agent != &tx.agent_id {
                        return None;
                    }
                }
                if currency != &tx.currency {
                    return None;
                }
                let spent = self.window_sum(agent_id.as_deref(), currency, *window_ms, &tx.id, now);
                let projected = spent + tx.amount;
                if projected < threshold * alert_at_percent {
                    return None;
                }
                let percent = if threshold.is_zero() {
                    Decimal::ZERO
                } else {
                    projected / threshold * Decimal::ONE_HUNDRED
                };
                Some(self.fire(
                    rule,
                    AlertType::BudgetThreshold,
                    tx,
                    format!(
                        "Projected spend {} {} is {percent:.1}% of the {} budget",
                        projected, tx.currency, threshold
                    ),
                    json!({
                        "windowSpend": spent,
                        "projected": projected,
                        "threshold": threshold,
                        "percentUsed": percent,
                    }),
                ))
            }

            AlertRuleKind::LargeTransaction {
                currency,
                threshold,
            } => {
                if currency != &tx.currency || tx.amount < *threshold {
                    return None;
                }
                Some(self.fire(
                    rule,
                    AlertType::LargeTransaction,
                    tx,
                    format!(
                        "Large transaction: {} {} to {} (threshold {})",
                        tx.amount, tx.currency, tx.recipient, threshold
                    ),
                    json!({ "amount": tx.amount, "threshold": threshold }),
                ))
            }

            AlertRuleKind::RateSpike {
                agent_id,
                max_transactions,
                window_ms,
            } => {
                if let Some(agent) = agent_id {
                    if agent != &tx.agent_id {
                        return None;
                    }
                }
                let count = self.window_count(agent_id.as_deref(), *window_ms, &tx.id, now) + 1;
                if count <= *max_transactions {
                    return None;
                }
                Some(self.fire(
                    rule,
                    AlertType::RateSpike,
                    tx,
                    format!(
                        "Rate spike: {} transactions in {}ms (max {})",
                        count, window_ms, max_transactions
                    ),
                    json!({ "count": count, "windowMs": window_ms, "max": max_transactions }),
                ))
            }

            AlertRuleKind::NewRecipient { agent_id } => {
                if let Some(agent) = agent_id {
                    if agent != &tx.agent_id {
                        return None;
                    }
                }
                let scope = agent_id.clone().unwrap_or_else(|| "*".to_string());
                let mut seen = self.seen_recipients.write();
                let recipients = seen.entry(scope.clone()).or_insert_with(|| {
                    self.seed_recipients(agent_id.as_deref(), &tx.id)
                });
                if recipients.contains(&tx.recipient) {
                    return None;
                }
                recipients.insert(tx.recipient.clone());
                drop(seen);
                Some(self.fire(
                    rule,
                    AlertType::NewRecipient,
                    tx,
                    format!("First payment to recipient {}", tx.recipient),
                    json!({ "recipient": tx.recipient, "scope": scope }),
                ))
            }

            AlertRuleKind::Anomaly {
                agent_id,
                std_dev_threshold,
                min_sample_size,
            } => {
                if let Some(agent) = agent_id {
                    if agent != &tx.agent_id {
                        return None;
                    }
                }
                let samples = self.completed_amounts(agent_id.as_deref(), &tx.currency, &tx.id);
                if samples.len() < *min_sample_size {
                    return None;
                }
                let n = samples.len() as f64;
                let mean = samples.iter().sum::<f64>() / n;
                let variance = samples.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
                let sigma = variance.sqrt();
                if sigma <= 0.0 {
                    return None;
                }
                let amount = tx.amount.to_f64().unwrap_or(0.0);
                let z = (amount - mean) / sigma;
                if z <= *std_dev_threshold {
                    return None;
                }
                Some(self.fire(
                    rule,
                    AlertType::Anomaly,
                    tx,
                    format!(
                        "Anomalous amount {} {} ({z:.2} std devs above mean {mean:.2})",
                        tx.amount, tx.currency
                    ),
                    json!({ "zScore": z, "mean": mean, "stdDev": sigma, "sampleSize": samples.len() }),
                ))
            }
        }
    }

    fn fire(
        &self,
        rule: &AlertRule,
        alert_type: AlertType,
        tx: &Transaction,
        message: String,
        extra: serde_json::Value,
    ) -> Alert {
        let mut data = json!({ "ruleId": rule.id, "ruleName": rule.name });
        if let (Some(obj), Some(extra)) = (data.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        Alert {
            alert_type,
            severity: rule.severity,
            message,
            timestamp: Utc::now(),
            agent_id: Some(tx.agent_id.clone()),
            transaction_id: Some(tx.id.clone()),
            data,
        }
    }

    /// Completed spend in the window, excluding the transaction under
    /// evaluation (it may or may not be recorded yet).
    fn window_sum(
        &self,
        agent_id: Option<&str>,
        currency: &str,
        window_ms: u64,
        exclude_id: &str,
        now: DateTime<Utc>,
    ) -> Decimal {
        let cutoff = now - Duration::milliseconds(window_ms as i64);
        self.window_txs(agent_id, exclude_id)
            .iter()
            .filter(|t| {
                t.status == TransactionStatus::Completed
                    && t.currency == currency
                    && t.created_at >= cutoff
            })
            .map(|t| t.amount)
            .sum()
    }

    fn window_count(
        &self,
        agent_id: Option<&str>,
        window_ms: u64,
        exclude_id: &str,
        now: DateTime<Utc>,
    ) -> usize {
        let cutoff = now - Duration::milliseconds(window_ms as i64);
        self.window_txs(agent_id, exclude_id)
            .iter()
            .filter(|t| t.created_at >= cutoff)
            .count()
    }

    fn completed_amounts(
        &self,
        agent_id: Option<&str>,
        currency: &str,
        exclude_id: &str,
    ) -> Vec<f64> {
        self.window_txs(agent_id, exclude_id)
            .iter()
            .filter(|t| t.status == TransactionStatus::Completed && t.currency == currency)
            .filter_map(|t| t.amount.to_f64())
            .collect()
    }

    fn window_txs(&self, agent_id: Option<&str>, exclude_id: &str) -> Vec<Transaction> {
        let txs = match agent_id {
            Some(agent) => self.tracker.get_by_agent(agent),
            None => self.tracker.query(&Default::default()),
        };
        txs.into_iter().filter(|t| t.id != exclude_id).collect()
    }

    fn seed_recipients(&self, agent_id: Option<&str>, exclude_id: &str) -> HashSet<String> {
        self.window_txs(agent_id, exclude_id)
            .into_iter()
            .map(|t| t.recipient)
            .collect()
    }
}
