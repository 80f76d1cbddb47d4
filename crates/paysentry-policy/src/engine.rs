//! The policy engine: budget buckets, cooldowns, rule scans.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use paysentry_types::{BudgetWindow, Transaction};

use crate::model::{BudgetLimit, RuleAction, SpendPolicy};

/// Accumulated spend for one `policy x scope x window x window-instance`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetBucket {
    pub amount: Decimal,
    pub count: u64,
}

/// Snapshot returned by [`PolicyEngine::current_spend`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentSpend {
    pub amount: Decimal,
    pub count: u64,
}

/// The outcome of evaluating a transaction.
///
/// Policy rejection is a value, never an error: callers branch on
/// `allowed` and surface `reason` to humans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub action: RuleAction,
    pub reason: String,
    pub policy_id: Option<String>,
    pub rule_id: Option<String>,
    /// Decision-specific details (violated budget, remaining cooldown, ...)
    pub details: serde_json::Value,
}

impl PolicyDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            action: RuleAction::Allow,
            reason: reason.into(),
            policy_id: None,
            rule_id: None,
            details: serde_json::Value::Null,
        }
    }

    fn from_action(action: RuleAction, reason: impl Into<String>) -> Self {
        Self {
            allowed: action.is_allowed(),
            action,
            reason: reason.into(),
            policy_id: None,
            rule_id: None,
            details: serde_json::Value::Null,
        }
    }
}

#[derive(Default)]
struct EngineState {
    /// Load order; replaced in place when an id is reloaded
    policies: Vec<SpendPolicy>,
    buckets: HashMap<String, BudgetBucket>,
    last_tx_time: HashMap<String, DateTime<Utc>>,
}

/// Deterministic policy evaluator.
///
/// `evaluate` never mutates buckets; only [`PolicyEngine::record_transaction`]
/// and [`PolicyEngine::reset`] do, so callers may defer recording until an
/// external settlement actually succeeds.
pub struct PolicyEngine {
    state: RwLock<EngineState>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(EngineState::default()),
        }
    }

    /// Load a policy, replacing any existing policy with the same id.
    pub fn load_policy(&self, policy: SpendPolicy) {
        let mut state = self.state.write();
        match state.policies.iter_mut().find(|p| p.id == policy.id) {
            Some(slot) => *slot = policy,
            None => state.policies.push(policy),
        }
    }

    /// Remove a policy by id. Unknown ids are a no-op returning `false`.
    pub fn remove_policy(&self, policy_id: &str) -> bool {
        let mut state = self.state.write();
        let before = state.policies.len();
        state.policies.retain(|p| p.id != policy_id);
        state.policies.len() != before
    }

    pub fn policies(&self) -> Vec<SpendPolicy> {
        self.state.read().policies.clone()
    }

    /// Evaluate with the current clock.
    pub fn evaluate(&self, tx: &Transaction) -> PolicyDecision {
        self.evaluate_at(tx, Utc::now())
    }

    /// Evaluate at an explicit instant. Given identical bucket state,
    /// cooldown table, and `now`, the decision is identical across
    /// processes.
    pub fn evaluate_at(&self, tx: &Transaction, now: DateTime<Utc>) -> PolicyDecision {
        let state = self.state.read();
        let mut decisions: Vec<PolicyDecision> = state
            .policies
            .iter()
            .filter(|p| p.enabled)
            .map(|p| Self::evaluate_policy(&state, p, tx, now))
            .collect();

        if decisions.is_empty() {
            return PolicyDecision::allow("no policies loaded");
        }

        // Most restrictive wins; min_by_key is stable so the first of
        // equal rank (policy load order) is kept.
        let winner = decisions
            .iter()
            .enumerate()
            .min_by_key(|(idx, d)| (d.action.severity_rank(), *idx))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        let decision = decisions.swap_remove(winner);
        debug!(
            tx_id = %tx.id,
            action = %decision.action,
            allowed = decision.allowed,
            "policy decision"
        );
        decision
    }

    fn evaluate_policy(
        state: &EngineState,
        policy: &SpendPolicy,
        tx: &Transaction,
        now: DateTime<Utc>,
    ) -> PolicyDecision {
        // 1. Budgets: the first violated budget denies.
        for budget in policy.budgets.iter().filter(|b| b.applies_to(tx)) {
            let key = Self::bucket_key(&policy.id, budget, now);
            // Each per-transaction evaluation is its own window, so no
            // prior spend counts against it.
            let current = if budget.window == BudgetWindow::PerTransaction {
                Decimal::ZERO
            } else {
                state
                    .buckets
                    .get(&key)
                    .map(|b| b.amount)
                    .unwrap_or(Decimal::ZERO)
            };
            let projected = current + tx.amount;
            if projected > budget.max_amount {
                let mut decision = PolicyDecision::from_action(
                    RuleAction::Deny,
                    format!(
                        "Budget exceeded: {} {} projected over {} limit of {} ({} window)",
                        projected,
                        tx.currency,
                        budget.scope_key(),
                        budget.max_amount,
                        budget.window,
                    ),
                );
                decision.policy_id = Some(policy.id.clone());
                decision.details = json!({
                    "window": budget.window.as_str(),
                    "windowKey": budget.window.window_key(now),
                    "currentAmount": current,
                    "projectedAmount": projected,
                    "maxAmount": budget.max_amount,
                });
                return decision;
            }
        }

        // 2. Cooldown.
        if let Some(cooldown_ms) = policy.cooldown_ms {
            if let Some(last) = state.last_tx_time.get(&tx.agent_id) {
                let elapsed = (now - *last).num_milliseconds();
                if elapsed >= 0 && (elapsed as u64) < cooldown_ms {
                    let remaining = cooldown_ms - elapsed as u64;
                    let mut decision = PolicyDecision::from_action(
                        RuleAction::Deny,
                        format!(
                            "Cooldown active for agent {}: {}ms remaining",
                            tx.agent_id, remaining
                        ),
                    );
                    decision.policy_id = Some(policy.id.clone());
                    decision.details = json!({ "remainingMs": remaining });
                    return decision;
                }
            }
        }

        // 3. Rule scan: ascending priority, stable on ties, first match.
        let mut rules: Vec<_> = policy.rules.iter().filter(|r| r.enabled).collect();
        rules.sort_by_key(|r| r.priority);
        for rule in rules {
            if rule.conditions.matches(tx) {
                let label = rule.name.as_deref().unwrap_or(&rule.id);
                let mut decision = PolicyDecision::from_action(
                    rule.action,
                    format!("Matched rule '{}' ({})", label, rule.action),
                );
                decision.policy_id = Some(policy.id.clone());
                decision.rule_id = Some(rule.id.clone());
                return decision;
            }
        }

        let mut decision = PolicyDecision::allow("no matching rules, default allow");
        decision.policy_id = Some(policy.id.clone());
        decision
    }

    /// Record a settled transaction into every matching budget bucket and
    /// refresh the agent's cooldown timestamp.
    pub fn record_transaction(&self, tx: &Transaction) {
        self.record_transaction_at(tx, Utc::now());
    }

    pub fn record_transaction_at(&self, tx: &Transaction, now: DateTime<Utc>) {
        let mut state = self.state.write();
        let mut keys: Vec<String> = Vec::new();
        for policy in state.policies.iter().filter(|p| p.enabled) {
            for budget in policy.budgets.iter().filter(|b| b.applies_to(tx)) {
                keys.push(Self::bucket_key(&policy.id, budget, now));
            }
        }
        for key in keys {
            let bucket = state.buckets.entry(key).or_default();
            bucket.amount += tx.amount;
            bucket.count += 1;
        }
        state.last_tx_time.insert(tx.agent_id.clone(), now);
    }

    /// Current accumulation for one budget of one policy. `at` defaults to
    /// now and selects the window instance.
    pub fn current_spend(
        &self,
        policy_id: &str,
        budget: &BudgetLimit,
        at: Option<DateTime<Utc>>,
    ) -> CurrentSpend {
        let key = Self::bucket_key(policy_id, budget, at.unwrap_or_else(Utc::now));
        self.state
            .read()
            .buckets
            .get(&key)
            .map(|b| CurrentSpend {
                amount: b.amount,
                count: b.count,
            })
            .unwrap_or_default()
    }

    /// Drop all buckets and cooldown state, keeping loaded policies.
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.buckets.clear();
        state.last_tx_time.clear();
    }

    fn bucket_key(policy_id: &str, budget: &BudgetLimit, at: DateTime<Utc>) -> String {
        format!(
            "{}|{}|{}|{}",
            policy_id,
            budget.scope_key(),
            budget.window,
            budget.window.window_key(at)
        )
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PolicyRule, RuleConditions};
    use chrono::Duration;
    use paysentry_types::PaymentProtocol;
    use rust_decimal_macros::dec;

    fn tx(amount: Decimal) -> Transaction {
        tx_for("agent-1", amount)
    }

    fn tx_for(agent: &str, amount: Decimal) -> Transaction {
        Transaction::builder(agent, "api.vendor.example/search", amount, "USDC")
            .protocol(PaymentProtocol::X402)
            .service_id("svc-search")
            .build()
            .unwrap()
    }

    fn rule(id: &str, priority: i64, conditions: RuleConditions, action: RuleAction) -> PolicyRule {
        PolicyRule {
            id: id.to_string(),
            name: None,
            description: None,
            enabled: true,
            priority,
            conditions,
            action,
        }
    }

    fn tiered_policy(daily_budget: Decimal) -> SpendPolicy {
        SpendPolicy {
            id: "default".to_string(),
            name: "Default controls".to_string(),
            enabled: true,
            rules: vec![
                rule(
                    "block-above-1000",
                    1,
                    RuleConditions {
                        min_amount: Some(dec!(1000)),
                        currencies: Some(vec!["USDC".to_string()]),
                        ..Default::default()
                    },
                    RuleAction::Deny,
                ),
                rule(
                    "approve-above-100",
                    2,
                    RuleConditions {
                        min_amount: Some(dec!(100)),
                        currencies: Some(vec!["USDC".to_string()]),
                        ..Default::default()
                    },
                    RuleAction::RequireApproval,
                ),
                rule("allow-all", 3, RuleConditions::default(), RuleAction::Allow),
            ],
            budgets: vec![BudgetLimit {
                window: BudgetWindow::Daily,
                max_amount: daily_budget,
                currency: Some("USDC".to_string()),
                agent_ids: None,
                service_ids: None,
            }],
            cooldown_ms: None,
        }
    }

    #[test]
    fn no_policies_defaults_to_allow() {
        let engine = PolicyEngine::new();
        let decision = engine.evaluate(&tx(dec!(10)));
        assert!(decision.allowed);
        assert!(decision.reason.contains("no policies"));
    }

    #[test]
    fn tiered_rules_allow_approve_deny() {
        let engine = PolicyEngine::new();
        engine.load_policy(tiered_policy(dec!(500)));

        let small = engine.evaluate(&tx(dec!(10)));
        assert_eq!(small.action, RuleAction::Allow);
        assert!(small.allowed);

        let medium = engine.evaluate(&tx(dec!(150)));
        assert_eq!(medium.action, RuleAction::RequireApproval);
        assert!(!medium.allowed);
        assert_eq!(medium.rule_id.as_deref(), Some("approve-above-100"));

        let large = engine.evaluate(&tx(dec!(1500)));
        assert_eq!(large.action, RuleAction::Deny);
        assert_eq!(large.rule_id.as_deref(), Some("block-above-1000"));
    }

    #[test]
    fn budget_exhaustion_denies_before_rules() {
        let engine = PolicyEngine::new();
        engine.load_policy(tiered_policy(dec!(100)));

        engine.record_transaction(&tx(dec!(80)));
        let decision = engine.evaluate(&tx(dec!(30)));
        assert!(!decision.allowed);
        assert_eq!(decision.action, RuleAction::Deny);
        assert!(decision.reason.contains("Budget exceeded"));
        assert_eq!(decision.details["projectedAmount"], json!(dec!(110)));
    }

    #[test]
    fn budget_boundary_is_inclusive() {
        let engine = PolicyEngine::new();
        engine.load_policy(tiered_policy(dec!(100)));

        engine.record_transaction(&tx(dec!(80)));
        // Exactly at the ceiling still passes the budget check.
        let decision = engine.evaluate(&tx(dec!(20)));
        assert_ne!(decision.action, RuleAction::Deny);
    }

    #[test]
    fn evaluate_does_not_consume_budget() {
        let engine = PolicyEngine::new();
        let policy = tiered_policy(dec!(100));
        let budget = policy.budgets[0].clone();
        engine.load_policy(policy);

        for _ in 0..5 {
            engine.evaluate(&tx(dec!(90)));
        }
        let spend = engine.current_spend("default", &budget, None);
        assert_eq!(spend.amount, Decimal::ZERO);
        assert_eq!(spend.count, 0);
    }

    #[test]
    fn record_increments_exactly_one_bucket_per_budget() {
        let engine = PolicyEngine::new();
        let policy = tiered_policy(dec!(500));
        let budget = policy.budgets[0].clone();
        engine.load_policy(policy);

        let now = Utc::now();
        engine.record_transaction_at(&tx(dec!(80)), now);
        engine.record_transaction_at(&tx(dec!(20)), now);

        let spend = engine.current_spend("default", &budget, Some(now));
        assert_eq!(spend.amount, dec!(100));
        assert_eq!(spend.count, 2);
    }

    #[test]
    fn adjacent_daily_windows_use_fresh_buckets() {
        let engine = PolicyEngine::new();
        let policy = tiered_policy(dec!(100));
        engine.load_policy(policy);

        let yesterday = Utc::now() - Duration::days(1);
        engine.record_transaction_at(&tx(dec!(95)), yesterday);

        // Yesterday's spend does not count against today's window.
        let decision = engine.evaluate(&tx(dec!(50)));
        assert_ne!(decision.action, RuleAction::Deny);
    }

    #[test]
    fn cooldown_denies_with_remaining_ms() {
        let engine = PolicyEngine::new();
        let mut policy = tiered_policy(dec!(10000));
        policy.cooldown_ms = Some(60_000);
        engine.load_policy(policy);

        let t0 = Utc::now();
        engine.record_transaction_at(&tx(dec!(5)), t0);

        let decision = engine.evaluate_at(&tx(dec!(5)), t0 + Duration::milliseconds(30_000));
        assert!(!decision.allowed);
        assert!(decision.reason.contains("Cooldown"));
        assert_eq!(decision.details["remainingMs"], json!(30_000));
    }

    #[test]
    fn cooldown_of_exactly_cooldown_ms_allows() {
        let engine = PolicyEngine::new();
        let mut policy = tiered_policy(dec!(10000));
        policy.cooldown_ms = Some(60_000);
        engine.load_policy(policy);

        let t0 = Utc::now();
        engine.record_transaction_at(&tx(dec!(5)), t0);

        let decision = engine.evaluate_at(&tx(dec!(5)), t0 + Duration::milliseconds(60_000));
        assert!(decision.allowed);
    }

    #[test]
    fn cooldown_is_per_agent() {
        let engine = PolicyEngine::new();
        let mut policy = tiered_policy(dec!(10000));
        policy.cooldown_ms = Some(60_000);
        engine.load_policy(policy);

        let t0 = Utc::now();
        engine.record_transaction_at(&tx_for("agent-1", dec!(5)), t0);

        let other = engine.evaluate_at(&tx_for("agent-2", dec!(5)), t0 + Duration::milliseconds(10));
        assert!(other.allowed);
    }

    #[test]
    fn equal_priority_keeps_load_order() {
        let engine = PolicyEngine::new();
        engine.load_policy(SpendPolicy {
            id: "ties".to_string(),
            name: "Ties".to_string(),
            enabled: true,
            rules: vec![
                rule("first", 5, RuleConditions::default(), RuleAction::Flag),
                rule("second", 5, RuleConditions::default(), RuleAction::Deny),
            ],
            budgets: vec![],
            cooldown_ms: None,
        });

        let decision = engine.evaluate(&tx(dec!(1)));
        assert_eq!(decision.rule_id.as_deref(), Some("first"));
        assert_eq!(decision.action, RuleAction::Flag);
    }

    #[test]
    fn disabled_rules_and_policies_are_skipped() {
        let engine = PolicyEngine::new();
        let mut policy = SpendPolicy {
            id: "p".to_string(),
            name: "P".to_string(),
            enabled: true,
            rules: vec![PolicyRule {
                enabled: false,
                ..rule("deny-all", 0, RuleConditions::default(), RuleAction::Deny)
            }],
            budgets: vec![],
            cooldown_ms: None,
        };
        engine.load_policy(policy.clone());
        assert!(engine.evaluate(&tx(dec!(1))).allowed);

        policy.rules[0].enabled = true;
        policy.enabled = false;
        engine.load_policy(policy);
        // Disabled policy contributes no decision at all.
        let decision = engine.evaluate(&tx(dec!(1)));
        assert!(decision.allowed);
        assert!(decision.reason.contains("no policies"));
    }

    #[test]
    fn most_restrictive_policy_wins() {
        let engine = PolicyEngine::new();
        engine.load_policy(SpendPolicy {
            id: "lenient".to_string(),
            name: "Lenient".to_string(),
            enabled: true,
            rules: vec![rule("ok", 0, RuleConditions::default(), RuleAction::Allow)],
            budgets: vec![],
            cooldown_ms: None,
        });
        engine.load_policy(SpendPolicy {
            id: "strict".to_string(),
            name: "Strict".to_string(),
            enabled: true,
            rules: vec![rule(
                "hold",
                0,
                RuleConditions::default(),
                RuleAction::RequireApproval,
            )],
            budgets: vec![],
            cooldown_ms: None,
        });

        let decision = engine.evaluate(&tx(dec!(1)));
        assert_eq!(decision.action, RuleAction::RequireApproval);
        assert_eq!(decision.policy_id.as_deref(), Some("strict"));
    }

    #[test]
    fn per_transaction_budget_caps_single_payments() {
        let engine = PolicyEngine::new();
        engine.load_policy(SpendPolicy {
            id: "cap".to_string(),
            name: "Per-tx cap".to_string(),
            enabled: true,
            rules: vec![],
            budgets: vec![BudgetLimit {
                window: BudgetWindow::PerTransaction,
                max_amount: dec!(50),
                currency: None,
                agent_ids: None,
                service_ids: None,
            }],
            cooldown_ms: None,
        });

        assert!(engine.evaluate(&tx(dec!(50))).allowed);
        assert!(!engine.evaluate(&tx(dec!(51))).allowed);

        // Prior recordings never accumulate against a per-transaction cap.
        engine.record_transaction(&tx(dec!(50)));
        engine.record_transaction(&tx(dec!(50)));
        assert!(engine.evaluate(&tx(dec!(50))).allowed);
    }

    #[test]
    fn scoped_budget_ignores_other_agents() {
        let engine = PolicyEngine::new();
        engine.load_policy(SpendPolicy {
            id: "scoped".to_string(),
            name: "Scoped".to_string(),
            enabled: true,
            rules: vec![],
            budgets: vec![BudgetLimit {
                window: BudgetWindow::Daily,
                max_amount: dec!(100),
                currency: None,
                agent_ids: Some(vec!["agent-1".to_string()]),
                service_ids: None,
            }],
            cooldown_ms: None,
        });

        engine.record_transaction(&tx_for("agent-2", dec!(500)));
        // agent-2's spend went to no bucket this budget reads.
        assert!(engine.evaluate(&tx_for("agent-1", dec!(100))).allowed);
        assert!(!engine.evaluate(&tx_for("agent-1", dec!(101))).allowed);
    }

    #[test]
    fn reset_restores_fresh_spend_state() {
        let engine = PolicyEngine::new();
        let policy = tiered_policy(dec!(100));
        let budget = policy.budgets[0].clone();
        engine.load_policy(policy);

        engine.record_transaction(&tx(dec!(80)));
        engine.reset();

        let spend = engine.current_spend("default", &budget, None);
        assert_eq!(spend, CurrentSpend::default());
        assert!(engine.evaluate(&tx(dec!(90))).allowed);
        assert_eq!(engine.policies().len(), 1, "policies survive reset");
    }

    #[test]
    fn reload_replaces_policy_in_place() {
        let engine = PolicyEngine::new();
        engine.load_policy(tiered_policy(dec!(100)));
        engine.load_policy(tiered_policy(dec!(500)));
        assert_eq!(engine.policies().len(), 1);
        assert_eq!(engine.policies()[0].budgets[0].max_amount, dec!(500));
    }

    #[test]
    fn remove_policy_is_noop_for_unknown_ids() {
        let engine = PolicyEngine::new();
        engine.load_policy(tiered_policy(dec!(100)));
        assert!(!engine.remove_policy("missing"));
        assert!(engine.remove_policy("default"));
        assert!(engine.policies().is_empty());
    }
}
