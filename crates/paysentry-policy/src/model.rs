//! Policy documents: rules, conditions, budgets.
//!
//! The JSON shape mirrors the wire format policies are authored in:
//! camelCase field names, snake_case enum values, unknown fields tolerated.

use std::collections::HashMap;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use paysentry_types::{glob_match, BudgetWindow, PaymentProtocol, Transaction};

/// Result type for policy operations
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Errors raised when loading policy documents
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid policy document: {message}")]
    InvalidDocument { message: String },

    #[error("Failed to read policy file {path}: {message}")]
    Io { path: String, message: String },
}

/// What a matched rule does to the transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Flag,
    RequireApproval,
    Deny,
}

impl RuleAction {
    /// Restrictiveness rank; lower wins when combining decisions.
    pub fn severity_rank(&self) -> u8 {
        match self {
            Self::Deny => 0,
            Self::RequireApproval => 1,
            Self::Flag => 2,
            Self::Allow => 3,
        }
    }

    /// `allow` and `flag` let the payment proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow | Self::Flag)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Flag => "flag",
            Self::RequireApproval => "require_approval",
            Self::Deny => "deny",
        }
    }
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition set for a rule. All present fields must match (AND).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConditions {
    /// Glob patterns against the agent id (any may match)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<Vec<String>>,
    /// Glob patterns against the recipient (any may match)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<String>>,
    /// Exact service tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<String>>,
    /// Exact protocols
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Vec<PaymentProtocol>>,
    /// Inclusive lower amount bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_amount: Option<Decimal>,
    /// Inclusive upper amount bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<Decimal>,
    /// Exact currency codes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currencies: Option<Vec<String>>,
    /// Every listed pair must exist verbatim in the transaction metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl RuleConditions {
    /// Whether the transaction satisfies every present condition.
    /// An empty condition set matches everything.
    pub fn matches(&self, tx: &Transaction) -> bool {
        if let Some(agents) = &self.agents {
            if !agents.iter().any(|p| glob_match(&tx.agent_id, p)) {
                return false;
            }
        }
        if let Some(recipients) = &self.recipients {
            if !recipients.iter().any(|p| glob_match(&tx.recipient, p)) {
                return false;
            }
        }
        if let Some(services) = &self.services {
            match &tx.service_id {
                Some(service) if services.contains(service) => {}
                _ => return false,
            }
        }
        if let Some(protocols) = &self.protocols {
            if !protocols.contains(&tx.protocol) {
                return false;
            }
        }
        if let Some(min) = self.min_amount {
            if tx.amount < min {
                return false;
            }
        }
        if let Some(max) = self.max_amount {
            if tx.amount > max {
                return false;
            }
        }
        if let Some(currencies) = &self.currencies {
            if !currencies.contains(&tx.currency) {
                return false;
            }
        }
        if let Some(metadata) = &self.metadata {
            for (key, value) in metadata {
                if tx.metadata().get(key) != Some(value) {
                    return false;
                }
            }
        }
        true
    }
}

/// A single ordered rule inside a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower priority evaluates earlier; ties keep load order
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub action: RuleAction,
}

/// A spending ceiling over a window, optionally scoped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetLimit {
    pub window: BudgetWindow,
    pub max_amount: Decimal,
    /// Only transactions in this currency count and are limited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Restrict to these agents (exact ids)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ids: Option<Vec<String>>,
    /// Restrict to these service tags (exact)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_ids: Option<Vec<String>>,
}

impl BudgetLimit {
    /// Whether this budget counts the transaction.
    pub fn applies_to(&self, tx: &Transaction) -> bool {
        if let Some(currency) = &self.currency {
            if &tx.currency != currency {
                return false;
            }
        }
        if let Some(agent_ids) = &self.agent_ids {
            if !agent_ids.contains(&tx.agent_id) {
                return false;
            }
        }
        if let Some(service_ids) = &self.service_ids {
            match &tx.service_id {
                Some(service) if service_ids.contains(service) => {}
                _ => return false,
            }
        }
        true
    }

    /// Deterministic serialization of the budget's scope filters.
    /// Unscoped budgets share the `global` key.
    pub fn scope_key(&self) -> String {
        if self.agent_ids.is_none() && self.service_ids.is_none() && self.currency.is_none() {
            return "global".to_string();
        }
        let join_sorted = |ids: &Option<Vec<String>>| -> String {
            ids.as_ref()
                .map(|ids| {
                    let mut sorted = ids.clone();
                    sorted.sort();
                    sorted.join(",")
                })
                .unwrap_or_default()
        };
        format!(
            "agents={};services={};currency={}",
            join_sorted(&self.agent_ids),
            join_sorted(&self.service_ids),
            self.currency.clone().unwrap_or_default()
        )
    }
}

/// A named, ordered collection of rules and budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendPolicy {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub budgets: Vec<BudgetLimit>,
    /// Minimum milliseconds between transactions per agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<u64>,
}

impl SpendPolicy {
    /// Parse a policy document from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| PolicyError::InvalidDocument {
            message: e.to_string(),
        })
    }

    /// Load a policy document from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| PolicyError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&raw)
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tx(agent: &str, amount: Decimal) -> Transaction {
        Transaction::builder(agent, "api.vendor.example/search", amount, "USDC")
            .protocol(PaymentProtocol::X402)
            .service_id("svc-search")
            .metadata_entry("env", "prod")
            .build()
            .unwrap()
    }

    #[test]
    fn empty_conditions_match_everything() {
        assert!(RuleConditions::default().matches(&tx("agent-1", dec!(5))));
    }

    #[test]
    fn agent_globs_and_exact_services() {
        let cond = RuleConditions {
            agents: Some(vec!["agent-*".to_string()]),
            services: Some(vec!["svc-search".to_string()]),
            ..Default::default()
        };
        assert!(cond.matches(&tx("agent-7", dec!(5))));
        assert!(!cond.matches(&tx("bot-7", dec!(5))));
    }

    #[test]
    fn amount_bounds_are_inclusive() {
        let cond = RuleConditions {
            min_amount: Some(dec!(10)),
            max_amount: Some(dec!(100)),
            ..Default::default()
        };
        assert!(cond.matches(&tx("a", dec!(10))));
        assert!(cond.matches(&tx("a", dec!(100))));
        assert!(!cond.matches(&tx("a", dec!(9.99))));
        assert!(!cond.matches(&tx("a", dec!(100.01))));
    }

    #[test]
    fn metadata_requires_verbatim_pairs() {
        let mut wanted = HashMap::new();
        wanted.insert("env".to_string(), "prod".to_string());
        let cond = RuleConditions {
            metadata: Some(wanted.clone()),
            ..Default::default()
        };
        assert!(cond.matches(&tx("a", dec!(5))));

        wanted.insert("missing".to_string(), "x".to_string());
        let cond = RuleConditions {
            metadata: Some(wanted),
            ..Default::default()
        };
        assert!(!cond.matches(&tx("a", dec!(5))));
    }

    #[test]
    fn severity_rank_ordering() {
        assert!(RuleAction::Deny.severity_rank() < RuleAction::RequireApproval.severity_rank());
        assert!(RuleAction::RequireApproval.severity_rank() < RuleAction::Flag.severity_rank());
        assert!(RuleAction::Flag.severity_rank() < RuleAction::Allow.severity_rank());
        assert!(RuleAction::Flag.is_allowed());
        assert!(!RuleAction::RequireApproval.is_allowed());
    }

    #[test]
    fn budget_scope_keys_are_deterministic() {
        let global = BudgetLimit {
            window: BudgetWindow::Daily,
            max_amount: dec!(100),
            currency: None,
            agent_ids: None,
            service_ids: None,
        };
        assert_eq!(global.scope_key(), "global");

        let scoped = BudgetLimit {
            window: BudgetWindow::Daily,
            max_amount: dec!(100),
            currency: Some("USDC".to_string()),
            agent_ids: Some(vec!["b".to_string(), "a".to_string()]),
            service_ids: None,
        };
        // Ids are sorted, so declaration order never changes the key.
        assert_eq!(scoped.scope_key(), "agents=a,b;services=;currency=USDC");
    }

    #[test]
    fn policy_document_round_trip() {
        let json = r#"{
            "id": "default",
            "name": "Default controls",
            "enabled": true,
            "rules": [
                {
                    "id": "block-large",
                    "enabled": true,
                    "priority": 1,
                    "conditions": {"minAmount": 1000, "currencies": ["USDC"]},
                    "action": "deny"
                },
                {
                    "id": "approve-medium",
                    "enabled": true,
                    "priority": 2,
                    "conditions": {"minAmount": 100},
                    "action": "require_approval"
                }
            ],
            "budgets": [
                {"window": "daily", "maxAmount": 500, "currency": "USDC"}
            ],
            "cooldownMs": 1000,
            "futureField": "ignored"
        }"#;
        let policy = SpendPolicy::from_json(json).unwrap();
        assert_eq!(policy.rules.len(), 2);
        assert_eq!(policy.rules[0].action, RuleAction::Deny);
        assert_eq!(policy.rules[0].conditions.min_amount, Some(dec!(1000)));
        assert_eq!(policy.budgets[0].window, BudgetWindow::Daily);
        assert_eq!(policy.budgets[0].max_amount, dec!(500));
        assert_eq!(policy.cooldown_ms, Some(1000));
    }

    #[test]
    fn malformed_document_is_invalid() {
        let err = SpendPolicy::from_json("{\"id\": 42}").unwrap_err();
        assert!(matches!(err, PolicyError::InvalidDocument { .. }));
    }
}
