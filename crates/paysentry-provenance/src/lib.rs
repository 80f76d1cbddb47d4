//! PaySentry Provenance - Append-only lifecycle records
//!
//! Every transaction accumulates a chain of stage records: intent,
//! policy check, approval, execution, settlement, dispute. Once appended,
//! records are never removed or reordered.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle stage of a provenance record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceStage {
    Intent,
    PolicyCheck,
    Approval,
    Execution,
    Settlement,
    Dispute,
}

impl ProvenanceStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intent => "intent",
            Self::PolicyCheck => "policy_check",
            Self::Approval => "approval",
            Self::Execution => "execution",
            Self::Settlement => "settlement",
            Self::Dispute => "dispute",
        }
    }
}

impl std::fmt::Display for ProvenanceStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Pass,
    Fail,
    Pending,
}

/// One appended stage record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub transaction_id: String,
    pub stage: ProvenanceStage,
    pub timestamp: DateTime<Utc>,
    /// Human-readable description of what happened
    pub action: String,
    pub outcome: StageOutcome,
    /// Stage-specific details, stored verbatim
    pub details: Value,
}

#[derive(Default)]
struct LogState {
    chains: HashMap<String, Vec<ProvenanceRecord>>,
    total: usize,
}

/// The provenance log. Appends are serialized per transaction id by the
/// single lock; cross-transaction appends contend only briefly.
pub struct ProvenanceLog {
    state: RwLock<LogState>,
}

impl ProvenanceLog {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LogState::default()),
        }
    }

    fn append(
        &self,
        transaction_id: &str,
        stage: ProvenanceStage,
        action: impl Into<String>,
        outcome: StageOutcome,
        details: Value,
    ) -> ProvenanceRecord {
        let record = ProvenanceRecord {
            transaction_id: transaction_id.to_string(),
            stage,
            timestamp: Utc::now(),
            action: action.into(),
            outcome,
            details,
        };
        let mut state = self.state.write();
        state
            .chains
            .entry(transaction_id.to_string())
            .or_default()
            .push(record.clone());
        state.total += 1;
        record
    }

    pub fn record_intent(
        &self,
        transaction_id: &str,
        action: impl Into<String>,
        details: Value,
    ) -> ProvenanceRecord {
        self.append(
            transaction_id,
            ProvenanceStage::Intent,
            action,
            StageOutcome::Pending,
            details,
        )
    }

    pub fn record_policy_check(
        &self,
        transaction_id: &str,
        outcome: StageOutcome,
        details: Value,
    ) -> ProvenanceRecord {
        self.append(
            transaction_id,
            ProvenanceStage::PolicyCheck,
            "policy evaluation",
            outcome,
            details,
        )
    }

    pub fn record_approval(
        &self,
        transaction_id: &str,
        outcome: StageOutcome,
        details: Value,
    ) -> ProvenanceRecord {
        self.append(
            transaction_id,
            ProvenanceStage::Approval,
            "approval decision",
            outcome,
            details,
        )
    }

    pub fn record_execution(
        &self,
        transaction_id: &str,
        action: impl Into<String>,
        details: Value,
    ) -> ProvenanceRecord {
        self.append(
            transaction_id,
            ProvenanceStage::Execution,
            action,
            StageOutcome::Pending,
            details,
        )
    }

    pub fn record_settlement(
        &self,
        transaction_id: &str,
        outcome: StageOutcome,
        details: Value,
    ) -> ProvenanceRecord {
        self.append(
            transaction_id,
            ProvenanceStage::Settlement,
            "settlement",
            outcome,
            details,
        )
    }

    pub fn record_dispute(
        &self,
        transaction_id: &str,
        action: impl Into<String>,
        details: Value,
    ) -> ProvenanceRecord {
        self.append(
            transaction_id,
            ProvenanceStage::Dispute,
            action,
            StageOutcome::Pending,
            details,
        )
    }

    /// The chronological chain for a transaction.
    pub fn chain(&self, transaction_id: &str) -> Vec<ProvenanceRecord> {
        self.state
            .read()
            .chains
            .get(transaction_id)
            .cloned()
            .unwrap_or_default()
    }

    /// A chain is complete once it has an intent record and reached either
    /// settlement or dispute.
    pub fn is_complete(&self, transaction_id: &str) -> bool {
        let state = self.state.read();
        match state.chains.get(transaction_id) {
            Some(records) => {
                let has = |stage: ProvenanceStage| records.iter().any(|r| r.stage == stage);
                has(ProvenanceStage::Intent)
                    && (has(ProvenanceStage::Settlement) || has(ProvenanceStage::Dispute))
            }
            None => false,
        }
    }

    pub fn last_stage(&self, transaction_id: &str) -> Option<ProvenanceStage> {
        self.state
            .read()
            .chains
            .get(transaction_id)
            .and_then(|records| records.last().map(|r| r.stage))
    }

    pub fn transaction_ids(&self) -> Vec<String> {
        self.state.read().chains.keys().cloned().collect()
    }

    pub fn total_records(&self) -> usize {
        self.state.read().total
    }
}

impl Default for ProvenanceLog {
    fn default() -> Self {
        Self::new()
    }
}
