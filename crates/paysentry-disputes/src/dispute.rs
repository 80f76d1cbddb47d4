//! Dispute case lifecycle and evidence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use paysentry_provenance::ProvenanceLog;
use paysentry_types::{generate_id, prefix};

/// Result type for dispute operations
pub type DisputeResult<T> = Result<T, DisputeError>;

/// Dispute errors. Every variant names the offending id and is raised
/// before any state is mutated.
#[derive(Debug, Error)]
pub enum DisputeError {
    #[error("Active dispute already exists for transaction {transaction_id}")]
    ActiveDisputeExists { transaction_id: String },

    #[error("Dispute {dispute_id} not found")]
    DisputeNotFound { dispute_id: String },

    #[error("Dispute {dispute_id} is closed ({status})")]
    DisputeClosed { dispute_id: String, status: String },

    #[error("Status {status} is not a resolution; use update_status for open states")]
    NotAResolution { status: String },

    #[error("Status {status} closes a dispute; use resolve")]
    ResolutionViaUpdate { status: String },
}

/// Dispute status graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    Investigating,
    ResolvedRefunded,
    ResolvedDenied,
    ResolvedPartial,
    Escalated,
}

impl DisputeStatus {
    /// Closed disputes accept no further mutation.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::ResolvedRefunded | Self::ResolvedDenied | Self::ResolvedPartial
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Investigating => "investigating",
            Self::ResolvedRefunded => "resolved_refunded",
            Self::ResolvedDenied => "resolved_denied",
            Self::ResolvedPartial => "resolved_partial",
            Self::Escalated => "escalated",
        }
    }
}

impl std::fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is liable for the disputed amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiabilityParty {
    Agent,
    ServiceProvider,
    Protocol,
    User,
    Undetermined,
}

impl std::fmt::Display for LiabilityParty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::ServiceProvider => "service_provider",
            Self::Protocol => "protocol",
            Self::User => "user",
            Self::Undetermined => "undetermined",
        };
        f.write_str(s)
    }
}

/// One piece of evidence attached to a dispute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeEvidence {
    /// Free-form kind tag (`transaction_log`, `receipt`, `correspondence`, ...)
    pub kind: String,
    pub description: String,
    pub data: serde_json::Value,
    pub added_at: DateTime<Utc>,
}

impl DisputeEvidence {
    pub fn new(
        kind: impl Into<String>,
        description: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            data,
            added_at: Utc::now(),
        }
    }
}

/// A dispute case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeCase {
    pub id: String,
    pub transaction_id: String,
    pub agent_id: String,
    pub reason: String,
    pub status: DisputeStatus,
    pub liability: LiabilityParty,
    pub requested_amount: Decimal,
    pub resolved_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set exactly when the dispute closes
    pub resolved_at: Option<DateTime<Utc>>,
    /// Ordered; the provenance snapshot, when configured, comes first
    pub evidence: Vec<DisputeEvidence>,
}

/// Input to [`DisputeManager::file`]
#[derive(Debug, Clone)]
pub struct FileDisputeInput {
    pub transaction_id: String,
    pub agent_id: String,
    pub reason: String,
    pub requested_amount: Decimal,
    /// User-supplied evidence, appended after the provenance snapshot
    pub evidence: Vec<DisputeEvidence>,
}

/// How a dispute closes
#[derive(Debug, Clone)]
pub struct Resolution {
    pub status: DisputeStatus,
    pub liability: LiabilityParty,
    pub resolved_amount: Option<Decimal>,
}

/// Filter for [`DisputeManager::query`]. All present fields must match.
#[derive(Debug, Clone, Default)]
pub struct DisputeQuery {
    pub status: Option<DisputeStatus>,
    pub agent_id: Option<String>,
    pub transaction_id: Option<String>,
    pub liability: Option<LiabilityParty>,
    pub limit: Option<usize>,
}

/// Aggregate dispute figures
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisputeStats {
    pub total: usize,
    pub active: usize,
    pub by_status: HashMap<String, usize>,
    pub by_liability: HashMap<String, usize>,
    pub total_requested: Decimal,
    pub total_resolved: Decimal,
}

/// Notified on every status change. Errors are caught and logged; they
/// never abort the operation or later listeners.
#[async_trait::async_trait]
pub trait DisputeListener: Send + Sync {
    async fn on_status_change(
        &self,
        dispute: &DisputeCase,
        previous: DisputeStatus,
    ) -> DisputeResult<()>;

    fn name(&self) -> &str;
}

#[derive(Default)]
struct DisputeStore {
    disputes: HashMap<String, DisputeCase>,
    order: Vec<String>,
}

/// The dispute manager.
pub struct DisputeManager {
    store: RwLock<DisputeStore>,
    listeners: RwLock<Vec<Arc<dyn DisputeListener>>>,
    provenance: Option<Arc<ProvenanceLog>>,
}

impl DisputeManager {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(DisputeStore::default()),
            listeners: RwLock::new(Vec::new()),
            provenance: None,
        }
    }

    /// Attach a provenance log: filing then snapshots the transaction's
    /// chain into evidence and appends a dispute stage record.
    pub fn with_provenance(provenance: Arc<ProvenanceLog>) -> Self {
        Self {
            store: RwLock::new(DisputeStore::default()),
            listeners: RwLock::new(Vec::new()),
            provenance: Some(provenance),
        }
    }

    pub fn on_status_change(&self, listener: Arc<dyn DisputeListener>) {
        self.listeners.write().push(listener);
    }

    /// File a new dispute. Fails if the transaction already has a
    /// non-closed dispute.
    pub fn file(&self, input: FileDisputeInput) -> DisputeResult<DisputeCase> {
        let mut store = self.store.write();
        let active_exists = store.disputes.values().any(|d| {
            d.transaction_id == input.transaction_id && !d.status.is_closed()
        });
        if active_exists {
            return Err(DisputeError::ActiveDisputeExists {
                transaction_id: input.transaction_id,
            });
        }

        let now = Utc::now();
        let mut evidence = Vec::new();
        if let Some(provenance) = &self.provenance {
            let chain = provenance.chain(&input.transaction_id);
            evidence.push(DisputeEvidence {
                kind: "transaction_log".to_string(),
                description: format!(
                    "Provenance chain for {} at filing time",
                    input.transaction_id
                ),
                data: json!({ "records": chain }),
                added_at: now,
            });
        }
        evidence.extend(input.evidence);

        let dispute = DisputeCase {
            id: generate_id(prefix::DISPUTE),
            transaction_id: input.transaction_id.clone(),
            agent_id: input.agent_id,
            reason: input.reason.clone(),
            status: DisputeStatus::Open,
            liability: LiabilityParty::Undetermined,
            requested_amount: input.requested_amount,
            resolved_amount: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            evidence,
        };

        store.order.push(dispute.id.clone());
        store.disputes.insert(dispute.id.clone(), dispute.clone());
        drop(store);

        if let Some(provenance) = &self.provenance {
            provenance.record_dispute(
                &input.transaction_id,
                "dispute filed",
                json!({ "disputeId": dispute.id, "reason": input.reason }),
            );
        }
        info!(dispute_id = %dispute.id, tx_id = %dispute.transaction_id, "dispute filed");
        Ok(dispute)
    }

    /// Append evidence. Closed disputes refuse it.
    pub fn add_evidence(
        &self,
        dispute_id: &str,
        evidence: DisputeEvidence,
    ) -> DisputeResult<DisputeCase> {
        let mut store = self.store.write();
        let dispute =
            store
                .disputes
                .get_mut(dispute_id)
                .ok_or_else(|| DisputeError::DisputeNotFound {
                    dispute_id: dispute_id.to_string(),
                })?;
        if dispute.status.is_closed() {
            return Err(DisputeError::DisputeClosed {
                dispute_id: dispute_id.to_string(),
                status: dispute.status.to_string(),
            });
        }
        dispute.evidence.push(evidence);
        dispute.updated_at = Utc::now();
        Ok(dispute.clone())
    }

    /// Move a dispute between open states. Closing statuses must go
    /// through [`DisputeManager::resolve`] so `resolved_at` is stamped.
    pub async fn update_status(
        &self,
        dispute_id: &str,
        status: DisputeStatus,
    ) -> DisputeResult<DisputeCase> {
        if status.is_closed() {
            return Err(DisputeError::ResolutionViaUpdate {
                status: status.to_string(),
            });
        }
        let (dispute, previous) = {
            let mut store = self.store.write();
            let dispute =
                store
                    .disputes
                    .get_mut(dispute_id)
                    .ok_or_else(|| DisputeError::DisputeNotFound {
                        dispute_id: dispute_id.to_string(),
                    })?;
            if dispute.status.is_closed() {
                return Err(DisputeError::DisputeClosed {
                    dispute_id: dispute_id.to_string(),
                    status: dispute.status.to_string(),
                });
            }
            let previous = dispute.status;
            dispute.status = status;
            dispute.updated_at = Utc::now();
            (dispute.clone(), previous)
        };
        self.notify(&dispute, previous).await;
        Ok(dispute)
    }

    /// Close a dispute with a resolution, stamping `resolved_at`.
    pub async fn resolve(
        &self,
        dispute_id: &str,
        resolution: Resolution,
    ) -> DisputeResult<DisputeCase> {
        if !resolution.status.is_closed() {
            return Err(DisputeError::NotAResolution {
                status: resolution.status.to_string(),
            });
        }
        let (dispute, previous) = {
            let mut store = self.store.write();
            let dispute =
                store
                    .disputes
                    .get_mut(dispute_id)
                    .ok_or_else(|| DisputeError::DisputeNotFound {
                        dispute_id: dispute_id.to_string(),
                    })?;
            if dispute.status.is_closed() {
                return Err(DisputeError::DisputeClosed {
                    dispute_id: dispute_id.to_string(),
                    status: dispute.status.to_string(),
                });
            }
            let previous = dispute.status;
            let now = Utc::now();
            dispute.status = resolution.status;
            dispute.liability = resolution.liability;
            dispute.resolved_amount = resolution.resolved_amount;
            dispute.resolved_at = Some(now);
            dispute.updated_at = now;
            (dispute.clone(), previous)
        };
        info!(
            dispute_id = %dispute.id,
            status = %dispute.status,
            liability = %dispute.liability,
            "dispute resolved"
        );
        self.notify(&dispute, previous).await;
        Ok(dispute)
    }

    async fn notify(&self, dispute: &DisputeCase, previous: DisputeStatus) {
        let listeners: Vec<Arc<dyn DisputeListener>> = self.listeners.read().clone();
        for listener in listeners {
            if let Err(e) = listener.on_status_change(dispute, previous).await {
                warn!(listener = listener.name(), error = %e, "dispute listener failed");
            }
        }
    }

    pub fn get(&self, dispute_id: &str) -> Option<DisputeCase> {
        self.store.read().disputes.get(dispute_id).cloned()
    }

    /// All disputes ever filed for a transaction, newest-first.
    pub fn get_by_transaction(&self, transaction_id: &str) -> Vec<DisputeCase> {
        self.query(&DisputeQuery {
            transaction_id: Some(transaction_id.to_string()),
            ..Default::default()
        })
    }

    pub fn get_by_agent(&self, agent_id: &str) -> Vec<DisputeCase> {
        self.query(&DisputeQuery {
            agent_id: Some(agent_id.to_string()),
            ..Default::default()
        })
    }

    /// AND of present filters, newest-first, truncated to `limit`.
    pub fn query(&self, q: &DisputeQuery) -> Vec<DisputeCase> {
        let store = self.store.read();
        let limit = q.limit.unwrap_or(usize::MAX);
        store
            .order
            .iter()
            .rev()
            .filter_map(|id| store.disputes.get(id))
            .filter(|d| {
                q.status.map_or(true, |s| d.status == s)
                    && q.agent_id.as_ref().map_or(true, |a| &d.agent_id == a)
                    && q.transaction_id
                        .as_ref()
                        .map_or(true, |t| &d.transaction_id == t)
                    && q.liability.map_or(true, |l| d.liability == l)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> DisputeStats {
        let store = self.store.read();
        let mut stats = DisputeStats {
            total: store.disputes.len(),
            ..Default::default()
        };
        for dispute in store.disputes.values() {
            if !dispute.status.is_closed() {
                stats.active += 1;
            }
            *stats
                .by_status
                .entry(dispute.status.to_string())
                .or_default() += 1;
            *stats
                .by_liability
                .entry(dispute.liability.to_string())
                .or_default() += 1;
            stats.total_requested += dispute.requested_amount;
            if let Some(resolved) = dispute.resolved_amount {
                stats.total_resolved += resolved;
            }
        }
        stats
    }
}

impl Default for DisputeManager {
    fn default() -> Self {
        Self::new()
    }
}
