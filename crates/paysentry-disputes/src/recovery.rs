//! Refund recovery: a FIFO queue of retryable executor calls.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use paysentry_ledger::SpendTracker;
use paysentry_types::{generate_id, prefix};

use crate::dispute::{DisputeManager, DisputeStatus};

/// Result type for recovery operations
pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Recovery errors
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Dispute {dispute_id} not found")]
    DisputeNotFound { dispute_id: String },

    #[error("Dispute {dispute_id} is not refundable (status {status})")]
    NotRefundable { dispute_id: String, status: String },

    #[error("Recovery already in progress for dispute {dispute_id}")]
    ActiveRecoveryExists { dispute_id: String },

    #[error("Recovery {recovery_id} not found")]
    RecoveryNotFound { recovery_id: String },

    #[error("Recovery {recovery_id} cannot be cancelled (status {status})")]
    CannotCancel { recovery_id: String, status: String },

    #[error("Refund executor failed: {message}")]
    ExecutorFailed { message: String },
}

/// How funds return to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryType {
    FullRefund,
    PartialRefund,
    Chargeback,
    Credit,
}

/// Recovery action status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl RecoveryStatus {
    /// Only failed and cancelled actions free the dispute for another
    /// recovery attempt.
    pub fn blocks_new_recovery(&self) -> bool {
        !matches!(self, Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued refund action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub id: String,
    pub dispute_id: String,
    pub transaction_id: String,
    pub agent_id: String,
    pub action_type: RecoveryType,
    pub amount: Decimal,
    pub currency: String,
    pub status: RecoveryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// External refund transaction id, set on success
    pub refund_tx_id: Option<String>,
    /// Last executor error, set on failure
    pub error: Option<String>,
}

/// What the external executor reports back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundOutcome {
    pub success: bool,
    pub refund_tx_id: Option<String>,
    pub error: Option<String>,
}

/// Executes refunds against an external rail. May yield; may fail.
#[async_trait::async_trait]
pub trait RefundExecutor: Send + Sync {
    async fn execute(&self, action: &RecoveryAction) -> RecoveryResult<RefundOutcome>;
}

/// Retry tuning for [`RecoveryEngine::process_queue`]
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Executor attempts per action per queue run
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `n * retry_delay_ms` before the next try
    pub retry_delay_ms: u64,
    /// Currency used when the transaction is unknown to the ledger
    pub default_currency: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            default_currency: "USDC".to_string(),
        }
    }
}

/// Aggregate recovery figures
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub total_recovered: Decimal,
}

#[derive(Default)]
struct RecoveryStore {
    actions: HashMap<String, RecoveryAction>,
    queue: VecDeque<String>,
}

/// The recovery engine. Actions enqueue FIFO and are attempted in that
/// order within one `process_queue` run.
pub struct RecoveryEngine {
    disputes: Arc<DisputeManager>,
    tracker: Arc<SpendTracker>,
    executor: Arc<dyn RefundExecutor>,
    config: RecoveryConfig,
    store: RwLock<RecoveryStore>,
}

impl RecoveryEngine {
    pub fn new(
        disputes: Arc<DisputeManager>,
        tracker: Arc<SpendTracker>,
        executor: Arc<dyn RefundExecutor>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            disputes,
            tracker,
            executor,
            config,
            store: RwLock::new(RecoveryStore::default()),
        }
    }

    /// Queue a refund for a favorably resolved dispute.
    ///
    /// The amount is the dispute's resolved amount, falling back to the
    /// requested amount; partial resolutions produce partial refunds.
    pub fn initiate(&self, dispute_id: &str) -> RecoveryResult<RecoveryAction> {
        let dispute =
            self.disputes
                .get(dispute_id)
                .ok_or_else(|| RecoveryError::DisputeNotFound {
                    dispute_id: dispute_id.to_string(),
                })?;

        let action_type = match dispute.status {
            DisputeStatus::ResolvedRefunded => RecoveryType::FullRefund,
            DisputeStatus::ResolvedPartial => RecoveryType::PartialRefund,
            other => {
                return Err(RecoveryError::NotRefundable {
                    dispute_id: dispute_id.to_string(),
                    status: other.to_string(),
                })
            }
        };

        let mut store = self.store.write();
        let blocked = store
            .actions
            .values()
            .any(|a| a.dispute_id == dispute_id && a.status.blocks_new_recovery());
        if blocked {
            return Err(RecoveryError::ActiveRecoveryExists {
                dispute_id: dispute_id.to_string(),
            });
        }

        let currency = self
            .tracker
            .get(&dispute.transaction_id)
            .map(|tx| tx.currency)
            .unwrap_or_else(|| self.config.default_currency.clone());
        let now = Utc::now();
        let action = RecoveryAction {
            id: generate_id(prefix::RECOVERY),
            dispute_id: dispute.id.clone(),
            transaction_id: dispute.transaction_id.clone(),
            agent_id: dispute.agent_id.clone(),
            action_type,
            amount: dispute.resolved_amount.unwrap_or(dispute.requested_amount),
            currency,
            status: RecoveryStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            refund_tx_id: None,
            error: None,
        };
        store.queue.push_back(action.id.clone());
        store.actions.insert(action.id.clone(), action.clone());
        info!(recovery_id = %action.id, dispute_id = %dispute.id, "recovery queued");
        Ok(action)
    }

    /// Drain the queue, attempting each non-cancelled action in FIFO order
    /// with linear backoff between retries. Returns the actions touched.
    pub async fn process_queue(&self) -> Vec<RecoveryAction> {
        let ids: Vec<String> = {
            let mut store = self.store.write();
            store.queue.drain(..).collect()
        };

        let mut processed = Vec::new();
        for id in ids {
            let action = match self.transition(&id, RecoveryStatus::Processing) {
                Some(action) => action,
                // Cancelled while queued (or unknown): skip.
                None => continue,
            };

            let mut refund: Option<RefundOutcome> = None;
            let mut last_error = None;
            for attempt in 1..=self.config.max_retries {
                match self.executor.execute(&action).await {
                    Ok(outcome) if outcome.success => {
                        refund = Some(outcome);
                        break;
                    }
                    Ok(outcome) => {
                        last_error = Some(
                            outcome
                                .error
                                .unwrap_or_else(|| "refund executor reported failure".to_string()),
                        );
                    }
                    Err(e) => last_error = Some(e.to_string()),
                }
                warn!(
                    recovery_id = %action.id,
                    attempt,
                    max = self.config.max_retries,
                    "refund attempt failed"
                );
                if attempt < self.config.max_retries {
                    let delay = self.config.retry_delay_ms * attempt as u64;
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
            }

            let finished = {
                let mut store = self.store.write();
                let slot = store.actions.get_mut(&action.id);
                match (slot, refund) {
                    (Some(slot), Some(outcome)) => {
                        let now = Utc::now();
                        slot.status = RecoveryStatus::Completed;
                        slot.refund_tx_id = outcome.refund_tx_id;
                        slot.completed_at = Some(now);
                        slot.updated_at = now;
                        slot.error = None;
                        Some(slot.clone())
                    }
                    (Some(slot), None) => {
                        slot.status = RecoveryStatus::Failed;
                        slot.error = last_error;
                        slot.updated_at = Utc::now();
                        Some(slot.clone())
                    }
                    (None, _) => None,
                }
            };
            if let Some(finished) = finished {
                match finished.status {
                    RecoveryStatus::Completed => {
                        info!(recovery_id = %finished.id, "refund completed")
                    }
                    _ => warn!(recovery_id = %finished.id, "refund failed after retries"),
                }
                processed.push(finished);
            }
        }
        processed
    }

    /// Move a queued action to processing; returns None if it is no
    /// longer pending (e.g. cancelled while queued).
    fn transition(&self, id: &str, to: RecoveryStatus) -> Option<RecoveryAction> {
        let mut store = self.store.write();
        let action = store.actions.get_mut(id)?;
        if action.status != RecoveryStatus::Pending {
            return None;
        }
        action.status = to;
        action.updated_at = Utc::now();
        Some(action.clone())
    }

    /// Cancel a pending action. Anything already processing or finished
    /// refuses.
    pub fn cancel(&self, recovery_id: &str) -> RecoveryResult<RecoveryAction> {
        let mut store = self.store.write();
        let action =
            store
                .actions
                .get_mut(recovery_id)
                .ok_or_else(|| RecoveryError::RecoveryNotFound {
                    recovery_id: recovery_id.to_string(),
                })?;
        if action.status != RecoveryStatus::Pending {
            return Err(RecoveryError::CannotCancel {
                recovery_id: recovery_id.to_string(),
                status: action.status.to_string(),
            });
        }
        action.status = RecoveryStatus::Cancelled;
        action.updated_at = Utc::now();
        Ok(action.clone())
    }

    pub fn get(&self, recovery_id: &str) -> Option<RecoveryAction> {
        self.store.read().actions.get(recovery_id).cloned()
    }

    pub fn get_by_dispute(&self, dispute_id: &str) -> Vec<RecoveryAction> {
        let mut actions: Vec<RecoveryAction> = self
            .store
            .read()
            .actions
            .values()
            .filter(|a| a.dispute_id == dispute_id)
            .cloned()
            .collect();
        actions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        actions
    }

    pub fn all(&self, status: Option<RecoveryStatus>) -> Vec<RecoveryAction> {
        let mut actions: Vec<RecoveryAction> = self
            .store
            .read()
            .actions
            .values()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        actions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        actions
    }

    pub fn stats(&self) -> RecoveryStats {
        let store = self.store.read();
        let mut stats = RecoveryStats {
            total: store.actions.len(),
            ..Default::default()
        };
        for action in store.actions.values() {
            *stats
                .by_status
                .entry(action.status.to_string())
                .or_default() += 1;
            if action.status == RecoveryStatus::Completed {
                stats.total_recovered += action.amount;
            }
        }
        stats
    }
}
