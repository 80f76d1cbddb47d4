//! Indexed in-memory transaction store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use paysentry_types::{PaymentProtocol, Transaction, TransactionStatus};

/// Filter for [`SpendTracker::query`]. All present fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionQuery {
    pub agent_id: Option<String>,
    pub recipient: Option<String>,
    pub service_id: Option<String>,
    pub protocol: Option<PaymentProtocol>,
    pub status: Option<TransactionStatus>,
    pub currency: Option<String>,
    /// Inclusive lower bound on amount
    pub min_amount: Option<Decimal>,
    /// Inclusive upper bound on amount
    pub max_amount: Option<Decimal>,
    /// Created at or after this instant
    pub after: Option<DateTime<Utc>>,
    /// Created at or before this instant
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Default)]
struct TrackerState {
    transactions: HashMap<String, Transaction>,
    by_agent: HashMap<String, Vec<String>>,
    by_service: HashMap<String, Vec<String>>,
    by_recipient: HashMap<String, Vec<String>>,
    /// Insertion order for chronological scans
    order: Vec<String>,
}

/// The spend ledger.
///
/// Secondary indices and the chronological list are derived state over the
/// primary map; they are only touched on first insert, so updating a
/// transaction in place never moves it.
pub struct SpendTracker {
    state: RwLock<TrackerState>,
}

impl SpendTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
        }
    }

    /// Insert a new transaction or overwrite an existing one in place.
    pub fn record(&self, tx: Transaction) {
        let mut state = self.state.write();
        if state.transactions.contains_key(&tx.id) {
            debug!(tx_id = %tx.id, status = %tx.status, "transaction updated");
            state.transactions.insert(tx.id.clone(), tx);
            return;
        }

        debug!(tx_id = %tx.id, agent = %tx.agent_id, "transaction recorded");
        state
            .by_agent
            .entry(tx.agent_id.clone())
            .or_default()
            .push(tx.id.clone());
        if let Some(service) = &tx.service_id {
            state
                .by_service
                .entry(service.clone())
                .or_default()
                .push(tx.id.clone());
        }
        state
            .by_recipient
            .entry(tx.recipient.clone())
            .or_default()
            .push(tx.id.clone());
        state.order.push(tx.id.clone());
        state.transactions.insert(tx.id.clone(), tx);
    }

    pub fn get(&self, id: &str) -> Option<Transaction> {
        self.state.read().transactions.get(id).cloned()
    }

    /// All transactions for an agent, newest-first.
    pub fn get_by_agent(&self, agent_id: &str) -> Vec<Transaction> {
        let state = self.state.read();
        Self::collect_newest_first(&state, state.by_agent.get(agent_id))
    }

    /// All transactions for a service tag, newest-first.
    pub fn get_by_service(&self, service_id: &str) -> Vec<Transaction> {
        let state = self.state.read();
        Self::collect_newest_first(&state, state.by_service.get(service_id))
    }

    /// All transactions to a recipient, newest-first.
    pub fn get_by_recipient(&self, recipient: &str) -> Vec<Transaction> {
        let state = self.state.read();
        Self::collect_newest_first(&state, state.by_recipient.get(recipient))
    }

    fn collect_newest_first(state: &TrackerState, ids: Option<&Vec<String>>) -> Vec<Transaction> {
        ids.map(|ids| {
            ids.iter()
                .rev()
                .filter_map(|id| state.transactions.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }

    /// Filtered query, newest-first, truncated to `limit`.
    ///
    /// The starting set is the most selective available index, preferring
    /// agent, then service, then recipient; remaining predicates apply with
    /// AND semantics.
    pub fn query(&self, q: &TransactionQuery) -> Vec<Transaction> {
        let state = self.state.read();
        let start: &Vec<String> = if let Some(agent) = &q.agent_id {
            match state.by_agent.get(agent) {
                Some(ids) => ids,
                None => return Vec::new(),
            }
        } else if let Some(service) = &q.service_id {
            match state.by_service.get(service) {
                Some(ids) => ids,
                None => return Vec::new(),
            }
        } else if let Some(recipient) = &q.recipient {
            match state.by_recipient.get(recipient) {
                Some(ids) => ids,
                None => return Vec::new(),
            }
        } else {
            &state.order
        };

        let limit = q.limit.unwrap_or(usize::MAX);
        start
            .iter()
            .rev()
            .filter_map(|id| state.transactions.get(id))
            .filter(|tx| Self::matches(tx, q))
            .take(limit)
            .cloned()
            .collect()
    }

    fn matches(tx: &Transaction, q: &TransactionQuery) -> bool {
        if let Some(agent) = &q.agent_id {
            if &tx.agent_id != agent {
                return false;
            }
        }
        if let Some(recipient) = &q.recipient {
            if &tx.recipient != recipient {
                return false;
            }
        }
        if let Some(service) = &q.service_id {
            if tx.service_id.as_ref() != Some(service) {
                return false;
            }
        }
        if let Some(protocol) = q.protocol {
            if tx.protocol != protocol {
                return false;
            }
        }
        if let Some(status) = q.status {
            if tx.status != status {
                return false;
            }
        }
        if let Some(currency) = &q.currency {
            if &tx.currency != currency {
                return false;
            }
        }
        if let Some(min) = q.min_amount {
            if tx.amount < min {
                return false;
            }
        }
        if let Some(max) = q.max_amount {
            if tx.amount > max {
                return false;
            }
        }
        if let Some(after) = q.after {
            if tx.created_at < after {
                return false;
            }
        }
        if let Some(before) = q.before {
            if tx.created_at > before {
                return false;
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.state.read().transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().transactions.is_empty()
    }

    /// Distinct agent ids that have recorded transactions.
    pub fn agents(&self) -> Vec<String> {
        self.state.read().by_agent.keys().cloned().collect()
    }

    /// Distinct recipients that have received transactions.
    pub fn recipients(&self) -> Vec<String> {
        self.state.read().by_recipient.keys().cloned().collect()
    }
}

impl Default for SpendTracker {
    fn default() -> Self {
        Self::new()
    }
}
