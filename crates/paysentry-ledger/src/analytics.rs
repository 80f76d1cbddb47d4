//! Aggregated spending summaries over the tracker.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use paysentry_types::TransactionStatus;

use crate::tracker::{SpendTracker, TransactionQuery};

/// Scope for a summary. Absent fields mean "everything".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsQuery {
    pub agent_id: Option<String>,
    pub currency: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    /// How many top recipients to report (default 5)
    pub top_recipients: Option<usize>,
}

/// Volume routed to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientVolume {
    pub recipient: String,
    pub total: Decimal,
    pub count: usize,
}

/// Aggregated view of the transaction stream.
///
/// Volume figures count completed transactions only; status counts cover
/// everything in scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpendSummary {
    pub transaction_count: usize,
    pub completed_count: usize,
    pub counts_by_status: HashMap<String, usize>,
    pub volume_by_currency: HashMap<String, Decimal>,
    pub volume_by_agent: HashMap<String, Decimal>,
    pub volume_by_service: HashMap<String, Decimal>,
    pub volume_by_protocol: HashMap<String, Decimal>,
    pub average_by_currency: HashMap<String, Decimal>,
    pub top_recipients: Vec<RecipientVolume>,
}

/// Stateless aggregation over a [`SpendTracker`].
pub struct SpendAnalytics;

impl SpendAnalytics {
    pub fn summarize(tracker: &SpendTracker, q: &AnalyticsQuery) -> SpendSummary {
        let txs = tracker.query(&TransactionQuery {
            agent_id: q.agent_id.clone(),
            currency: q.currency.clone(),
            after: q.after,
            before: q.before,
            ..Default::default()
        });

        let mut summary = SpendSummary {
            transaction_count: txs.len(),
            ..Default::default()
        };
        let mut completed_counts: HashMap<String, usize> = HashMap::new();
        let mut recipient_volume: HashMap<String, (Decimal, usize)> = HashMap::new();

        for tx in &txs {
            *summary
                .counts_by_status
                .entry(tx.status.to_string())
                .or_default() += 1;

            if tx.status != TransactionStatus::Completed {
                continue;
            }
            summary.completed_count += 1;
            *summary
                .volume_by_currency
                .entry(tx.currency.clone())
                .or_default() += tx.amount;
            *summary
                .volume_by_agent
                .entry(tx.agent_id.clone())
                .or_default() += tx.amount;
            if let Some(service) = &tx.service_id {
                *summary
                    .volume_by_service
                    .entry(service.clone())
                    .or_default() += tx.amount;
            }
            *summary
                .volume_by_protocol
                .entry(tx.protocol.to_string())
                .or_default() += tx.amount;
            *completed_counts.entry(tx.currency.clone()).or_default() += 1;
            let entry = recipient_volume
                .entry(tx.recipient.clone())
                .or_insert((Decimal::ZERO, 0));
            entry.0 += tx.amount;
            entry.1 += 1;
        }

        for (currency, total) in &summary.volume_by_currency {
            let count = completed_counts.get(currency).copied().unwrap_or(0);
            if count > 0 {
                summary
                    .average_by_currency
                    .insert(currency.clone(), total / Decimal::from(count));
            }
        }

        let mut ranked: Vec<RecipientVolume> = recipient_volume
            .into_iter()
            .map(|(recipient, (total, count))| RecipientVolume {
                recipient,
                total,
                count,
            })
            .collect();
        ranked.sort_by(|a, b| b.total.cmp(&a.total).then(a.recipient.cmp(&b.recipient)));
        ranked.truncate(q.top_recipients.unwrap_or(5));
        summary.top_recipients = ranked;

        summary
    }
}
