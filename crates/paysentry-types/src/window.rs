//! Budget windows and timestamp formatting.
//!
//! Window keys identify one window instance deterministically so that two
//! timestamps inside the same hour/day/week/month address the same budget
//! bucket. All keys are computed in UTC; weeks are ISO weeks starting
//! Monday.

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// The window a budget limit accumulates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetWindow {
    /// Every evaluation is its own window
    PerTransaction,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl BudgetWindow {
    /// Compute the key of the window instance containing `at`.
    pub fn window_key(&self, at: DateTime<Utc>) -> String {
        match self {
            BudgetWindow::PerTransaction => String::new(),
            BudgetWindow::Hourly => at.format("%Y-%m-%dT%H").to_string(),
            BudgetWindow::Daily => at.format("%Y-%m-%d").to_string(),
            BudgetWindow::Weekly => {
                let iso = at.iso_week();
                NaiveDate::from_isoywd_opt(iso.year(), iso.week(), Weekday::Mon)
                    .map(|monday| monday.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| at.format("%Y-%m-%d").to_string())
            }
            BudgetWindow::Monthly => at.format("%Y-%m").to_string(),
        }
    }

    /// Label used inside bucket keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetWindow::PerTransaction => "per_transaction",
            BudgetWindow::Hourly => "hourly",
            BudgetWindow::Daily => "daily",
            BudgetWindow::Weekly => "weekly",
            BudgetWindow::Monthly => "monthly",
        }
    }
}

impl std::fmt::Display for BudgetWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format a timestamp as ISO-8601 UTC with millisecond precision.
///
/// Lexicographic comparison of two formatted values equals chronological
/// comparison of the underlying instants.
pub fn iso_millis(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
