//! Per-key circuit breaker.
//!
//! Each key carries independent closed / open / half-open state. All
//! transitions happen under one mutex, so a burst of concurrent failures
//! that collectively cross the threshold trips the breaker exactly once.

use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};

/// Breaker state per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

/// Breaker tuning
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a probe
    pub recovery_timeout_ms: u64,
    /// Probes admitted concurrently while half-open
    pub half_open_max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_max_requests: 1,
        }
    }
}

/// Read-only view of one key's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub first_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_in_flight: u32,
}

#[derive(Debug, Clone)]
struct KeyState {
    state: BreakerState,
    failure_count: u32,
    first_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            first_failure_at: None,
            opened_at: None,
            half_open_in_flight: 0,
        }
    }
}

/// The circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` through the breaker for `key`.
    ///
    /// Open breakers reject immediately with [`GatewayError::BreakerOpen`]
    /// and never invoke `f`; once the recovery timeout elapses the next
    /// call is admitted as a half-open probe.
    pub async fn execute<T, F, Fut>(&self, key: &str, f: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.admit(key)?;
        let result = f().await;
        match &result {
            Ok(_) => self.on_success(key),
            Err(_) => self.on_failure(key),
        }
        result
    }

    fn admit(&self, key: &str) -> GatewayResult<()> {
        let mut keys = self.keys.lock();
        let entry = keys.entry(key.to_string()).or_default();
        match entry.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = entry.opened_at.unwrap_or_else(Utc::now);
                let elapsed = (Utc::now() - opened_at).num_milliseconds().max(0) as u64;
                if elapsed >= self.config.recovery_timeout_ms {
                    info!(key, "circuit breaker admitting half-open probe");
                    entry.state = BreakerState::HalfOpen;
                    entry.half_open_in_flight = 1;
                    Ok(())
                } else {
                    Err(GatewayError::BreakerOpen {
                        key: key.to_string(),
                        remaining_ms: self.config.recovery_timeout_ms - elapsed,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if entry.half_open_in_flight < self.config.half_open_max_requests {
                    entry.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(GatewayError::BreakerOpen {
                        key: key.to_string(),
                        remaining_ms: 0,
                    })
                }
            }
        }
    }

    fn on_success(&self, key: &str) {
        let mut keys = self.keys.lock();
        let entry = keys.entry(key.to_string()).or_default();
        match entry.state {
            BreakerState::HalfOpen => {
                info!(key, "circuit breaker closed after successful probe");
                *entry = KeyState::default();
            }
            _ => {
                entry.failure_count = 0;
                entry.first_failure_at = None;
            }
        }
    }

    fn on_failure(&self, key: &str) {
        let mut keys = self.keys.lock();
        let entry = keys.entry(key.to_string()).or_default();
        match entry.state {
            BreakerState::Closed => {
                entry.failure_count += 1;
                entry.first_failure_at.get_or_insert_with(Utc::now);
                if entry.failure_count >= self.config.failure_threshold {
                    warn!(key, failures = entry.failure_count, "circuit breaker opened");
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(Utc::now());
                    entry.half_open_in_flight = 0;
                }
            }
            BreakerState::HalfOpen => {
                warn!(key, "half-open probe failed; circuit breaker reopened");
                entry.state = BreakerState::Open;
                entry.opened_at = Some(Utc::now());
                entry.half_open_in_flight = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self, key: &str) -> BreakerState {
        self.keys
            .lock()
            .get(key)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Snapshot every known key.
    pub fn snapshot(&self) -> HashMap<String, BreakerSnapshot> {
        self.keys
            .lock()
            .iter()
            .map(|(key, e)| {
                (
                    key.clone(),
                    BreakerSnapshot {
                        state: e.state,
                        failure_count: e.failure_count,
                        first_failure_at: e.first_failure_at,
                        opened_at: e.opened_at,
                        half_open_in_flight: e.half_open_in_flight,
                    },
                )
            })
            .collect()
    }

    /// Unconditionally return one key to closed with zero counts.
    pub fn reset(&self, key: &str) {
        self.keys
            .lock()
            .insert(key.to_string(), KeyState::default());
    }

    /// Reset every key.
    pub fn reset_all(&self) {
        self.keys.lock().clear();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
