use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for transient failures, applied through broker redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of redeliveries before the message is dead-lettered.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

/// What to do with a delivery whose handling failed transiently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue, deliverable again after `delay`.
    Requeue { attempt: u32, delay: Duration },
    /// Retry budget spent; reject without requeue.
    DeadLetter,
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Decides from the number of transient failures recorded for the
    /// order, this one included. Failure `n` is retry attempt `n`.
    pub fn decide(&self, failures: u32) -> RetryDecision {
        let attempt = failures.max(1);
        if attempt > self.max_retries {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Requeue {
                attempt,
                delay: self.delay_for_attempt(attempt),
            }
        }
    }
}

/// Transient failures per order id.
///
/// Only handler failures are recorded. Requeues caused by shutdown or by a
/// lost connection leave the count untouched, so they never spend the
/// retry budget. An entry is dropped once its order is acked or
/// dead-lettered.
#[derive(Debug, Default)]
pub struct RetryLedger {
    failures: Mutex<HashMap<String, u32>>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one more failure and returns the total so far.
    pub fn record_failure(&self, order_id: &str) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(order_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn failures(&self, order_id: &str) -> u32 {
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.get(order_id).copied().unwrap_or_default()
    }

    pub fn clear(&self, order_id: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.remove(order_id);
    }
}
