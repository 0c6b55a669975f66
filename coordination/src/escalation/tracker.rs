//! Per-fingerprint failure counters.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Failures on the same fingerprint before escalation is recommended.
pub const DEFAULT_ESCALATION_THRESHOLD: u32 = 2;

/// Advice returned to the caller after a failure is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationAdvice {
    pub escalated: bool,
    pub failure_count: u32,
    pub recommendation: String,
}

/// Thread-safe failure counters keyed by task fingerprint.
///
/// Shared across concurrent tasks through an `Arc`; every read-modify-write
/// happens under the internal lock.
#[derive(Debug)]
pub struct EscalationTracker {
    counts: Mutex<HashMap<String, u32>>,
    threshold: u32,
}

impl Default for EscalationTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ESCALATION_THRESHOLD)
    }
}

impl EscalationTracker {
    /// Create a tracker with a custom threshold (minimum 1).
    pub fn new(threshold: u32) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Increment and return the failure count for `fingerprint`.
    pub fn record_failure(&self, fingerprint: &str) -> u32 {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(fingerprint.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let count = *count;
        drop(counts);

        tracing::debug!(fingerprint, count, "Recorded task failure");
        count
    }

    /// Clear the counter after a success.
    pub fn reset(&self, fingerprint: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if counts.remove(fingerprint).is_some() {
            tracing::debug!(fingerprint, "Reset failure counter");
        }
    }

    /// Current failure count (0 when unknown).
    pub fn failure_count(&self, fingerprint: &str) -> u32 {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(fingerprint).copied().unwrap_or(0)
    }

    /// Advice for a given failure count.
    pub fn advise(&self, failure_count: u32) -> EscalationAdvice {
        if failure_count >= self.threshold {
            EscalationAdvice {
                escalated: true,
                failure_count,
                recommendation: "Escalate to ARCHITECT: resubmit the task to the design role."
                    .to_string(),
            }
        } else {
            EscalationAdvice {
                escalated: false,
                failure_count,
                recommendation: format!("Retry with CODER ({failure_count}/{})", self.threshold),
            }
        }
    }

    /// Record a failure and return the resulting advice.
    pub fn record_and_advise(&self, fingerprint: &str) -> EscalationAdvice {
        let count = self.record_failure(fingerprint);
        self.advise(count)
    }
}
