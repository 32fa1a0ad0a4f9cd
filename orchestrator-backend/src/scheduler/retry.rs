//! Retry policy for cron job runs.
//!
//! Each attempt is classified into an [`AttemptOutcome`]; [`decide`] turns the
//! classification and the attempt count into the next step. It does no I/O so
//! the whole policy is unit-testable.

use std::time::Duration;

use crate::models::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubles on every further retry. 0 retries immediately.
    pub base_backoff_ms: u64,
    /// Upper bound for a single delay
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff_ms: crate::config::defaults::RETRY_BACKOFF_BASE_MS,
            max_backoff_ms: crate::config::defaults::RETRY_BACKOFF_MAX_MS,
        }
    }
}

impl RetryPolicy {
    /// Immediate retries, used by tests
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            base_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.base_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms.max(self.base_backoff_ms));
        Duration::from_millis(ms)
    }
}

/// How a single agent-loop attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success,
    /// The agent reported an error; another attempt may succeed
    RetryableFailure { error: String },
    /// Timeout or cancellation; retrying would not help
    TerminalFailure { kind: FailureKind, error: String },
}

impl AttemptOutcome {
    /// Failure kind to record when the run gives up on this outcome
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            AttemptOutcome::Success => None,
            AttemptOutcome::RetryableFailure { .. } => Some(FailureKind::AgentError),
            AttemptOutcome::TerminalFailure { kind, .. } => Some(*kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Decide what happens after attempt number `attempt` (1-based) ended with `outcome`.
///
/// A job with `max_retries = n` gets at most `n + 1` attempts.
pub fn decide(
    attempt: u32,
    max_retries: u32,
    outcome: &AttemptOutcome,
    policy: &RetryPolicy,
) -> RetryDecision {
    match outcome {
        AttemptOutcome::RetryableFailure { .. } if attempt <= max_retries => RetryDecision::Retry {
            delay: policy.backoff(attempt),
        },
        _ => RetryDecision::GiveUp,
    }
}
