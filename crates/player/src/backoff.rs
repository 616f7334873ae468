// Retry scheduling for transient fetch failures

use spool_core::RetryPolicy;
use std::time::{Duration, Instant};

/// Exponential backoff over a [`RetryPolicy`].
///
/// Progress (bytes arriving) resets the attempt count, so the budget applies
/// to consecutive failures only.
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    retry_at: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            retry_at: None,
        }
    }

    /// Schedule the next retry; `None` once the budget is spent
    pub fn schedule(&mut self, now: Instant) -> Option<Duration> {
        let delay = self.policy.delay_for(self.attempt)?;
        self.attempt += 1;
        self.retry_at = Some(now + delay);
        Some(delay)
    }

    /// Whether a scheduled retry is due; clears it if so
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.retry_at {
            Some(at) if now >= at => {
                self.retry_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.retry_at.is_some()
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.retry_at = None;
    }
}
