//! Exponential retry backoff with time-based gating
//!
//! The policy never sleeps. Callers ask [`BackoffPolicy::check`] whether the
//! retry gate is open at a given instant and report each outcome with
//! [`BackoffPolicy::record_failure`] or [`BackoffPolicy::reset`].

use crate::config::BackoffSection;
use std::time::{Duration, Instant};

/// Exponential backoff state for one retrying component
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt_count: u32,
    retry_at: Option<Instant>,
}

/// Outcome of consulting the retry gate
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Gate is open; `attempt` is the 1-based number of the attempt about to run
    Proceed { attempt: u32 },
    /// Gate is closed for `remaining`
    Wait { remaining: Duration },
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        let max_delay = max_delay.max(initial_delay);
        Self {
            initial_delay,
            current_delay: initial_delay,
            max_delay,
            multiplier: if multiplier.is_finite() {
                multiplier.max(1.0)
            } else {
                1.0
            },
            attempt_count: 0,
            retry_at: None,
        }
    }

    pub fn from_config(config: &BackoffSection) -> Self {
        Self::new(
            Duration::from_millis(config.initial_ms),
            Duration::from_millis(config.max_ms),
            config.multiplier,
        )
    }

    /// Delay applied after the most recent failure (initial delay when none)
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Consecutive failures since the last success
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check whether a retry may run at `now`
    pub fn check(&self, now: Instant) -> RetryDecision {
        match self.retry_at {
            Some(retry_at) if now < retry_at => RetryDecision::Wait {
                remaining: retry_at - now,
            },
            _ => RetryDecision::Proceed {
                attempt: self.attempt_count + 1,
            },
        }
    }

    /// Record a failed attempt at `now` and close the gate
    ///
    /// Returns the delay until the next attempt. The first failure waits the
    /// initial delay; each later one multiplies it, capped at the maximum.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        if self.attempt_count > 0 {
            self.current_delay = self.next_delay();
        }
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.retry_at = Some(now + self.current_delay);
        self.current_delay
    }

    /// Return to the initial delay after a success
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt_count = 0;
        self.retry_at = None;
    }

    fn next_delay(&self) -> Duration {
        let scaled = self.current_delay.as_secs_f64() * self.multiplier;
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.max_delay)
            .max(self.current_delay)
            .min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffSection::default())
    }
}
